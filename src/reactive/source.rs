//! Source contract shared by every dependency primitive.
//!
//! A source is anything a derived computation can depend on: it has a
//! scope and hands out cancellable change subscriptions. Stores and
//! notifiers both implement it; the derived engine only ever sees the
//! trait.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;

/// Visibility of a reactive source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// One value shared across every session.
    Global,
    /// A per-session family; reads and writes route to the current session.
    Session,
}

impl Scope {
    pub fn is_session(self) -> bool {
        matches!(self, Scope::Session)
    }

    /// Union rule for derived sources: session-scoped if any input is.
    pub fn union<I: IntoIterator<Item = Scope>>(scopes: I) -> Scope {
        if scopes.into_iter().any(Scope::is_session) {
            Scope::Session
        } else {
            Scope::Global
        }
    }
}

/// Failure to resolve the ambient session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("no session bound to the current context")]
    NoSessionContext,
}

/// Value-free change callback used by `Source::watch`.
pub type ChangeFn = Arc<dyn Fn() + Send + Sync>;

/// A dependency primitive: scope plus a change subscription.
///
/// `watch` never delivers an initial tick; initial-value delivery is a
/// store-only behavior on its value subscription. Session-scoped sources
/// resolve the ambient session at watch time.
pub trait Source: Send + Sync {
    fn scope(&self) -> Scope;
    fn watch(&self, f: ChangeFn) -> Result<Subscription, SessionError>;
}

/// Cancellation handle returned by every subscribe operation.
///
/// The handle is the subscriber's lifetime: dropping it cancels. `cancel`
/// is idempotent; after it returns, no new callback fires for this handle
/// (a callback already in flight may complete).
pub struct Subscription {
    cancelled: Arc<AtomicBool>,
    on_cancel: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Subscription {
    pub(crate) fn new(
        cancelled: Arc<AtomicBool>,
        on_cancel: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            cancelled,
            on_cancel: Mutex::new(Some(Box::new(on_cancel))),
        }
    }

    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            let hook = lock_recover(&self.on_cancel).take();
            if let Some(hook) = hook {
                hook();
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Lock a mutex, recovering the data on poison.
///
/// Subscriber lists hold plain collections with no invariant spanning the
/// guard, so a poisoned lock is still safe to reuse.
pub(crate) fn lock_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct Entry<A> {
    id: u64,
    cancelled: Arc<AtomicBool>,
    call: Arc<dyn Fn(&A) + Send + Sync>,
}

impl<A> Clone for Entry<A> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            cancelled: Arc::clone(&self.cancelled),
            call: Arc::clone(&self.call),
        }
    }
}

/// Ordered subscriber registry with copy-on-iterate fan-out.
///
/// Fan-outs for one list are serialized by the dispatch lock and visit
/// subscribers in registration order. The entries lock is never held
/// while a callback runs, so subscribers may be added or cancelled
/// mid-fan-out; an entry added during a fan-out sees the next event, and
/// a cancelled entry is tombstoned and skipped. Registration that also
/// delivers an initial value goes through `add_and_deliver`, which holds
/// the dispatch lock across both steps so the new entry sees a given
/// event exactly once: either as its initial delivery or as the next
/// fan-out, never both.
pub(crate) struct SubscriberList<A> {
    entries: Mutex<Vec<Entry<A>>>,
    dispatch: Mutex<()>,
    next_id: AtomicU64,
}

impl<A> SubscriberList<A> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            dispatch: Mutex::new(()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a subscriber. Returns its id and cancelled flag.
    pub fn add(&self, call: Arc<dyn Fn(&A) + Send + Sync>) -> (u64, Arc<AtomicBool>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancelled = Arc::new(AtomicBool::new(false));
        lock_recover(&self.entries).push(Entry {
            id,
            cancelled: Arc::clone(&cancelled),
            call,
        });
        (id, cancelled)
    }

    /// Register a subscriber and deliver an initial value, atomically
    /// with respect to fan-out.
    ///
    /// The dispatch lock is held across registration and the optional
    /// immediate callback, so a concurrent `emit` either completes
    /// before the new entry exists (and `current` observes its result)
    /// or runs after the initial delivery. Returning `None` from
    /// `current` registers without delivering.
    pub fn add_and_deliver(
        &self,
        call: Arc<dyn Fn(&A) + Send + Sync>,
        current: impl FnOnce() -> Option<A>,
    ) -> (u64, Arc<AtomicBool>) {
        let _dispatch = lock_recover(&self.dispatch);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancelled = Arc::new(AtomicBool::new(false));
        lock_recover(&self.entries).push(Entry {
            id,
            cancelled: Arc::clone(&cancelled),
            call: Arc::clone(&call),
        });
        if let Some(value) = current() {
            call(&value);
        }
        (id, cancelled)
    }

    pub fn remove(&self, id: u64) {
        lock_recover(&self.entries).retain(|entry| entry.id != id);
    }

    /// Fan an event out to every live subscriber, in registration order.
    pub fn emit(&self, value: &A) {
        let _dispatch = lock_recover(&self.dispatch);
        let snapshot: Vec<Entry<A>> = lock_recover(&self.entries).clone();
        for entry in snapshot {
            if !entry.cancelled.load(Ordering::SeqCst) {
                (entry.call)(value);
            }
        }
    }

    /// Produce an event under the dispatch lock, then fan it out.
    ///
    /// `make` runs before the subscriber snapshot is taken, so the state
    /// update and its fan-out form one atomic step per list.
    pub fn emit_with(&self, make: impl FnOnce() -> A) {
        let _dispatch = lock_recover(&self.dispatch);
        let value = make();
        let snapshot: Vec<Entry<A>> = lock_recover(&self.entries).clone();
        for entry in snapshot {
            if !entry.cancelled.load(Ordering::SeqCst) {
                (entry.call)(&value);
            }
        }
    }

    pub fn len(&self) -> usize {
        lock_recover(&self.entries).len()
    }
}

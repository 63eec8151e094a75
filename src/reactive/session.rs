//! Session identity, ambient context, and session-scoped stores.
//!
//! A session id is bound for the dynamic extent of processing one inbound
//! frame (and re-bound around every recompute a computation runs on its
//! worker thread), so session stores resolve the right per-session slot
//! without the id being threaded through call sites.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use uuid::Uuid;

use super::source::{
    ChangeFn, Scope, SessionError, Source, SubscriberList, Subscription, lock_recover,
};

/// Opaque per-connection identity. Minted on connect, ended on disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Uuid);

impl SessionId {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

thread_local! {
    static CURRENT: Cell<Option<SessionId>> = const { Cell::new(None) };
}

/// Bind `id` as the current session for the duration of `f`.
///
/// Nesting restores the previous binding on exit, including on panic.
pub fn with<R>(id: SessionId, f: impl FnOnce() -> R) -> R {
    struct Restore(Option<SessionId>);
    impl Drop for Restore {
        fn drop(&mut self) {
            CURRENT.with(|current| current.set(self.0));
        }
    }

    let _restore = Restore(CURRENT.with(|current| current.replace(Some(id))));
    f()
}

/// The ambient session, if one is bound.
pub fn current() -> Option<SessionId> {
    CURRENT.with(Cell::get)
}

/// The ambient session, or `NoSessionContext`.
pub fn require() -> Result<SessionId, SessionError> {
    current().ok_or(SessionError::NoSessionContext)
}

/// End a session: every registered session-scoped family drops its slot
/// for `id`, cancelling nothing retroactively (subscriptions are expected
/// to have been cancelled by the caller already).
pub fn end(id: SessionId) {
    let mut families = lock_recover(families());
    families.retain(|family| match family.upgrade() {
        Some(family) => {
            family.release_session(id);
            true
        }
        None => false,
    });
}

/// A family of per-session slots, reachable for teardown.
trait SessionScoped: Send + Sync {
    fn release_session(&self, id: SessionId);
}

fn families() -> &'static Mutex<Vec<Weak<dyn SessionScoped>>> {
    static FAMILIES: OnceLock<Mutex<Vec<Weak<dyn SessionScoped>>>> = OnceLock::new();
    FAMILIES.get_or_init(|| Mutex::new(Vec::new()))
}

fn register_family(family: Weak<dyn SessionScoped>) {
    lock_recover(families()).push(family);
}

/// A session-scoped reactive value.
///
/// Logically a family of [`Store`](super::Store)-like slots indexed by
/// session id; reads, writes, and subscriptions route to the current
/// session's slot, which is created lazily from the initial value on
/// first access. Fan-out never crosses sessions.
pub struct SessionStore<T> {
    family: Arc<Family<T>>,
}

struct Family<T> {
    initial: T,
    slots: Mutex<HashMap<SessionId, Arc<Slot<T>>>>,
}

struct Slot<T> {
    value: Mutex<T>,
    subs: SubscriberList<T>,
}

impl<T> Clone for SessionStore<T> {
    fn clone(&self) -> Self {
        Self {
            family: Arc::clone(&self.family),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> SessionStore<T> {
    pub fn new(initial: T) -> Self {
        let family = Arc::new(Family {
            initial,
            slots: Mutex::new(HashMap::new()),
        });
        register_family(Arc::downgrade(&family) as Weak<dyn SessionScoped>);
        Self { family }
    }

    fn slot(&self) -> Result<Arc<Slot<T>>, SessionError> {
        let id = require()?;
        let mut slots = lock_recover(&self.family.slots);
        let slot = slots.entry(id).or_insert_with(|| {
            Arc::new(Slot {
                value: Mutex::new(self.family.initial.clone()),
                subs: SubscriberList::new(),
            })
        });
        Ok(Arc::clone(slot))
    }

    pub fn get(&self) -> Result<T, SessionError> {
        let slot = self.slot()?;
        let value = lock_recover(&slot.value).clone();
        Ok(value)
    }

    pub fn set(&self, value: T) -> Result<(), SessionError> {
        let slot = self.slot()?;
        slot.subs.emit_with(|| {
            *lock_recover(&slot.value) = value.clone();
            value
        });
        Ok(())
    }

    pub fn mutate(&self, next: impl FnOnce(&T) -> T) -> Result<(), SessionError> {
        let slot = self.slot()?;
        slot.subs.emit_with(|| {
            let mut guard = lock_recover(&slot.value);
            let value = next(&guard);
            *guard = value.clone();
            value
        });
        Ok(())
    }

    /// Subscribe to the current session's slot. The slot's current value
    /// is delivered immediately; registration and that delivery are one
    /// step atomic with the slot's fan-out.
    pub fn subscribe(
        &self,
        f: impl Fn(&T) + Send + Sync + 'static,
    ) -> Result<Subscription, SessionError> {
        let slot = self.slot()?;
        let call: Arc<dyn Fn(&T) + Send + Sync> = Arc::new(f);
        let (id, cancelled) = slot
            .subs
            .add_and_deliver(call, || Some(lock_recover(&slot.value).clone()));
        let cleanup = Arc::clone(&slot);
        Ok(Subscription::new(cancelled, move || cleanup.subs.remove(id)))
    }

    /// Subscriber count for the current session's slot.
    pub fn subscriber_count(&self) -> Result<usize, SessionError> {
        Ok(self.slot()?.subs.len())
    }
}

impl<T: Clone + Send + Sync + 'static> Source for SessionStore<T> {
    fn scope(&self) -> Scope {
        Scope::Session
    }

    fn watch(&self, f: ChangeFn) -> Result<Subscription, SessionError> {
        let slot = self.slot()?;
        let call: Arc<dyn Fn(&T) + Send + Sync> = Arc::new(move |_| f());
        let (id, cancelled) = slot.subs.add(call);
        let cleanup = Arc::clone(&slot);
        Ok(Subscription::new(cancelled, move || cleanup.subs.remove(id)))
    }
}

impl<T: Send + Sync> SessionScoped for Family<T> {
    fn release_session(&self, id: SessionId) {
        lock_recover(&self.slots).remove(&id);
    }
}

//! Global value store.

use std::sync::Arc;
use std::sync::Mutex;

use super::source::{ChangeFn, Scope, SessionError, Source, SubscriberList, Subscription, lock_recover};

/// A global reactive value shared across every session.
///
/// Writes fan out to all current subscribers synchronously, in
/// registration order, before the write call returns. There is no
/// equality suppression: `set(x); set(x)` fires twice.
pub struct Store<T> {
    inner: Arc<StoreInner<T>>,
}

struct StoreInner<T> {
    value: Mutex<T>,
    subs: SubscriberList<T>,
}

impl<T> Clone for Store<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Store<T> {
    pub fn new(initial: T) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                value: Mutex::new(initial),
                subs: SubscriberList::new(),
            }),
        }
    }

    pub fn get(&self) -> T {
        lock_recover(&self.inner.value).clone()
    }

    /// Replace the value and fan out to all subscribers.
    pub fn set(&self, value: T) {
        let inner = &self.inner;
        inner.subs.emit_with(|| {
            *lock_recover(&inner.value) = value.clone();
            value
        });
    }

    /// Update the value from its previous state and fan out.
    ///
    /// `next` receives the previous value; calling `get` from inside it
    /// would deadlock.
    pub fn mutate(&self, next: impl FnOnce(&T) -> T) {
        let inner = &self.inner;
        inner.subs.emit_with(|| {
            let mut guard = lock_recover(&inner.value);
            let value = next(&guard);
            *guard = value.clone();
            value
        });
    }

    /// Subscribe to values. The current value is delivered to the new
    /// subscriber immediately, then every subsequent write. Registration
    /// and the initial delivery are one step atomic with fan-out, so a
    /// concurrent write is seen exactly once.
    pub fn subscribe(&self, f: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let call: Arc<dyn Fn(&T) + Send + Sync> = Arc::new(f);
        let (id, cancelled) = self
            .inner
            .subs
            .add_and_deliver(call, || Some(lock_recover(&self.inner.value).clone()));

        let inner = Arc::clone(&self.inner);
        Subscription::new(cancelled, move || inner.subs.remove(id))
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subs.len()
    }
}

impl<T: Clone + Send + Sync + 'static> Source for Store<T> {
    fn scope(&self) -> Scope {
        Scope::Global
    }

    fn watch(&self, f: ChangeFn) -> Result<Subscription, SessionError> {
        let call: Arc<dyn Fn(&T) + Send + Sync> = Arc::new(move |_| f());
        let (id, cancelled) = self.inner.subs.add(call);
        let inner = Arc::clone(&self.inner);
        Ok(Subscription::new(cancelled, move || inner.subs.remove(id)))
    }
}

//! Change notifiers: value-free signals and derived fan-in.

use std::sync::{Arc, Mutex};

use super::source::{ChangeFn, Scope, SessionError, Source, SubscriberList, Subscription, lock_recover};

/// A stateless change signal.
///
/// `notify` fans out to all current subscribers synchronously, in
/// registration order. Subscribing never delivers an initial event.
pub struct Notifier {
    inner: Arc<NotifierInner>,
}

struct NotifierInner {
    subs: SubscriberList<()>,
    scope: Scope,
}

impl Clone for Notifier {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        Self::scoped(Scope::Global)
    }

    /// A notifier carrying an explicit scope tag. A session-scoped
    /// notifier is expected to be created per session (inside the
    /// endpoint factory); the tag only informs scope inference.
    pub fn scoped(scope: Scope) -> Self {
        Self {
            inner: Arc::new(NotifierInner {
                subs: SubscriberList::new(),
                scope,
            }),
        }
    }

    pub fn notify(&self) {
        self.inner.subs.emit(&());
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subs.len()
    }

    /// A notifier that fires once whenever any input fires.
    ///
    /// Input subscriptions are acquired when the first watcher arrives
    /// and released when the last leaves. Scope is the union of the
    /// input scopes.
    pub fn derive(inputs: Vec<Arc<dyn Source>>) -> DerivedNotifier {
        let scope = Scope::union(inputs.iter().map(|input| input.scope()));
        DerivedNotifier {
            inner: Arc::new(DerivedNotifierInner {
                inputs,
                subs: SubscriberList::new(),
                state: Mutex::new(DerivedNotifierState {
                    watchers: 0,
                    input_subs: Vec::new(),
                }),
                scope,
            }),
        }
    }
}

impl Source for Notifier {
    fn scope(&self) -> Scope {
        self.inner.scope
    }

    fn watch(&self, f: ChangeFn) -> Result<Subscription, SessionError> {
        let call: Arc<dyn Fn(&()) + Send + Sync> = Arc::new(move |()| f());
        let (id, cancelled) = self.inner.subs.add(call);
        let inner = Arc::clone(&self.inner);
        Ok(Subscription::new(cancelled, move || inner.subs.remove(id)))
    }
}

/// Fan-in over several sources, produced by [`Notifier::derive`].
pub struct DerivedNotifier {
    inner: Arc<DerivedNotifierInner>,
}

struct DerivedNotifierInner {
    inputs: Vec<Arc<dyn Source>>,
    subs: SubscriberList<()>,
    state: Mutex<DerivedNotifierState>,
    scope: Scope,
}

struct DerivedNotifierState {
    watchers: usize,
    input_subs: Vec<Subscription>,
}

impl Clone for DerivedNotifier {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Source for DerivedNotifier {
    fn scope(&self) -> Scope {
        self.inner.scope
    }

    fn watch(&self, f: ChangeFn) -> Result<Subscription, SessionError> {
        let call: Arc<dyn Fn(&()) + Send + Sync> = Arc::new(move |()| f());
        let (id, cancelled) = self.inner.subs.add(call);

        {
            let mut state = lock_recover(&self.inner.state);
            state.watchers += 1;
            if state.watchers == 1 {
                let mut acquired = Vec::with_capacity(self.inner.inputs.len());
                for input in &self.inner.inputs {
                    let fan = Arc::clone(&self.inner);
                    match input.watch(Arc::new(move || fan.subs.emit(&()))) {
                        Ok(sub) => acquired.push(sub),
                        Err(err) => {
                            state.watchers -= 1;
                            self.inner.subs.remove(id);
                            return Err(err);
                        }
                    }
                }
                state.input_subs = acquired;
            }
        }

        let inner = Arc::clone(&self.inner);
        Ok(Subscription::new(cancelled, move || {
            inner.subs.remove(id);
            let mut state = lock_recover(&inner.state);
            state.watchers -= 1;
            if state.watchers == 0 {
                state.input_subs.clear();
            }
        }))
    }
}

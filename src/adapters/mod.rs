//! External change-producer adapters.
//!
//! Concrete producers (database change feeds, file watchers) live
//! outside the core; this module carries their contract: a producer is
//! started lazily when a notifier gains its first watcher, stopped when
//! the last leaves, and restarted on the next subscribe. A hub shares
//! one producer per key so repeated `notifier_for` calls never stack
//! listeners.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use crate::reactive::{ChangeFn, Notifier, Scope, SessionError, Source, Subscription, lock_recover};

/// Stops the producer when dropped.
pub struct ProducerGuard {
    stop: Option<Box<dyn FnOnce() + Send>>,
}

impl ProducerGuard {
    pub fn new(stop: impl FnOnce() + Send + 'static) -> Self {
        Self {
            stop: Some(Box::new(stop)),
        }
    }

    /// A guard for producers with nothing to tear down.
    pub fn noop() -> Self {
        Self { stop: None }
    }
}

impl Drop for ProducerGuard {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop();
        }
    }
}

/// An external change source.
///
/// `start` must begin observing and call `notifier.notify()` at least
/// once per externally observed change (coalescing rapid events is
/// fine). It may notify synchronously from inside its own I/O callback;
/// fan-out never re-enters the producer. An initial tick from `start`
/// is producer policy.
pub trait ChangeProducer: Send + Sync {
    fn start(&self, notifier: Notifier) -> ProducerGuard;
}

/// A notifier whose producer runs only while it has watchers.
pub struct LazyNotifier {
    inner: Arc<LazyInner>,
}

struct LazyInner {
    notifier: Notifier,
    producer: Arc<dyn ChangeProducer>,
    state: Mutex<LazyState>,
}

struct LazyState {
    watchers: usize,
    guard: Option<ProducerGuard>,
}

impl Clone for LazyNotifier {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl LazyNotifier {
    pub fn new(producer: Arc<dyn ChangeProducer>) -> Self {
        Self {
            inner: Arc::new(LazyInner {
                notifier: Notifier::new(),
                producer,
                state: Mutex::new(LazyState {
                    watchers: 0,
                    guard: None,
                }),
            }),
        }
    }

    /// Whether the underlying producer is currently running.
    pub fn is_active(&self) -> bool {
        lock_recover(&self.inner.state).guard.is_some()
    }
}

impl Source for LazyNotifier {
    fn scope(&self) -> Scope {
        Scope::Global
    }

    fn watch(&self, f: ChangeFn) -> Result<Subscription, SessionError> {
        // Register first so a producer that ticks from `start` reaches
        // this watcher too.
        let sub = self.inner.notifier.watch(f)?;

        let needs_start = {
            let mut state = lock_recover(&self.inner.state);
            state.watchers += 1;
            state.watchers == 1 && state.guard.is_none()
        };
        if needs_start {
            // Start outside the state lock: the producer may notify
            // synchronously, and fan-out must not run under our lock.
            let guard = self.inner.producer.start(self.inner.notifier.clone());
            let mut state = lock_recover(&self.inner.state);
            if state.watchers == 0 {
                // Raced with an immediate cancel; stop right away.
                drop(guard);
            } else {
                state.guard = Some(guard);
            }
        }

        let inner = Arc::clone(&self.inner);
        let cancelled = Arc::new(std::sync::atomic::AtomicBool::new(false));
        Ok(Subscription::new(cancelled, move || {
            sub.cancel();
            let released = {
                let mut state = lock_recover(&inner.state);
                state.watchers -= 1;
                if state.watchers == 0 {
                    state.guard.take()
                } else {
                    None
                }
            };
            drop(released); // stop outside the lock
        }))
    }
}

/// Shares one lazily started producer per key.
pub struct NotifierHub<K> {
    make: Box<dyn Fn(&K) -> Arc<dyn ChangeProducer> + Send + Sync>,
    entries: Mutex<HashMap<K, LazyNotifier>>,
}

impl<K: Eq + Hash + Clone> NotifierHub<K> {
    pub fn new(make: impl Fn(&K) -> Arc<dyn ChangeProducer> + Send + Sync + 'static) -> Self {
        Self {
            make: Box::new(make),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// The shared notifier for `key`; one underlying producer per key.
    pub fn notifier_for(&self, key: &K) -> LazyNotifier {
        let mut entries = lock_recover(&self.entries);
        entries
            .entry(key.clone())
            .or_insert_with(|| LazyNotifier::new((self.make)(key)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Producer that counts starts/stops and can fire on demand.
    struct FakeProducer {
        starts: Arc<AtomicUsize>,
        stops: Arc<AtomicUsize>,
        sink: Arc<Mutex<Option<Notifier>>>,
        initial_tick: bool,
    }

    impl ChangeProducer for FakeProducer {
        fn start(&self, notifier: Notifier) -> ProducerGuard {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.initial_tick {
                notifier.notify();
            }
            *self.sink.lock().unwrap() = Some(notifier);
            let stops = Arc::clone(&self.stops);
            let sink = Arc::clone(&self.sink);
            ProducerGuard::new(move || {
                stops.fetch_add(1, Ordering::SeqCst);
                *sink.lock().unwrap() = None;
            })
        }
    }

    struct Fixture {
        lazy: LazyNotifier,
        starts: Arc<AtomicUsize>,
        stops: Arc<AtomicUsize>,
        sink: Arc<Mutex<Option<Notifier>>>,
    }

    fn fixture(initial_tick: bool) -> Fixture {
        let starts = Arc::new(AtomicUsize::new(0));
        let stops = Arc::new(AtomicUsize::new(0));
        let sink = Arc::new(Mutex::new(None));
        let lazy = LazyNotifier::new(Arc::new(FakeProducer {
            starts: Arc::clone(&starts),
            stops: Arc::clone(&stops),
            sink: Arc::clone(&sink),
            initial_tick,
        }));
        Fixture {
            lazy,
            starts,
            stops,
            sink,
        }
    }

    fn counting_watch(source: &dyn Source, calls: &Arc<AtomicUsize>) -> Subscription {
        let calls = Arc::clone(calls);
        source
            .watch(Arc::new(move || {
                calls.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap()
    }

    #[test]
    fn producer_starts_on_first_watch_and_stops_on_last_cancel() {
        let fx = fixture(false);
        assert!(!fx.lazy.is_active());

        let calls = Arc::new(AtomicUsize::new(0));
        let first = counting_watch(&fx.lazy, &calls);
        let second = counting_watch(&fx.lazy, &calls);
        assert_eq!(fx.starts.load(Ordering::SeqCst), 1);
        assert!(fx.lazy.is_active());

        first.cancel();
        assert_eq!(fx.stops.load(Ordering::SeqCst), 0);
        second.cancel();
        assert_eq!(fx.stops.load(Ordering::SeqCst), 1);
        assert!(!fx.lazy.is_active());
    }

    #[test]
    fn producer_restarts_after_churn() {
        let fx = fixture(false);
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let sub = counting_watch(&fx.lazy, &calls);
            sub.cancel();
        }
        assert_eq!(fx.starts.load(Ordering::SeqCst), 3);
        assert_eq!(fx.stops.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn external_change_reaches_watchers() {
        let fx = fixture(false);
        let calls = Arc::new(AtomicUsize::new(0));
        let _sub = counting_watch(&fx.lazy, &calls);

        let notifier = fx.sink.lock().unwrap().clone().expect("producer running");
        notifier.notify();
        notifier.notify();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn synchronous_initial_tick_reaches_the_first_watcher() {
        let fx = fixture(true);
        let calls = Arc::new(AtomicUsize::new(0));
        let _sub = counting_watch(&fx.lazy, &calls);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn hub_shares_one_producer_per_key() {
        let starts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&starts);
        let hub: NotifierHub<String> = NotifierHub::new(move |_key| {
            Arc::new(FakeProducer {
                starts: Arc::clone(&counter),
                stops: Arc::new(AtomicUsize::new(0)),
                sink: Arc::new(Mutex::new(None)),
                initial_tick: false,
            })
        });

        let calls = Arc::new(AtomicUsize::new(0));
        let a1 = hub.notifier_for(&"t1".to_string());
        let a2 = hub.notifier_for(&"t1".to_string());
        let _w1 = counting_watch(&a1, &calls);
        let _w2 = counting_watch(&a2, &calls);
        assert_eq!(starts.load(Ordering::SeqCst), 1);

        let b = hub.notifier_for(&"t2".to_string());
        let _w3 = counting_watch(&b, &calls);
        assert_eq!(starts.load(Ordering::SeqCst), 2);
    }
}

//! Derived computations: cached, debounced re-execution over sources.
//!
//! One worker thread per live computation owns the run loop. Triggers
//! (dependency fires, forced runs) arrive on a channel; debounce is a
//! receive window restarted by each trigger; fires observed during a run
//! coalesce into exactly one follow-up run; cache expiry is a select
//! deadline. The worker starts with the first subscriber and stops with
//! the last, which also releases every dependency subscription.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, unbounded};
use serde_json::Value;
use thiserror::Error;

use super::session::{self, SessionId};
use super::source::{Scope, SessionError, Source, SubscriberList, Subscription, lock_recover};

/// Failure produced by a recompute.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ComputeError {
    #[error("no session bound to the current context")]
    NoSession,
    #[error("{0}")]
    Failed(String),
}

impl ComputeError {
    pub fn failed(message: impl Into<String>) -> Self {
        ComputeError::Failed(message.into())
    }
}

impl From<SessionError> for ComputeError {
    fn from(_: SessionError) -> Self {
        ComputeError::NoSession
    }
}

/// One produced result: a value or the failure of that cycle.
pub type Update = Result<Value, ComputeError>;

/// Caching policy for a computation's last value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Cache {
    /// Never retain a value; every new subscriber forces a run.
    #[default]
    None,
    /// Retain the last value for the given interval after each run.
    Ttl(Duration),
    /// Retain the last value until the computation is dropped.
    Keep,
}

type ComputeFn = Arc<dyn Fn() -> Update + Send + Sync>;

enum WorkerMsg {
    Fire,
    Stop,
}

/// A re-runnable computation over a set of dependency sources.
///
/// Values are dynamic JSON; typed payloads belong to the layer that
/// constructs the compute closure. Cloning shares the computation.
pub struct Derived {
    inner: Arc<Inner>,
}

struct Inner {
    deps: Vec<Arc<dyn Source>>,
    compute: ComputeFn,
    cache: Cache,
    debounce: Option<Duration>,
    session: Option<SessionId>,
    scope: Scope,
    subs: SubscriberList<Update>,
    last: Mutex<Option<Value>>,
    state: Mutex<Lifecycle>,
}

struct Lifecycle {
    watchers: usize,
    dep_subs: Vec<Subscription>,
    trigger_tx: Option<Sender<WorkerMsg>>,
}

impl Clone for Derived {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Derived {
    /// Build a computation. The ambient session at construction time is
    /// captured and re-bound around every recompute.
    pub fn new(
        deps: Vec<Arc<dyn Source>>,
        compute: impl Fn() -> Update + Send + Sync + 'static,
        cache: Cache,
        debounce: Option<Duration>,
    ) -> Self {
        let scope = Scope::union(deps.iter().map(|dep| dep.scope()));
        Self {
            inner: Arc::new(Inner {
                deps,
                compute: Arc::new(compute),
                cache,
                debounce,
                session: session::current(),
                scope,
                subs: SubscriberList::new(),
                last: Mutex::new(None),
                state: Mutex::new(Lifecycle {
                    watchers: 0,
                    dep_subs: Vec::new(),
                    trigger_tx: None,
                }),
            }),
        }
    }

    pub fn scope(&self) -> Scope {
        self.inner.scope
    }

    /// The cached last value, if one is retained.
    pub fn cached(&self) -> Option<Value> {
        lock_recover(&self.inner.last).clone()
    }

    pub fn subscriber_count(&self) -> usize {
        lock_recover(&self.inner.state).watchers
    }

    /// Request a recompute, as if a dependency had fired.
    pub fn notify_changes(&self) {
        let state = lock_recover(&self.inner.state);
        if let Some(tx) = &state.trigger_tx {
            let _ = tx.send(WorkerMsg::Fire);
        }
    }

    /// Attach a subscriber.
    ///
    /// With a cached value present it is delivered immediately and no
    /// recompute happens; with none, a run is forced. The first
    /// subscriber acquires dependency subscriptions and starts the
    /// worker; cancelling the last releases both.
    pub fn subscribe(&self, f: impl Fn(&Update) + Send + Sync + 'static) -> Subscription {
        let call: Arc<dyn Fn(&Update) + Send + Sync> = Arc::new(f);

        // Lifecycle first: the first subscriber acquires dependency
        // subscriptions and starts the worker before any delivery.
        {
            let mut state = lock_recover(&self.inner.state);
            state.watchers += 1;
            if state.watchers == 1 {
                Inner::start(&self.inner, &mut state);
            }
        }

        // Registration plus the cached-or-force-run decision happen
        // under the fan-out dispatch lock, so a run completing
        // concurrently is seen exactly once: either its result is
        // already cached here, or it fans out to the new entry after.
        let inner = &self.inner;
        let (id, cancelled) = inner.subs.add_and_deliver(call, || {
            let cached = lock_recover(&inner.last).clone();
            match cached {
                Some(value) => Some(Ok(value)),
                None => {
                    let state = lock_recover(&inner.state);
                    if let Some(tx) = &state.trigger_tx {
                        let _ = tx.send(WorkerMsg::Fire);
                    }
                    None
                }
            }
        });

        let inner = Arc::clone(&self.inner);
        Subscription::new(cancelled, move || inner.release_subscriber(id))
    }
}

impl Inner {
    /// Acquire dependency subscriptions and spawn the worker. Called with
    /// the lifecycle lock held, on the first subscriber.
    fn start(this: &Arc<Inner>, state: &mut Lifecycle) {
        let (tx, rx) = unbounded();

        let acquire = |state: &mut Lifecycle| {
            for dep in &this.deps {
                let trigger = tx.clone();
                match dep.watch(Arc::new(move || {
                    let _ = trigger.send(WorkerMsg::Fire);
                })) {
                    Ok(sub) => state.dep_subs.push(sub),
                    Err(err) => {
                        tracing::warn!(error = %err, "dependency watch failed; skipping");
                    }
                }
            }
        };
        match this.session {
            Some(id) => session::with(id, || acquire(state)),
            None => acquire(state),
        }

        state.trigger_tx = Some(tx);
        let worker = Arc::clone(this);
        std::thread::spawn(move || worker.run_loop(rx));
    }

    fn release_subscriber(&self, id: u64) {
        self.subs.remove(id);
        let mut state = lock_recover(&self.state);
        state.watchers -= 1;
        if state.watchers == 0 {
            state.dep_subs.clear();
            if let Some(tx) = state.trigger_tx.take() {
                let _ = tx.send(WorkerMsg::Stop);
            }
            // Ttl expiry lives in the worker that just stopped; only a
            // Keep cache survives a zero-subscriber window.
            if !matches!(self.cache, Cache::Keep) {
                *lock_recover(&self.last) = None;
            }
        }
    }

    fn run_loop(self: Arc<Inner>, rx: Receiver<WorkerMsg>) {
        let mut expiry: Option<Instant> = None;

        loop {
            let tick = match expiry {
                Some(at) => crossbeam::channel::after(at.saturating_duration_since(Instant::now())),
                None => crossbeam::channel::never(),
            };
            crossbeam::select! {
                recv(rx) -> msg => match msg {
                    Ok(WorkerMsg::Fire) => {}
                    Ok(WorkerMsg::Stop) | Err(_) => return,
                },
                recv(tick) -> _ => {
                    *lock_recover(&self.last) = None;
                    expiry = None;
                    continue;
                }
            }

            // Debounce window: each further fire restarts it.
            if let Some(window) = self.debounce {
                loop {
                    match rx.recv_timeout(window) {
                        Ok(WorkerMsg::Fire) => {}
                        Ok(WorkerMsg::Stop) => return,
                        Err(RecvTimeoutError::Timeout) => break,
                        Err(RecvTimeoutError::Disconnected) => return,
                    }
                }
            }

            // Run, then coalesce fires observed during the run into at
            // most one follow-up run. Caching the result and fanning it
            // out are one atomic step, so a subscriber registering
            // concurrently sees this result exactly once: from the cache
            // or from this fan-out, never both.
            loop {
                let update = self.run_once();
                self.subs.emit_with(|| {
                    self.store_cached(&update, &mut expiry);
                    update.clone()
                });

                let mut pending = false;
                loop {
                    match rx.try_recv() {
                        Ok(WorkerMsg::Fire) => pending = true,
                        Ok(WorkerMsg::Stop) => return,
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Disconnected) => return,
                    }
                }
                if !pending {
                    break;
                }
            }
        }
    }

    fn run_once(&self) -> Update {
        match self.session {
            Some(id) => session::with(id, || (self.compute)()),
            None => (self.compute)(),
        }
    }

    fn store_cached(&self, update: &Update, expiry: &mut Option<Instant>) {
        let Ok(value) = update else {
            // A failed cycle leaves any previous cached value alone.
            return;
        };
        match self.cache {
            Cache::None => {}
            Cache::Ttl(ttl) => {
                *lock_recover(&self.last) = Some(value.clone());
                *expiry = Some(Instant::now() + ttl);
            }
            Cache::Keep => {
                *lock_recover(&self.last) = Some(value.clone());
                *expiry = None;
            }
        }
    }
}

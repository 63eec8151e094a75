//! Subscription multiplexer.
//!
//! Owns the server-wide `active` map of live computations keyed by
//! `(session, action, params fingerprint)`, attaches per-subscription
//! forwarders that emit frames onto the owning connection's outbound
//! channel, and tears a session's entries down on disconnect.

use std::collections::HashMap;
use std::sync::Mutex;

use crossbeam::channel::Sender;
use serde_json::Value;

use crate::config::Limits;
use crate::reactive::{SessionId, Subscription, Update, lock_recover};
use crate::server::action::{Action, ActionMap, QueryOutcome, validate_params};
use crate::server::fingerprint::fingerprint;
use crate::server::proto::ServerFrame;

/// One connection's view, handed to every dispatch call.
pub(crate) struct ConnectionCtx {
    pub session: SessionId,
    pub actions: ActionMap,
    pub outbound: Sender<ServerFrame>,
}

impl ConnectionCtx {
    /// Best-effort write: a closed channel drops the frame silently.
    fn send(&self, frame: ServerFrame) {
        let _ = self.outbound.send(frame);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SubKey {
    session: SessionId,
    action: String,
    fingerprint: String,
}

struct ActiveEntry {
    computation: crate::reactive::Derived,
    subscribers: HashMap<String, Subscription>,
}

/// The server-wide subscription state.
pub struct Mux {
    active: Mutex<HashMap<SubKey, ActiveEntry>>,
    limits: Limits,
}

impl Mux {
    pub fn new(limits: Limits) -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
            limits,
        }
    }

    pub(crate) fn subscribe(
        &self,
        ctx: &ConnectionCtx,
        name: String,
        sub_id: String,
        params: Option<Value>,
    ) {
        let Some(action) = ctx.actions.get(&name) else {
            ctx.send(ServerFrame::subscription_error(
                &name,
                &sub_id,
                format!("unknown action \"{name}\""),
            ));
            return;
        };
        let Action::Query(query) = action else {
            ctx.send(ServerFrame::subscription_error(
                &name,
                &sub_id,
                format!("action \"{name}\" is not a query"),
            ));
            return;
        };

        let validated = match validate_params(query.validator_ref(), params) {
            Ok(validated) => validated,
            Err(err) => {
                ctx.send(ServerFrame::subscription_error(&name, &sub_id, err.message));
                return;
            }
        };
        let fp = fingerprint(Some(&validated));

        let mut active = lock_recover(&self.active);

        let session_subs: usize = active
            .iter()
            .filter(|(key, _)| key.session == ctx.session)
            .map(|(_, entry)| entry.subscribers.len())
            .sum();
        if session_subs >= self.limits.max_subscriptions_per_session {
            ctx.send(ServerFrame::subscription_error(
                &name,
                &sub_id,
                format!(
                    "subscription limit reached ({})",
                    self.limits.max_subscriptions_per_session
                ),
            ));
            return;
        }

        let key = SubKey {
            session: ctx.session,
            action: name.clone(),
            fingerprint: fp,
        };

        if !active.contains_key(&key) {
            match query.instantiate(validated) {
                Ok(QueryOutcome::Live(computation)) => {
                    active.insert(
                        key.clone(),
                        ActiveEntry {
                            computation,
                            subscribers: HashMap::new(),
                        },
                    );
                }
                Ok(QueryOutcome::Value(value)) => {
                    // Plain result: one update, no subscription state.
                    ctx.send(ServerFrame::update(&name, &sub_id, value));
                    return;
                }
                Err(err) => {
                    ctx.send(ServerFrame::subscription_error(
                        &name,
                        &sub_id,
                        err.to_string(),
                    ));
                    return;
                }
            }
        }

        // The entry was just inserted or already present.
        let Some(entry) = active.get_mut(&key) else {
            return;
        };

        let outbound = ctx.outbound.clone();
        let frame_name = name.clone();
        let frame_sub = sub_id.clone();
        let subscription = entry.computation.subscribe(move |update: &Update| {
            let frame = match update {
                Ok(value) => ServerFrame::update(&frame_name, &frame_sub, value.clone()),
                Err(err) => {
                    ServerFrame::subscription_error(&frame_name, &frame_sub, err.to_string())
                }
            };
            let _ = outbound.send(frame);
        });
        // Replacing an existing subId cancels its previous attachment
        // and is treated as a client resync: force a recompute so the
        // re-subscriber observes current state, not just the cache.
        if entry.subscribers.insert(sub_id, subscription).is_some() {
            entry.computation.notify_changes();
        }
    }

    pub(crate) fn unsubscribe(
        &self,
        ctx: &ConnectionCtx,
        name: String,
        sub_id: String,
        params: Option<Value>,
    ) {
        let validator = match ctx.actions.get(&name) {
            Some(Action::Query(query)) => query.validator_ref(),
            _ => None,
        };
        let Ok(validated) = validate_params(validator, params) else {
            // Nothing could have been subscribed under unparsable params.
            return;
        };
        let key = SubKey {
            session: ctx.session,
            action: name,
            fingerprint: fingerprint(Some(&validated)),
        };

        let mut active = lock_recover(&self.active);
        if let Some(entry) = active.get_mut(&key) {
            entry.subscribers.remove(&sub_id);
            if entry.subscribers.is_empty() {
                active.remove(&key);
            }
        }
    }

    pub(crate) fn mutate(
        &self,
        ctx: &ConnectionCtx,
        name: String,
        request_id: String,
        params: Option<Value>,
    ) {
        let Some(action) = ctx.actions.get(&name) else {
            ctx.send(ServerFrame::mutation_error(
                &name,
                &request_id,
                format!("unknown action \"{name}\""),
            ));
            return;
        };
        let Action::Mutation(mutation) = action else {
            ctx.send(ServerFrame::mutation_error(
                &name,
                &request_id,
                format!("action \"{name}\" is not a mutation"),
            ));
            return;
        };

        let validated = match validate_params(mutation.validator_ref(), params) {
            Ok(validated) => validated,
            Err(err) => {
                ctx.send(ServerFrame::mutation_error(&name, &request_id, err.message));
                return;
            }
        };

        match mutation.invoke(validated) {
            Ok(data) => ctx.send(ServerFrame::mutation_result(&name, &request_id, data)),
            Err(err) => ctx.send(ServerFrame::mutation_error(
                &name,
                &request_id,
                err.to_string(),
            )),
        }
    }

    /// Cancel and drop every entry owned by `session`.
    pub fn close_session(&self, session: SessionId) {
        let mut active = lock_recover(&self.active);
        active.retain(|key, _| key.session != session);
    }

    /// Live computation count, for tests and introspection.
    pub fn active_computations(&self) -> usize {
        lock_recover(&self.active).len()
    }
}

//! End-to-end scenarios over real TCP connections.

mod fixtures;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{Value, json};

use fixtures::TestServer;
use ripple_rs::reactive::{Notifier, SessionStore};
use ripple_rs::server::{Action, ActionMap, JsonType, Mutation, ObjectSchema, Query};

/// A tiny "table": shared rows plus a change notifier.
#[derive(Clone)]
struct ItemsTable {
    rows: Arc<Mutex<Vec<Value>>>,
    changed: Notifier,
}

impl ItemsTable {
    fn new() -> Self {
        Self {
            rows: Arc::new(Mutex::new(Vec::new())),
            changed: Notifier::new(),
        }
    }

    fn insert(&self, row: Value) {
        self.rows.lock().unwrap().push(row);
        self.changed.notify();
    }

    fn snapshot(&self) -> Value {
        Value::Array(self.rows.lock().unwrap().clone())
    }
}

fn items_endpoint(table: &ItemsTable) -> ripple_rs::server::EndpointFactory {
    let table = table.clone();
    Arc::new(move || {
        let mut actions = ActionMap::new();
        let reader = table.clone();
        actions.insert(
            "itemsList".to_string(),
            Action::Query(
                Query::live(move |_| Ok(reader.snapshot()))
                    .deps(vec![Arc::new(table.changed.clone())]),
            ),
        );
        let writer = table.clone();
        actions.insert(
            "addItem".to_string(),
            Action::Mutation(
                Mutation::new(move |params| {
                    writer.insert(params.clone());
                    Ok(json!("ok"))
                })
                .validator(ObjectSchema::new().field("name", JsonType::String)),
            ),
        );
        actions
    })
}

fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(10));
    }
}

// S1: live list, initial empty result, push on external change.
#[test]
fn live_items_list_pushes_on_notify() {
    let table = ItemsTable::new();
    let server = TestServer::start(items_endpoint(&table));
    let mut client = server.connect();

    client.subscribe("itemsList", "a", Value::Null);
    assert_eq!(client.recv_update("a"), json!([]));

    table.insert(json!({"id": 1, "name": "x"}));
    assert_eq!(client.recv_update("a"), json!([{"id": 1, "name": "x"}]));
}

// S2: session store isolation across connections.
#[test]
fn login_updates_only_the_mutating_session() {
    let user: SessionStore<Value> = SessionStore::new(Value::Null);
    let factory: ripple_rs::server::EndpointFactory = {
        let user = user.clone();
        Arc::new(move || {
            let mut actions = ActionMap::new();
            actions.insert(
                "sessionUser".to_string(),
                Action::Query(Query::from_session_store(user.clone())),
            );
            let slot = user.clone();
            actions.insert(
                "login".to_string(),
                Action::Mutation(
                    Mutation::new(move |params| {
                        slot.set(params.clone())?;
                        Ok(json!("logged in"))
                    })
                    .validator(ObjectSchema::new().field("username", JsonType::String)),
                ),
            );
            actions
        })
    };
    let server = TestServer::start(factory);

    let mut c1 = server.connect();
    let mut c2 = server.connect();
    c1.subscribe("sessionUser", "s", Value::Null);
    c2.subscribe("sessionUser", "s", Value::Null);
    assert_eq!(c1.recv_update("s"), Value::Null);
    assert_eq!(c2.recv_update("s"), Value::Null);

    c1.mutate("login", "r1", json!({"username": "alice"}));

    // Reply and the resulting update race; accept either order.
    let mut got_result = false;
    let mut got_update = false;
    while !(got_result && got_update) {
        let frame = c1.recv();
        match frame["type"].as_str() {
            Some("mutationResult") => {
                assert_eq!(frame["requestId"], "r1");
                got_result = true;
            }
            Some("update") => {
                assert_eq!(frame["data"], json!({"username": "alice"}));
                got_update = true;
            }
            other => panic!("unexpected frame type {other:?}"),
        }
    }

    assert_eq!(c2.try_recv(Duration::from_millis(200)), None);
}

// S3: dedup within one session; unsubscribing one leaves the other.
#[test]
fn identical_subscriptions_share_and_fan_out_per_sub_id() {
    let table = ItemsTable::new();
    let server = TestServer::start(items_endpoint(&table));
    let mut client = server.connect();

    client.subscribe("itemsList", "x", json!({"kind": "all", "limit": 10}));
    assert_eq!(client.recv_update("x"), json!([]));
    // Same params, different key order: same computation.
    client.subscribe("itemsList", "y", json!({"limit": 10, "kind": "all"}));
    assert_eq!(client.recv_update("y"), json!([]));

    // One computation holds exactly one watch on the notifier.
    wait_until("shared dep watch", || table.changed.subscriber_count() == 1);

    table.insert(json!({"id": 1}));
    let mut ids = vec![];
    for _ in 0..2 {
        let frame = client.recv_until(|frame| frame["type"] == "update");
        assert_eq!(frame["data"], json!([{"id": 1}]));
        ids.push(frame["subId"].as_str().unwrap().to_string());
    }
    ids.sort();
    assert_eq!(ids, vec!["x", "y"]);

    client.unsubscribe("itemsList", "x", json!({"kind": "all", "limit": 10}));
    std::thread::sleep(Duration::from_millis(100));
    table.insert(json!({"id": 2}));
    let frame = client.recv_until(|frame| frame["type"] == "update");
    assert_eq!(frame["subId"], "y");
    assert_eq!(client.try_recv(Duration::from_millis(200)), None);
}

// S4: fires during an in-flight run coalesce into one follow-up.
#[test]
fn overlapping_fires_produce_exactly_one_follow_up() {
    let dep = Notifier::new();
    let runs = Arc::new(Mutex::new(0u32));
    let factory: ripple_rs::server::EndpointFactory = {
        let dep = dep.clone();
        let runs = Arc::clone(&runs);
        Arc::new(move || {
            let mut actions = ActionMap::new();
            let counter = Arc::clone(&runs);
            actions.insert(
                "slow".to_string(),
                Action::Query(
                    Query::live(move |_| {
                        let run = {
                            let mut guard = counter.lock().unwrap();
                            *guard += 1;
                            *guard
                        };
                        std::thread::sleep(Duration::from_millis(100));
                        Ok(json!(run))
                    })
                    .deps(vec![Arc::new(dep.clone())]),
                ),
            );
            actions
        })
    };
    let server = TestServer::start(factory);
    let mut client = server.connect();

    client.subscribe("slow", "a", Value::Null);
    wait_until("first run in flight", || *runs.lock().unwrap() == 1);
    for _ in 0..5 {
        dep.notify();
    }

    assert_eq!(client.recv_update("a"), json!(1));
    assert_eq!(client.recv_update("a"), json!(2));
    assert_eq!(client.try_recv(Duration::from_millis(300)), None);
    assert_eq!(*runs.lock().unwrap(), 2);
}

// S5: validation failure leaves the connection open and state untouched.
#[test]
fn invalid_mutation_params_yield_an_error_frame() {
    let table = ItemsTable::new();
    let server = TestServer::start(items_endpoint(&table));
    let mut client = server.connect();

    client.mutate("addItem", "r", json!({"name": 42}));
    let frame = client.recv();
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["requestId"], "r");
    assert!(frame["message"].as_str().unwrap().contains("\"name\""));
    assert_eq!(table.snapshot(), json!([]));

    // The connection still works.
    client.mutate("addItem", "r2", json!({"name": "x"}));
    let frame = client.recv_until(|frame| frame["type"] == "mutationResult");
    assert_eq!(frame["requestId"], "r2");
    assert_eq!(table.snapshot(), json!([{"name": "x"}]));
}

// S6: disconnect cancels subscriptions and releases dependencies.
#[test]
fn disconnect_tears_down_subscriptions() {
    let table = ItemsTable::new();
    let server = TestServer::start(items_endpoint(&table));

    let mut client = server.connect();
    client.subscribe("itemsList", "a", Value::Null);
    assert_eq!(client.recv_update("a"), json!([]));
    wait_until("dep watch attached", || table.changed.subscriber_count() == 1);

    drop(client);
    wait_until("dep watch released", || {
        table.changed.subscriber_count() == 0
    });

    // Firing afterwards reaches nobody and breaks nothing.
    table.insert(json!({"id": 1}));

    let mut fresh = server.connect();
    fresh.subscribe("itemsList", "b", Value::Null);
    assert_eq!(fresh.recv_update("b"), json!([{"id": 1}]));
}

#[test]
fn unknown_action_and_bad_frames_do_not_disconnect() {
    let table = ItemsTable::new();
    let server = TestServer::start(items_endpoint(&table));
    let mut client = server.connect();

    client.subscribe("nope", "a", Value::Null);
    let frame = client.recv();
    assert_eq!(frame["type"], "error");
    assert!(frame["message"].as_str().unwrap().contains("unknown action"));

    client.send_raw("this is not json");
    let frame = client.recv();
    assert_eq!(frame["type"], "error");

    client.subscribe("itemsList", "a", Value::Null);
    assert_eq!(client.recv_update("a"), json!([]));
}

#[test]
fn mutation_reply_correlates_by_request_id() {
    let table = ItemsTable::new();
    let server = TestServer::start(items_endpoint(&table));
    let mut client = server.connect();

    client.mutate("addItem", "first", json!({"name": "a"}));
    client.mutate("addItem", "second", json!({"name": "b"}));

    let frame = client.recv_until(|frame| frame["type"] == "mutationResult");
    assert_eq!(frame["requestId"], "first");
    let frame = client.recv_until(|frame| frame["type"] == "mutationResult");
    assert_eq!(frame["requestId"], "second");
}

#[test]
fn immediate_query_answers_once_and_stays_silent() {
    let factory: ripple_rs::server::EndpointFactory = Arc::new(|| {
        let mut actions = ActionMap::new();
        actions.insert(
            "echo".to_string(),
            Action::Query(Query::immediate(|params| Ok(params))),
        );
        actions
    });
    let server = TestServer::start(factory);
    let mut client = server.connect();

    client.subscribe("echo", "a", json!({"k": 1}));
    assert_eq!(client.recv_update("a"), json!({"k": 1}));
    assert_eq!(client.try_recv(Duration::from_millis(200)), None);
}

#[test]
fn compute_failure_is_reported_per_subscriber_and_retries() {
    let dep = Notifier::new();
    let healthy = Arc::new(Mutex::new(false));
    let factory: ripple_rs::server::EndpointFactory = {
        let dep = dep.clone();
        let healthy = Arc::clone(&healthy);
        Arc::new(move || {
            let mut actions = ActionMap::new();
            let flag = Arc::clone(&healthy);
            actions.insert(
                "flaky".to_string(),
                Action::Query(
                    Query::live(move |_| {
                        if *flag.lock().unwrap() {
                            Ok(json!("fine"))
                        } else {
                            Err(ripple_rs::ComputeError::failed("backend down"))
                        }
                    })
                    .deps(vec![Arc::new(dep.clone())]),
                ),
            );
            actions
        })
    };
    let server = TestServer::start(factory);
    let mut client = server.connect();

    client.subscribe("flaky", "a", Value::Null);
    let frame = client.recv();
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["subId"], "a");
    assert!(frame["message"].as_str().unwrap().contains("backend down"));

    // The subscription survived; the next fire retries.
    *healthy.lock().unwrap() = true;
    dep.notify();
    assert_eq!(client.recv_update("a"), json!("fine"));
}

#![allow(dead_code)]

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use serde_json::Value;

use ripple_rs::config::Config;
use ripple_rs::server::{EndpointFactory, Server, ServerHandle};

/// An in-process server bound to an ephemeral port.
pub struct TestServer {
    handle: ServerHandle,
    join: Option<std::thread::JoinHandle<()>>,
}

impl TestServer {
    pub fn start(factory: EndpointFactory) -> Self {
        let config = Config {
            listen_addr: "127.0.0.1:0".to_string(),
            ..Config::default()
        };
        let server = Server::bind(&config, factory).expect("bind server");
        let handle = server.handle().expect("server handle");
        let join = std::thread::spawn(move || {
            let _ = server.run();
        });
        Self {
            handle,
            join: Some(join),
        }
    }

    pub fn connect(&self) -> TestClient {
        TestClient::connect(&self.handle)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.shutdown();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// ndjson client speaking the wire protocol.
pub struct TestClient {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl TestClient {
    pub fn connect(handle: &ServerHandle) -> Self {
        let deadline = Instant::now() + Duration::from_secs(5);
        let stream = loop {
            match TcpStream::connect(handle.addr()) {
                Ok(stream) => break stream,
                Err(err) => {
                    assert!(Instant::now() < deadline, "connect failed: {err}");
                    std::thread::sleep(Duration::from_millis(10));
                }
            }
        };
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("read timeout");
        let reader = BufReader::new(stream.try_clone().expect("clone stream"));
        Self { stream, reader }
    }

    pub fn send(&mut self, frame: Value) {
        let mut line = frame.to_string();
        line.push('\n');
        self.stream.write_all(line.as_bytes()).expect("send frame");
    }

    pub fn send_raw(&mut self, line: &str) {
        self.stream
            .write_all(format!("{line}\n").as_bytes())
            .expect("send raw");
    }

    pub fn subscribe(&mut self, name: &str, sub_id: &str, params: Value) {
        self.send(serde_json::json!({
            "type": "subscribe", "name": name, "subId": sub_id, "params": params
        }));
    }

    pub fn unsubscribe(&mut self, name: &str, sub_id: &str, params: Value) {
        self.send(serde_json::json!({
            "type": "unsubscribe", "name": name, "subId": sub_id, "params": params
        }));
    }

    pub fn mutate(&mut self, name: &str, request_id: &str, params: Value) {
        self.send(serde_json::json!({
            "type": "mutation", "name": name, "requestId": request_id, "params": params
        }));
    }

    /// Next frame, as parsed JSON. Panics on timeout or disconnect.
    pub fn recv(&mut self) -> Value {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).expect("read frame");
        assert!(n > 0, "server closed the connection");
        serde_json::from_str(line.trim_end()).expect("parse frame")
    }

    /// Next frame, or None if nothing arrives within `wait`.
    pub fn try_recv(&mut self, wait: Duration) -> Option<Value> {
        self.stream
            .set_read_timeout(Some(wait))
            .expect("read timeout");
        let mut line = String::new();
        let result = self.reader.read_line(&mut line);
        self.stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("read timeout");
        match result {
            Ok(0) => None,
            Ok(_) => Some(serde_json::from_str(line.trim_end()).expect("parse frame")),
            Err(_) => None,
        }
    }

    /// Receive frames until one matches, failing after the deadline.
    pub fn recv_until(&mut self, mut matches: impl FnMut(&Value) -> bool) -> Value {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            assert!(Instant::now() < deadline, "timed out waiting for frame");
            let frame = self.recv();
            if matches(&frame) {
                return frame;
            }
        }
    }

    /// Receive an update for `sub_id` and return its `data`.
    pub fn recv_update(&mut self, sub_id: &str) -> Value {
        let frame = self.recv_until(|frame| {
            frame["type"] == "update" && frame["subId"] == sub_id
        });
        frame["data"].clone()
    }
}

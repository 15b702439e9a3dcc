//! Scripted in-memory transport for tests.
//!
//! [`MockConnector`] plugs into the [`Connector`] seam. Every dial yields a
//! fresh [`MockServer`] whose sink parses outbound frames and answers
//! `/meta/*` requests synchronously, so whole connect/subscribe/reconnect
//! flows run without sockets or real time.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use bayeux_protocol::frame;

use crate::transport::{Connector, FrameSink, FrameStream, TransportError};

/// Behavior knobs shared by every connection a connector hands out.
#[derive(Default)]
struct Script {
    /// Dials left to refuse before accepting.
    fail_dials: AtomicU32,
    /// Channels whose subscribe requests get a 403.
    forbidden: StdMutex<HashSet<String>>,
    /// Auto-ack `/meta/connect` heartbeats.
    ack_connects: AtomicBool,
    /// Leave `/meta/handshake` requests unanswered; the test replies by hand.
    mute_handshakes: AtomicBool,
    /// Answer `/meta/disconnect` (on by default).
    mute_disconnects: AtomicBool,
    /// Reject `/meta/unsubscribe` requests.
    fail_unsubscribes: AtomicBool,
    /// Handshakes served so far, across connections; names c1, c2, ...
    handshakes: AtomicU32,
}

#[derive(Clone)]
pub(crate) struct MockConnector {
    script: Arc<Script>,
    dials: Arc<AtomicU32>,
    servers: Arc<StdMutex<Vec<MockServer>>>,
}

impl MockConnector {
    pub(crate) fn new() -> Self {
        Self {
            script: Arc::new(Script::default()),
            dials: Arc::new(AtomicU32::new(0)),
            servers: Arc::new(StdMutex::new(Vec::new())),
        }
    }

    pub(crate) fn arc(&self) -> Arc<dyn Connector> {
        Arc::new(self.clone())
    }

    /// Total dial attempts, including refused ones.
    pub(crate) fn dials(&self) -> u32 {
        self.dials.load(Ordering::SeqCst)
    }

    /// Refuses the next `n` dials.
    pub(crate) fn fail_dials(&self, n: u32) {
        self.script.fail_dials.store(n, Ordering::SeqCst);
    }

    pub(crate) fn forbid(&self, channel: &str) {
        self.script
            .forbidden
            .lock()
            .unwrap()
            .insert(channel.to_owned());
    }

    pub(crate) fn ack_connects(&self, ack: bool) {
        self.script.ack_connects.store(ack, Ordering::SeqCst);
    }

    pub(crate) fn mute_handshakes(&self) {
        self.script.mute_handshakes.store(true, Ordering::SeqCst);
    }

    pub(crate) fn mute_disconnects(&self) {
        self.script.mute_disconnects.store(true, Ordering::SeqCst);
    }

    pub(crate) fn fail_unsubscribes(&self) {
        self.script.fail_unsubscribes.store(true, Ordering::SeqCst);
    }

    /// The latest accepted connection. Panics when none exists.
    pub(crate) fn server(&self) -> MockServer {
        self.servers
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no connection accepted yet")
    }

    /// Waits until the `n`-th (1-based) connection is accepted.
    pub(crate) async fn wait_for_dial(&self, n: usize) -> MockServer {
        let servers = self.servers.clone();
        wait_until(move || servers.lock().unwrap().get(n - 1).cloned()).await
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        _url: &str,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>), TransportError> {
        self.dials.fetch_add(1, Ordering::SeqCst);

        let remaining = &self.script.fail_dials;
        if remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TransportError::Closed);
        }

        let (to_client, from_server) = mpsc::unbounded_channel();
        let conn = Arc::new(Conn {
            script: self.script.clone(),
            received: StdMutex::new(Vec::new()),
            to_client: StdMutex::new(Some(to_client)),
            fail_writes: AtomicBool::new(false),
        });
        self.servers
            .lock()
            .unwrap()
            .push(MockServer { conn: conn.clone() });

        Ok((
            Box::new(MockSink { conn }),
            Box::new(MockStream { rx: from_server }),
        ))
    }
}

struct Conn {
    script: Arc<Script>,
    received: StdMutex<Vec<Value>>,
    to_client: StdMutex<Option<mpsc::UnboundedSender<Result<String, TransportError>>>>,
    fail_writes: AtomicBool,
}

impl Conn {
    fn push_frame(&self, messages: Vec<Value>) {
        if messages.is_empty() {
            return;
        }
        if let Some(tx) = self.to_client.lock().unwrap().as_ref() {
            let _ = tx.send(Ok(Value::Array(messages).to_string()));
        }
    }

    fn reply_to(&self, msg: &Value) -> Vec<Value> {
        let script = &self.script;
        let chan = msg["channel"].as_str().unwrap_or_default();
        let id = msg.get("id").cloned().unwrap_or(Value::Null);
        match chan {
            "/meta/handshake" => {
                if script.mute_handshakes.load(Ordering::SeqCst) {
                    return Vec::new();
                }
                let n = script.handshakes.fetch_add(1, Ordering::SeqCst) + 1;
                vec![json!({
                    "id": id,
                    "channel": "/meta/handshake",
                    "successful": true,
                    "clientId": format!("c{n}"),
                    "version": "1.0",
                    "supportedConnectionTypes": ["websocket"],
                })]
            }
            "/meta/connect" => {
                if script.ack_connects.load(Ordering::SeqCst) {
                    vec![json!({
                        "id": id,
                        "channel": "/meta/connect",
                        "successful": true,
                    })]
                } else {
                    Vec::new()
                }
            }
            "/meta/subscribe" => {
                let sub = msg["subscription"].as_str().unwrap_or_default();
                if script.forbidden.lock().unwrap().contains(sub) {
                    vec![json!({
                        "id": id,
                        "channel": "/meta/subscribe",
                        "subscription": sub,
                        "successful": false,
                        "error": "403:uid=7:forbidden",
                    })]
                } else {
                    vec![json!({
                        "id": id,
                        "channel": "/meta/subscribe",
                        "subscription": sub,
                        "successful": true,
                    })]
                }
            }
            "/meta/unsubscribe" => {
                let sub = msg["subscription"].as_str().unwrap_or_default();
                if script.fail_unsubscribes.load(Ordering::SeqCst) {
                    vec![json!({
                        "id": id,
                        "channel": "/meta/unsubscribe",
                        "subscription": sub,
                        "successful": false,
                        "error": "500::unsubscribe refused",
                    })]
                } else {
                    vec![json!({
                        "id": id,
                        "channel": "/meta/unsubscribe",
                        "subscription": sub,
                        "successful": true,
                    })]
                }
            }
            "/meta/disconnect" => {
                if script.mute_disconnects.load(Ordering::SeqCst) {
                    Vec::new()
                } else {
                    vec![json!({
                        "id": id,
                        "channel": "/meta/disconnect",
                        "successful": true,
                    })]
                }
            }
            _ => Vec::new(),
        }
    }
}

struct MockSink {
    conn: Arc<Conn>,
}

#[async_trait]
impl FrameSink for MockSink {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        if self.conn.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.conn.to_client.lock().unwrap().is_none() {
            return Err(TransportError::Closed);
        }
        // The socket writes either a framed array or (in socket-level tests)
        // a bare object.
        let messages = frame::decode(&text)
            .unwrap_or_else(|_| vec![serde_json::from_str(&text).expect("sink got non-JSON")]);
        let mut replies = Vec::new();
        for msg in messages {
            self.conn.received.lock().unwrap().push(msg.clone());
            replies.extend(self.conn.reply_to(&msg));
        }
        self.conn.push_frame(replies);
        Ok(())
    }

    async fn close(&mut self, _code: u16, _reason: &str) {
        self.conn.to_client.lock().unwrap().take();
    }
}

struct MockStream {
    rx: mpsc::UnboundedReceiver<Result<String, TransportError>>,
}

#[async_trait]
impl FrameStream for MockStream {
    async fn next(&mut self) -> Option<Result<String, TransportError>> {
        self.rx.recv().await
    }
}

/// Test-facing handle to one accepted connection.
#[derive(Clone)]
pub(crate) struct MockServer {
    conn: Arc<Conn>,
}

impl MockServer {
    /// Every message received on this connection, in arrival order.
    pub(crate) fn received(&self) -> Vec<Value> {
        self.conn.received.lock().unwrap().clone()
    }

    pub(crate) fn received_on(&self, channel: &str) -> Vec<Value> {
        self.received()
            .into_iter()
            .filter(|m| m["channel"] == channel)
            .collect()
    }

    pub(crate) async fn wait_for_frames(&self, n: usize) -> Vec<Value> {
        let conn = self.conn.clone();
        wait_until(move || {
            let received = conn.received.lock().unwrap();
            (received.len() >= n).then(|| received.clone())
        })
        .await
    }

    pub(crate) async fn wait_for_on(&self, channel: &str, n: usize) -> Vec<Value> {
        let server = self.clone();
        let channel = channel.to_owned();
        wait_until(move || {
            let matching = server.received_on(&channel);
            (matching.len() >= n).then_some(matching)
        })
        .await
    }

    /// Injects a server-initiated frame.
    pub(crate) fn push(&self, messages: Vec<Value>) {
        self.conn.push_frame(messages);
    }

    pub(crate) fn push_one(&self, message: Value) {
        self.push(vec![message]);
    }

    /// Makes subsequent writes fail without closing the connection.
    pub(crate) fn fail_writes(&self, fail: bool) {
        self.conn.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Severs the connection: the client's reader sees end-of-stream.
    pub(crate) fn drop_connection(&self) {
        self.conn.to_client.lock().unwrap().take();
    }
}

/// Polls `probe` until it yields, sleeping between polls; paused-time tests
/// auto-advance through the sleeps. Panics after a generous cap.
pub(crate) async fn wait_until<T>(mut probe: impl FnMut() -> Option<T>) -> T {
    for _ in 0..10_000 {
        if let Some(value) = probe() {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

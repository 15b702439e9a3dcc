//! The Bayeux session.
//!
//! [`BayeuxClient`] owns a [`StatefulSocket`] and layers the protocol on
//! top: the `/meta/handshake`, the `/meta/connect` heartbeat, id-correlated
//! request/response, the subscription registry rebuilt after every
//! reconnect, and advice-driven reconnect policy. Shared state travels in a
//! clonable [`SessionContext`] so the dispatch and reconnect paths can run
//! as free functions over it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use bayeux_protocol::constants::{CLOSE_NORMAL, REQUEST_TIMEOUT};
use bayeux_protocol::{
    frame, Advice, ConnectRequest, DataMessage, DisconnectRequest, HandshakeRequest,
    ResponseError, ResponseMessage, SubscribeRequest, UnsubscribeRequest,
};

use crate::dispatch;
use crate::error::ClientError;
use crate::reachability::ReachabilityHandle;
use crate::socket::{SerializeFn, StatefulSocket};
use crate::transport::{Connector, WsConnector};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Bayeux endpoint, e.g. `ws://host:8080/bayeux`.
    pub url: String,
    /// Bound on every id-correlated request/response wait.
    pub request_timeout: Duration,
    /// Opaque `ext` passed through on handshake and heartbeat messages.
    pub ext: Option<Value>,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            request_timeout: REQUEST_TIMEOUT,
            ext: None,
        }
    }

    pub fn with_ext(mut self, ext: Value) -> Self {
        self.ext = Some(ext);
        self
    }
}

pub(crate) type SubscriptionHandler = Arc<dyn Fn(&Value) + Send + Sync>;

pub(crate) struct SessionState {
    pub(crate) config: ClientConfig,
    pub(crate) client_id: StdMutex<Option<String>>,
    pub(crate) id_counter: AtomicU64,
    pub(crate) pending: StdMutex<HashMap<u64, oneshot::Sender<Value>>>,
    pub(crate) subscriptions: StdMutex<HashMap<String, SubscriptionHandler>>,
    pub(crate) advice: StdMutex<Advice>,
    pub(crate) heartbeat_tx: mpsc::Sender<()>,
    /// Taken by the first `connect()`, which spawns the heartbeat loop.
    pub(crate) heartbeat_rx: StdMutex<Option<mpsc::Receiver<()>>>,
    /// Token of the active reconnect loop, if any.
    pub(crate) reconnect_cancel: StdMutex<Option<CancellationToken>>,
    /// Session lifetime; cancelled when the client is dropped.
    pub(crate) cancel: CancellationToken,
}

/// Everything the dispatch, heartbeat, and reconnect paths need, cheap to
/// clone into spawned tasks.
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub(crate) socket: StatefulSocket,
    pub(crate) state: Arc<SessionState>,
}

impl SessionContext {
    pub(crate) fn next_id(&self) -> u64 {
        self.state.id_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn client_id(&self) -> Option<String> {
        self.state.client_id.lock().ok().and_then(|g| g.clone())
    }

    pub(crate) fn set_client_id(&self, id: String) {
        if let Ok(mut guard) = self.state.client_id.lock() {
            *guard = Some(id);
        }
    }

    pub(crate) fn clear_client_id(&self) {
        if let Ok(mut guard) = self.state.client_id.lock() {
            guard.take();
        }
    }

    pub(crate) fn advice(&self) -> Advice {
        self.state
            .advice
            .lock()
            .map(|g| *g)
            .unwrap_or_default()
    }

    /// Replaces the stored advice wholesale and propagates the interval to
    /// the socket's retry pacing.
    pub(crate) fn set_advice(&self, advice: Advice) {
        if let Ok(mut guard) = self.state.advice.lock() {
            *guard = advice;
        }
        self.socket.set_retry_interval(advice.interval_duration());
    }
}

/// A Bayeux client session over a reconnecting WebSocket.
pub struct BayeuxClient {
    pub(crate) ctx: SessionContext,
}

impl BayeuxClient {
    /// A client on the production WebSocket transport.
    pub fn new(config: ClientConfig, reachability: ReachabilityHandle) -> Self {
        Self::with_connector(config, Arc::new(WsConnector), reachability)
    }

    /// A client on a caller-supplied transport.
    pub fn with_connector(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        reachability: ReachabilityHandle,
    ) -> Self {
        let (heartbeat_tx, heartbeat_rx) = mpsc::channel(1);
        let state = Arc::new(SessionState {
            config: config.clone(),
            client_id: StdMutex::new(None),
            id_counter: AtomicU64::new(0),
            pending: StdMutex::new(HashMap::new()),
            subscriptions: StdMutex::new(HashMap::new()),
            advice: StdMutex::new(Advice::default()),
            heartbeat_tx,
            heartbeat_rx: StdMutex::new(Some(heartbeat_rx)),
            reconnect_cancel: StdMutex::new(None),
            cancel: CancellationToken::new(),
        });

        let serialize: SerializeFn = {
            let state = state.clone();
            Box::new(move |msg| stamp_and_encode(&state, msg))
        };
        let socket = StatefulSocket::new(config.url, connector, reachability, serialize);

        let ctx = SessionContext { socket, state };

        // Install the session's inbound and closed hooks. Both hold the
        // socket weakly: the socket core owns the callbacks, and a strong
        // context in there would keep it alive forever.
        let weak = ctx.socket.downgrade();
        {
            let weak = weak.clone();
            let state = ctx.state.clone();
            ctx.socket.set_message_callback(Box::new(move |text| {
                let Some(socket) = weak.upgrade() else { return };
                let ctx = SessionContext {
                    socket,
                    state: state.clone(),
                };
                dispatch::handle_frame(&ctx, text);
            }));
        }
        {
            let state = ctx.state.clone();
            ctx.socket.set_closed_callback(Box::new(move |args| {
                let Some(socket) = weak.upgrade() else { return };
                let ctx = SessionContext {
                    socket,
                    state: state.clone(),
                };
                dispatch::on_socket_closed(&ctx, args);
            }));
        }

        Self { ctx }
    }

    /// Opens the session: connects the transport (retrying as needed),
    /// handshakes for a `clientId`, and starts the heartbeat. Idempotent;
    /// also re-arms auto-reconnect after a previous `close()`.
    pub async fn connect(&self) -> Result<(), ClientError> {
        dispatch::cancel_active_reconnect(&self.ctx.state);
        self.ctx.socket.enable_auto_reconnect();
        self.ensure_heartbeat();
        execute_connect(&self.ctx).await
    }

    /// Subscribes `handler` to `channel`. Deliveries decode their `data`
    /// field into `T`; undecodable deliveries are logged and dropped. The
    /// registration survives reconnects until [`unsubscribe`] or [`close`].
    ///
    /// [`unsubscribe`]: Self::unsubscribe
    /// [`close`]: Self::close
    pub async fn subscribe<T, F>(
        &self,
        channel: &str,
        handler: F,
    ) -> Result<ResponseMessage, ClientError>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let request = SubscribeRequest::new(channel);
        let response = send_async(&self.ctx, serde_json::to_value(&request)?).await?;

        let logged_channel = channel.to_owned();
        let erased: SubscriptionHandler = Arc::new(move |raw: &Value| match raw.get("data") {
            Some(data) => match serde_json::from_value::<T>(data.clone()) {
                Ok(payload) => handler(payload),
                Err(e) => {
                    warn!(channel = %logged_channel, error = %e, "dropping undecodable delivery")
                }
            },
            None => warn!(channel = %logged_channel, "delivery without data field"),
        });
        if let Ok(mut subs) = self.ctx.state.subscriptions.lock() {
            subs.insert(channel.to_owned(), erased);
        }
        debug!(channel, "subscribed");
        Ok(response)
    }

    /// Unsubscribes from `channel`. The local registration is removed even
    /// when the server rejects the request.
    pub async fn unsubscribe(&self, channel: &str) -> Result<ResponseMessage, ClientError> {
        let request = UnsubscribeRequest::new(channel);
        let result = send_async(&self.ctx, serde_json::to_value(&request)?).await;
        if let Ok(mut subs) = self.ctx.state.subscriptions.lock() {
            subs.remove(channel);
        }
        debug!(channel, "unsubscribed");
        result
    }

    /// Publishes `data` on `channel`. Fire-and-forget: the message is
    /// enqueued (and therefore survives disconnection) and a detached flush
    /// is triggered.
    pub fn publish<T: Serialize>(&self, channel: &str, data: T) -> Result<(), ClientError> {
        let message = DataMessage::new(channel, data);
        let mut msg = serde_json::to_value(&message)?;
        msg["id"] = self.ctx.next_id().into();
        self.ctx.socket.send(msg);
        Ok(())
    }

    /// Closes the session: clears subscriptions, offers the server a
    /// `/meta/disconnect` bounded by `advice.interval`, and tears down the
    /// transport with auto-reconnect suppressed. Subsequent `send`s enqueue
    /// until an explicit [`connect`].
    ///
    /// [`connect`]: Self::connect
    pub async fn close(&self) {
        let ctx = &self.ctx;
        ctx.socket.disable_auto_reconnect();
        dispatch::cancel_active_reconnect(&ctx.state);
        if let Ok(mut subs) = ctx.state.subscriptions.lock() {
            subs.clear();
        }

        if ctx.socket.is_connected() {
            let bound = ctx.advice().interval_duration();
            match serde_json::to_value(&DisconnectRequest::new()) {
                Ok(msg) => {
                    tokio::select! {
                        result = send_async(ctx, msg) => {
                            if let Err(e) = result {
                                debug!(error = %e, "disconnect request failed");
                            }
                        }
                        _ = tokio::time::sleep(bound) => debug!("disconnect timed out"),
                    }
                }
                Err(e) => debug!(error = %e, "disconnect encode failed"),
            }
        }

        ctx.socket.close(CLOSE_NORMAL, "").await;
        info!("session closed");
    }

    pub fn is_connected(&self) -> bool {
        self.ctx.socket.is_connected()
    }

    /// The server-assigned session id, if handshaken.
    pub fn client_id(&self) -> Option<String> {
        self.ctx.client_id()
    }

    /// Messages enqueued and not yet written.
    pub fn queued(&self) -> usize {
        self.ctx.socket.queued()
    }

    fn ensure_heartbeat(&self) {
        let rx = self
            .ctx
            .state
            .heartbeat_rx
            .lock()
            .ok()
            .and_then(|mut g| g.take());
        if let Some(rx) = rx {
            tokio::spawn(dispatch::heartbeat_loop(self.ctx.clone(), rx));
        }
    }
}

impl Drop for BayeuxClient {
    fn drop(&mut self) {
        self.ctx.state.cancel.cancel();
        dispatch::cancel_active_reconnect(&self.ctx.state);
    }
}

/// Stamps the current `clientId` into `msg` (when one exists) and wraps it
/// in a one-element array — the socket's serialize hook. Stamping happens at
/// write time, so messages queued across a re-handshake carry the fresh id.
pub(crate) fn stamp_and_encode(state: &SessionState, msg: &Value) -> String {
    let mut msg = msg.clone();
    let client_id = state.client_id.lock().ok().and_then(|g| g.clone());
    if let (Some(client_id), Some(obj)) = (client_id, msg.as_object_mut()) {
        obj.insert("clientId".to_owned(), Value::String(client_id));
    }
    frame::encode(msg)
}

/// The session connect sequence, under the socket's connecting lock:
/// establish a transport, handshake for a fresh `clientId`, kick the
/// heartbeat, and only then flush queued user messages so they go out
/// stamped with the new id.
pub(crate) async fn execute_connect(ctx: &SessionContext) -> Result<(), ClientError> {
    let _guard = ctx.socket.lock_connecting().await;
    if ctx.socket.is_connected() && ctx.client_id().is_some() {
        return Ok(());
    }
    // Gate the queue for the whole handshake window: a detached flush
    // kicked off by a concurrent publish/subscribe would otherwise write
    // user messages stamped with no (or a stale) clientId as soon as the
    // transport is up.
    let hold = ctx.socket.hold_flush().await;
    if !ctx.socket.is_connected() {
        ctx.socket.establish().await?;
    }

    ctx.clear_client_id();
    let mut request = HandshakeRequest::new();
    request.ext = ctx.state.config.ext.clone();
    let response = send_direct(ctx, serde_json::to_value(&request)?).await?;
    let client_id = response
        .client_id
        .clone()
        .ok_or_else(|| ClientError::Handshake("response carries no clientId".to_owned()))?;
    info!(client_id = %client_id, "handshake complete");
    ctx.set_client_id(client_id);

    send_heartbeat_connect(ctx).await?;
    drop(hold);
    ctx.socket.flush().await;
    Ok(())
}

/// Sends the heartbeat `/meta/connect` on the direct-write path.
pub(crate) async fn send_heartbeat_connect(ctx: &SessionContext) -> Result<(), ClientError> {
    let mut request = ConnectRequest::new();
    request.id = Some(ctx.next_id());
    request.ext = ctx.state.config.ext.clone();
    let text = stamp_and_encode(&ctx.state, &serde_json::to_value(&request)?);
    ctx.socket.write_now(text).await?;
    trace!("heartbeat connect sent");
    Ok(())
}

/// Id-correlated request over the queue: assign an id, register a reply
/// slot, enqueue, await the reply.
pub(crate) async fn send_async(
    ctx: &SessionContext,
    mut msg: Value,
) -> Result<ResponseMessage, ClientError> {
    let id = ctx.next_id();
    msg["id"] = id.into();
    let slot = register_waiter(ctx, id);
    ctx.socket.send(msg);
    await_reply(ctx, slot).await
}

/// Id-correlated request over the direct-write path, bypassing the queue.
/// Only `/meta/*` traffic during connect/close uses this.
async fn send_direct(ctx: &SessionContext, mut msg: Value) -> Result<ResponseMessage, ClientError> {
    let id = ctx.next_id();
    msg["id"] = id.into();
    let slot = register_waiter(ctx, id);
    let text = stamp_and_encode(&ctx.state, &msg);
    ctx.socket.write_now(text).await?;
    await_reply(ctx, slot).await
}

/// A registered reply slot. Deregisters itself on drop, so a wait that is
/// cancelled from outside (`close()` racing a disconnect against its
/// timeout, a reconnect loop cancelled mid-handshake) cannot leak its
/// `pending` entry.
struct ReplySlot {
    state: Arc<SessionState>,
    id: u64,
    rx: Option<oneshot::Receiver<Value>>,
}

impl Drop for ReplySlot {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.state.pending.lock() {
            pending.remove(&self.id);
        }
    }
}

fn register_waiter(ctx: &SessionContext, id: u64) -> ReplySlot {
    let (tx, rx) = oneshot::channel();
    if let Ok(mut pending) = ctx.state.pending.lock() {
        pending.insert(id, tx);
    }
    ReplySlot {
        state: ctx.state.clone(),
        id,
        rx: Some(rx),
    }
}

async fn await_reply(
    ctx: &SessionContext,
    mut slot: ReplySlot,
) -> Result<ResponseMessage, ClientError> {
    let Some(rx) = slot.rx.take() else {
        return Err(ClientError::Closed);
    };
    let outcome = tokio::time::timeout(ctx.state.config.request_timeout, rx).await;
    drop(slot);

    let raw = match outcome {
        Ok(Ok(raw)) => raw,
        Ok(Err(_)) => return Err(ClientError::Closed),
        Err(_) => return Err(ClientError::Timeout),
    };
    let response: ResponseMessage = serde_json::from_value(raw)?;
    if response.successful {
        Ok(response)
    } else {
        let error = response
            .error
            .as_deref()
            .map(ResponseError::parse)
            .unwrap_or_else(|| ResponseError {
                code: 0,
                args: Vec::new(),
                description: "request failed".to_owned(),
            });
        Err(ClientError::Response(error))
    }
}

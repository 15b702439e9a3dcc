//! The stateful, reconnecting socket.
//!
//! Owns one transport at a time, queues outbound messages while
//! disconnected, drains them FIFO once a connection exists, and routes
//! connection loss through a closed callback so the layer above can decide
//! whether to reconnect. The shared core travels behind an `Arc`; spawned
//! tasks hold it weakly so dropping the last socket handle tears everything
//! down.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use bayeux_protocol::constants::{CLOSE_NORMAL, CLOSE_PROTOCOL_ERROR, DEFAULT_INTERVAL};

use crate::reachability::ReachabilityHandle;
use crate::retry::auto_retry;
use crate::transport::{Connector, FrameSink, FrameStream, TransportError};

/// Details delivered with the closed notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseArgs {
    pub code: u16,
    pub reason: String,
}

impl CloseArgs {
    fn normal() -> Self {
        Self {
            code: CLOSE_NORMAL,
            reason: String::new(),
        }
    }
}

pub(crate) type MessageCallback = Box<dyn Fn(&str) + Send + Sync>;
pub(crate) type ClosedCallback = Box<dyn Fn(CloseArgs) + Send + Sync>;
pub(crate) type SerializeFn = Box<dyn Fn(&Value) -> String + Send + Sync>;

/// Dial attempts folded into one reachability-gated retry round. The
/// establish loop itself is unbounded; this only paces how often the gate
/// is re-taken.
const ATTEMPTS_PER_ROUND: u32 = 3;

pub(crate) struct SocketCore {
    url: String,
    connector: Arc<dyn Connector>,
    reachability: ReachabilityHandle,
    queue: StdMutex<VecDeque<Value>>,
    /// The writer. `Some` iff `connected`.
    sink: Mutex<Option<Box<dyn FrameSink>>>,
    connected: AtomicBool,
    /// At most one connect attempt at a time.
    connecting: Mutex<()>,
    /// At most one queue drain at a time.
    flushing: Mutex<()>,
    /// Set while a [`FlushHold`] is live; `flush` refuses to drain so the
    /// session can keep queued user messages off the wire mid-handshake.
    flush_hold: AtomicBool,
    retry_interval: StdMutex<Duration>,
    serialize: SerializeFn,
    on_message: StdMutex<Option<MessageCallback>>,
    on_closed: StdMutex<Option<ClosedCallback>>,
    /// Cleared by `close()` before teardown so explicit shutdown does not
    /// bounce; re-armed by `connect()`.
    auto_reconnect: AtomicBool,
    /// Current-connection marker. A reader whose epoch is stale disposes
    /// silently instead of firing the closed callback again.
    epoch: AtomicU64,
    conn_cancel: StdMutex<Option<CancellationToken>>,
    reader: StdMutex<Option<JoinHandle<()>>>,
    /// Cancels an in-flight establish loop; `close()` swaps in a fresh token
    /// so a later `connect()` starts clean.
    abort: StdMutex<CancellationToken>,
    /// Close details recorded by a local close before the reader unwinds.
    local_close: StdMutex<Option<CloseArgs>>,
    watcher_started: AtomicBool,
    shutdown: CancellationToken,
}

impl Drop for SocketCore {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Ok(guard) = self.abort.lock() {
            guard.cancel();
        }
        if let Ok(guard) = self.conn_cancel.lock() {
            if let Some(cancel) = guard.as_ref() {
                cancel.cancel();
            }
        }
        if let Ok(mut guard) = self.reader.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

/// Reconnecting WebSocket wrapper with an outbound FIFO queue.
#[derive(Clone)]
pub struct StatefulSocket {
    core: Arc<SocketCore>,
}

impl StatefulSocket {
    /// Creates a disconnected socket. `serialize` turns a queued message
    /// into the text written to the wire; the session layer's hook stamps
    /// the current `clientId` and wraps the message in a one-element array.
    pub fn new(
        url: impl Into<String>,
        connector: Arc<dyn Connector>,
        reachability: ReachabilityHandle,
        serialize: SerializeFn,
    ) -> Self {
        let socket = Self {
            core: Arc::new(SocketCore {
                url: url.into(),
                connector,
                reachability,
                queue: StdMutex::new(VecDeque::new()),
                sink: Mutex::new(None),
                connected: AtomicBool::new(false),
                connecting: Mutex::new(()),
                flushing: Mutex::new(()),
                flush_hold: AtomicBool::new(false),
                retry_interval: StdMutex::new(DEFAULT_INTERVAL),
                serialize,
                on_message: StdMutex::new(None),
                on_closed: StdMutex::new(None),
                auto_reconnect: AtomicBool::new(true),
                epoch: AtomicU64::new(0),
                conn_cancel: StdMutex::new(None),
                reader: StdMutex::new(None),
                abort: StdMutex::new(CancellationToken::new()),
                local_close: StdMutex::new(None),
                watcher_started: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        };

        // Default closed handler: reconnect. The session layer replaces this
        // with its advice-aware variant.
        let weak = Arc::downgrade(&socket.core);
        socket.set_closed_callback(Box::new(move |_args| {
            if let Some(core) = weak.upgrade() {
                let socket = StatefulSocket { core };
                if socket.auto_reconnect_enabled() {
                    tokio::spawn(async move {
                        if let Err(e) = socket.connect().await {
                            debug!(error = %e, "reconnect abandoned");
                        }
                    });
                }
            }
        }));

        socket
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        if let Ok(mut guard) = self.core.on_message.lock() {
            *guard = Some(cb);
        }
    }

    pub fn set_closed_callback(&self, cb: ClosedCallback) {
        if let Ok(mut guard) = self.core.on_closed.lock() {
            *guard = Some(cb);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.core.connected.load(Ordering::SeqCst)
    }

    pub fn auto_reconnect_enabled(&self) -> bool {
        self.core.auto_reconnect.load(Ordering::SeqCst)
    }

    pub(crate) fn enable_auto_reconnect(&self) {
        self.core.auto_reconnect.store(true, Ordering::SeqCst);
    }

    pub(crate) fn disable_auto_reconnect(&self) {
        self.core.auto_reconnect.store(false, Ordering::SeqCst);
    }

    /// A weak handle for callbacks the socket core itself stores; a strong
    /// one in there would keep the core alive forever.
    pub(crate) fn downgrade(&self) -> WeakSocket {
        WeakSocket {
            core: Arc::downgrade(&self.core),
        }
    }

    /// Number of messages waiting to be written.
    pub fn queued(&self) -> usize {
        self.core.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    /// Base retry pacing. The session layer overwrites this from
    /// `advice.interval`.
    pub fn set_retry_interval(&self, interval: Duration) {
        if let Ok(mut guard) = self.core.retry_interval.lock() {
            *guard = interval;
        }
    }

    pub(crate) fn retry_interval(&self) -> Duration {
        self.core
            .retry_interval
            .lock()
            .map(|g| *g)
            .unwrap_or(DEFAULT_INTERVAL)
    }

    /// Connects, retrying until a transport exists. Idempotent: concurrent
    /// callers serialize on the connecting lock and the late ones observe
    /// `connected` and return immediately.
    pub async fn connect(&self) -> Result<(), TransportError> {
        self.enable_auto_reconnect();
        let _guard = self.core.connecting.lock().await;
        if self.is_connected() {
            return Ok(());
        }
        self.establish().await?;
        self.flush().await;
        Ok(())
    }

    /// The connecting lock, for callers that run their own post-connect
    /// steps (the session handshakes before flushing).
    pub(crate) async fn lock_connecting(&self) -> MutexGuard<'_, ()> {
        self.core.connecting.lock().await
    }

    /// Suspends queue drains until the returned hold drops, waiting out any
    /// drain already past the gate. `send` keeps enqueueing; the messages
    /// simply stay put. The session holds this across a handshake so no
    /// queued user message is written before a `clientId` exists.
    pub(crate) async fn hold_flush(&self) -> FlushHold {
        self.core.flush_hold.store(true, Ordering::SeqCst);
        drop(self.core.flushing.lock().await);
        FlushHold {
            socket: self.clone(),
        }
    }

    /// The connect loop: unbounded rounds of reachability-gated dial
    /// attempts. Fails only when aborted by `close()` or drop. Callers must
    /// hold the connecting lock.
    pub(crate) async fn establish(&self) -> Result<(), TransportError> {
        let core = &self.core;
        spawn_down_watcher(core);

        loop {
            let abort = match core.abort.lock() {
                Ok(guard) => guard.clone(),
                Err(_) => return Err(TransportError::Closed),
            };
            if abort.is_cancelled() {
                return Err(TransportError::Closed);
            }

            let interval = self.retry_interval();
            let dial = auto_retry(
                &core.reachability,
                || core.connector.connect(&core.url),
                ATTEMPTS_PER_ROUND,
                interval,
            );
            let outcome = tokio::select! {
                _ = abort.cancelled() => return Err(TransportError::Closed),
                outcome = dial => outcome,
            };

            match outcome {
                Ok((sink, stream)) => {
                    let epoch = core.epoch.fetch_add(1, Ordering::SeqCst) + 1;
                    let cancel = CancellationToken::new();
                    if let Ok(mut guard) = core.conn_cancel.lock() {
                        *guard = Some(cancel.clone());
                    }
                    if let Ok(mut guard) = core.local_close.lock() {
                        guard.take();
                    }
                    *core.sink.lock().await = Some(sink);
                    core.connected.store(true, Ordering::SeqCst);

                    let handle =
                        tokio::spawn(read_loop(Arc::downgrade(core), stream, epoch, cancel));
                    if let Ok(mut guard) = core.reader.lock() {
                        // A previous reader, if any, is stale and winds down
                        // on its own.
                        guard.replace(handle);
                    }

                    info!(url = %core.url, "transport connected");
                    return Ok(());
                }
                Err(e) => {
                    warn!(url = %core.url, error = %e, "connect failed; retrying");
                    tokio::select! {
                        _ = abort.cancelled() => return Err(TransportError::Closed),
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
            }
        }
    }

    /// Enqueues a message and detaches a best-effort flush. Never fails:
    /// while disconnected the message simply waits.
    pub fn send(&self, item: Value) {
        if let Ok(mut queue) = self.core.queue.lock() {
            queue.push_back(item);
        }
        let socket = self.clone();
        tokio::spawn(async move {
            socket.flush().await;
        });
    }

    /// Drains the queue while connected: peek, serialize, write, pop. A
    /// failed write leaves the message at the head for the reconnect path
    /// to re-flush. Returns immediately when disconnected.
    pub async fn flush(&self) {
        let core = &self.core;
        let _guard = core.flushing.lock().await;

        loop {
            if !core.connected.load(Ordering::SeqCst) || core.flush_hold.load(Ordering::SeqCst) {
                break;
            }
            let head = core
                .queue
                .lock()
                .ok()
                .and_then(|q| q.front().cloned());
            let Some(item) = head else { break };

            let text = (core.serialize)(&item);
            let mut sink = core.sink.lock().await;
            let Some(writer) = sink.as_mut() else { break };
            match writer.send(text).await {
                Ok(()) => {
                    drop(sink);
                    if let Ok(mut queue) = core.queue.lock() {
                        queue.pop_front();
                    }
                    trace!("message flushed");
                }
                Err(e) => {
                    warn!(error = %e, "write failed; message stays queued");
                    break;
                }
            }
        }
    }

    /// Writes directly to the current transport, bypassing the queue. The
    /// session uses this for `/meta/*` traffic that must not wait behind
    /// queued application messages.
    pub(crate) async fn write_now(&self, text: String) -> Result<(), TransportError> {
        let mut sink = self.core.sink.lock().await;
        match sink.as_mut() {
            Some(writer) => writer.send(text).await,
            None => Err(TransportError::Closed),
        }
    }

    /// Tears down the current transport and suppresses auto-reconnect.
    /// Returns after the closed callback has fired (when a connection
    /// existed to close).
    pub async fn close(&self, code: u16, reason: &str) {
        let core = &self.core;
        core.auto_reconnect.store(false, Ordering::SeqCst);
        if let Ok(mut abort) = core.abort.lock() {
            abort.cancel();
            *abort = CancellationToken::new();
        }
        if let Ok(mut guard) = core.local_close.lock() {
            *guard = Some(CloseArgs {
                code,
                reason: reason.to_owned(),
            });
        }

        if let Some(mut sink) = core.sink.lock().await.take() {
            sink.close(code, reason).await;
        }
        if let Some(cancel) = core.conn_cancel.lock().ok().and_then(|mut g| g.take()) {
            cancel.cancel();
        }

        let handle = core.reader.lock().ok().and_then(|mut g| g.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                debug!(error = %e, "reader task ended abnormally");
            }
        }
        if let Ok(mut guard) = core.local_close.lock() {
            guard.take();
        }
        debug!("socket closed");
    }
}

/// Keeps the flush gate closed; dropping it reopens the queue.
pub(crate) struct FlushHold {
    socket: StatefulSocket,
}

impl Drop for FlushHold {
    fn drop(&mut self) {
        self.socket.core.flush_hold.store(false, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub(crate) struct WeakSocket {
    core: Weak<SocketCore>,
}

impl WeakSocket {
    pub(crate) fn upgrade(&self) -> Option<StatefulSocket> {
        self.core.upgrade().map(|core| StatefulSocket { core })
    }
}

/// Forces the transport closed without touching the auto-reconnect flag, so
/// recovery runs through the ordinary closed-callback path.
async fn force_close(core: &Arc<SocketCore>, code: u16, reason: &str) {
    if let Ok(mut guard) = core.local_close.lock() {
        *guard = Some(CloseArgs {
            code,
            reason: reason.to_owned(),
        });
    }
    if let Some(mut sink) = core.sink.lock().await.take() {
        sink.close(code, reason).await;
    }
    if let Some(cancel) = core.conn_cancel.lock().ok().and_then(|mut g| g.take()) {
        cancel.cancel();
    }
}

/// Watches the reachability oracle; an `up -> down` edge while connected
/// force-closes the transport with 1002 rather than leaving it half-open.
fn spawn_down_watcher(core: &Arc<SocketCore>) {
    if core
        .watcher_started
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return;
    }

    let weak = Arc::downgrade(core);
    let mut handle = core.reachability.clone();
    let shutdown = core.shutdown.clone();
    tokio::spawn(async move {
        loop {
            let edge = tokio::select! {
                _ = shutdown.cancelled() => break,
                edge = handle.changed() => edge,
            };
            let Some(up) = edge else { break };
            let Some(core) = weak.upgrade() else { break };
            if !up && core.connected.load(Ordering::SeqCst) {
                info!("network down; forcing transport closed");
                force_close(&core, CLOSE_PROTOCOL_ERROR, "network down").await;
            }
        }
    });
}

/// Per-connection reader. Forwards text frames to the message callback; on
/// exit, if this connection is still current, resets state (disposing the
/// writer first) and fires the closed callback exactly once.
async fn read_loop(
    weak: Weak<SocketCore>,
    mut stream: Box<dyn FrameStream>,
    epoch: u64,
    cancel: CancellationToken,
) {
    let close = loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break None,
            frame = stream.next() => frame,
        };
        match frame {
            Some(Ok(text)) => {
                trace!(len = text.len(), "frame received");
                let Some(core) = weak.upgrade() else { return };
                let lock_result = core.on_message.lock();
                if let Ok(guard) = lock_result {
                    if let Some(cb) = guard.as_ref() {
                        cb(&text);
                    }
                }
            }
            Some(Err(TransportError::ConnectionAborted)) => {
                debug!("connection aborted by peer");
                break Some(CloseArgs {
                    code: CLOSE_PROTOCOL_ERROR,
                    reason: "connection aborted".to_owned(),
                });
            }
            Some(Err(e)) => {
                error!(error = %e, "transport read failed");
                break Some(CloseArgs {
                    code: CLOSE_PROTOCOL_ERROR,
                    reason: e.to_string(),
                });
            }
            None => break Some(CloseArgs::normal()),
        }
    };

    let Some(core) = weak.upgrade() else { return };
    if core.epoch.load(Ordering::SeqCst) != epoch {
        debug!("stale transport wound down");
        return;
    }

    core.connected.store(false, Ordering::SeqCst);
    // Dispose the writer before anyone hears about the closure.
    core.sink.lock().await.take();

    let args = core
        .local_close
        .lock()
        .ok()
        .and_then(|mut g| g.take())
        .or(close)
        .unwrap_or_else(CloseArgs::normal);
    debug!(code = args.code, reason = %args.reason, "connection closed");

    let lock_result = core.on_closed.lock();
    if let Ok(guard) = lock_result {
        if let Some(cb) = guard.as_ref() {
            cb(args);
        }
    }
}

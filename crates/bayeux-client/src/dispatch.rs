//! Inbound routing, the heartbeat loop, and the reconnect loop.
//!
//! A frame is a JSON array; each element routes through, in order: advice
//! replacement, id correlation, the `/meta/connect` heartbeat, and finally
//! the per-channel subscription handlers. Correlation wins over channel
//! routing — a `/meta/*` reply with a registered id is a response, not a
//! delivery.

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use bayeux_protocol::constants::channel;
use bayeux_protocol::{frame, Advice, Reconnect, SubscribeRequest};

use crate::error::ClientError;
use crate::session::{self, SessionContext, SessionState};
use crate::socket::CloseArgs;
use crate::transport::TransportError;

/// Routes one inbound frame. Runs synchronously on the reader task; nothing
/// here blocks.
pub(crate) fn handle_frame(ctx: &SessionContext, text: &str) {
    let messages = match frame::decode(text) {
        Ok(messages) => messages,
        Err(e) => {
            warn!(error = %e, "dropping undecodable frame");
            return;
        }
    };
    for message in messages {
        handle_message(ctx, message);
    }
}

fn handle_message(ctx: &SessionContext, message: Value) {
    // Advice replaces the stored value wholesale, before any routing.
    if let Some(advice) = message.get("advice") {
        match serde_json::from_value::<Advice>(advice.clone()) {
            Ok(advice) => {
                trace!(?advice, "server advice updated");
                ctx.set_advice(advice);
            }
            Err(e) => warn!(error = %e, "ignoring malformed advice"),
        }
    }

    // Response correlation.
    if let Some(id) = message.get("id").and_then(Value::as_u64) {
        let waiter = ctx
            .state
            .pending
            .lock()
            .ok()
            .and_then(|mut pending| pending.remove(&id));
        if let Some(tx) = waiter {
            let _ = tx.send(message);
            return;
        }
    }

    let chan = message
        .get("channel")
        .and_then(Value::as_str)
        .unwrap_or_default();

    // Heartbeat reply: schedule the next /meta/connect. The channel has
    // capacity one, so bursts coalesce.
    if chan == channel::CONNECT {
        let _ = ctx.state.heartbeat_tx.try_send(());
        return;
    }

    let handler = ctx
        .state
        .subscriptions
        .lock()
        .ok()
        .and_then(|subs| subs.get(chan).cloned());
    match handler {
        Some(handler) => handler(&message),
        None => trace!(channel = chan, "no handler for channel"),
    }
}

/// The heartbeat: one long-lived task. Each `/meta/connect` reply signals
/// it; it snapshots advice, sleeps `advice.interval`, and sends the next
/// `/meta/connect`. Advice other than `retry` pauses it until the next
/// signal (a re-handshake kicks a fresh one).
pub(crate) async fn heartbeat_loop(ctx: SessionContext, mut signals: mpsc::Receiver<()>) {
    loop {
        let signal = tokio::select! {
            _ = ctx.state.cancel.cancelled() => break,
            signal = signals.recv() => signal,
        };
        if signal.is_none() {
            break;
        }

        let advice = ctx.advice();
        if advice.reconnect != Reconnect::Retry {
            debug!(?advice, "heartbeat paused by advice");
            continue;
        }
        tokio::select! {
            _ = ctx.state.cancel.cancelled() => break,
            _ = tokio::time::sleep(advice.interval_duration()) => {}
        }
        if !ctx.socket.is_connected() {
            continue;
        }
        if let Err(e) = session::send_heartbeat_connect(&ctx).await {
            debug!(error = %e, "heartbeat send failed");
        }
    }
    debug!("heartbeat loop ended");
}

/// The socket's closed hook: decide whether this closure reconnects.
pub(crate) fn on_socket_closed(ctx: &SessionContext, args: CloseArgs) {
    debug!(code = args.code, reason = %args.reason, "session transport closed");
    // The server-side session died with the connection.
    ctx.clear_client_id();
    if !ctx.socket.auto_reconnect_enabled() {
        return;
    }
    if ctx.advice().reconnect == Reconnect::None {
        info!("server advice is 'none'; staying disconnected");
        return;
    }
    spawn_reconnect(ctx);
}

/// Starts a reconnect loop, cancelling any previous one first so at most
/// one runs at a time.
pub(crate) fn spawn_reconnect(ctx: &SessionContext) {
    cancel_active_reconnect(&ctx.state);
    let cancel = CancellationToken::new();
    if let Ok(mut guard) = ctx.state.reconnect_cancel.lock() {
        *guard = Some(cancel.clone());
    }
    tokio::spawn(reconnect_loop(ctx.clone(), cancel));
}

pub(crate) fn cancel_active_reconnect(state: &SessionState) {
    if let Ok(mut guard) = state.reconnect_cancel.lock() {
        if let Some(token) = guard.take() {
            token.cancel();
        }
    }
}

/// Re-runs the session connect sequence until it sticks, then re-subscribes
/// every registered channel. The fresh `clientId` from the re-handshake
/// invalidates server-side subscriptions, so re-subscription is required
/// for correctness, not hygiene.
async fn reconnect_loop(ctx: SessionContext, cancel: CancellationToken) {
    loop {
        if ctx.advice().reconnect == Reconnect::None {
            info!("server advice is 'none'; abandoning reconnect");
            return;
        }
        let attempt = tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ctx.state.cancel.cancelled() => return,
            attempt = session::execute_connect(&ctx) => attempt,
        };
        match attempt {
            Ok(()) => break,
            Err(ClientError::Transport(TransportError::Closed)) => {
                debug!("reconnect aborted by close");
                return;
            }
            Err(e) => {
                warn!(error = %e, "reconnect failed; retrying");
                let interval = ctx.advice().interval_duration();
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ctx.state.cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        }
    }
    resubscribe_all(&ctx).await;
}

/// Re-issues `/meta/subscribe` for every registered channel, in parallel,
/// exactly once per channel. Failures are logged; the registration stays so
/// the next reconnect tries again.
async fn resubscribe_all(ctx: &SessionContext) {
    let channels: Vec<String> = ctx
        .state
        .subscriptions
        .lock()
        .map(|subs| subs.keys().cloned().collect())
        .unwrap_or_default();
    if channels.is_empty() {
        return;
    }
    info!(count = channels.len(), "re-subscribing after reconnect");

    let ops = channels.into_iter().map(|chan| {
        let ctx = ctx.clone();
        async move {
            let request = SubscribeRequest::new(&chan);
            match serde_json::to_value(&request) {
                Ok(msg) => match session::send_async(&ctx, msg).await {
                    Ok(_) => debug!(channel = %chan, "re-subscribed"),
                    Err(e) => warn!(channel = %chan, error = %e, "re-subscribe failed"),
                },
                Err(e) => warn!(channel = %chan, error = %e, "re-subscribe encode failed"),
            }
        }
    });
    futures_util::future::join_all(ops).await;
}

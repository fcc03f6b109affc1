//! WebSocket session loop: runs one authenticated client from upgrade
//! through disconnect.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use serde_json::json;
use switchboard_core::{Envelope, encode};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::connection::ClientConnection;
use super::handler::{ConnectionHandler, MessageOutcome};
use super::heartbeat::{HeartbeatResult, run_heartbeat};
use crate::config::ServerConfig;
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL,
};

/// How long the writer gets to flush a close frame after the reader stops.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Per-session tuning taken from [`ServerConfig`].
#[derive(Clone, Copy, Debug)]
pub struct SessionOptions {
    /// Interval between server Ping frames and liveness checks.
    pub heartbeat_interval: Duration,
    /// Silence after which the connection is closed.
    pub heartbeat_timeout: Duration,
    /// Outbound queue capacity.
    pub send_buffer: usize,
}

impl From<&ServerConfig> for SessionOptions {
    fn from(config: &ServerConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval(),
            heartbeat_timeout: config.heartbeat_timeout(),
            send_buffer: config.send_buffer.max(1),
        }
    }
}

/// Build the greeting sent to a freshly registered client.
pub fn connected_envelope(connection: &ClientConnection) -> Envelope {
    Envelope::new(
        "connected",
        "connection",
        json!({
            "clientId": connection.id,
            "userId": connection.principal(),
        }),
    )
}

/// Run a WebSocket session for an authenticated client.
///
/// 1. Opens the handler (admits the connection) and queues the greeting
/// 2. Forwards queued frames to the socket, sending Ping frames on the
///    heartbeat interval
/// 3. Feeds inbound text frames to the handler
/// 4. Stops on client close, socket error, heartbeat timeout, eviction or
///    server shutdown (`close` is cancelled)
/// 5. Closes the handler, which deregisters the connection
#[instrument(skip_all, fields(principal = ?handler.principal().map(|p| p.as_str())))]
pub async fn run_ws_session(
    ws: WebSocket,
    mut handler: ConnectionHandler,
    options: SessionOptions,
    close: CancellationToken,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (send_tx, mut send_rx) = mpsc::channel::<Arc<String>>(options.send_buffer);

    let connection = match handler.open(send_tx, close.clone()) {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "cannot open session");
            let _ = ws_tx.send(Message::Close(None)).await;
            return;
        }
    };
    let client_id = connection.id.clone();

    let started = Instant::now();
    info!(%client_id, "client connected");
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

    match encode(&connected_envelope(&connection)) {
        Ok(json) => {
            let _ = connection.send(Arc::new(json));
        }
        Err(e) => warn!(error = %e, "failed to encode greeting"),
    }

    // Outbound writer: queued frames, periodic pings, close frame on hang-up.
    let writer_close = close.clone();
    let ping_every = options.heartbeat_interval.max(Duration::from_millis(1));
    let mut outbound = tokio::spawn(async move {
        let mut ping = tokio::time::interval(ping_every);
        // Skip the immediate first tick
        let _ = ping.tick().await;

        loop {
            tokio::select! {
                () = writer_close.cancelled() => {
                    let frame = CloseFrame {
                        code: close_code::AWAY,
                        reason: "connection closed".into(),
                    };
                    let _ = ws_tx.send(Message::Close(Some(frame))).await;
                    break;
                }
                msg = send_rx.recv() => {
                    let Some(text) = msg else { break };
                    if ws_tx.send(Message::Text(String::clone(&text).into())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if ws_tx.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let heartbeat = {
        let connection = connection.clone();
        let cancel = close.clone();
        tokio::spawn(async move {
            let result = run_heartbeat(
                connection.clone(),
                options.heartbeat_interval,
                options.heartbeat_timeout,
                cancel,
            )
            .await;
            if result == HeartbeatResult::TimedOut {
                warn!(
                    client_id = %connection.id,
                    silent_for = ?connection.last_pong_elapsed(),
                    "client unresponsive, disconnecting"
                );
                connection.close();
            }
        })
    };

    // Inbound loop
    loop {
        let frame = tokio::select! {
            biased;
            () = close.cancelled() => {
                debug!(%client_id, "close requested");
                break;
            }
            frame = ws_rx.next() => frame,
        };

        let msg = match frame {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                debug!(%client_id, error = %e, "socket error");
                break;
            }
            None => break,
        };
        connection.mark_alive();

        let text = match msg {
            Message::Text(ref t) => Some(t.as_str()),
            Message::Binary(ref data) => {
                let text = std::str::from_utf8(data).ok();
                if text.is_none() {
                    info!(%client_id, len = data.len(), "received non-UTF8 binary frame");
                }
                text
            }
            Message::Close(_) => {
                info!(%client_id, "client sent close frame");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => None,
        };
        let Some(text) = text else { continue };

        match handler.on_message(text) {
            Ok(MessageOutcome::Routed(recipients)) => {
                debug!(%client_id, recipients, "client message routed");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(%client_id, error = %e, "message outside open state");
                break;
            }
        }
    }

    // Clean up
    let _ = handler.close();
    close.cancel();
    heartbeat.abort();
    if tokio::time::timeout(CLOSE_GRACE, &mut outbound).await.is_err() {
        outbound.abort();
    }

    info!(%client_id, "client disconnected");
    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
}

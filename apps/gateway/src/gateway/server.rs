//! WebSocket upgrade handler and per-connection event loop.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time;

use crate::AppState;

use super::connection::{Connection, Outbound};
use super::events::Envelope;
use super::handler::{self, CLOSE_DECODE_ERROR};

const CLOSE_NORMAL: u16 = 1000;

/// How long a closing connection may take to flush queued frames.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub fn router() -> Router<AppState> {
    Router::new().route("/gateway", get(ws_upgrade))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: AppState) {
    let (ws_tx, ws_rx) = socket.split();
    let (conn, outbound) = Connection::open();
    state.connections.add(conn.clone());
    tracing::debug!(conn_id = %conn.id, "gateway connection opened");

    let mut writer = tokio::spawn(write_loop(ws_tx, outbound));
    let writer_done = read_loop(&state, &conn, ws_rx, &mut writer).await;

    handler::disconnect(&state, &conn).await;
    state.connections.remove(&conn);

    if !writer_done {
        conn.close(CLOSE_NORMAL, "Connection closed");
        if time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
            tracing::debug!(conn_id = %conn.id, "writer did not drain in time");
        }
    }
    tracing::debug!(conn_id = %conn.id, "gateway connection closed");
}

/// Read envelopes until the client goes away or the writer shuts down.
/// Returns whether the writer has already finished.
///
/// Envelopes are handled one at a time so a connection's messages are
/// processed in arrival order.
async fn read_loop(
    state: &AppState,
    conn: &Arc<Connection>,
    mut ws_rx: SplitStream<WebSocket>,
    writer: &mut JoinHandle<()>,
) -> bool {
    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let envelope: Envelope = match serde_json::from_str(text.as_str()) {
                            Ok(env) => env,
                            Err(_) => {
                                conn.close(CLOSE_DECODE_ERROR, "Invalid JSON");
                                return false;
                            }
                        };
                        handler::route(state, envelope, conn).await;
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => return false,
                    Some(Err(e)) => {
                        tracing::debug!(?e, conn_id = %conn.id, "ws read error");
                        return false;
                    }
                    _ => continue,
                }
            }

            // Writer exits after sending a close frame or on a write error.
            _ = &mut *writer => return true,
        }
    }
}

async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut outbound: UnboundedReceiver<Outbound>,
) {
    while let Some(frame) = outbound.recv().await {
        match frame {
            Outbound::Envelope(envelope) => {
                let json = match serde_json::to_string(&envelope) {
                    Ok(json) => json,
                    Err(err) => {
                        tracing::error!(?err, op = envelope.op, "failed to encode envelope");
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(json.into())).await.is_err() {
                    return;
                }
            }
            Outbound::Close { code, reason } => {
                let _ = send_close(&mut ws_tx, code, &reason).await;
                return;
            }
        }
    }
}

/// Send a WebSocket close frame with a code and reason.
async fn send_close(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    code: u16,
    reason: &str,
) -> Result<(), axum::Error> {
    let close_msg = Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }));
    ws_tx.send(close_msg).await
}

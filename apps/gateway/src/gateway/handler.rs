//! Incoming opcode routing and error reporting.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::error::GatewayError;
use crate::AppState;

use super::connection::Connection;
use super::events::{
    AuthenticatePayload, Envelope, OP_AUTHENTICATE, OP_ERROR, OP_JOIN_ROOM, OP_LEAVE_ROOM,
    OP_ROOM_JOIN_REQUEST,
};

/// Close codes (4000-range for application-level).
pub const CLOSE_UNKNOWN_ERROR: u16 = 4000;
pub const CLOSE_DECODE_ERROR: u16 = 4002;
pub const CLOSE_AUTH_FAILED: u16 = 4004;
pub const CLOSE_SESSION_HIJACK: u16 = 4008;
pub const CLOSE_SESSION_RESUMED: u16 = 4009;

/// Handle one inbound envelope from `conn`.
pub async fn route(state: &AppState, envelope: Envelope, conn: &Arc<Connection>) {
    if let Err(err) = handle(state, envelope, conn).await {
        report(conn, err);
    }
}

/// Run teardown for a connection the transport has lost.
pub async fn disconnect(state: &AppState, conn: &Arc<Connection>) {
    state.auth.disconnect(conn).await;
}

async fn handle(
    state: &AppState,
    envelope: Envelope,
    conn: &Arc<Connection>,
) -> Result<(), GatewayError> {
    if conn.is_superseded() {
        tracing::debug!(conn_id = %conn.id, op = envelope.op, "ignoring op on superseded connection");
        return Ok(());
    }

    if envelope.op == OP_AUTHENTICATE {
        let payload: AuthenticatePayload = envelope
            .payload()
            .map_err(|_| GatewayError::auth("malformed AUTHENTICATE payload"))?;
        return state.auth.authenticate(payload, conn).await;
    }

    if !conn.is_authenticated() {
        tracing::debug!(conn_id = %conn.id, op = envelope.op, "ignoring op before AUTHENTICATE");
        return Ok(());
    }

    match envelope.op {
        OP_JOIN_ROOM => match id_payload(&envelope.d) {
            Some(room_id) => state.rooms.join(&room_id, conn, false).await,
            None => Ok(()),
        },
        OP_LEAVE_ROOM => state.rooms.leave(conn, true).await,
        OP_ROOM_JOIN_REQUEST => match id_payload(&envelope.d) {
            Some(user_id) => state.rooms.accept_join_request(&user_id, conn).await,
            None => Ok(()),
        },
        op => {
            tracing::debug!(conn_id = %conn.id, op, "unhandled opcode");
            Ok(())
        }
    }
}

/// Room and user ids arrive as JSON strings; bare numbers are accepted too.
fn id_payload(d: &Value) -> Option<String> {
    match d {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Fatal errors close the connection. Anything else is logged under a fresh
/// id and the client gets `ERROR { id }`.
fn report(conn: &Connection, err: GatewayError) {
    if err.is_fatal() {
        let (code, reason) = match &err {
            GatewayError::Hijack { .. } => (CLOSE_SESSION_HIJACK, "Session belongs to another user"),
            GatewayError::Auth(_) => (CLOSE_AUTH_FAILED, "Authentication failed"),
            _ => (CLOSE_UNKNOWN_ERROR, "Send failed"),
        };
        tracing::debug!(conn_id = %conn.id, %err, "closing connection");
        conn.close(code, reason);
        return;
    }

    let error_id = roomcast_common::id::prefixed_ulid(roomcast_common::id::prefix::ERROR);
    tracing::error!(%error_id, conn_id = %conn.id, ?err, "gateway handler failed");
    if conn.reply(OP_ERROR, &json!({ "id": error_id })).is_err() {
        tracing::warn!(conn_id = %conn.id, "dropping error envelope for closed connection");
    }
}

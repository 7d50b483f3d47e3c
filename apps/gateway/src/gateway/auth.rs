//! AUTHENTICATE handshake, session resume and disconnect teardown.

use std::sync::Arc;

use serde::Serialize;

use super::connection::Connection;
use super::dispatcher::Dispatcher;
use super::events::{AuthenticatePayload, OP_AUTHENTICATE};
use super::handler::CLOSE_SESSION_RESUMED;
use super::registry::ConnectionRegistry;
use super::rooms::RoomHandler;
use super::session::{Session, SessionDirectory};
use super::target::MessageTarget;
use crate::auth::tokens::TokenVerifier;
use crate::directory::Directory;
use crate::error::GatewayError;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AuthenticateReply {
    session_id: String,
}

pub struct AuthHandler {
    verifier: Arc<dyn TokenVerifier>,
    connections: Arc<ConnectionRegistry>,
    directory: Arc<dyn Directory>,
    sessions: Arc<SessionDirectory>,
    dispatcher: Arc<Dispatcher>,
    rooms: Arc<RoomHandler>,
}

impl AuthHandler {
    pub fn new(
        verifier: Arc<dyn TokenVerifier>,
        connections: Arc<ConnectionRegistry>,
        directory: Arc<dyn Directory>,
        sessions: Arc<SessionDirectory>,
        dispatcher: Arc<Dispatcher>,
        rooms: Arc<RoomHandler>,
    ) -> Self {
        Self {
            verifier,
            connections,
            directory,
            sessions,
            dispatcher,
            rooms,
        }
    }

    /// Authenticate the connection, resuming `session_id` when it belongs to
    /// the same user.
    ///
    /// Every failure comes back fatal, so the router closes the connection.
    /// A connection that is already authenticated ignores further attempts.
    pub async fn authenticate(
        &self,
        payload: AuthenticatePayload,
        conn: &Arc<Connection>,
    ) -> Result<(), GatewayError> {
        if conn.is_authenticated() {
            tracing::debug!(conn_id = %conn.id, "ignoring repeated AUTHENTICATE");
            return Ok(());
        }

        self.handshake(payload, conn).await.map_err(|err| {
            if err.is_fatal() {
                err
            } else {
                GatewayError::auth(err.to_string())
            }
        })
    }

    async fn handshake(
        &self,
        payload: AuthenticatePayload,
        conn: &Arc<Connection>,
    ) -> Result<(), GatewayError> {
        let user_id = self.verifier.verify(&payload.token).await?;
        let user = self
            .directory
            .find_user(&user_id)
            .await?
            .ok_or_else(|| GatewayError::auth(format!("unknown user {user_id}")))?;

        let resumed = match payload.session_id.as_deref() {
            Some(id) => self.claim(id, &user_id).await?,
            None => None,
        };

        conn.set_user(user);
        let session = match resumed {
            Some(stored) => {
                self.sessions.persist(&stored.id).await?;
                self.take_over(&stored.id, conn);
                conn.replace_session(stored.clone());
                stored
            }
            None => {
                let fresh = conn.update_session(|s| s.user_id = Some(user_id.clone()));
                self.sessions.save(&fresh).await?;
                fresh
            }
        };

        let dispatcher = self.dispatcher.clone();
        let target = MessageTarget::user(&user_id);
        conn.set_user_registration(tokio::spawn(async move {
            match dispatcher.register(&target).await {
                Ok(()) => true,
                Err(err) => {
                    tracing::error!(route = ?target.route, ?err, "user channel registration failed");
                    false
                }
            }
        }));

        conn.reply(
            OP_AUTHENTICATE,
            &AuthenticateReply {
                session_id: session.id.clone(),
            },
        )?;
        tracing::info!(
            session_id = %session.id,
            %user_id,
            room_id = ?session.room_id,
            "gateway session established"
        );

        if let Some(room_id) = &session.room_id {
            self.rooms.join(room_id, conn, true).await?;
        }
        Ok(())
    }

    /// Look up a session the client asked to resume.
    ///
    /// A session owned by someone else is a hijack attempt and nothing is
    /// touched. Unknown ids fall back to a fresh session.
    async fn claim(&self, session_id: &str, user_id: &str) -> Result<Option<Session>, GatewayError> {
        let Some(stored) = self.sessions.get(session_id).await? else {
            return Ok(None);
        };
        match stored.user_id.as_deref() {
            Some(owner) if owner == user_id => Ok(Some(stored)),
            Some(owner) => {
                tracing::warn!(%session_id, %user_id, %owner, "session hijack attempt");
                Err(GatewayError::Hijack {
                    session_id: session_id.to_string(),
                })
            }
            None => Ok(None),
        }
    }

    /// Supersede and close other local connections still bound to a session
    /// that `conn` is resuming.
    fn take_over(&self, session_id: &str, conn: &Connection) {
        for old in self.connections.all_for_session(session_id) {
            if old.id == conn.id {
                continue;
            }
            old.supersede();
            old.close(CLOSE_SESSION_RESUMED, "Session resumed on another connection");
            tracing::info!(%session_id, old_conn = %old.id, new_conn = %conn.id, "session taken over");
        }
    }

    /// Tear down after the transport reports the connection gone.
    ///
    /// The session is saved with its room still set and marked for expiry,
    /// so a reconnect inside the window resumes into the same room. A
    /// superseded connection only drops its own channel references.
    pub async fn disconnect(&self, conn: &Arc<Connection>) {
        let session = conn.session();

        if conn.is_superseded() {
            if let Some(user_id) = &session.user_id {
                self.release_user_channel(conn, user_id).await;
            }
            self.rooms.detach(conn).await;
            tracing::info!(session_id = %session.id, conn_id = %conn.id, "superseded connection closed");
            return;
        }

        if let Some(user_id) = &session.user_id {
            if let Err(err) = self.sessions.save(&session).await {
                tracing::error!(session_id = %session.id, ?err, "failed to save session snapshot");
            }
            if let Err(err) = self.sessions.expire(&session.id, self.sessions.expiry()).await {
                tracing::error!(session_id = %session.id, ?err, "failed to mark session for expiry");
            }
            self.release_user_channel(conn, user_id).await;
        }

        if let Err(err) = self.rooms.leave(conn, false).await {
            tracing::error!(session_id = %session.id, ?err, "failed to leave room on disconnect");
        }

        tracing::info!(
            session_id = %session.id,
            user_id = ?session.user_id,
            "gateway session ended"
        );
    }

    /// Undo the user channel registration started at authentication, once it
    /// has finished.
    async fn release_user_channel(&self, conn: &Connection, user_id: &str) {
        let Some(registration) = conn.take_user_registration() else {
            return;
        };
        if registration.await.unwrap_or(false) {
            let target = MessageTarget::user(user_id);
            if let Err(err) = self.dispatcher.unregister(&target).await {
                tracing::error!(%user_id, ?err, "failed to release user channel");
            }
        }
    }
}

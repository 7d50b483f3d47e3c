//! JOIN_ROOM, LEAVE_ROOM and join-request handling.

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;

use super::connection::Connection;
use super::dispatcher::Dispatcher;
use super::events::{OP_ADD_USER, OP_JOIN_ROOM, OP_REMOVE_USER, OP_ROOM_JOIN_REQUEST};
use super::presence::{PresenceDirectory, Removal};
use super::session::SessionDirectory;
use super::target::MessageTarget;
use crate::db::kv::Namespace;
use crate::directory::Directory;
use crate::error::GatewayError;
use crate::models::room::RoomInfo;
use crate::models::user::UserInfo;
use crate::permissions::{self, Permission};

/// Successful JOIN_ROOM reply.
#[derive(Debug, Serialize)]
struct JoinReply {
    status: u16,
    room: RoomInfo,
    users: Vec<UserInfo>,
    permissions: Vec<Permission>,
}

pub struct RoomHandler {
    directory: Arc<dyn Directory>,
    presence: Arc<PresenceDirectory>,
    sessions: Arc<SessionDirectory>,
    dispatcher: Arc<Dispatcher>,
    /// One-time invites live at `rooms.invites.<roomId>`, field `userId`.
    invites: Namespace,
}

impl RoomHandler {
    pub fn new(
        directory: Arc<dyn Directory>,
        presence: Arc<PresenceDirectory>,
        sessions: Arc<SessionDirectory>,
        dispatcher: Arc<Dispatcher>,
        invites: Namespace,
    ) -> Self {
        Self {
            directory,
            presence,
            sessions,
            dispatcher,
            invites,
        }
    }

    /// Put the connection's session in `room_id`.
    ///
    /// `force` skips both the already-joined short-circuit and the invite
    /// check; it is used when a resumed session is put back in its room.
    pub async fn join(
        &self,
        room_id: &str,
        conn: &Arc<Connection>,
        force: bool,
    ) -> Result<(), GatewayError> {
        let Some(user_id) = conn.user_id() else {
            return Ok(());
        };

        match conn.room_id() {
            Some(current) if current == room_id => {
                if !force {
                    return conn.reply(OP_JOIN_ROOM, &json!({ "status": 200, "roomId": current }));
                }
            }
            Some(_) => self.leave(conn, true).await?,
            None => {}
        }

        let Some(room) = self.directory.find_room(room_id).await? else {
            return conn.reply(OP_JOIN_ROOM, &json!({ "status": 404 }));
        };

        if room.private && !room.is_owner(&user_id) && !force {
            let invited = self.invites.hdel(&["invites", room_id], &user_id).await?;
            if !invited {
                tracing::info!(%room_id, %user_id, "join needs owner approval");
                self.publish(
                    OP_ROOM_JOIN_REQUEST,
                    &json!({ "userId": user_id }),
                    &MessageTarget::user(&room.owner_id),
                )
                .await;
                return Ok(());
            }
        }

        let user = conn
            .user()
            .ok_or_else(|| GatewayError::auth("connection has no user"))?;
        let session_id = conn.session_id();

        self.presence.add_session(room_id, &user_id, &session_id).await?;
        if conn.registered_room().as_deref() != Some(room_id) {
            if let Some(previous) = conn.take_registered_room() {
                self.release(&previous).await;
            }
            self.dispatcher.register(&MessageTarget::room(room_id)).await?;
            conn.set_registered_room(room_id.to_string());
        }

        let profile = UserInfo::from(&user);
        self.publish(
            OP_ADD_USER,
            &json!({ "user": profile }),
            &MessageTarget::room(room_id).ignoring(&session_id),
        )
        .await;

        let mut users: Vec<UserInfo> = self
            .presence
            .get_users(room_id, &[user_id.as_str()])
            .await?
            .iter()
            .map(UserInfo::from)
            .collect();
        users.push(profile);

        let session = conn.update_session(|s| s.room_id = Some(room_id.to_string()));
        self.sessions.save(&session).await?;

        tracing::info!(%room_id, %user_id, %session_id, "joined room");
        conn.reply(
            OP_JOIN_ROOM,
            &JoinReply {
                status: 200,
                room: RoomInfo::from(&room),
                users,
                permissions: permissions::permissions_for(&user_id, &room),
            },
        )
    }

    /// Take the connection's session out of its room, if it is in one.
    ///
    /// `persist` writes the cleared room back to the session store. The
    /// disconnect path passes `false` so the stored session still names the
    /// room for a later resume.
    pub async fn leave(&self, conn: &Arc<Connection>, persist: bool) -> Result<(), GatewayError> {
        if let Some(registered) = conn.take_registered_room() {
            self.release(&registered).await;
        }

        let Some(room_id) = conn.room_id() else {
            return Ok(());
        };
        let session = conn.update_session(|s| s.room_id = None);

        if let Some(user_id) = &session.user_id {
            let removal = self
                .presence
                .remove_session(&room_id, user_id, &session.id)
                .await?;
            if removal == Removal::LastSession {
                self.publish(OP_REMOVE_USER, user_id, &MessageTarget::room(&room_id))
                    .await;
            }
            tracing::info!(%room_id, %user_id, session_id = %session.id, ?removal, "left room");
        }

        if persist {
            self.sessions.save(&session).await?;
        }
        Ok(())
    }

    /// Drop the connection's room channel reference without touching
    /// membership. Used for connections whose session lives on elsewhere.
    pub async fn detach(&self, conn: &Connection) {
        if let Some(registered) = conn.take_registered_room() {
            self.release(&registered).await;
        }
    }

    /// Grant `user_id` a one-time invite to the caller's current room.
    pub async fn accept_join_request(
        &self,
        user_id: &str,
        conn: &Arc<Connection>,
    ) -> Result<(), GatewayError> {
        let (Some(room_id), Some(caller)) = (conn.room_id(), conn.user_id()) else {
            return Ok(());
        };
        let Some(room) = self.directory.find_room(&room_id).await? else {
            return Ok(());
        };

        if !permissions::has_permissions(&caller, &[Permission::ManageRoom], &room) {
            tracing::warn!(%room_id, user_id = %caller, "join request accepted without MANAGE_ROOM");
            return Ok(());
        }

        self.invites
            .hset_json(&["invites", room_id.as_str()], user_id, &1)
            .await?;
        self.publish(
            OP_ROOM_JOIN_REQUEST,
            &json!({ "roomId": room_id }),
            &MessageTarget::user(user_id),
        )
        .await;
        Ok(())
    }

    async fn release(&self, room_id: &str) {
        if let Err(err) = self.dispatcher.unregister(&MessageTarget::room(room_id)).await {
            tracing::error!(%room_id, ?err, "failed to release room channel");
        }
    }

    /// Dispatch, logging a failed publish instead of failing the caller.
    async fn publish<T: Serialize>(&self, op: u8, data: &T, target: &MessageTarget) {
        if let Err(err) = self.dispatcher.dispatch(op, data, target, None).await {
            tracing::error!(op, route = ?target.route, ?err, "dispatch failed");
        }
    }
}

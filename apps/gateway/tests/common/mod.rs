#![allow(dead_code)]

use std::sync::Arc;

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;

use roomcast_gateway::auth::tokens::{JwtVerifier, TokenClaims};
use roomcast_gateway::config::Config;
use roomcast_gateway::db::memory::MemoryStore;
use roomcast_gateway::directory::MemoryDirectory;
use roomcast_gateway::gateway::connection::{Connection, Outbound};
use roomcast_gateway::gateway::events::{Envelope, OP_AUTHENTICATE};
use roomcast_gateway::gateway::handler;
use roomcast_gateway::models::room::Room;
use roomcast_gateway::models::user::User;
use roomcast_gateway::AppState;

/// HS256 secret shared by every test node.
pub const SECRET: &str = "gateway-test-secret";

/// Gateway processes sharing one store and one entity directory.
pub struct Cluster {
    pub store: Arc<MemoryStore>,
    pub directory: Arc<MemoryDirectory>,
}

impl Cluster {
    pub fn new() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            directory: Arc::new(MemoryDirectory::new()),
        }
    }

    /// A fresh gateway process on the shared store.
    pub fn node(&self) -> AppState {
        AppState::new(
            Config::local(SECRET),
            self.store.clone(),
            self.store.clone(),
            self.directory.clone(),
            Arc::new(JwtVerifier::from_secret(SECRET.as_bytes())),
        )
    }

    pub fn add_user(&self, id: &str) -> User {
        let user = User {
            id: id.to_string(),
            username: id.to_string(),
            display_name: format!("User {id}"),
            avatar_url: None,
        };
        self.directory.insert_user(user.clone());
        user
    }

    pub fn add_room(&self, id: &str, owner_id: &str, private: bool) -> Room {
        let room = Room {
            id: id.to_string(),
            name: format!("Room {id}"),
            owner_id: owner_id.to_string(),
            private,
        };
        self.directory.insert_room(room.clone());
        room
    }
}

/// Mint a valid access token for `user_id`.
pub fn token(user_id: &str) -> String {
    mint(user_id, chrono::Utc::now().timestamp() + 3600, SECRET)
}

pub fn mint(user_id: &str, exp: i64, secret: &str) -> String {
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &TokenClaims {
            id: user_id.to_string(),
            exp,
        },
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .expect("encode token")
}

/// Let spawned tasks (user channel registration) run.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

/// A connection driven directly through the router, without a socket.
pub struct TestClient {
    pub conn: Arc<Connection>,
    rx: UnboundedReceiver<Outbound>,
}

impl TestClient {
    pub fn connect(state: &AppState) -> Self {
        let (conn, rx) = Connection::open();
        state.connections.add(conn.clone());
        Self { conn, rx }
    }

    pub async fn send(&self, state: &AppState, op: u8, d: Value) {
        handler::route(state, Envelope::new(op, d, None), &self.conn).await;
    }

    /// Authenticate and return the bound session id.
    pub async fn authenticate(
        &mut self,
        state: &AppState,
        user_id: &str,
        session_id: Option<&str>,
    ) -> String {
        let mut d = serde_json::json!({ "token": token(user_id) });
        if let Some(id) = session_id {
            d["sessionId"] = Value::from(id);
        }
        self.send(state, OP_AUTHENTICATE, d).await;

        let reply = self
            .envelopes()
            .into_iter()
            .find(|env| env.op == OP_AUTHENTICATE)
            .expect("AUTHENTICATE reply");
        settle().await;
        reply.d["sessionId"].as_str().expect("sessionId").to_string()
    }

    /// Transport-level disconnect.
    pub async fn disconnect(&self, state: &AppState) {
        handler::disconnect(state, &self.conn).await;
        state.connections.remove(&self.conn);
    }

    pub fn frames(&mut self) -> Vec<Outbound> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// Queued envelopes; close frames are dropped.
    pub fn envelopes(&mut self) -> Vec<Envelope> {
        self.frames()
            .into_iter()
            .filter_map(|frame| match frame {
                Outbound::Envelope(env) => Some(env),
                Outbound::Close { .. } => None,
            })
            .collect()
    }

    /// Queued envelopes with opcode `op`.
    pub fn take(&mut self, op: u8) -> Vec<Envelope> {
        self.envelopes().into_iter().filter(|env| env.op == op).collect()
    }

    /// Close code, if a close was queued.
    pub fn close_code(&mut self) -> Option<u16> {
        self.frames().into_iter().find_map(|frame| match frame {
            Outbound::Close { code, .. } => Some(code),
            Outbound::Envelope(_) => None,
        })
    }
}

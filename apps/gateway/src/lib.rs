pub mod auth;
pub mod config;
pub mod db;
pub mod directory;
pub mod error;
pub mod gateway;
pub mod models;
pub mod permissions;
pub mod routes;

use std::sync::Arc;

use auth::tokens::TokenVerifier;
use config::Config;
use db::kv::{KeyValueStore, Namespace};
use db::pubsub::PubSub;
use directory::Directory;
use gateway::auth::AuthHandler;
use gateway::broker::Broker;
use gateway::dispatcher::Dispatcher;
use gateway::presence::PresenceDirectory;
use gateway::registry::ConnectionRegistry;
use gateway::rooms::RoomHandler;
use gateway::session::SessionDirectory;

/// Shared application state available to all route handlers.
///
/// One per gateway process. Every component holding process-local state
/// (connections, caches, channel subscriptions) lives here.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub connections: Arc<ConnectionRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub sessions: Arc<SessionDirectory>,
    pub presence: Arc<PresenceDirectory>,
    pub rooms: Arc<RoomHandler>,
    pub auth: Arc<AuthHandler>,
}

impl AppState {
    pub fn new(
        config: Config,
        kv: Arc<dyn KeyValueStore>,
        pubsub: Arc<dyn PubSub>,
        directory: Arc<dyn Directory>,
        verifier: Arc<dyn TokenVerifier>,
    ) -> Self {
        let node_id = roomcast_common::id::prefixed_ulid(roomcast_common::id::prefix::NODE);
        let connections = Arc::new(ConnectionRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(
            node_id,
            connections.clone(),
            Broker::new(pubsub),
        ));

        let sessions = Arc::new(SessionDirectory::new(
            Namespace::new("sessions", kv.clone()),
            config.session_expiry,
        ));
        let presence = Arc::new(PresenceDirectory::new(
            Namespace::new("rooms", kv.clone()),
            directory.clone(),
        ));
        dispatcher.add_listener(presence.clone());

        let rooms = Arc::new(RoomHandler::new(
            directory.clone(),
            presence.clone(),
            sessions.clone(),
            dispatcher.clone(),
            Namespace::new("rooms", kv),
        ));
        let auth = Arc::new(AuthHandler::new(
            verifier,
            connections.clone(),
            directory,
            sessions.clone(),
            dispatcher.clone(),
            rooms.clone(),
        ));

        Self {
            config: Arc::new(config),
            connections,
            dispatcher,
            sessions,
            presence,
            rooms,
            auth,
        }
    }

    /// Release every channel subscription held by this process.
    pub async fn shutdown(&self) {
        self.dispatcher.shutdown().await;
        tracing::info!(node = %self.dispatcher.node_id(), "gateway subscriptions drained");
    }
}

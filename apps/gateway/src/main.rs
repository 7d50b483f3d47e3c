use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use roomcast_gateway::auth::tokens::{JwtVerifier, TokenVerifier};
use roomcast_gateway::config::{Config, TokenKey};
use roomcast_gateway::db::kv::KeyValueStore;
use roomcast_gateway::db::memory::MemoryStore;
use roomcast_gateway::db::pubsub::PubSub;
use roomcast_gateway::db::redis::RedisStore;
use roomcast_gateway::directory::{Directory, MemoryDirectory, PgDirectory};
use roomcast_gateway::AppState;

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing; env vars may be set externally)
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let port = config.port;

    let (kv, pubsub): (Arc<dyn KeyValueStore>, Arc<dyn PubSub>) = match &config.redis_url {
        Some(url) => {
            let store = Arc::new(
                RedisStore::connect(url)
                    .await
                    .expect("failed to connect to redis"),
            );
            (store.clone() as Arc<dyn KeyValueStore>, store as Arc<dyn PubSub>)
        }
        None => {
            tracing::warn!("REDIS_URL not set, using in-process store (single node only)");
            let store = Arc::new(MemoryStore::new());
            (store.clone() as Arc<dyn KeyValueStore>, store as Arc<dyn PubSub>)
        }
    };

    let directory: Arc<dyn Directory> = match &config.database_url {
        Some(url) => {
            let pool =
                roomcast_gateway::db::pool::connect(url).expect("failed to create database pool");
            Arc::new(PgDirectory::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using empty in-memory directory");
            Arc::new(MemoryDirectory::new())
        }
    };

    let verifier: Arc<dyn TokenVerifier> = match &config.token_key {
        TokenKey::RsaPem(pem) => {
            Arc::new(JwtVerifier::from_rsa_pem(pem).expect("invalid JWT_PUBLIC_KEY"))
        }
        TokenKey::Secret(secret) => Arc::new(JwtVerifier::from_secret(secret.as_bytes())),
    };

    let state = AppState::new(config, kv, pubsub, directory, verifier);
    tracing::info!(node = %state.dispatcher.node_id(), "gateway configured");

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(roomcast_gateway::routes::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "gateway listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    state.shutdown().await;
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(?err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

pub mod auth;
pub mod broker;
pub mod connection;
pub mod dispatcher;
pub mod events;
pub mod handler;
pub mod presence;
pub mod registry;
pub mod rooms;
pub mod server;
pub mod session;
pub mod target;

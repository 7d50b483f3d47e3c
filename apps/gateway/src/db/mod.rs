pub mod kv;
pub mod memory;
pub mod pool;
pub mod pubsub;
pub mod redis;
pub mod schema;

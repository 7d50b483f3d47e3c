use diesel_async::pooled_connection::deadpool::Pool;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::AsyncPgConnection;

use crate::error::GatewayError;

pub type DbPool = Pool<AsyncPgConnection>;

/// Create a Diesel async connection pool for the entity directory.
///
/// The gateway only reads rooms and users, so the pool stays small.
pub fn connect(database_url: &str) -> Result<DbPool, GatewayError> {
    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
    let pool = Pool::builder(manager)
        .max_size(8)
        .build()
        .map_err(|err| GatewayError::directory(err.to_string()))?;

    tracing::info!("database pool created");

    Ok(pool)
}

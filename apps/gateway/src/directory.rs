//! Read-only lookup of Room and User records owned by other services.

use std::collections::HashMap;

use async_trait::async_trait;
use diesel::prelude::*;
use parking_lot::RwLock;

use crate::db::pool::DbPool;
use crate::db::schema::{rooms, users};
use crate::error::GatewayError;
use crate::models::room::Room;
use crate::models::user::User;

#[async_trait]
pub trait Directory: Send + Sync {
    async fn find_room(&self, id: &str) -> Result<Option<Room>, GatewayError>;
    async fn find_user(&self, id: &str) -> Result<Option<User>, GatewayError>;

    /// Batch fetch. Unknown ids are skipped; order is unspecified.
    async fn find_users(&self, ids: &[String]) -> Result<Vec<User>, GatewayError>;
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

pub struct PgDirectory {
    pool: DbPool,
}

impl PgDirectory {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Directory for PgDirectory {
    async fn find_room(&self, id: &str) -> Result<Option<Room>, GatewayError> {
        let mut conn = self.pool.get().await?;
        let room = diesel_async::RunQueryDsl::get_result(
            rooms::table.find(id).select(Room::as_select()),
            &mut conn,
        )
        .await
        .optional()?;
        Ok(room)
    }

    async fn find_user(&self, id: &str) -> Result<Option<User>, GatewayError> {
        let mut conn = self.pool.get().await?;
        let user = diesel_async::RunQueryDsl::get_result(
            users::table.find(id).select(User::as_select()),
            &mut conn,
        )
        .await
        .optional()?;
        Ok(user)
    }

    async fn find_users(&self, ids: &[String]) -> Result<Vec<User>, GatewayError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.pool.get().await?;
        let found: Vec<User> = diesel_async::RunQueryDsl::load(
            users::table
                .filter(users::id.eq_any(ids))
                .select(User::as_select()),
            &mut conn,
        )
        .await?;
        Ok(found)
    }
}

// ---------------------------------------------------------------------------
// In-memory (development / tests)
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryDirectory {
    rooms: RwLock<HashMap<String, Room>>,
    users: RwLock<HashMap<String, User>>,
    batch_lookups: RwLock<Vec<Vec<String>>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_room(&self, room: Room) {
        self.rooms.write().insert(room.id.clone(), room);
    }

    pub fn insert_user(&self, user: User) {
        self.users.write().insert(user.id.clone(), user);
    }

    /// Every id list passed to [`Directory::find_users`], oldest first.
    pub fn batch_lookups(&self) -> Vec<Vec<String>> {
        self.batch_lookups.read().clone()
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn find_room(&self, id: &str) -> Result<Option<Room>, GatewayError> {
        Ok(self.rooms.read().get(id).cloned())
    }

    async fn find_user(&self, id: &str) -> Result<Option<User>, GatewayError> {
        Ok(self.users.read().get(id).cloned())
    }

    async fn find_users(&self, ids: &[String]) -> Result<Vec<User>, GatewayError> {
        self.batch_lookups.write().push(ids.to_vec());
        let users = self.users.read();
        Ok(ids.iter().filter_map(|id| users.get(id).cloned()).collect())
    }
}

use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::db::schema::rooms;

/// A room record, read from the entity directory.
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = rooms)]
pub struct Room {
    pub id: String,
    pub name: String,
    pub owner_id: String,
    pub private: bool,
}

impl Room {
    pub fn is_owner(&self, user_id: &str) -> bool {
        self.owner_id == user_id
    }
}

/// Room detail included in a successful JOIN_ROOM reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    pub id: String,
    pub name: String,
    pub owner_id: String,
    pub private: bool,
}

impl From<&Room> for RoomInfo {
    fn from(room: &Room) -> Self {
        Self {
            id: room.id.clone(),
            name: room.name.clone(),
            owner_id: room.owner_id.clone(),
            private: room.private,
        }
    }
}

use serde::{Deserialize, Serialize};

use crate::models::room::Room;

/// Actions a room member may be allowed to take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Permission {
    QueueAdd,
    QueueEdit,
    VideoRemote,
    ManageRoom,
    KickMembers,
}

impl Permission {
    pub const ALL: [Permission; 5] = [
        Permission::QueueAdd,
        Permission::QueueEdit,
        Permission::VideoRemote,
        Permission::ManageRoom,
        Permission::KickMembers,
    ];
}

/// Permissions held by `user_id` in `room`.
///
/// The owner holds every permission; any other member may only queue.
pub fn permissions_for(user_id: &str, room: &Room) -> Vec<Permission> {
    if room.is_owner(user_id) {
        Permission::ALL.to_vec()
    } else {
        vec![Permission::QueueAdd]
    }
}

/// Whether `user_id` holds every permission in `required`.
pub fn has_permissions(user_id: &str, required: &[Permission], room: &Room) -> bool {
    let held = permissions_for(user_id, room);
    required.iter().all(|p| held.contains(p))
}

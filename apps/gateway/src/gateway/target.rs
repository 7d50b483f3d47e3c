//! Message addressing: who a dispatched envelope is for.

use serde::{Deserialize, Serialize};

/// Fan-out scope of a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum Route {
    Room(String),
    User(String),
    /// Every connection on the local process. Never published.
    Broadcast,
}

impl Route {
    /// Broker channel for this route, if it has one.
    pub fn channel(&self) -> Option<String> {
        match self {
            Route::Room(id) => Some(format!("room.{id}")),
            Route::User(id) => Some(format!("user.{id}")),
            Route::Broadcast => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageTarget {
    pub route: Route,
    /// Session ids that must not receive the message (e.g. the sender).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignored: Vec<String>,
}

impl MessageTarget {
    pub fn room(id: impl Into<String>) -> Self {
        Self::from(Route::Room(id.into()))
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self::from(Route::User(id.into()))
    }

    pub fn broadcast() -> Self {
        Self::from(Route::Broadcast)
    }

    pub fn ignoring(mut self, session_id: impl Into<String>) -> Self {
        self.ignored.push(session_id.into());
        self
    }

    pub fn is_ignored(&self, session_id: &str) -> bool {
        self.ignored.iter().any(|s| s == session_id)
    }

    pub fn channel(&self) -> Option<String> {
        self.route.channel()
    }
}

impl From<Route> for MessageTarget {
    fn from(route: Route) -> Self {
        Self {
            route,
            ignored: Vec::new(),
        }
    }
}

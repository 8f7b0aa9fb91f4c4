//! Pub/sub channel naming: events are routed by map or by user.

use std::fmt;
use uuid::Uuid;

/// A fan-out channel. Every subscriber of a channel receives every message on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// `map:{map_id}`: everything that happens on one map.
    Map(Uuid),
    /// `user:{user_id}`: events addressed to one user, whatever map they are on.
    User(Uuid),
}

impl Channel {
    pub fn name(&self) -> String {
        self.to_string()
    }

    /// Parse `map:{uuid}` / `user:{uuid}`.
    pub fn from_name(name: &str) -> Option<Self> {
        let (kind, id) = name.split_once(':')?;
        let id = Uuid::parse_str(id).ok()?;
        match kind {
            "map" => Some(Channel::Map(id)),
            "user" => Some(Channel::User(id)),
            _ => None,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Map(id) => write!(f, "map:{}", id),
            Channel::User(id) => write!(f, "user:{}", id),
        }
    }
}

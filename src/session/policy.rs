use std::sync::Arc;

use async_trait::async_trait;

use crate::error::AppError;
use crate::ids::{RoomKey, UserId};

/// Consulted before a connection joins a room. Quotas, plans and bans live
/// behind this trait.
#[async_trait]
pub trait JoinPolicy: Send + Sync {
    /// `members` is the room's current member count, excluding the joiner.
    async fn admit(&self, user: &UserId, room: RoomKey, members: usize) -> Result<(), AppError>;
}

pub type SharedPolicy = Arc<dyn JoinPolicy>;

/// Caps concurrent collaborators per room.
#[derive(Debug, Clone, Copy)]
pub struct MaxCollaborators {
    limit: usize,
}

impl MaxCollaborators {
    pub fn new(limit: usize) -> Self {
        Self { limit }
    }
}

#[async_trait]
impl JoinPolicy for MaxCollaborators {
    async fn admit(&self, user: &UserId, room: RoomKey, members: usize) -> Result<(), AppError> {
        if members >= self.limit {
            return Err(AppError::Forbidden(format!(
                "room {room} is full ({} collaborators); {user} cannot join",
                self.limit
            )));
        }
        Ok(())
    }
}

//! Live collaboration rooms: one actor per document or branch, owning the
//! authoritative replica, its members and their presence.

mod actor;
mod events;
mod handle;
mod presence;
mod registry;

pub use events::{ActivityEvent, ActivityKind};
pub use handle::{EvictOutcome, RoomHandle, RoomPhase, RoomStatus};
pub use presence::{PresenceConfig, PresenceTracker};
pub use registry::{RegistryConfig, RoomRegistry};

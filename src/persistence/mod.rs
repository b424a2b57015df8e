mod memory;
mod postgres;
pub mod recorder;
mod store;
mod types;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use recorder::{PersistenceHealth, RecorderConfig, RecorderHandle, spawn_recorder};
pub use store::{BlobStore, SharedStore};
pub use types::*;

use std::sync::Arc;

use crate::branches::BranchManager;
use crate::config::Config;
use crate::persistence::{MemoryStore, SharedStore};
use crate::room::RoomRegistry;
use crate::session::{MaxCollaborators, SharedPolicy, TicketIssuer};
use crate::snapshots::SnapshotManager;

pub struct AppState {
    pub config: Config,
    pub store: SharedStore,
    pub registry: Arc<RoomRegistry>,
    pub ticketing: TicketIssuer,
    pub policy: SharedPolicy,
    pub snapshots: SnapshotManager,
    pub branches: BranchManager,
}

impl AppState {
    /// Must be called inside a tokio runtime: the registry spawns its reaper.
    pub fn new(config: Config, store: SharedStore) -> Self {
        Self::with_components(config, store, TicketIssuer::from_env_or_generate())
    }

    pub fn with_components(config: Config, store: SharedStore, ticketing: TicketIssuer) -> Self {
        let registry = RoomRegistry::new(
            store.clone(),
            config.registry.clone(),
            config.recorder.clone(),
            config.presence.clone(),
        );
        let snapshots = SnapshotManager::new(registry.clone(), store.clone());
        let branches = BranchManager::new(registry.clone(), store.clone(), snapshots.clone());
        let policy: SharedPolicy = Arc::new(MaxCollaborators::new(config.max_collaborators));

        Self {
            config,
            store,
            registry,
            ticketing,
            policy,
            snapshots,
            branches,
        }
    }

    /// Default configuration over a fresh in-memory store.
    pub fn in_memory() -> Self {
        Self::with_components(
            Config::default(),
            Arc::new(MemoryStore::new()),
            TicketIssuer::development(),
        )
    }

    pub fn with_policy(mut self, policy: SharedPolicy) -> Self {
        self.policy = policy;
        self
    }
}

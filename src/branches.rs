//! Isolated forks of a document, each running as its own room, merged back
//! by whole-state overwrite of main.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::error::AppError;
use crate::ids::{BranchId, DocumentId, RoomKey, SnapshotId, now_millis};
use crate::persistence::{BranchRecord, SharedStore, StoreKey, decode_record, encode_record};
use crate::room::{ActivityEvent, ActivityKind, RoomHandle, RoomRegistry};
use crate::snapshots::SnapshotManager;

pub struct BranchManager {
    registry: Arc<RoomRegistry>,
    store: SharedStore,
    snapshots: SnapshotManager,
    /// Merges read one room and overwrite another; one at a time.
    merging: Mutex<()>,
}

impl BranchManager {
    pub fn new(registry: Arc<RoomRegistry>, store: SharedStore, snapshots: SnapshotManager) -> Self {
        Self {
            registry,
            store,
            snapshots,
            merging: Mutex::new(()),
        }
    }

    /// Fork from a snapshot, or from main's live state when no snapshot is given.
    #[instrument(skip(self), fields(doc = %document))]
    pub async fn create(
        &self,
        document: DocumentId,
        name: &str,
        source_snapshot: Option<SnapshotId>,
    ) -> Result<BranchRecord, AppError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::InvalidInput("branch name cannot be empty".to_string()));
        }
        if name.eq_ignore_ascii_case("main") {
            return Err(AppError::InvalidInput("branch name `main` is reserved".to_string()));
        }

        let state = match source_snapshot {
            Some(id) => self.snapshots.get(document, id).await?.state,
            None => {
                self.registry
                    .with_room(RoomKey::main(document), |handle: RoomHandle| async move {
                        handle.encode_full().await
                    })
                    .await?
            }
        };

        let record = BranchRecord {
            id: BranchId::generate()?,
            document_id: document,
            name: name.to_string(),
            source_snapshot_id: source_snapshot,
            is_main: false,
            merged_at: None,
            created_at: now_millis(),
        };

        // Room state first: a listed branch always has state to load.
        self.store.save(&StoreKey::room(record.room()), state).await?;
        self.save(&record).await?;

        if source_snapshot.is_none()
            && let Some(handle) = self.registry.get(RoomKey::main(document)).await
            && let Err(err) = handle.flush().await
        {
            warn!(branch = %record.id, error = %err, "branch created but main state flush failed");
        }

        info!(branch = %record.id, name = %record.name, "branch created");
        Ok(record)
    }

    /// Room a session should join for `branch` (`None` is main).
    pub async fn switch(
        &self,
        document: DocumentId,
        branch: Option<BranchId>,
    ) -> Result<RoomKey, AppError> {
        match branch {
            None => Ok(RoomKey::main(document)),
            Some(id) => Ok(self.get(document, id).await?.room()),
        }
    }

    pub async fn get(&self, document: DocumentId, id: BranchId) -> Result<BranchRecord, AppError> {
        let main = BranchRecord::main(document);
        if id == main.id {
            return Ok(main);
        }

        let key = StoreKey::branch(document, id);
        match self.store.load(&key).await? {
            Some(bytes) => decode_record(&key, &bytes),
            None => Err(AppError::NotFound(format!(
                "branch {id} not found for document {document}"
            ))),
        }
    }

    /// Overwrite main with the branch's state and mark the branch merged.
    #[instrument(skip(self), fields(doc = %document))]
    pub async fn merge(&self, document: DocumentId, id: BranchId) -> Result<BranchRecord, AppError> {
        let _merging = self.merging.lock().await;

        let mut record = self.get(document, id).await?;
        if record.is_main {
            return Err(AppError::InvalidInput("main cannot be merged into itself".to_string()));
        }
        if record.merged_at.is_some() {
            return Err(AppError::InvalidInput(format!("branch {id} is already merged")));
        }

        let branch_room = record.room();
        let state = self
            .registry
            .with_room(branch_room, |handle: RoomHandle| async move {
                handle.encode_full().await
            })
            .await?;

        let main = RoomKey::main(document);
        self.registry
            .with_room(main, |handle: RoomHandle| {
                let blob = state.clone();
                async move { handle.replace_state(blob).await }
            })
            .await?;

        if let Some(handle) = self.registry.get(branch_room).await
            && let Err(err) = handle.flush().await
        {
            warn!(branch = %id, error = %err, "branch state not flushed after merge");
        }

        record.merged_at = Some(now_millis());
        self.save(&record).await?;

        self.registry.publish(ActivityEvent {
            room: main,
            at: now_millis(),
            kind: ActivityKind::BranchMerged { branch: id },
        });
        info!(branch = %id, "branch merged into main");
        Ok(record)
    }

    /// Forget the branch, then close its room. Its final state blob stays in
    /// the store.
    #[instrument(skip(self), fields(doc = %document))]
    pub async fn delete(&self, document: DocumentId, id: BranchId) -> Result<(), AppError> {
        let record = self.get(document, id).await?;
        if record.is_main {
            return Err(AppError::InvalidInput("main cannot be deleted".to_string()));
        }

        // Record first: once it is gone no new session can switch into the room.
        self.store.delete(&StoreKey::branch(document, id)).await?;
        self.registry.teardown(record.room(), "branch deleted").await?;
        info!(branch = %id, "branch deleted");
        Ok(())
    }

    /// Main first, then branches in creation order.
    pub async fn list(&self, document: DocumentId) -> Result<Vec<BranchRecord>, AppError> {
        let mut branches = Vec::new();
        for key in self.store.list(&StoreKey::branches_of(document)).await? {
            let Some(bytes) = self.store.load(&key).await? else {
                continue;
            };
            branches.push(decode_record::<BranchRecord>(&key, &bytes)?);
        }
        branches.sort_by_key(|b| (b.created_at, b.id));

        let mut out = Vec::with_capacity(branches.len() + 1);
        out.push(BranchRecord::main(document));
        out.extend(branches);
        Ok(out)
    }

    async fn save(&self, record: &BranchRecord) -> Result<(), AppError> {
        self.store
            .save(
                &StoreKey::branch(record.document_id, record.id),
                encode_record(record)?,
            )
            .await
    }
}

//! Named, immutable checkpoints of a document's main state.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::error::AppError;
use crate::ids::{ClientId, DocumentId, RoomKey, SnapshotId, UserId, now_millis};
use crate::model::TimelineDocument;
use crate::persistence::{SharedStore, SnapshotRecord, StoreKey, decode_record, encode_record};
use crate::room::{ActivityEvent, ActivityKind, RoomHandle, RoomRegistry};

#[derive(Clone)]
pub struct SnapshotManager {
    registry: Arc<RoomRegistry>,
    store: SharedStore,
}

impl SnapshotManager {
    pub fn new(registry: Arc<RoomRegistry>, store: SharedStore) -> Self {
        Self { registry, store }
    }

    /// Capture the live main state. The room is loaded if it is not running.
    #[instrument(skip(self, description), fields(doc = %document))]
    pub async fn create(
        &self,
        document: DocumentId,
        name: &str,
        description: Option<String>,
        created_by: &UserId,
    ) -> Result<SnapshotRecord, AppError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::InvalidInput("snapshot name cannot be empty".to_string()));
        }

        let room = RoomKey::main(document);
        let state = self
            .registry
            .with_room(room, |handle: RoomHandle| async move { handle.encode_full().await })
            .await?;
        let summary = TimelineDocument::from_full(ClientId::default(), &state)?.summary();

        let record = SnapshotRecord {
            id: SnapshotId::generate()?,
            document_id: document,
            name: name.to_string(),
            description: description.filter(|d| !d.trim().is_empty()),
            state,
            section_count: summary.section_count,
            total_bars: summary.total_bars,
            created_by: created_by.clone(),
            created_at: now_millis(),
        };
        self.store
            .save(&StoreKey::snapshot(document, record.id), encode_record(&record)?)
            .await?;

        if let Some(handle) = self.registry.get(room).await
            && let Err(err) = handle.flush().await
        {
            warn!(snapshot = %record.id, error = %err, "snapshot saved but live state flush failed");
        }

        info!(snapshot = %record.id, sections = record.section_count, bars = record.total_bars, "snapshot created");
        Ok(record)
    }

    /// Replace the main state with the snapshot's. Members are resynced and
    /// the restored state is durable before this returns.
    #[instrument(skip(self), fields(doc = %document))]
    pub async fn restore(
        &self,
        document: DocumentId,
        id: SnapshotId,
    ) -> Result<SnapshotRecord, AppError> {
        let record = self.get(document, id).await?;
        let room = RoomKey::main(document);

        self.registry
            .with_room(room, |handle: RoomHandle| {
                let blob = record.state.clone();
                async move { handle.replace_state(blob).await }
            })
            .await?;

        self.registry.publish(ActivityEvent {
            room,
            at: now_millis(),
            kind: ActivityKind::SnapshotRestored { snapshot: id },
        });
        info!(snapshot = %id, "snapshot restored");
        Ok(record)
    }

    pub async fn get(&self, document: DocumentId, id: SnapshotId) -> Result<SnapshotRecord, AppError> {
        let key = StoreKey::snapshot(document, id);
        match self.store.load(&key).await? {
            Some(bytes) => decode_record(&key, &bytes),
            None => Err(AppError::NotFound(format!(
                "snapshot {id} not found for document {document}"
            ))),
        }
    }

    /// Newest first.
    pub async fn list(&self, document: DocumentId) -> Result<Vec<SnapshotRecord>, AppError> {
        let mut records = Vec::new();
        for key in self.store.list(&StoreKey::snapshots_of(document)).await? {
            // Deleted between list and load.
            let Some(bytes) = self.store.load(&key).await? else {
                continue;
            };
            records.push(decode_record::<SnapshotRecord>(&key, &bytes)?);
        }
        records.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        Ok(records)
    }

    pub async fn delete(&self, document: DocumentId, id: SnapshotId) -> Result<(), AppError> {
        let key = StoreKey::snapshot(document, id);
        if self.store.load(&key).await?.is_none() {
            return Err(AppError::NotFound(format!(
                "snapshot {id} not found for document {document}"
            )));
        }
        self.store.delete(&key).await?;
        info!(doc = %document, snapshot = %id, "snapshot deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LocalOp, TempoCurve};
    use crate::persistence::{MemoryStore, RecorderConfig};
    use crate::room::{PresenceConfig, RegistryConfig};

    type TestResult<T> = Result<T, AppError>;

    fn manager() -> SnapshotManager {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let registry = RoomRegistry::new(
            store.clone(),
            RegistryConfig::default(),
            RecorderConfig::default(),
            PresenceConfig::default(),
        );
        SnapshotManager::new(registry, store)
    }

    fn with_sections(names: &[&str]) -> TestResult<Vec<u8>> {
        let mut doc = TimelineDocument::new(ClientId(1));
        for (index, name) in names.iter().enumerate() {
            doc.apply(LocalOp::InsertSection {
                index,
                name: (*name).to_string(),
                bar_count: 8,
                tempo: TempoCurve::constant(100.0),
            })?;
        }
        Ok(doc.encode_full()?)
    }

    #[tokio::test]
    async fn create_records_counts_and_restore_round_trips() -> TestResult<()> {
        let snapshots = manager();
        let doc = DocumentId::from(1_u64);
        let room = RoomKey::main(doc);
        let main = snapshots.registry.get_or_create(room).await?;
        main.replace_state(with_sections(&["Intro", "Verse"])?).await?;

        let snap = snapshots.create(doc, " v1 ", None, &UserId::new("ana")).await?;
        assert_eq!(snap.name, "v1");
        assert_eq!(snap.section_count, 2);
        assert_eq!(snap.total_bars, 16);

        main.replace_state(with_sections(&["Only"])?).await?;
        snapshots.restore(doc, snap.id).await?;
        let restored = TimelineDocument::from_full(ClientId(0), &main.encode_full().await?)?;
        assert_eq!(restored.section_names(), vec!["Intro", "Verse"]);
        Ok(())
    }

    #[tokio::test]
    async fn list_is_newest_first_and_delete_forgets() -> TestResult<()> {
        let snapshots = manager();
        let doc = DocumentId::from(2_u64);
        let user = UserId::new("ben");

        let first = snapshots.create(doc, "first", None, &user).await?;
        let second = snapshots
            .create(doc, "second", Some("after chorus".into()), &user)
            .await?;

        let listed: Vec<SnapshotId> = snapshots.list(doc).await?.iter().map(|s| s.id).collect();
        assert_eq!(listed, vec![second.id, first.id]);

        snapshots.delete(doc, first.id).await?;
        assert!(matches!(
            snapshots.get(doc, first.id).await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            snapshots.delete(doc, first.id).await,
            Err(AppError::NotFound(_))
        ));
        assert_eq!(snapshots.list(doc).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn snapshots_are_scoped_to_their_document() -> TestResult<()> {
        let snapshots = manager();
        let snap = snapshots
            .create(DocumentId::from(3_u64), "mine", None, &UserId::new("ana"))
            .await?;
        assert!(matches!(
            snapshots.get(DocumentId::from(4_u64), snap.id).await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            snapshots.create(DocumentId::from(3_u64), "  ", None, &UserId::new("ana")).await,
            Err(AppError::InvalidInput(_))
        ));
        Ok(())
    }
}

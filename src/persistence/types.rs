use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::ids::{BranchId, DocumentId, RoomKey, SnapshotId, UserId};

/// Key of one blob in a [`BlobStore`](super::BlobStore).
///
/// Layout: `room/{doc}`, `room/{doc}/{branch}`, `snapshot/{doc}/{id}`,
/// `branch/{doc}/{id}`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StoreKey(String);

impl StoreKey {
    /// Live state of a room.
    pub fn room(room: RoomKey) -> Self {
        match room.branch {
            Some(branch) => Self(format!("room/{}/{}", room.document, branch)),
            None => Self(format!("room/{}", room.document)),
        }
    }

    pub fn snapshot(doc: DocumentId, id: SnapshotId) -> Self {
        Self(format!("snapshot/{doc}/{id}"))
    }

    pub fn branch(doc: DocumentId, id: BranchId) -> Self {
        Self(format!("branch/{doc}/{id}"))
    }

    pub fn snapshots_of(doc: DocumentId) -> String {
        format!("snapshot/{doc}/")
    }

    pub fn branches_of(doc: DocumentId) -> String {
        format!("branch/{doc}/")
    }

    /// Rebuild a key listed by a store. Callers only ever hand back keys the
    /// store produced, so no validation happens here.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable named checkpoint of a document's main state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub id: SnapshotId,
    pub document_id: DocumentId,
    pub name: String,
    pub description: Option<String>,
    pub state: Vec<u8>,
    pub section_count: u32,
    pub total_bars: u64,
    pub created_by: UserId,
    pub created_at: i64,
}

/// A fork of a document. The branch's state lives under the room key
/// `(document_id, id)`; the record only carries metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchRecord {
    pub id: BranchId,
    pub document_id: DocumentId,
    pub name: String,
    pub source_snapshot_id: Option<SnapshotId>,
    pub is_main: bool,
    pub merged_at: Option<i64>,
    pub created_at: i64,
}

impl BranchRecord {
    /// The implicit main branch: the document's own live state.
    pub fn main(document_id: DocumentId) -> Self {
        Self {
            id: BranchId::from(document_id.as_u64()),
            document_id,
            name: "main".to_string(),
            source_snapshot_id: None,
            is_main: true,
            merged_at: None,
            created_at: 0,
        }
    }

    pub fn room(&self) -> RoomKey {
        if self.is_main {
            RoomKey::main(self.document_id)
        } else {
            RoomKey::branch(self.document_id, self.id)
        }
    }
}

pub(crate) fn encode_record<T: Serialize>(record: &T) -> Result<Vec<u8>, AppError> {
    Ok(postcard::to_allocvec(record)?)
}

pub(crate) fn decode_record<T: DeserializeOwned>(
    key: &StoreKey,
    bytes: &[u8],
) -> Result<T, AppError> {
    postcard::from_bytes(bytes)
        .map_err(|e| AppError::Store(format!("corrupt record at {key}: {e}")))
}

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::AppError;

static SONYFLAKE: LazyLock<Option<sonyflake::Sonyflake>> = LazyLock::new(|| {
    match sonyflake::Sonyflake::new() {
        Ok(flake) => Some(flake),
        Err(err) => {
            tracing::warn!(error = %err, "sonyflake unavailable (no private ipv4?); using local id clock");
            None
        }
    }
});

static LOCAL_CLOCK: AtomicU64 = AtomicU64::new(0);

fn next_flake() -> Result<u64, AppError> {
    match SONYFLAKE.as_ref() {
        Some(flake) => flake
            .next_id()
            .map_err(|e| AppError::Internal(format!("failed to generate id: {e}"))),
        None => Ok(next_local()),
    }
}

/// Millisecond timestamp shifted left with a monotonic low counter.
fn next_local() -> u64 {
    let candidate = (now_millis().max(0) as u64) << 12;
    let mut prev = LOCAL_CLOCK.load(Ordering::Relaxed);
    loop {
        let next = candidate.max(prev + 1);
        match LOCAL_CLOCK.compare_exchange_weak(prev, next, Ordering::SeqCst, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => prev = actual,
        }
    }
}

macro_rules! flake_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Generate a new process-unique, time-ordered id.
            pub fn generate() -> Result<Self, AppError> {
                next_flake().map(Self)
            }

            pub fn parse(s: &str) -> Result<Self, std::num::ParseIntError> {
                s.parse::<u64>().map(Self)
            }

            pub fn as_u64(&self) -> u64 {
                self.0
            }
        }

        impl From<u64> for $name {
            fn from(raw: u64) -> Self {
                Self(raw)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }
    };
}

flake_id!(
    /// A collaborative timeline document.
    DocumentId
);
flake_id!(
    /// An immutable named checkpoint of a document.
    SnapshotId
);
flake_id!(
    /// An isolated fork of a document that can be merged back.
    BranchId
);

/// Replica id stamped into every op. Assigned by the server on each join, so a
/// reconnecting client always starts a fresh replica lineage.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ClientId(pub u64);

impl ClientId {
    pub fn random() -> Self {
        use rand::RngCore;
        // 0 is reserved for server-side replicas.
        loop {
            let raw = rand::rngs::OsRng.next_u64();
            if raw != 0 {
                return Self(raw);
            }
        }
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Verified user identity, as carried by a join ticket.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one live room: a document's main state, or one of its branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RoomKey {
    pub document: DocumentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<BranchId>,
}

impl RoomKey {
    pub fn main(document: DocumentId) -> Self {
        Self {
            document,
            branch: None,
        }
    }

    pub fn branch(document: DocumentId, branch: BranchId) -> Self {
        Self {
            document,
            branch: Some(branch),
        }
    }

    pub fn is_main(&self) -> bool {
        self.branch.is_none()
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.branch {
            Some(branch) => write!(f, "{}@{}", self.document, branch),
            None => write!(f, "{}", self.document),
        }
    }
}

/// One websocket connection. Stable across room switches and resyncs, unlike
/// the [`ClientId`] it is assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Wall clock in unix milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique_and_ordered() -> Result<(), AppError> {
        let first = DocumentId::generate()?;
        let second = DocumentId::generate()?;
        assert!(second > first);
        Ok(())
    }

    #[test]
    fn room_key_display_includes_branch() {
        let main = RoomKey::main(DocumentId::from(7_u64));
        let branch = RoomKey::branch(DocumentId::from(7_u64), BranchId::from(9_u64));
        assert_eq!(main.to_string(), "7");
        assert_eq!(branch.to_string(), "7@9");
        assert!(main.is_main());
        assert!(!branch.is_main());
    }

    #[test]
    fn ids_round_trip_through_strings() {
        let id = SnapshotId::from(12345_u64);
        assert_eq!(id.to_string().parse::<SnapshotId>().ok(), Some(id));
        assert!("not-a-number".parse::<BranchId>().is_err());
    }
}

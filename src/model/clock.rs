use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ids::ClientId;

/// Lamport timestamp paired with the replica that produced it.
///
/// The derived ordering compares `lamport` first and `client` second, which gives
/// a total order over every write any replica can ever make. All last-writer-wins
/// decisions in the model reduce to comparing two stamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Stamp {
    pub lamport: u64,
    pub client: ClientId,
}

impl Stamp {
    pub const fn new(lamport: u64, client: ClientId) -> Self {
        Self { lamport, client }
    }
}

impl Ord for Stamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.lamport
            .cmp(&other.lamport)
            .then_with(|| self.client.cmp(&other.client))
    }
}

impl PartialOrd for Stamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.lamport, self.client)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LamportClock {
    time: u64,
}

impl LamportClock {
    pub fn at(time: u64) -> Self {
        Self { time }
    }

    pub fn now(&self) -> u64 {
        self.time
    }

    /// Next stamp for `client`, or `None` once the clock is exhausted.
    pub fn tick(&mut self, client: ClientId) -> Option<Stamp> {
        self.time = self.time.checked_add(1)?;
        Some(Stamp::new(self.time, client))
    }

    pub fn observe(&mut self, stamp: Stamp) {
        self.time = self.time.max(stamp.lamport);
    }
}

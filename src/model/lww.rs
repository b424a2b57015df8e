use serde::{Deserialize, Serialize};

use super::clock::Stamp;

/// Last-writer-wins register.
///
/// A write is kept only if its stamp is strictly greater than the current one.
/// Since stamps are unique per write, re-delivering a write is a no-op and two
/// replicas that saw the same set of writes hold the same value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lww<T> {
    value: T,
    stamp: Stamp,
}

impl<T> Lww<T> {
    pub fn new(value: T, stamp: Stamp) -> Self {
        Self { value, stamp }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    pub fn stamp(&self) -> Stamp {
        self.stamp
    }

    /// Returns `true` if the write won.
    pub fn set(&mut self, value: T, stamp: Stamp) -> bool {
        if stamp > self.stamp {
            self.value = value;
            self.stamp = stamp;
            true
        } else {
            false
        }
    }
}

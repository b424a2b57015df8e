use std::collections::BTreeMap;
use std::time::Duration;

use crate::ids::ClientId;
use crate::model::Presence;

#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Entries not refreshed within this window are dropped.
    pub timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
        }
    }
}

/// Ephemeral collaborator metadata for one room. Owned by the room actor;
/// never persisted, never part of the document state.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    entries: BTreeMap<ClientId, Presence>,
}

impl PresenceTracker {
    pub fn upsert(&mut self, client: ClientId, mut presence: Presence, now: i64) -> &Presence {
        presence.last_seen_at = now;
        self.entries.insert(client, presence);
        &self.entries[&client]
    }

    /// Refresh liveness without changing the entry. Returns `false` if the
    /// client has no entry.
    pub fn touch(&mut self, client: ClientId, now: i64) -> bool {
        match self.entries.get_mut(&client) {
            Some(entry) => {
                entry.last_seen_at = now;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, client: ClientId) -> Option<Presence> {
        self.entries.remove(&client)
    }

    pub fn list(&self) -> Vec<(ClientId, Presence)> {
        self.entries
            .iter()
            .map(|(client, presence)| (*client, presence.clone()))
            .collect()
    }

    /// Move an entry to a newly assigned client id.
    pub fn rekey(&mut self, from: ClientId, to: ClientId) {
        if let Some(entry) = self.entries.remove(&from) {
            self.entries.insert(to, entry);
        }
    }

    /// Drop entries last seen before `now - timeout`; returns who left.
    pub fn sweep(&mut self, now: i64, timeout: Duration) -> Vec<ClientId> {
        let cutoff = now - timeout.as_millis() as i64;
        let stale: Vec<ClientId> = self
            .entries
            .iter()
            .filter(|(_, p)| p.last_seen_at < cutoff)
            .map(|(client, _)| *client)
            .collect();
        for client in &stale {
            self.entries.remove(client);
        }
        stale
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::UserId;

    fn presence(user: &str) -> Presence {
        Presence {
            user_id: UserId::new(user),
            display_name: user.to_uppercase(),
            color: "#ff8800".into(),
            cursor: None,
            last_seen_at: 0,
        }
    }

    #[test]
    fn sweep_drops_only_stale_entries() {
        let mut tracker = PresenceTracker::default();
        tracker.upsert(ClientId(1), presence("ana"), 1_000);
        tracker.upsert(ClientId(2), presence("ben"), 1_000);
        assert!(tracker.touch(ClientId(2), 20_000));

        let gone = tracker.sweep(35_000, Duration::from_secs(30));
        assert_eq!(gone, vec![ClientId(1)]);
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.list()[0].0, ClientId(2));
    }

    #[test]
    fn upsert_stamps_server_time_and_rekey_moves_entry() {
        let mut tracker = PresenceTracker::default();
        let mut claimed = presence("ana");
        claimed.last_seen_at = 99;
        assert_eq!(tracker.upsert(ClientId(1), claimed, 5).last_seen_at, 5);

        tracker.rekey(ClientId(1), ClientId(9));
        assert!(tracker.remove(ClientId(1)).is_none());
        assert!(tracker.remove(ClientId(9)).is_some());
        assert!(tracker.is_empty());
        assert!(!tracker.touch(ClientId(9), 6));
    }
}

//! Live rooms, keyed by document and branch.
//!
//! At most one actor runs per key. Lookups take the read lock; creation and
//! removal take the write lock and re-check. A key being evicted is parked in
//! `draining` until its actor has flushed, so a new actor for the same key
//! never loads state older than the one being written.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::select;
use tokio::sync::{RwLock, broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::AppError;
use crate::ids::RoomKey;
use crate::persistence::{RecorderConfig, SharedStore};

use super::actor::{RoomContext, spawn_room};
use super::events::ActivityEvent;
use super::handle::{EvictOutcome, RoomHandle, RoomPhase};
use super::presence::PresenceConfig;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Soft cap on live rooms; idle rooms beyond it are evicted oldest first.
    pub max_rooms: usize,
    pub idle_timeout: Duration,
    pub save_debounce: Duration,
    pub mailbox_capacity: usize,
    pub activity_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_rooms: 256,
            idle_timeout: Duration::from_secs(60),
            save_debounce: Duration::from_secs(2),
            mailbox_capacity: 256,
            activity_capacity: 1024,
        }
    }
}

/// Ask the registry to evict one incarnation of a room.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EvictionRequest {
    pub key: RoomKey,
    pub generation: u64,
}

struct Slot {
    handle: RoomHandle,
    generation: u64,
    last_used: AtomicU64,
}

#[derive(Default)]
struct Rooms {
    live: HashMap<RoomKey, Slot>,
    draining: HashMap<RoomKey, watch::Receiver<bool>>,
}

pub struct RoomRegistry {
    rooms: RwLock<Rooms>,
    ctx: RoomContext,
    generations: AtomicU64,
    uses: AtomicU64,
    shutdown: CancellationToken,
}

impl RoomRegistry {
    pub fn new(
        store: SharedStore,
        config: RegistryConfig,
        recorder: RecorderConfig,
        presence: PresenceConfig,
    ) -> Arc<Self> {
        let (evictions, queue) = mpsc::unbounded_channel();
        let (activity, _) = broadcast::channel(config.activity_capacity.max(1));

        let registry = Arc::new(Self {
            rooms: RwLock::new(Rooms::default()),
            ctx: RoomContext {
                store,
                registry: config,
                recorder,
                presence,
                activity,
                evictions,
            },
            generations: AtomicU64::new(0),
            uses: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(reap(
            Arc::downgrade(&registry),
            queue,
            registry.shutdown.clone(),
        ));
        registry
    }

    /// Handle to the live room for `key`, starting its actor if needed.
    pub async fn get_or_create(&self, key: RoomKey) -> Result<RoomHandle, AppError> {
        loop {
            {
                let rooms = self.rooms.read().await;
                if let Some(handle) = self.live_handle(&rooms, &key) {
                    return Ok(handle);
                }
                if let Some(drain) = rooms.draining.get(&key) {
                    let mut drain = drain.clone();
                    drop(rooms);
                    debug!(room = %key, "waiting for room to finish draining");
                    let _ = drain.wait_for(|done| *done).await;
                    continue;
                }
            }

            let mut rooms = self.rooms.write().await;
            if let Some(handle) = self.live_handle(&rooms, &key) {
                return Ok(handle);
            }
            if rooms.draining.contains_key(&key) {
                continue;
            }

            let generation = self.generations.fetch_add(1, Ordering::SeqCst);
            let handle = spawn_room(key, generation, &self.ctx);
            rooms.live.insert(
                key,
                Slot {
                    handle: handle.clone(),
                    generation,
                    last_used: AtomicU64::new(self.tick()),
                },
            );
            let victims = self.over_capacity(&rooms, key);
            let live = rooms.live.len();
            drop(rooms);

            debug!(room = %key, generation, live, "room started");
            for victim in victims {
                let _ = self.ctx.evictions.send(victim);
            }
            return Ok(handle);
        }
    }

    /// Run `f` against the live room, retrying once more on a fresh actor if
    /// the one it reached stopped underneath it.
    pub async fn with_room<T, F, Fut>(&self, key: RoomKey, f: F) -> Result<T, AppError>
    where
        F: Fn(RoomHandle) -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let mut retries = 0;
        loop {
            let handle = self.get_or_create(key).await?;
            match f(handle.clone()).await {
                Err(AppError::RoomUnavailable(reason)) if handle.is_closed() && retries < 2 => {
                    retries += 1;
                    debug!(room = %key, %reason, retries, "room stopped mid-request; retrying");
                }
                result => return result,
            }
        }
    }

    /// Existing live room, without starting one.
    pub async fn get(&self, key: RoomKey) -> Option<RoomHandle> {
        let rooms = self.rooms.read().await;
        self.live_handle(&rooms, &key)
    }

    /// Flush and stop the room if nobody is connected. Returns whether it was
    /// evicted.
    pub async fn evict(&self, key: RoomKey) -> Result<bool, AppError> {
        self.evict_generation(key, None).await
    }

    /// Evict every room that is idle right now.
    pub async fn evict_idle(&self) -> usize {
        let idle: Vec<RoomKey> = {
            let rooms = self.rooms.read().await;
            rooms
                .live
                .iter()
                .filter(|(_, slot)| {
                    slot.handle.member_count() == 0 && slot.handle.phase() == RoomPhase::Idle
                })
                .map(|(key, _)| *key)
                .collect()
        };

        let mut evicted = 0;
        for key in idle {
            match self.evict(key).await {
                Ok(true) => evicted += 1,
                Ok(false) => {}
                Err(err) => warn!(room = %key, error = %err, "idle eviction failed"),
            }
        }
        evicted
    }

    /// Flush the room and stop it even if members are connected; they are
    /// sent `room.closed`.
    #[instrument(skip(self))]
    pub async fn teardown(&self, key: RoomKey, reason: &str) -> Result<(), AppError> {
        let (slot, done) = {
            let mut rooms = self.rooms.write().await;
            let Some(slot) = rooms.live.remove(&key) else {
                return Ok(());
            };
            let (done, drain) = watch::channel(false);
            rooms.draining.insert(key, drain);
            (slot, done)
        };

        let result = match slot.handle.close(reason).await {
            Err(_) if slot.handle.is_closed() => Ok(()),
            result => result,
        };

        let mut rooms = self.rooms.write().await;
        rooms.draining.remove(&key);
        if result.is_err() {
            rooms.live.insert(key, slot);
        }
        drop(rooms);
        let _ = done.send(true);
        result
    }

    /// Flush and stop every room.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let slots: Vec<(RoomKey, Slot)> = {
            let mut rooms = self.rooms.write().await;
            rooms.live.drain().collect()
        };
        info!(rooms = slots.len(), "shutting down rooms");

        join_all(slots.into_iter().map(|(key, slot)| async move {
            if let Err(err) = slot.handle.close("server shutting down").await
                && !slot.handle.is_closed()
            {
                warn!(room = %key, error = %err, "room did not shut down cleanly");
            }
        }))
        .await;
    }

    pub fn subscribe_activity(&self) -> broadcast::Receiver<ActivityEvent> {
        self.ctx.activity.subscribe()
    }

    pub(crate) fn publish(&self, event: ActivityEvent) {
        let _ = self.ctx.activity.send(event);
    }

    pub async fn len(&self) -> usize {
        self.rooms.read().await.live.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Rooms whose latest state could not be persisted.
    pub async fn degraded_rooms(&self) -> Vec<RoomKey> {
        let rooms = self.rooms.read().await;
        let mut keys: Vec<RoomKey> = rooms
            .live
            .iter()
            .filter(|(_, slot)| slot.handle.health().is_degraded())
            .map(|(key, _)| *key)
            .collect();
        keys.sort();
        keys
    }

    fn live_handle(&self, rooms: &Rooms, key: &RoomKey) -> Option<RoomHandle> {
        let slot = rooms.live.get(key)?;
        if slot.handle.is_closed() {
            return None;
        }
        slot.last_used.store(self.tick(), Ordering::Relaxed);
        Some(slot.handle.clone())
    }

    fn tick(&self) -> u64 {
        self.uses.fetch_add(1, Ordering::Relaxed)
    }

    /// Least recently used idle rooms that push the count past `max_rooms`.
    fn over_capacity(&self, rooms: &Rooms, fresh: RoomKey) -> Vec<EvictionRequest> {
        let excess = rooms
            .live
            .len()
            .saturating_sub(self.ctx.registry.max_rooms);
        if excess == 0 {
            return Vec::new();
        }

        let mut idle: Vec<(u64, EvictionRequest)> = rooms
            .live
            .iter()
            .filter(|(key, slot)| **key != fresh && slot.handle.member_count() == 0)
            .map(|(key, slot)| {
                (
                    slot.last_used.load(Ordering::Relaxed),
                    EvictionRequest {
                        key: *key,
                        generation: slot.generation,
                    },
                )
            })
            .collect();
        idle.sort_by_key(|(used, _)| *used);
        idle.into_iter()
            .take(excess)
            .map(|(_, request)| request)
            .collect()
    }

    async fn evict_generation(
        &self,
        key: RoomKey,
        generation: Option<u64>,
    ) -> Result<bool, AppError> {
        let (slot, done) = {
            let mut rooms = self.rooms.write().await;
            let Some(slot) = rooms.live.get(&key) else {
                return Ok(false);
            };
            if generation.is_some_and(|g| g != slot.generation)
                || (slot.handle.member_count() > 0 && !slot.handle.is_closed())
            {
                return Ok(false);
            }
            let Some(slot) = rooms.live.remove(&key) else {
                return Ok(false);
            };
            let (done, drain) = watch::channel(false);
            rooms.draining.insert(key, drain);
            (slot, done)
        };

        let evicted = match slot.handle.evict().await {
            Ok(EvictOutcome::Evicted) => true,
            Ok(EvictOutcome::Busy) => false,
            // Already stopped.
            Err(_) => true,
        };

        let mut rooms = self.rooms.write().await;
        rooms.draining.remove(&key);
        if !evicted {
            rooms.live.insert(key, slot);
        }
        drop(rooms);
        let _ = done.send(true);

        if evicted {
            debug!(room = %key, "room removed from registry");
        }
        Ok(evicted)
    }
}

impl Drop for RoomRegistry {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Consume eviction requests posted by idle rooms and by the capacity check.
async fn reap(
    registry: Weak<RoomRegistry>,
    mut queue: mpsc::UnboundedReceiver<EvictionRequest>,
    shutdown: CancellationToken,
) {
    loop {
        let request = select! {
            _ = shutdown.cancelled() => break,
            request = queue.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };
        let Some(registry) = registry.upgrade() else {
            break;
        };
        tokio::spawn(async move {
            if let Err(err) = registry
                .evict_generation(request.key, Some(request.generation))
                .await
            {
                warn!(room = %request.key, error = %err, "eviction failed");
            }
        });
    }
    debug!("room reaper stopped");
}

//! One task per live room. The actor owns the room's document, its members
//! and their presence; everything else talks to it through its mailbox, so
//! every mutation for a room is applied in a single serial order.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::select;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::error::AppError;
use crate::ids::{ClientId, ConnectionId, RoomKey, UserId, now_millis};
use crate::model::{Op, Presence, RejectedOp, TimelineDocument};
use crate::persistence::{
    PersistenceHealth, RecorderConfig, RecorderHandle, SharedStore, StoreKey, spawn_recorder,
};
use crate::session::{PresenceEntry, ServerFrame, encode_blob};

use super::events::{ActivityEvent, events_for_op};
use super::handle::{EvictOutcome, RoomCommand, RoomHandle, RoomPhase, RoomStatus};
use super::presence::{PresenceConfig, PresenceTracker};
use super::registry::{EvictionRequest, RegistryConfig};

/// Replica id of server-side documents. Servers merge ops but never author them.
const SERVER_REPLICA: ClientId = ClientId(0);

/// Everything a room needs from its registry.
#[derive(Clone)]
pub(crate) struct RoomContext {
    pub store: SharedStore,
    pub registry: RegistryConfig,
    pub recorder: RecorderConfig,
    pub presence: PresenceConfig,
    pub activity: broadcast::Sender<ActivityEvent>,
    pub evictions: mpsc::UnboundedSender<EvictionRequest>,
}

pub(crate) fn spawn_room(key: RoomKey, generation: u64, ctx: &RoomContext) -> RoomHandle {
    let (tx, rx) = mpsc::channel(ctx.registry.mailbox_capacity);
    let (phase_tx, phase_rx) = watch::channel(RoomPhase::Loading);
    let member_count = Arc::new(AtomicUsize::new(0));
    let health = Arc::new(PersistenceHealth::default());
    let recorder = spawn_recorder(
        StoreKey::room(key),
        ctx.store.clone(),
        ctx.recorder.clone(),
        health.clone(),
    );

    let actor = RoomActor {
        key,
        generation,
        store: ctx.store.clone(),
        recorder,
        doc: TimelineDocument::new(SERVER_REPLICA),
        members: BTreeMap::new(),
        presence: PresenceTracker::default(),
        rx,
        phase: phase_tx,
        member_count: member_count.clone(),
        activity: ctx.activity.clone(),
        evictions: ctx.evictions.clone(),
        config: ctx.registry.clone(),
        presence_config: ctx.presence.clone(),
        unsaved: false,
        save_at: None,
        idle_at: None,
    };
    tokio::spawn(actor.run());

    RoomHandle::new(key, tx, phase_rx, member_count, health)
}

struct Member {
    client: ClientId,
    user: UserId,
    outbound: mpsc::Sender<ServerFrame>,
}

enum Flow {
    Continue,
    Stop,
}

struct RoomActor {
    key: RoomKey,
    generation: u64,
    store: SharedStore,
    recorder: RecorderHandle,
    doc: TimelineDocument,
    members: BTreeMap<ConnectionId, Member>,
    presence: PresenceTracker,
    rx: mpsc::Receiver<RoomCommand>,
    phase: watch::Sender<RoomPhase>,
    member_count: Arc<AtomicUsize>,
    activity: broadcast::Sender<ActivityEvent>,
    evictions: mpsc::UnboundedSender<EvictionRequest>,
    config: RegistryConfig,
    presence_config: PresenceConfig,
    /// State changed since the last write confirmed from inside the actor.
    unsaved: bool,
    save_at: Option<Instant>,
    idle_at: Option<Instant>,
}

async fn at(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn forward_ack(
    ack: oneshot::Receiver<Result<(), AppError>>,
    reply: oneshot::Sender<Result<(), AppError>>,
) {
    tokio::spawn(async move {
        let result = ack
            .await
            .unwrap_or_else(|_| Err(AppError::Store("recorder stopped".to_string())));
        let _ = reply.send(result);
    });
}

impl RoomActor {
    async fn run(mut self) {
        if let Err(err) = self.load().await {
            error!(room = %self.key, error = %err, "room failed to load");
            self.fail(err).await;
            return;
        }
        self.enter_idle();

        let mut sweep = tokio::time::interval(self.presence_config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let flow = select! {
                command = self.rx.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => {
                        debug!(room = %self.key, "all handles dropped; stopping room");
                        if self.unsaved && let Err(err) = self.flush_now().await {
                            error!(room = %self.key, error = %err, "final flush failed");
                        }
                        Flow::Stop
                    }
                },
                _ = at(self.save_at) => self.save().await,
                _ = at(self.idle_at) => {
                    self.request_eviction();
                    Flow::Continue
                }
                _ = sweep.tick() => {
                    self.sweep_presence();
                    Flow::Continue
                }
            };
            if let Flow::Stop = flow {
                break;
            }
        }

        let _ = self.phase.send(RoomPhase::Evicted);
        if let Err(err) = self.recorder.shutdown().await {
            warn!(room = %self.key, error = %err, "recorder did not shut down cleanly");
        }
        info!(room = %self.key, "room stopped");
    }

    async fn load(&mut self) -> Result<(), AppError> {
        let loaded = self
            .store
            .load(&StoreKey::room(self.key))
            .await
            .map_err(|e| AppError::RoomUnavailable(format!("cannot load room {}: {e}", self.key)))?;

        match loaded {
            Some(blob) => {
                self.doc = TimelineDocument::from_full(SERVER_REPLICA, &blob).map_err(|e| {
                    AppError::RoomUnavailable(format!(
                        "persisted state for room {} is unreadable: {e}",
                        self.key
                    ))
                })?;
                info!(room = %self.key, size = blob.len(), clock = self.doc.clock(), "room loaded from store");
            }
            None => info!(room = %self.key, "room created empty"),
        }
        Ok(())
    }

    /// Refuse everything queued, ask to be removed from the registry, exit.
    async fn fail(&mut self, err: AppError) {
        let _ = self.phase.send(RoomPhase::Evicted);
        let _ = self.evictions.send(EvictionRequest {
            key: self.key,
            generation: self.generation,
        });
        self.rx.close();

        let message = err.to_string();
        let unavailable = || AppError::RoomUnavailable(message.clone());
        while let Some(command) = self.rx.recv().await {
            match command {
                RoomCommand::Join { reply, .. }
                | RoomCommand::ReplaceState { reply, .. }
                | RoomCommand::Flush { reply }
                | RoomCommand::Close { reply, .. } => {
                    let _ = reply.send(Err(unavailable()));
                }
                RoomCommand::EncodeFull { reply } => {
                    let _ = reply.send(Err(unavailable()));
                }
                RoomCommand::Evict { reply } => {
                    let _ = reply.send(EvictOutcome::Evicted);
                }
                RoomCommand::Status { .. }
                | RoomCommand::Leave { .. }
                | RoomCommand::Submit { .. }
                | RoomCommand::Presence { .. }
                | RoomCommand::Heartbeat { .. } => {}
            }
        }
    }

    async fn handle(&mut self, command: RoomCommand) -> Flow {
        match command {
            RoomCommand::Join {
                conn,
                client,
                user,
                outbound,
                reply,
            } => {
                let _ = reply.send(self.join(conn, client, user, outbound));
            }
            RoomCommand::Leave { conn } => {
                if let Some(member) = self.members.remove(&conn) {
                    info!(room = %self.key, %conn, client = %member.client, "member left");
                    self.drop_presence(member.client);
                    self.membership_changed();
                }
            }
            RoomCommand::Submit { conn, op } => self.submit(conn, op),
            RoomCommand::Presence { conn, presence } => {
                let Some(member) = self.members.get(&conn) else {
                    return Flow::Continue;
                };
                let client = member.client;
                let entry = Presence {
                    user_id: member.user.clone(),
                    display_name: presence.display_name,
                    color: presence.color,
                    cursor: presence.cursor,
                    last_seen_at: 0,
                };
                let presence = self.presence.upsert(client, entry, now_millis()).clone();
                self.broadcast(
                    Some(conn),
                    ServerFrame::PresenceChanged {
                        room: self.key,
                        client_id: client,
                        presence,
                    },
                );
            }
            RoomCommand::Heartbeat { conn } => {
                if let Some(member) = self.members.get(&conn) {
                    self.presence.touch(member.client, now_millis());
                }
            }
            RoomCommand::EncodeFull { reply } => {
                let _ = reply.send(self.doc.encode_full().map_err(AppError::from));
            }
            RoomCommand::Status { reply } => {
                let _ = reply.send(RoomStatus {
                    room: self.key,
                    phase: *self.phase.borrow(),
                    members: self.members.len(),
                    clock: self.doc.clock(),
                    summary: self.doc.summary(),
                });
            }
            RoomCommand::ReplaceState { blob, reply } => {
                if let Err(err) = self.doc.load_full(&blob) {
                    warn!(room = %self.key, error = %err, "refusing replacement state");
                    let _ = reply.send(Err(err.into()));
                    return Flow::Continue;
                }
                info!(room = %self.key, clock = self.doc.clock(), members = self.members.len(), "room state replaced");
                self.resync_all();
                self.unsaved = true;
                self.flush_async(reply);
            }
            RoomCommand::Flush { reply } => self.flush_async(reply),
            RoomCommand::Evict { reply } => return self.evict(reply).await,
            RoomCommand::Close { reason, reply } => {
                if let Err(err) = self.flush_now().await {
                    let _ = reply.send(Err(err));
                    return Flow::Continue;
                }
                let frame = ServerFrame::RoomClosed {
                    room: self.key,
                    reason,
                };
                self.deliver(None, &frame);
                self.members.clear();
                self.member_count.store(0, Ordering::SeqCst);
                info!(room = %self.key, "room torn down");
                let _ = reply.send(Ok(()));
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    fn join(
        &mut self,
        conn: ConnectionId,
        client: ClientId,
        user: UserId,
        outbound: mpsc::Sender<ServerFrame>,
    ) -> Result<(), AppError> {
        let frame = self.sync_frame(client)?;
        outbound
            .try_send(frame)
            .map_err(|_| AppError::Internal("connection closed during join".to_string()))?;

        if let Some(previous) = self.members.insert(
            conn,
            Member {
                client,
                user: user.clone(),
                outbound,
            },
        ) {
            self.presence.rekey(previous.client, client);
        }

        info!(room = %self.key, %conn, %client, %user, members = self.members.len(), "member joined");
        self.membership_changed();
        Ok(())
    }

    fn submit(&mut self, conn: ConnectionId, op: Op) {
        let Some(member) = self.members.get(&conn) else {
            debug!(room = %self.key, %conn, "op from a connection that is not a member");
            return;
        };
        let client = member.client;
        let user = member.user.clone();

        let result = if op.client() != client {
            Err(RejectedOp::ClientMismatch {
                expected: client,
                found: op.client(),
            })
        } else if let Some(claimed) = op.acting_user()
            && *claimed != user
        {
            Err(RejectedOp::IdentityMismatch {
                expected: user.clone(),
                found: claimed.clone(),
            })
        } else {
            self.doc.apply_remote(&op)
        };

        match result {
            Ok(()) => {
                trace!(room = %self.key, stamp = %op.stamp, "op applied");
                match op.encode() {
                    Ok(bytes) => self.broadcast(
                        Some(conn),
                        ServerFrame::OpApplied {
                            room: self.key,
                            op: encode_blob(&bytes),
                        },
                    ),
                    Err(err) => error!(room = %self.key, error = %err, "failed to encode applied op"),
                }
                self.mark_dirty();

                let at = now_millis();
                for kind in events_for_op(&user, &op) {
                    let _ = self.activity.send(ActivityEvent {
                        room: self.key,
                        at,
                        kind,
                    });
                }
            }
            Err(rejection) => {
                warn!(room = %self.key, %conn, %client, reason = %rejection, "op rejected");
                let frame = ServerFrame::OpRejected {
                    room: self.key,
                    reason: rejection.to_string(),
                    rejection,
                };
                self.send_to(conn, frame);
                self.resync(conn);
            }
        }
    }

    fn sync_frame(&self, client: ClientId) -> Result<ServerFrame, AppError> {
        Ok(ServerFrame::SyncFull {
            room: self.key,
            client_id: client,
            state: encode_blob(&self.doc.encode_full()?),
            presence: self
                .presence
                .list()
                .into_iter()
                .map(|(client_id, presence)| PresenceEntry {
                    client_id,
                    presence,
                })
                .collect(),
        })
    }

    /// Assign a fresh client id and send the full state: the member starts a
    /// new replica lineage from the server's current state.
    fn resync(&mut self, conn: ConnectionId) {
        let Some(member) = self.members.get_mut(&conn) else {
            return;
        };
        let previous = member.client;
        let client = ClientId::random();
        member.client = client;
        self.presence.rekey(previous, client);

        match self.sync_frame(client) {
            Ok(frame) => self.send_to(conn, frame),
            Err(err) => error!(room = %self.key, error = %err, "failed to build resync"),
        }
    }

    fn resync_all(&mut self) {
        let conns: Vec<ConnectionId> = self.members.keys().copied().collect();
        for conn in conns {
            self.resync(conn);
        }
    }

    /// Queue `frame` for every member except `except`; returns members whose
    /// queue was full or closed.
    fn deliver(&self, except: Option<ConnectionId>, frame: &ServerFrame) -> Vec<ConnectionId> {
        self.members
            .iter()
            .filter(|(conn, _)| Some(**conn) != except)
            .filter(|(_, member)| member.outbound.try_send(frame.clone()).is_err())
            .map(|(conn, _)| *conn)
            .collect()
    }

    fn broadcast(&mut self, except: Option<ConnectionId>, frame: ServerFrame) {
        let failed = self.deliver(except, &frame);
        self.drop_members(failed);
    }

    fn send_to(&mut self, conn: ConnectionId, frame: ServerFrame) {
        let delivered = self
            .members
            .get(&conn)
            .is_some_and(|member| member.outbound.try_send(frame).is_ok());
        if !delivered {
            self.drop_members(vec![conn]);
        }
    }

    /// Remove members that cannot keep up. Dropping their queue ends their
    /// connection.
    fn drop_members(&mut self, mut conns: Vec<ConnectionId>) {
        if conns.is_empty() {
            return;
        }
        while let Some(conn) = conns.pop() {
            let Some(member) = self.members.remove(&conn) else {
                continue;
            };
            warn!(room = %self.key, %conn, client = %member.client, "dropping slow or closed member");
            if self.presence.remove(member.client).is_some() {
                let frame = ServerFrame::PresenceLeft {
                    room: self.key,
                    client_id: member.client,
                };
                conns.extend(self.deliver(None, &frame));
            }
        }
        self.membership_changed();
    }

    fn drop_presence(&mut self, client: ClientId) {
        if self.presence.remove(client).is_some() {
            self.broadcast(
                None,
                ServerFrame::PresenceLeft {
                    room: self.key,
                    client_id: client,
                },
            );
        }
    }

    fn sweep_presence(&mut self) {
        let gone = self
            .presence
            .sweep(now_millis(), self.presence_config.timeout);
        for client in gone {
            debug!(room = %self.key, %client, "presence expired");
            self.broadcast(
                None,
                ServerFrame::PresenceLeft {
                    room: self.key,
                    client_id: client,
                },
            );
        }
    }

    fn membership_changed(&mut self) {
        self.member_count.store(self.members.len(), Ordering::SeqCst);
        if self.members.is_empty() {
            if *self.phase.borrow() != RoomPhase::Idle {
                self.enter_idle();
            }
        } else {
            self.idle_at = None;
            let _ = self.phase.send_if_modified(|phase| {
                let changed = *phase != RoomPhase::Active;
                *phase = RoomPhase::Active;
                changed
            });
        }
    }

    fn enter_idle(&mut self) {
        let _ = self.phase.send(RoomPhase::Idle);
        self.idle_at = Some(Instant::now() + self.config.idle_timeout);
        debug!(room = %self.key, "room idle");
    }

    fn request_eviction(&mut self) {
        self.idle_at = None;
        debug!(room = %self.key, "idle timeout expired; requesting eviction");
        let _ = self.evictions.send(EvictionRequest {
            key: self.key,
            generation: self.generation,
        });
    }

    fn mark_dirty(&mut self) {
        self.unsaved = true;
        if self.save_at.is_none() {
            self.save_at = Some(Instant::now() + self.config.save_debounce);
        }
    }

    /// Debounced write-behind save, preceded by an integrity check.
    async fn save(&mut self) -> Flow {
        self.save_at = None;
        let blob = self
            .doc
            .check_integrity()
            .map_err(AppError::from)
            .and_then(|()| self.doc.encode_full().map_err(AppError::from));

        match blob {
            Ok(blob) => {
                trace!(room = %self.key, size = blob.len(), "queueing room state");
                self.recorder.save(blob);
                Flow::Continue
            }
            Err(err) => self.recover(err).await,
        }
    }

    /// Discard the in-memory state and reload the last persisted checkpoint.
    async fn recover(&mut self, cause: AppError) -> Flow {
        error!(room = %self.key, error = %cause, "room state inconsistent; reloading last checkpoint");

        let reloaded = match self.store.load(&StoreKey::room(self.key)).await {
            Ok(Some(blob)) => TimelineDocument::from_full(SERVER_REPLICA, &blob)
                .map_err(|e| AppError::RoomUnavailable(e.to_string())),
            Ok(None) => Err(AppError::RoomUnavailable(
                "no persisted state to recover from".to_string(),
            )),
            Err(err) => Err(AppError::RoomUnavailable(err.to_string())),
        };

        match reloaded {
            Ok(doc) => {
                self.doc = doc;
                self.unsaved = false;
                warn!(room = %self.key, clock = self.doc.clock(), "room recovered from checkpoint");
                self.resync_all();
                Flow::Continue
            }
            Err(err) => {
                error!(room = %self.key, error = %err, "room has no valid checkpoint; closing");
                let frame = ServerFrame::RoomClosed {
                    room: self.key,
                    reason: "room state unavailable".to_string(),
                };
                self.deliver(None, &frame);
                self.members.clear();
                self.member_count.store(0, Ordering::SeqCst);
                self.fail(err).await;
                Flow::Stop
            }
        }
    }

    /// Persist now and wait for durability.
    async fn flush_now(&mut self) -> Result<(), AppError> {
        if !self.unsaved {
            return Ok(());
        }
        let blob = self.doc.encode_full()?;
        self.recorder.flush_and_wait(blob).await?;
        self.unsaved = false;
        self.save_at = None;
        Ok(())
    }

    /// Persist now; `reply` resolves once durable without blocking the room.
    fn flush_async(&mut self, reply: oneshot::Sender<Result<(), AppError>>) {
        match self.doc.encode_full() {
            Ok(blob) => {
                self.save_at = None;
                forward_ack(self.recorder.flush(blob), reply);
            }
            Err(err) => {
                let _ = reply.send(Err(err.into()));
            }
        }
    }

    async fn evict(&mut self, reply: oneshot::Sender<EvictOutcome>) -> Flow {
        if !self.members.is_empty() {
            let _ = reply.send(EvictOutcome::Busy);
            return Flow::Continue;
        }

        if let Err(err) = self.flush_now().await {
            warn!(room = %self.key, error = %err, "eviction postponed; state not durable");
            let _ = reply.send(EvictOutcome::Busy);
            self.enter_idle();
            return Flow::Continue;
        }

        let _ = self.phase.send(RoomPhase::Evicted);
        let _ = reply.send(EvictOutcome::Evicted);
        info!(room = %self.key, "room evicted");
        Flow::Stop
    }
}

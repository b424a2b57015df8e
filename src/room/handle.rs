use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::AppError;
use crate::ids::{ClientId, ConnectionId, RoomKey, UserId};
use crate::model::{DocumentSummary, Op};
use crate::persistence::PersistenceHealth;
use crate::session::{PresenceInput, ServerFrame};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomPhase {
    Loading,
    Active,
    Idle,
    Evicted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictOutcome {
    Evicted,
    /// Members joined (or state could not be flushed); the room stays live.
    Busy,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoomStatus {
    pub room: RoomKey,
    pub phase: RoomPhase,
    pub members: usize,
    pub clock: u64,
    #[serde(flatten)]
    pub summary: DocumentSummary,
}

pub(crate) enum RoomCommand {
    Join {
        conn: ConnectionId,
        client: ClientId,
        user: UserId,
        outbound: mpsc::Sender<ServerFrame>,
        reply: oneshot::Sender<Result<(), AppError>>,
    },
    Leave {
        conn: ConnectionId,
    },
    Submit {
        conn: ConnectionId,
        op: Op,
    },
    Presence {
        conn: ConnectionId,
        presence: PresenceInput,
    },
    Heartbeat {
        conn: ConnectionId,
    },
    EncodeFull {
        reply: oneshot::Sender<Result<Vec<u8>, AppError>>,
    },
    Status {
        reply: oneshot::Sender<RoomStatus>,
    },
    ReplaceState {
        blob: Vec<u8>,
        reply: oneshot::Sender<Result<(), AppError>>,
    },
    Flush {
        reply: oneshot::Sender<Result<(), AppError>>,
    },
    Evict {
        reply: oneshot::Sender<EvictOutcome>,
    },
    Close {
        reason: String,
        reply: oneshot::Sender<Result<(), AppError>>,
    },
}

/// The only way into a room. Cheap to clone; every call is a message to the
/// room's actor, processed in mailbox order.
#[derive(Clone)]
pub struct RoomHandle {
    key: RoomKey,
    tx: mpsc::Sender<RoomCommand>,
    phase: watch::Receiver<RoomPhase>,
    members: Arc<AtomicUsize>,
    health: Arc<PersistenceHealth>,
}

impl RoomHandle {
    pub(crate) fn new(
        key: RoomKey,
        tx: mpsc::Sender<RoomCommand>,
        phase: watch::Receiver<RoomPhase>,
        members: Arc<AtomicUsize>,
        health: Arc<PersistenceHealth>,
    ) -> Self {
        Self {
            key,
            tx,
            phase,
            members,
            health,
        }
    }

    pub fn key(&self) -> RoomKey {
        self.key
    }

    pub fn phase(&self) -> RoomPhase {
        *self.phase.borrow()
    }

    /// Watch phase transitions.
    pub fn subscribe_phase(&self) -> watch::Receiver<RoomPhase> {
        self.phase.clone()
    }

    pub fn member_count(&self) -> usize {
        self.members.load(Ordering::SeqCst)
    }

    pub fn health(&self) -> &PersistenceHealth {
        &self.health
    }

    /// The actor has exited; a fresh handle must be obtained from the registry.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Register a connection. On success the actor has already queued
    /// `sync.full` on `outbound`.
    pub async fn join(
        &self,
        conn: ConnectionId,
        client: ClientId,
        user: UserId,
        outbound: mpsc::Sender<ServerFrame>,
    ) -> Result<(), AppError> {
        self.request(|reply| RoomCommand::Join {
            conn,
            client,
            user,
            outbound,
            reply,
        })
        .await?
    }

    pub async fn leave(&self, conn: ConnectionId) {
        let _ = self.tx.send(RoomCommand::Leave { conn }).await;
    }

    pub async fn submit(&self, conn: ConnectionId, op: Op) -> Result<(), AppError> {
        self.send(RoomCommand::Submit { conn, op }).await
    }

    pub async fn update_presence(
        &self,
        conn: ConnectionId,
        presence: PresenceInput,
    ) -> Result<(), AppError> {
        self.send(RoomCommand::Presence { conn, presence }).await
    }

    pub async fn heartbeat(&self, conn: ConnectionId) {
        let _ = self.tx.send(RoomCommand::Heartbeat { conn }).await;
    }

    pub async fn encode_full(&self) -> Result<Vec<u8>, AppError> {
        self.request(|reply| RoomCommand::EncodeFull { reply })
            .await?
    }

    pub async fn status(&self) -> Result<RoomStatus, AppError> {
        self.request(|reply| RoomCommand::Status { reply }).await
    }

    /// Swap the live state for `blob`, resync every member and persist.
    pub async fn replace_state(&self, blob: Vec<u8>) -> Result<(), AppError> {
        self.request(|reply| RoomCommand::ReplaceState { blob, reply })
            .await?
    }

    /// Persist the current state and wait until it is durable.
    pub async fn flush(&self) -> Result<(), AppError> {
        self.request(|reply| RoomCommand::Flush { reply }).await?
    }

    pub(crate) async fn evict(&self) -> Result<EvictOutcome, AppError> {
        self.request(|reply| RoomCommand::Evict { reply }).await
    }

    pub(crate) async fn close(&self, reason: impl Into<String>) -> Result<(), AppError> {
        let reason = reason.into();
        self.request(|reply| RoomCommand::Close { reason, reply })
            .await?
    }

    async fn send(&self, command: RoomCommand) -> Result<(), AppError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| self.unavailable())
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> RoomCommand,
    ) -> Result<T, AppError> {
        let (reply, rx) = oneshot::channel();
        self.send(command(reply)).await?;
        rx.await.map_err(|_| self.unavailable())
    }

    fn unavailable(&self) -> AppError {
        AppError::RoomUnavailable(format!("room {} is not running", self.key))
    }
}

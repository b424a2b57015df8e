use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::app_state::AppState;
use crate::error::AppError;
use crate::ids::{ClientId, ConnectionId, RoomKey};
use crate::room::RoomHandle;

use super::protocol::{ClientFrame, ServerFrame, decode_op};
use super::ticket::TicketSubject;

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Server-initiated websocket pings.
    pub heartbeat_interval: Duration,
    /// Connections silent for this long are dropped.
    pub liveness_timeout: Duration,
    /// Frames queued per connection before it counts as a slow consumer.
    pub outbound_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            liveness_timeout: Duration::from_secs(45),
            outbound_capacity: 256,
        }
    }
}

type Sink = SplitSink<WebSocket, Message>;

/// The room this connection is currently a member of.
struct Membership {
    key: RoomKey,
    handle: RoomHandle,
    client: ClientId,
    outbound: mpsc::Receiver<ServerFrame>,
}

struct Session {
    conn: ConnectionId,
    state: Arc<AppState>,
    subject: TicketSubject,
    current: Option<Membership>,
}

enum Outbound {
    Frame(ServerFrame),
    /// The room dropped this connection.
    Dropped(RoomKey),
}

async fn next_outbound(current: &mut Option<Membership>) -> Outbound {
    match current {
        Some(membership) => match membership.outbound.recv().await {
            Some(frame) => Outbound::Frame(frame),
            None => Outbound::Dropped(membership.key),
        },
        None => std::future::pending().await,
    }
}

async fn send_frame(sink: &mut Sink, frame: &ServerFrame) -> Result<(), AppError> {
    let json = frame.to_json()?;
    sink.send(Message::Text(json.into()))
        .await
        .map_err(|e| AppError::Internal(format!("websocket send failed: {e}")))
}

/// Drive one websocket connection until it closes, times out or breaks the
/// protocol. The connection is always removed from its room on the way out.
pub async fn peer(ws: WebSocket, state: Arc<AppState>, subject: TicketSubject) {
    let conn = ConnectionId::next();
    info!(%conn, doc = %subject.document, user = %subject.user, "peer connected");

    let transport = state.config.transport.clone();
    let (mut sink, mut stream) = ws.split();
    let mut session = Session {
        conn,
        state,
        subject,
        current: None,
    };

    let mut heartbeat = tokio::time::interval_at(
        Instant::now() + transport.heartbeat_interval,
        transport.heartbeat_interval,
    );
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_seen = Instant::now();

    let reason = loop {
        select! {
            incoming = stream.next() => {
                let message = match incoming {
                    Some(Ok(message)) => message,
                    Some(Err(err)) => break format!("transport error: {err}"),
                    None => break "closed by client".to_string(),
                };
                last_seen = Instant::now();

                let frame = match message {
                    Message::Text(text) => ClientFrame::parse(text.as_str()),
                    Message::Binary(_) => Err(AppError::Protocol("binary frames are not supported".to_string())),
                    Message::Pong(_) | Message::Ping(_) => {
                        session.heartbeat().await;
                        continue;
                    }
                    Message::Close(_) => break "closed by client".to_string(),
                };

                let result = match frame {
                    Ok(frame) => session.handle(frame).await,
                    Err(err) => Err(err),
                };
                match result {
                    Ok(Some(reply)) => {
                        if let Err(err) = send_frame(&mut sink, &reply).await {
                            break err.to_string();
                        }
                    }
                    Ok(None) => {}
                    Err(err @ AppError::Protocol(_)) => {
                        warn!(%conn, error = %err, "protocol violation; closing connection");
                        let _ = send_frame(&mut sink, &ServerFrame::error(&err)).await;
                        break err.to_string();
                    }
                    Err(err) => {
                        debug!(%conn, error = %err, "request refused");
                        if let Err(err) = send_frame(&mut sink, &ServerFrame::error(&err)).await {
                            break err.to_string();
                        }
                    }
                }
            }
            outbound = next_outbound(&mut session.current) => match outbound {
                Outbound::Frame(frame) => {
                    session.observe(&frame);
                    if let Err(err) = send_frame(&mut sink, &frame).await {
                        break err.to_string();
                    }
                }
                Outbound::Dropped(room) => {
                    session.current = None;
                    break format!("dropped by room {room}");
                }
            },
            _ = heartbeat.tick() => {
                if last_seen.elapsed() > transport.liveness_timeout {
                    break "liveness timeout".to_string();
                }
                trace!(%conn, "sending heartbeat ping");
                if let Err(err) = sink.send(Message::Ping(Bytes::new())).await {
                    break format!("heartbeat failed: {err}");
                }
            }
        }
    };

    session.leave().await;
    let _ = sink.close().await;
    info!(%conn, reason = %reason, "peer disconnected");
}

impl Session {
    async fn handle(&mut self, frame: ClientFrame) -> Result<Option<ServerFrame>, AppError> {
        match frame {
            ClientFrame::SyncRequest { room } => {
                self.join(room).await?;
                Ok(None)
            }
            ClientFrame::OpSubmit { room, op } => {
                let op = decode_op(&op)?;
                self.membership(room)?.handle.submit(self.conn, op).await?;
                Ok(None)
            }
            ClientFrame::PresenceUpdate { room, presence } => {
                self.membership(room)?
                    .handle
                    .update_presence(self.conn, presence)
                    .await?;
                Ok(None)
            }
            ClientFrame::Ping => {
                self.heartbeat().await;
                Ok(Some(ServerFrame::Pong))
            }
        }
    }

    /// Join `room`, leaving the current room first. The actor queues
    /// `sync.full` on the new outbound channel.
    async fn join(&mut self, room: RoomKey) -> Result<(), AppError> {
        self.subject.permits(&room)?;
        let room = self.state.branches.switch(room.document, room.branch).await?;

        self.leave().await;

        let mut attempts = 0;
        loop {
            let handle = self.state.registry.get_or_create(room).await?;
            self.state
                .policy
                .admit(&self.subject.user, room, handle.member_count())
                .await?;

            let (tx, outbound) = mpsc::channel(self.state.config.transport.outbound_capacity);
            let client = ClientId::random();
            match handle
                .join(self.conn, client, self.subject.user.clone(), tx)
                .await
            {
                Ok(()) => {
                    debug!(conn = %self.conn, %room, %client, "joined room");
                    self.current = Some(Membership {
                        key: room,
                        handle,
                        client,
                        outbound,
                    });
                    return Ok(());
                }
                Err(AppError::RoomUnavailable(_)) if handle.is_closed() && attempts < 2 => {
                    attempts += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn leave(&mut self) {
        if let Some(membership) = self.current.take() {
            membership.handle.leave(self.conn).await;
            debug!(conn = %self.conn, room = %membership.key, client = %membership.client, "left room");
        }
    }

    async fn heartbeat(&self) {
        if let Some(membership) = &self.current {
            membership.handle.heartbeat(self.conn).await;
        }
    }

    fn membership(&self, room: RoomKey) -> Result<&Membership, AppError> {
        match &self.current {
            Some(membership) if membership.key == room => Ok(membership),
            _ => Err(AppError::InvalidInput(format!(
                "connection has not joined room {room}"
            ))),
        }
    }

    /// Track what the room tells the client about itself.
    fn observe(&mut self, frame: &ServerFrame) {
        match frame {
            ServerFrame::SyncFull { client_id, .. } => {
                if let Some(membership) = &mut self.current {
                    membership.client = *client_id;
                }
            }
            ServerFrame::RoomClosed { room, reason } => {
                debug!(conn = %self.conn, %room, %reason, "room closed");
                self.current = None;
            }
            _ => {}
        }
    }
}

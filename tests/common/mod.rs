#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tandem::app_state::AppState;
use tandem::config::Config;
use tandem::error::AppError;
use tandem::ids::{ClientId, DocumentId, RoomKey, UserId};
use tandem::model::{LocalOp, ModelError, Op, RejectedOp, TimelineDocument};
use tandem::persistence::{BlobStore, MemoryStore, SharedStore, StoreKey};
use tandem::session::{
    ClientFrame, PresenceInput, ServerFrame, TicketIssuer, decode_blob, decode_op, encode_op,
};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

#[derive(Debug, Error)]
pub enum TestError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("app: {0}")]
    App(#[from] AppError),
    #[error("model: {0}")]
    Model(#[from] ModelError),
    #[error("rejected: {0}")]
    Rejected(#[from] RejectedOp),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("unexpected frame: {0:?}")]
    UnexpectedFrame(Box<ServerFrame>),
    #[error("connection closed")]
    Closed,
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for TestError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        TestError::WebSocket(Box::new(err))
    }
}

pub type TestResult<T> = Result<T, TestError>;

pub type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const FRAME_TIMEOUT: Duration = Duration::from_secs(5);

/// Config with short timers so idle, save and presence paths run quickly.
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.registry.save_debounce = Duration::from_millis(20);
    config.registry.idle_timeout = Duration::from_millis(300);
    config.recorder.retry_initial_backoff = Duration::from_millis(5);
    config.recorder.retry_max_backoff = Duration::from_millis(20);
    config.recorder.max_retries = 3;
    config.recorder.degraded_retry_interval = Duration::from_millis(50);
    config
}

pub async fn spawn_test_server() -> TestResult<(SocketAddr, Arc<AppState>)> {
    spawn_test_server_with(Config::default(), Arc::new(MemoryStore::new())).await
}

pub async fn spawn_test_server_with(
    config: Config,
    store: SharedStore,
) -> TestResult<(SocketAddr, Arc<AppState>)> {
    init_test_tracing();

    let state = Arc::new(AppState::with_components(
        config,
        store,
        TicketIssuer::development(),
    ));
    let app = tandem::api::router(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            tracing::error!("axum server failed: {err}");
        }
    });

    Ok((addr, state))
}

pub fn new_doc_id() -> DocumentId {
    static NEXT: AtomicU64 = AtomicU64::new(1_000);
    DocumentId::from(NEXT.fetch_add(1, Ordering::Relaxed))
}

pub async fn connect(
    addr: SocketAddr,
    state: &AppState,
    doc: DocumentId,
    user: &str,
) -> TestResult<Socket> {
    let ticket = state.ticketing.issue(doc, &UserId::new(user))?;
    connect_with_ticket(addr, &ticket.token).await
}

pub async fn connect_with_ticket(addr: SocketAddr, ticket: &str) -> TestResult<Socket> {
    let url = format!("ws://{addr}/edit?ticket={ticket}");
    let (socket, _response) = connect_async(&url).await?;
    Ok(socket)
}

pub async fn send(socket: &mut Socket, frame: &ClientFrame) -> TestResult<()> {
    socket.send(Message::Text(frame.to_json()?.into())).await?;
    Ok(())
}

/// Next protocol frame, skipping transport pings.
pub async fn recv(socket: &mut Socket) -> TestResult<ServerFrame> {
    loop {
        let next = tokio::time::timeout(FRAME_TIMEOUT, socket.next())
            .await
            .map_err(|_| TestError::Timeout("server frame"))?;
        match next {
            Some(Ok(Message::Text(text))) => return Ok(ServerFrame::parse(text.as_str())?),
            Some(Ok(Message::Close(_))) | None => return Err(TestError::Closed),
            Some(Ok(_)) => continue,
            Some(Err(err)) => return Err(err.into()),
        }
    }
}

/// `true` once the server has closed the socket.
pub async fn closed(socket: &mut Socket) -> bool {
    loop {
        match tokio::time::timeout(FRAME_TIMEOUT, socket.next()).await {
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Ok(Some(Err(_))) => return true,
            Ok(Some(Ok(_))) => continue,
            Err(_) => return false,
        }
    }
}

/// One simulated editor: a socket plus a local replica kept in sync the way
/// a real client would.
pub struct Editor {
    pub socket: Socket,
    pub room: RoomKey,
    pub client: ClientId,
    pub doc: TimelineDocument,
}

impl Editor {
    pub async fn join(
        addr: SocketAddr,
        state: &AppState,
        room: RoomKey,
        user: &str,
    ) -> TestResult<Self> {
        let mut socket = connect(addr, state, room.document, user).await?;
        send(&mut socket, &ClientFrame::SyncRequest { room }).await?;
        let mut editor = Self {
            socket,
            room,
            client: ClientId(0),
            doc: TimelineDocument::new(ClientId(0)),
        };
        editor.expect_sync().await?;
        Ok(editor)
    }

    /// Wait for `sync.full` and rebuild the local replica from it.
    pub async fn expect_sync(&mut self) -> TestResult<()> {
        loop {
            match recv(&mut self.socket).await? {
                ServerFrame::SyncFull {
                    client_id, state, ..
                } => {
                    self.client = client_id;
                    self.doc = TimelineDocument::from_full(client_id, &decode_blob(&state)?)?;
                    return Ok(());
                }
                ServerFrame::OpApplied { op, .. } => self.doc.apply_remote(&decode_op(&op)?)?,
                ServerFrame::PresenceChanged { .. } | ServerFrame::PresenceLeft { .. } => {}
                other => return Err(TestError::UnexpectedFrame(Box::new(other))),
            }
        }
    }

    /// Apply locally and submit. Returns the stamped op.
    pub async fn edit(&mut self, local: LocalOp) -> TestResult<Op> {
        let op = self.doc.apply(local)?;
        self.submit(&op).await?;
        Ok(op)
    }

    pub async fn submit(&mut self, op: &Op) -> TestResult<()> {
        send(
            &mut self.socket,
            &ClientFrame::OpSubmit {
                room: self.room,
                op: encode_op(op)?,
            },
        )
        .await
    }

    pub async fn presence(&mut self, name: &str) -> TestResult<()> {
        send(
            &mut self.socket,
            &ClientFrame::PresenceUpdate {
                room: self.room,
                presence: PresenceInput {
                    display_name: name.to_string(),
                    color: "#3366ff".to_string(),
                    cursor: None,
                },
            },
        )
        .await
    }

    /// Apply the next `n` relayed ops to the local replica.
    pub async fn absorb(&mut self, n: usize) -> TestResult<()> {
        let mut seen = 0;
        while seen < n {
            match recv(&mut self.socket).await? {
                ServerFrame::OpApplied { op, .. } => {
                    self.doc.apply_remote(&decode_op(&op)?)?;
                    seen += 1;
                }
                ServerFrame::PresenceChanged { .. } | ServerFrame::PresenceLeft { .. } => {}
                other => return Err(TestError::UnexpectedFrame(Box::new(other))),
            }
        }
        Ok(())
    }

    /// Round trip through the server: once `pong` arrives, every earlier
    /// frame from this editor is queued in the room's mailbox.
    pub async fn barrier(&mut self) -> TestResult<()> {
        send(&mut self.socket, &ClientFrame::Ping).await?;
        loop {
            match recv(&mut self.socket).await? {
                ServerFrame::Pong => return Ok(()),
                ServerFrame::OpApplied { op, .. } => self.doc.apply_remote(&decode_op(&op)?)?,
                ServerFrame::PresenceChanged { .. } | ServerFrame::PresenceLeft { .. } => {}
                other => return Err(TestError::UnexpectedFrame(Box::new(other))),
            }
        }
    }

    pub async fn close(mut self) -> TestResult<()> {
        self.socket.close(None).await?;
        Ok(())
    }
}

/// Current server-side state of `room`.
pub async fn server_doc(state: &AppState, room: RoomKey) -> TestResult<TimelineDocument> {
    let blob = state.registry.get_or_create(room).await?.encode_full().await?;
    Ok(TimelineDocument::from_full(ClientId(0), &blob)?)
}

/// Memory store whose writes can be made to fail on demand.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    failing: AtomicBool,
    attempts: AtomicU64,
}

impl FlakyStore {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlobStore for FlakyStore {
    async fn save(&self, key: &StoreKey, blob: Vec<u8>) -> Result<(), AppError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::Store("injected write failure".to_string()));
        }
        self.inner.save(key, blob).await
    }

    async fn load(&self, key: &StoreKey) -> Result<Option<Vec<u8>>, AppError> {
        self.inner.load(key).await
    }

    async fn delete(&self, key: &StoreKey) -> Result<(), AppError> {
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<StoreKey>, AppError> {
        self.inner.list(prefix).await
    }
}

/// Initialize tracing for tests (only initializes once)
pub fn init_test_tracing() {
    use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_test_writer()
                .with_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
                ),
        )
        .try_init();
}

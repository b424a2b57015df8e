//! Write-behind persistence for one room.
//!
//! The room actor hands over full-state blobs; the recorder keeps only the
//! newest one, writes it, and retries with exponential backoff when the store
//! fails. Live collaboration never waits on it except for explicit flushes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::AppError;
use crate::ids::now_millis;
use crate::persistence::{SharedStore, StoreKey};

#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub retry_initial_backoff: Duration,
    pub retry_max_backoff: Duration,
    /// Failed attempts per round before durability is reported as degraded.
    pub max_retries: u32,
    pub degraded_retry_interval: Duration,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            retry_initial_backoff: Duration::from_millis(200),
            retry_max_backoff: Duration::from_secs(5),
            max_retries: 5,
            degraded_retry_interval: Duration::from_secs(15),
        }
    }
}

/// Durability status of one room, readable without going through the actor.
#[derive(Debug, Default)]
pub struct PersistenceHealth {
    degraded: AtomicBool,
    failures: AtomicU64,
    saves: AtomicU64,
    last_saved_at: AtomicI64,
}

impl PersistenceHealth {
    /// `true` once a retry round was exhausted and until the next save lands.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }

    pub fn saves(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn last_saved_at(&self) -> Option<i64> {
        match self.last_saved_at.load(Ordering::SeqCst) {
            0 => None,
            at => Some(at),
        }
    }
}

enum RecorderJob {
    Save(Vec<u8>),
    Flush {
        blob: Vec<u8>,
        ack: oneshot::Sender<Result<(), AppError>>,
    },
}

pub struct RecorderHandle {
    tx: mpsc::UnboundedSender<RecorderJob>,
    join: JoinHandle<()>,
    health: Arc<PersistenceHealth>,
}

impl RecorderHandle {
    /// Queue a blob; superseded by any newer blob not yet written.
    pub fn save(&self, blob: Vec<u8>) {
        if self.tx.send(RecorderJob::Save(blob)).is_err() {
            warn!("recorder stopped; dropping queued state");
        }
    }

    /// Queue a blob and return a receiver that resolves once it (or a newer
    /// blob) is durable, or with an error once a retry round is exhausted.
    pub fn flush(&self, blob: Vec<u8>) -> oneshot::Receiver<Result<(), AppError>> {
        let (ack, rx) = oneshot::channel();
        if let Err(mpsc::error::SendError(job)) = self.tx.send(RecorderJob::Flush { blob, ack })
            && let RecorderJob::Flush { ack, .. } = job
        {
            let _ = ack.send(Err(AppError::Store("recorder stopped".to_string())));
        }
        rx
    }

    pub async fn flush_and_wait(&self, blob: Vec<u8>) -> Result<(), AppError> {
        self.flush(blob)
            .await
            .map_err(|_| AppError::Store("recorder stopped before acknowledging".to_string()))?
    }

    pub fn health(&self) -> Arc<PersistenceHealth> {
        self.health.clone()
    }

    /// Stop accepting blobs and wait for the queue to drain.
    pub async fn shutdown(self) -> Result<(), AppError> {
        drop(self.tx);
        self.join
            .await
            .map_err(|e| AppError::Store(e.to_string()))
    }
}

pub fn spawn_recorder(
    key: StoreKey,
    store: SharedStore,
    config: RecorderConfig,
    health: Arc<PersistenceHealth>,
) -> RecorderHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let recorder = Recorder {
        backoff: config.retry_initial_backoff,
        key,
        store,
        config,
        health: health.clone(),
        rx,
        pending: None,
        waiters: Vec::new(),
        attempts: 0,
        closed: false,
    };
    let join = tokio::spawn(recorder.run());

    RecorderHandle { tx, join, health }
}

struct Recorder {
    key: StoreKey,
    store: SharedStore,
    config: RecorderConfig,
    health: Arc<PersistenceHealth>,
    rx: mpsc::UnboundedReceiver<RecorderJob>,
    pending: Option<Vec<u8>>,
    waiters: Vec<oneshot::Sender<Result<(), AppError>>>,
    attempts: u32,
    backoff: Duration,
    closed: bool,
}

impl Recorder {
    async fn run(mut self) {
        loop {
            if self.pending.is_none() {
                if self.closed {
                    break;
                }
                match self.rx.recv().await {
                    Some(job) => self.absorb(job),
                    None => break,
                }
            }
            while let Ok(job) = self.rx.try_recv() {
                self.absorb(job);
            }

            let Some(blob) = self.pending.take() else {
                continue;
            };

            match self.store.save(&self.key, blob.clone()).await {
                Ok(()) => self.on_saved(blob.len()),
                Err(err) => {
                    self.pending = Some(blob);
                    let wait = self.on_failure(&err);
                    if self.closed && self.attempts >= self.config.max_retries {
                        error!(key = %self.key, error = %err, "recorder closing with unsaved state");
                        break;
                    }
                    self.wait(wait).await;
                }
            }
        }
        debug!(key = %self.key, "recorder stopped");
    }

    fn absorb(&mut self, job: RecorderJob) {
        match job {
            RecorderJob::Save(blob) => self.pending = Some(blob),
            RecorderJob::Flush { blob, ack } => {
                self.pending = Some(blob);
                self.waiters.push(ack);
            }
        }
    }

    fn on_saved(&mut self, size: usize) {
        if self.health.degraded.swap(false, Ordering::SeqCst) {
            info!(key = %self.key, attempts = self.attempts, "persistence recovered; state durable again");
        }
        self.health.saves.fetch_add(1, Ordering::SeqCst);
        self.health.last_saved_at.store(now_millis(), Ordering::SeqCst);
        self.attempts = 0;
        self.backoff = self.config.retry_initial_backoff;
        for ack in self.waiters.drain(..) {
            let _ = ack.send(Ok(()));
        }
        debug!(key = %self.key, size, "room state persisted");
    }

    /// Record a failed write and return how long to wait before the next one.
    fn on_failure(&mut self, err: &AppError) -> Duration {
        self.attempts += 1;
        self.health.failures.fetch_add(1, Ordering::SeqCst);

        if self.attempts < self.config.max_retries {
            let wait = self.backoff;
            self.backoff = (self.backoff * 2).min(self.config.retry_max_backoff);
            warn!(key = %self.key, attempt = self.attempts, error = %err, backoff_ms = wait.as_millis() as u64, "persisting room state failed; retrying");
            return wait;
        }

        if !self.health.degraded.swap(true, Ordering::SeqCst) {
            error!(key = %self.key, attempts = self.attempts, error = %err, "sync not durable: retries exhausted, collaboration continues in memory");
        }
        for ack in self.waiters.drain(..) {
            let _ = ack.send(Err(AppError::Store(format!(
                "state for {} not durable: {err}",
                self.key
            ))));
        }
        self.config.degraded_retry_interval
    }

    /// Sleep, folding newer jobs into the pending blob meanwhile.
    async fn wait(&mut self, wait: Duration) {
        let sleep = tokio::time::sleep(wait);
        tokio::pin!(sleep);
        loop {
            select! {
                _ = &mut sleep => return,
                job = self.rx.recv(), if !self.closed => match job {
                    Some(job) => self.absorb(job),
                    None => self.closed = true,
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::ids::{DocumentId, RoomKey};
    use crate::persistence::{BlobStore, MemoryStore};

    type TestResult<T> = Result<T, AppError>;

    /// Fails the first `failures` saves, then delegates to memory.
    struct FlakyStore {
        remaining: AtomicU32,
        inner: MemoryStore,
    }

    #[async_trait]
    impl BlobStore for FlakyStore {
        async fn save(&self, key: &StoreKey, blob: Vec<u8>) -> Result<(), AppError> {
            if self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(AppError::Store("injected failure".to_string()));
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

    fn fast_config(max_retries: u32) -> RecorderConfig {
        RecorderConfig {
            retry_initial_backoff: Duration::from_millis(5),
            retry_max_backoff: Duration::from_millis(20),
            max_retries,
            degraded_retry_interval: Duration::from_millis(30),
        }
    }

    fn key() -> StoreKey {
        StoreKey::room(RoomKey::main(DocumentId::from(1_u64)))
    }

    #[tokio::test]
    async fn flush_lands_after_transient_failures() -> TestResult<()> {
        let store = Arc::new(FlakyStore {
            remaining: AtomicU32::new(3),
            inner: MemoryStore::default(),
        });
        let health = Arc::new(PersistenceHealth::default());
        let recorder = spawn_recorder(key(), store.clone(), fast_config(5), health.clone());

        recorder.save(vec![1]);
        recorder.flush_and_wait(vec![2]).await?;

        assert_eq!(store.load(&key()).await?, Some(vec![2]));
        assert_eq!(health.failures(), 3);
        assert!(!health.is_degraded());
        recorder.shutdown().await
    }

    #[tokio::test]
    async fn exhausted_round_degrades_then_recovers() -> TestResult<()> {
        let store = Arc::new(FlakyStore {
            remaining: AtomicU32::new(4),
            inner: MemoryStore::default(),
        });
        let health = Arc::new(PersistenceHealth::default());
        let recorder = spawn_recorder(key(), store.clone(), fast_config(2), health.clone());

        let first = recorder.flush_and_wait(vec![7]).await;
        assert!(matches!(first, Err(AppError::Store(_))));
        assert!(health.is_degraded());

        recorder.save(vec![8]);
        for _ in 0..100 {
            if !health.is_degraded() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!health.is_degraded());
        assert_eq!(store.load(&key()).await?, Some(vec![8]));
        recorder.shutdown().await
    }

    #[tokio::test]
    async fn shutdown_drains_latest_blob() -> TestResult<()> {
        let store = Arc::new(MemoryStore::default());
        let health = Arc::new(PersistenceHealth::default());
        let recorder = spawn_recorder(key(), store.clone(), fast_config(3), health.clone());

        for n in 0..10_u8 {
            recorder.save(vec![n]);
        }
        recorder.shutdown().await?;

        assert_eq!(store.load(&key()).await?, Some(vec![9]));
        assert!(health.saves() >= 1);
        Ok(())
    }
}

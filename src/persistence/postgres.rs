use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use tracing::{debug, instrument, trace};

use crate::config::DatabaseConfig;
use crate::error::AppError;

use super::store::BlobStore;
use super::types::StoreKey;

/// PostgreSQL-backed implementation of [`BlobStore`]: one `blobs` table keyed
/// by the store key.
pub struct PostgresStore {
    pool: Pool<Postgres>,
}

impl PostgresStore {
    pub async fn from_env() -> Result<Self, AppError> {
        let config = DatabaseConfig::from_env()?
            .ok_or_else(|| AppError::Store("DATABASE_URL is not set".to_string()))?;
        Self::connect(&config).await
    }

    pub async fn connect(config: &DatabaseConfig) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    sqlx::query("SET application_name = 'tandem'")
                        .execute(conn)
                        .await
                        .map(|_| ())
                })
            })
            .connect(&config.url)
            .await
            .map_err(|e| AppError::Store(format!("failed to connect to postgres: {e}")))?;

        Self::ensure_schema(&pool).await?;

        Ok(Self { pool })
    }

    async fn ensure_schema(pool: &Pool<Postgres>) -> Result<(), AppError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS blobs (
                key TEXT PRIMARY KEY,
                blob BYTEA NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            );
            "#,
        )
        .execute(pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(())
    }
}

#[async_trait]
impl BlobStore for PostgresStore {
    #[instrument(skip(self, blob), fields(key = %key, size = blob.len()))]
    async fn save(&self, key: &StoreKey, blob: Vec<u8>) -> Result<(), AppError> {
        trace!("Saving blob to postgres");
        sqlx::query(
            r#"
            INSERT INTO blobs (key, blob)
            VALUES ($1, $2)
            ON CONFLICT (key) DO UPDATE
            SET blob = EXCLUDED.blob,
                updated_at = now()
            "#,
        )
        .bind(key.as_str())
        .bind(blob)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        debug!("Blob saved");

        Ok(())
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn load(&self, key: &StoreKey) -> Result<Option<Vec<u8>>, AppError> {
        trace!("Loading blob from postgres");
        let blob: Option<Vec<u8>> = sqlx::query_scalar("SELECT blob FROM blobs WHERE key = $1")
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        if let Some(ref bytes) = blob {
            debug!(size = bytes.len(), "Blob found");
        } else {
            debug!("No blob found");
        }

        Ok(blob)
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn delete(&self, key: &StoreKey) -> Result<(), AppError> {
        trace!("Deleting blob from postgres");
        let result = sqlx::query("DELETE FROM blobs WHERE key = $1")
            .bind(key.as_str())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        debug!(removed = result.rows_affected(), "Blob deleted");

        Ok(())
    }

    #[instrument(skip(self))]
    async fn list(&self, prefix: &str) -> Result<Vec<StoreKey>, AppError> {
        trace!("Listing blobs from postgres");
        let keys: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT key
            FROM blobs
            WHERE left(key, length($1)) = $1
            ORDER BY key ASC
            "#,
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        debug!(count = keys.len(), "Blobs listed");

        Ok(keys.into_iter().map(StoreKey::from_raw).collect())
    }
}

fn map_sqlx_err(err: sqlx::Error) -> AppError {
    AppError::Store(format!("database error: {err}"))
}

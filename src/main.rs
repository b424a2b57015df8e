use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use tandem::api::router;
use tandem::app_state::AppState;
use tandem::config::Config;
use tandem::error::AppError;
use tandem::persistence::{MemoryStore, PostgresStore, SharedStore};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    setup_tracing();

    let config = Config::from_env()?;
    let store: SharedStore = match &config.database {
        Some(database) => Arc::new(PostgresStore::connect(database).await?),
        None => {
            info!("DATABASE_URL not set; using the in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let bind = config.bind;
    let state = Arc::new(AppState::new(config, store));
    let app = router(state.clone());

    let listener = TcpListener::bind(bind).await?;
    info!("listening on http://{bind} (websocket at ws://{bind}/edit?ticket=...)");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("flushing live rooms");
    state.registry.shutdown().await;
    Ok(())
}

fn setup_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,axum::rejection=trace".into()),
        )
        .init();
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

//! Process configuration, read from the environment once at startup.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::error::AppError;
use crate::persistence::RecorderConfig;
use crate::room::{PresenceConfig, RegistryConfig};
use crate::session::TransportConfig;

const DEFAULT_BIND: &str = "0.0.0.0:3000";

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: SocketAddr,
    /// `None` selects the in-memory store.
    pub database: Option<DatabaseConfig>,
    pub registry: RegistryConfig,
    pub recorder: RecorderConfig,
    pub presence: PresenceConfig,
    pub transport: TransportConfig,
    pub max_collaborators: usize,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 3000)),
            database: None,
            registry: RegistryConfig::default(),
            recorder: RecorderConfig::default(),
            presence: PresenceConfig::default(),
            transport: TransportConfig::default(),
            max_collaborators: 32,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let defaults = Self::default();

        let bind = std::env::var("TANDEM_BIND").unwrap_or_else(|_| DEFAULT_BIND.to_string());
        let bind: SocketAddr = bind.parse()?;

        let mut registry = defaults.registry;
        registry.max_rooms = env_or("TANDEM_MAX_ROOMS", registry.max_rooms);
        registry.idle_timeout = Duration::from_secs(env_or(
            "TANDEM_IDLE_TIMEOUT_SECS",
            registry.idle_timeout.as_secs(),
        ));
        registry.save_debounce = Duration::from_millis(env_or(
            "TANDEM_SAVE_DEBOUNCE_MS",
            registry.save_debounce.as_millis() as u64,
        ));

        Ok(Self {
            bind,
            database: DatabaseConfig::from_env()?,
            registry,
            max_collaborators: env_or("TANDEM_MAX_COLLABORATORS", defaults.max_collaborators),
            ..defaults
        })
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Option<Self>, AppError> {
        let url = match std::env::var("DATABASE_URL") {
            Ok(url) => url,
            Err(std::env::VarError::NotPresent) => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        Ok(Some(Self {
            url,
            max_connections: env_or("DATABASE_MAX_CONNECTIONS", 10),
            min_connections: env_or("DATABASE_MIN_CONNECTIONS", 1),
        }))
    }
}

/// Parse `key`, keeping `default` when it is unset or malformed.
fn env_or<T: FromStr + Copy>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "ignoring malformed configuration value");
            default
        }),
        Err(_) => default,
    }
}

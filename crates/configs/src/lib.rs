//! # configs
//!
//! Layered settings: built-in defaults, then `config/default.toml`, then `config/{AGORA_ENV}.toml`,
//! then `AGORA__SECTION__KEY` environment variables (a `.env` file is honoured). Every file is
//! optional; the binary runs on defaults alone with the in-memory store.

use std::time::Duration;

use config::builder::DefaultState;
use config::{ConfigBuilder, Environment, File};
use secrecy::SecretString;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

pub const ENV_PREFIX: &str = "AGORA";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub database: DatabaseSettings,
    pub log: LogSettings,
    pub participants: ParticipantSettings,
    pub math: MathSettings,
    pub selection: SelectionSettings,
    pub moderation: ModerationSettings,
    pub notifications: NotificationSettings,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Public url of the web client, used in mail links.
    pub base_url: String,
    /// Sender address of every outgoing mail.
    pub mail_from: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            base_url: "http://localhost:8080".to_string(),
            mail_from: "notifications@localhost".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// Postgres url. Without one the server keeps everything in memory.
    pub url: Option<SecretString>,
    pub max_connections: u32,
    pub run_migrations: bool,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
            run_migrations: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// `EnvFilter` directive; `RUST_LOG` wins when set.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ParticipantSettings {
    pub cache_capacity: usize,
    pub join_retries: u32,
}

impl Default for ParticipantSettings {
    fn default() -> Self {
        Self {
            cache_capacity: 5000,
            join_retries: 9,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MathSettings {
    pub cache_capacity: usize,
    pub ttl_secs: u64,
    pub poll_interval_ms: u64,
    pub error_backoff_ms: u64,
    pub batch_size: i64,
    pub poller_enabled: bool,
}

impl Default for MathSettings {
    fn default() -> Self {
        Self {
            cache_capacity: 300,
            ttl_secs: 5,
            poll_interval_ms: 1000,
            error_backoff_ms: 5000,
            batch_size: 100,
            poller_enabled: true,
        }
    }
}

impl MathSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SelectionSettings {
    pub timeout_secs: u64,
}

impl Default for SelectionSettings {
    fn default() -> Self {
        Self { timeout_secs: 15 }
    }
}

impl SelectionSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ModerationSettings {
    pub extra_banned_words: Vec<String>,
    /// Other comments that must be waiting before moderators get mail.
    pub moderator_notify_min_backlog: u64,
    pub legacy_seed_vote_cutoff: i32,
}

impl Default for ModerationSettings {
    fn default() -> Self {
        Self {
            extra_banned_words: Vec::new(),
            moderator_notify_min_backlog: 1,
            legacy_seed_vote_cutoff: 17037,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct NotificationSettings {
    pub enabled: bool,
    pub poll_interval_ms: u64,
    pub error_backoff_ms: u64,
    /// Wait after the 1st, 2nd, ... unanswered mail.
    pub backoff_hours: Vec<u64>,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 2000,
            error_backoff_ms: 10_000,
            backoff_hours: vec![1, 4, 24, 48],
        }
    }
}

impl NotificationSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn backoff(&self) -> Vec<Duration> {
        self.backoff_hours
            .iter()
            .map(|h| Duration::from_secs(h.saturating_mul(3600)))
            .collect()
    }
}

impl Settings {
    /// Load from `./config` and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            debug!(path = %path.display(), "loaded .env");
        }
        let profile = std::env::var(format!("{ENV_PREFIX}_ENV")).unwrap_or_else(|_| "development".to_string());
        debug!(%profile, "loading settings");

        let builder = config::Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{profile}")).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("moderation.extra_banned_words")
                    .with_list_parse_key("notifications.backoff_hours"),
            );
        Self::build(builder)
    }

    fn build(builder: ConfigBuilder<DefaultState>) -> Result<Self, ConfigError> {
        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Invalid("server.port must not be 0".into()));
        }
        if self.math.batch_size <= 0 {
            return Err(ConfigError::Invalid("math.batch_size must be positive".into()));
        }
        if self.math.cache_capacity == 0 || self.participants.cache_capacity == 0 {
            return Err(ConfigError::Invalid("cache capacities must be positive".into()));
        }
        if self.selection.timeout_secs == 0 {
            return Err(ConfigError::Invalid("selection.timeout_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

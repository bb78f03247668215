use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Sleep between empty polls. Zero busy-polls.
    pub idle_sleep_ms: u64,
}

/// Limits for reading the upgrade request.
///
/// The handshake runs on the event loop thread, so a silent client blocks
/// every other socket for up to `max_read_retries * read_timeout_ms`.
#[derive(Debug, Deserialize, Clone)]
pub struct HandshakeConfig {
    pub read_budget: usize,
    pub max_read_retries: u32,
    pub read_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConnectionConfig {
    pub recv_buffer: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    pub level: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub environment: String,
    pub server: ServerConfig,
    pub handshake: HandshakeConfig,
    pub connection: ConnectionConfig,
    pub log: LogConfig,
}

impl HandshakeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("handshake.read_budget", self.read_budget as u64)?;
        require_positive("handshake.max_read_retries", self.max_read_retries as u64)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        if self.read_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.read_timeout_ms))
        }
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            read_budget: 5000,
            max_read_retries: 3,
            read_timeout_ms: 500,
        }
    }
}

impl ConnectionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("connection.recv_buffer", self.recv_buffer as u64)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self { recv_buffer: 2048 }
    }
}

fn require_positive(key: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Message(format!("{} must be greater than zero", key)));
    }
    Ok(())
}

fn with_defaults(
    builder: config::ConfigBuilder<config::builder::DefaultState>,
    environment: &str,
) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
    builder
        .set_default("environment", environment)?
        .set_default("server.host", "127.0.0.1")?
        .set_default("server.port", 8080)?
        .set_default("server.idle_sleep_ms", 1)?
        .set_default("handshake.read_budget", 5000)?
        .set_default("handshake.max_read_retries", 3)?
        .set_default("handshake.read_timeout_ms", 500)?
        .set_default("connection.recv_buffer", 2048)?
        .set_default("log.level", "info")
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = with_defaults(Config::builder(), "development")?
            // Add in settings from the config file if it exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // E.g., `APP_SERVER__PORT=5001` would set `Settings.server.port`
            .add_source(
                Environment::with_prefix("app")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Self = s.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.handshake.validate()?;
        self.connection.validate()
    }

    #[cfg(test)]
    pub fn new_for_test() -> Result<Self, ConfigError> {
        with_defaults(Config::builder(), "test")?
            .set_override("server.port", 0)?
            .set_override("server.idle_sleep_ms", 0)?
            .build()?
            .try_deserialize()
    }
}

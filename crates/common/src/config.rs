//! Application configuration.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Database configuration.
    pub database: DatabaseConfig,
    /// Outgoing email configuration.
    pub email: EmailConfig,
    /// Queue processor configuration.
    #[serde(default)]
    pub processor: ProcessorConfig,
    /// Retry policy configuration.
    #[serde(default)]
    pub retry: RetrySettings,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind to.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Database connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// `PostgreSQL` connection URL.
    pub url: String,
    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool.
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

/// Which provider transmits the rendered mail.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Log the message instead of sending it.
    #[default]
    Log,
    /// SMTP relay.
    Smtp,
    /// `SendGrid` HTTP API.
    SendGrid,
}

/// Outgoing email configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EmailConfig {
    /// Provider used to transmit mail.
    #[serde(default)]
    pub provider: ProviderKind,
    /// From address.
    pub from_address: String,
    /// From name.
    #[serde(default = "default_from_name")]
    pub from_name: String,
    /// Reply-to address.
    #[serde(default)]
    pub reply_to: Option<String>,
    /// Instance name (for templates).
    #[serde(default = "default_from_name")]
    pub instance_name: String,
    /// Instance URL (for templates).
    pub instance_url: String,
    /// SMTP settings, required when `provider = "smtp"`.
    #[serde(default)]
    pub smtp: Option<SmtpSettings>,
    /// `SendGrid` settings, required when `provider = "sendgrid"`.
    #[serde(default)]
    pub sendgrid: Option<SendGridSettings>,
}

/// SMTP relay settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SmtpSettings {
    /// SMTP host.
    pub host: String,
    /// SMTP port.
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    /// Use implicit TLS instead of STARTTLS.
    #[serde(default)]
    pub implicit_tls: bool,
    /// Username.
    #[serde(default)]
    pub username: Option<String>,
    /// Password.
    #[serde(default)]
    pub password: Option<String>,
    /// Per-command timeout in seconds.
    #[serde(default = "default_smtp_timeout_secs")]
    pub timeout_secs: u64,
}

/// `SendGrid` settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SendGridSettings {
    /// API key.
    pub api_key: String,
    /// API base URL, overridable for sandboxes.
    #[serde(default = "default_sendgrid_url")]
    pub base_url: String,
}

/// Queue processor configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessorConfig {
    /// Start the processor when the server boots.
    #[serde(default = "default_true")]
    pub autostart: bool,
    /// Interval between ticks in milliseconds.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Maximum jobs claimed per tick.
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    /// Interval between supervisor health checks in milliseconds.
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    /// Heartbeat age, in tick intervals, after which the loop counts as stalled.
    #[serde(default = "default_stall_multiplier")]
    pub stall_multiplier: u32,
    /// Seconds a job may stay claimed before it is returned to the queue.
    #[serde(default = "default_stale_claim_timeout_secs")]
    pub stale_claim_timeout_secs: u64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            autostart: true,
            tick_interval_ms: default_tick_interval_ms(),
            batch_size: default_batch_size(),
            health_check_interval_ms: default_health_check_interval_ms(),
            stall_multiplier: default_stall_multiplier(),
            stale_claim_timeout_secs: default_stale_claim_timeout_secs(),
        }
    }
}

impl ProcessorConfig {
    /// Interval between ticks.
    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Interval between health checks, never shorter than the tick interval.
    #[must_use]
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms).max(self.tick_interval())
    }

    /// Heartbeat age after which the loop is restarted.
    #[must_use]
    pub fn stall_threshold(&self) -> Duration {
        self.tick_interval() * self.stall_multiplier.max(1)
    }

    /// Claim age after which a `processing` job is returned to `pending`.
    #[must_use]
    pub const fn stale_claim_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_claim_timeout_secs)
    }
}

/// Retry policy configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
    /// Attempts a job gets unless the producer overrides it.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry in seconds.
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
    /// Upper bound for any retry delay in seconds.
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
    /// Growth factor between consecutive delays.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
            multiplier: default_multiplier(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON log lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

const fn default_port() -> u16 {
    3000
}

const fn default_max_connections() -> u32 {
    20
}

const fn default_min_connections() -> u32 {
    2
}

fn default_from_name() -> String {
    "Postbox".to_string()
}

const fn default_smtp_port() -> u16 {
    587
}

const fn default_smtp_timeout_secs() -> u64 {
    30
}

fn default_sendgrid_url() -> String {
    "https://api.sendgrid.com".to_string()
}

const fn default_true() -> bool {
    true
}

const fn default_tick_interval_ms() -> u64 {
    10_000
}

const fn default_batch_size() -> u64 {
    10
}

const fn default_health_check_interval_ms() -> u64 {
    30_000
}

const fn default_stall_multiplier() -> u32 {
    3
}

const fn default_stale_claim_timeout_secs() -> u64 {
    300
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_base_delay_secs() -> u64 {
    60
}

const fn default_max_delay_secs() -> u64 {
    3600 * 6
}

const fn default_multiplier() -> f64 {
    2.0
}

impl Config {
    /// Load configuration from files and environment variables.
    ///
    /// Configuration is loaded in the following order:
    /// 1. `.env` (if present)
    /// 2. `config/default.toml`
    /// 3. `config/{environment}.toml` (based on `POSTBOX_ENV`)
    /// 4. Environment variables with `POSTBOX_` prefix
    pub fn load() -> Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();
        let env = std::env::var("POSTBOX_ENV").unwrap_or_else(|_| "development".to_string());

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{env}")).required(false))
            .add_source(
                config::Environment::with_prefix("POSTBOX")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load configuration from a specific file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("POSTBOX")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}

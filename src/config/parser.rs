use std::path::Path;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use super::ConfigError;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub msteams: MsTeamsConfig,
    pub host: HostConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub connected_users: ConnectedUsersConfig,
    #[serde(default)]
    pub activity: ActivityConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Public URL of this deployment. Webhook subscriptions point here.
    pub base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MsTeamsConfig {
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default = "empty_secret")]
    pub client_secret: SecretString,
    #[serde(default = "empty_secret")]
    pub encryption_key: SecretString,
    #[serde(default = "empty_secret")]
    pub webhook_secret: SecretString,
    #[serde(default)]
    pub evaluation_api: bool,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostConfig {
    pub url: String,
    #[serde(default = "empty_secret")]
    pub bot_token: SecretString,
    pub bot_user_id: String,
    #[serde(default = "default_bot_username")]
    pub bot_username: String,
    #[serde(default = "default_plugin_id")]
    pub plugin_id: String,
    #[serde(default = "default_max_file_size")]
    pub max_file_size: i64,
    #[serde(default = "default_max_image_resolution")]
    pub max_image_resolution: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub sync_linked_channels: bool,
    #[serde(default)]
    pub sync_direct_messages: bool,
    #[serde(default = "default_true")]
    pub sync_chats: bool,
    #[serde(default)]
    pub enabled_teams: Vec<String>,
    #[serde(default)]
    pub automatically_promote_synthetic_users: bool,
    #[serde(default = "default_max_size_for_complete_download_mib")]
    pub max_size_for_complete_download_mib: i64,
    #[serde(default = "default_buffer_size_for_streaming_mib")]
    pub buffer_size_for_streaming_mib: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_linked_channels: false,
            sync_direct_messages: false,
            sync_chats: true,
            enabled_teams: Vec::new(),
            automatically_promote_synthetic_users: false,
            max_size_for_complete_download_mib: default_max_size_for_complete_download_mib(),
            buffer_size_for_streaming_mib: default_buffer_size_for_streaming_mib(),
        }
    }
}

impl SyncConfig {
    /// An empty allowlist means every team may link channels.
    pub fn is_team_enabled(&self, team_id: &str) -> bool {
        self.enabled_teams.is_empty() || self.enabled_teams.iter().any(|t| t == team_id)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ConnectedUsersConfig {
    #[serde(default)]
    pub allowed: i64,
    #[serde(default)]
    pub max_pending_invites: i64,
    #[serde(default)]
    pub restricted: bool,
    #[serde(default)]
    pub invite_days_until_unresponsive: i64,
    #[serde(default)]
    pub invite_timespan_days: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActivityConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_size: default_queue_size(),
            flush_interval_secs: default_flush_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_monitor_interval_secs")]
    pub interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_monitor_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub max_connections: Option<u32>,
    #[serde(default)]
    pub min_connections: Option<u32>,
}

impl DatabaseConfig {
    pub fn db_type(&self) -> DbType {
        if self.connection_string().starts_with("sqlite://") {
            DbType::Sqlite
        } else {
            DbType::Postgres
        }
    }

    pub fn connection_string(&self) -> String {
        if let Some(ref url) = self.url {
            url.clone()
        } else if let Some(ref file) = self.filename {
            format!("sqlite://{}", file)
        } else {
            String::new()
        }
    }

    pub fn sqlite_path(&self) -> Option<String> {
        if let DbType::Sqlite = self.db_type() {
            let url = self.connection_string();
            Some(url.strip_prefix("sqlite://").unwrap_or(&url).to_string())
        } else {
            None
        }
    }

    pub fn max_connections(&self) -> Option<u32> {
        match self.db_type() {
            DbType::Postgres => self.max_connections,
            DbType::Sqlite => Some(1),
        }
    }

    pub fn min_connections(&self) -> Option<u32> {
        match self.db_type() {
            DbType::Postgres => self.min_connections,
            DbType::Sqlite => Some(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbType {
    Postgres,
    Sqlite,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
    #[serde(default = "default_metrics_bind_address")]
    pub bind_address: String,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.yaml".to_string());

        Self::load_from_file(&config_path)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(&path)?;
        Self::load_from_str(&content)
    }

    pub fn load_from_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = serde_yaml::from_str(content)?;
        config.apply_env_overrides();
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("msteams.tenant_id", self.msteams.tenant_id.as_str()),
            ("msteams.client_id", self.msteams.client_id.as_str()),
            (
                "msteams.client_secret",
                self.msteams.client_secret.expose_secret(),
            ),
            (
                "msteams.encryption_key",
                self.msteams.encryption_key.expose_secret(),
            ),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingSetting(name));
            }
        }

        match url::Url::parse(&self.server.base_url) {
            Ok(parsed) if parsed.scheme() == "http" || parsed.scheme() == "https" => {}
            _ => {
                return Err(ConfigError::InvalidConfig(
                    "server.base_url must be an absolute http(s) URL".to_string(),
                ));
            }
        }

        if self.host.bot_user_id.is_empty() {
            return Err(ConfigError::MissingSetting("host.bot_user_id"));
        }

        if self.database.connection_string().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "database connection string cannot be empty".to_string(),
            ));
        }

        if self.activity.workers == 0 || self.activity.queue_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "activity.workers and activity.queue_size must be positive".to_string(),
            ));
        }

        if self.server.port == 0 {
            return Err(ConfigError::InvalidConfig(
                "server.port must be between 1 and 65535".to_string(),
            ));
        }

        Ok(())
    }

    /// Base URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        self.server.base_url.trim_end_matches('/')
    }

    pub fn webhook_secret(&self) -> &str {
        self.msteams.webhook_secret.expose_secret()
    }

    pub fn bot_user_id(&self) -> &str {
        &self.host.bot_user_id
    }

    pub fn preference_category(&self) -> String {
        format!("pp_{}", self.host.plugin_id)
    }

    fn normalize(&mut self) {
        self.server.base_url = self.server.base_url.trim().to_string();
        self.host.url = self.host.url.trim_end_matches('/').to_string();
        self.msteams.tenant_id = self.msteams.tenant_id.trim().to_string();
        self.msteams.client_id = self.msteams.client_id.trim().to_string();
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("MSTEAMS_SYNC_TENANT_ID") {
            self.msteams.tenant_id = value;
        }
        if let Ok(value) = std::env::var("MSTEAMS_SYNC_CLIENT_ID") {
            self.msteams.client_id = value;
        }
        if let Ok(value) = std::env::var("MSTEAMS_SYNC_CLIENT_SECRET") {
            self.msteams.client_secret = SecretString::from(value);
        }
        if let Ok(value) = std::env::var("MSTEAMS_SYNC_ENCRYPTION_KEY") {
            self.msteams.encryption_key = SecretString::from(value);
        }
        if let Ok(value) = std::env::var("MSTEAMS_SYNC_WEBHOOK_SECRET") {
            self.msteams.webhook_secret = SecretString::from(value);
        }
        if let Ok(value) = std::env::var("MSTEAMS_SYNC_DATABASE_URL") {
            self.database.url = Some(value);
        }
        if let Ok(value) = std::env::var("MSTEAMS_SYNC_HOST_TOKEN") {
            self.host.bot_token = SecretString::from(value);
        }
    }
}

fn empty_secret() -> SecretString {
    SecretString::from(String::new())
}

fn default_true() -> bool {
    true
}

fn default_port() -> u16 {
    8065
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_bot_username() -> String {
    "msteams".to_string()
}

fn default_plugin_id() -> String {
    "com.mattermost.msteams-sync".to_string()
}

fn default_max_file_size() -> i64 {
    100 * 1024 * 1024
}

fn default_max_image_resolution() -> i64 {
    7680 * 4320
}

fn default_max_size_for_complete_download_mib() -> i64 {
    20
}

fn default_buffer_size_for_streaming_mib() -> i64 {
    20
}

fn default_workers() -> usize {
    50
}

fn default_queue_size() -> usize {
    5000
}

fn default_flush_interval_secs() -> u64 {
    300
}

fn default_monitor_interval_secs() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_metrics_port() -> u16 {
    9001
}

fn default_metrics_bind_address() -> String {
    "127.0.0.1".to_string()
}

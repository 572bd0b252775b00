pub use self::parser::{
    ActivityConfig, Config, ConnectedUsersConfig, DatabaseConfig, DbType, HostConfig,
    LoggingConfig, MetricsConfig, MonitorConfig, MsTeamsConfig, ServerConfig, SyncConfig,
};
pub use self::validator::ConfigError;

mod parser;
mod validator;

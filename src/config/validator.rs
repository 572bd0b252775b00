use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unable to read the configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("unable to parse the configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("{0} is required")]
    MissingSetting(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

use crate::config::{
    ArchiveConfig, Cli, LoggingConfig, QueueConfig, RulesConfig, StorageConfig,
};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("archive id must not be empty")]
    InvalidArchiveId,

    #[error("partition must not be empty")]
    InvalidPartition,

    #[error("group window must be at least one minute")]
    InvalidGroupWindow,

    #[error("at least one filesystem must be configured")]
    NoFilesystems,

    #[error("filesystem '{0}' is misconfigured")]
    InvalidFilesystem(String),

    #[error("filesystem key '{0}' is configured twice")]
    DuplicateFilesystemKey(String),

    #[error("filesystem '{0}' has inconsistent watermarks")]
    InvalidWatermarks(String),

    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Deserialize, Default)]
pub struct Config {
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub rules: RulesConfig,
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the configuration named on the command line, exiting with a
    /// readable message if it cannot be read or fails validation.
    pub fn from_args() -> Self {
        let cli = Cli::from_env();
        match Self::from_file(&cli.config_path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("cannot load config '{}': {}", cli.config_path, e);
                std::process::exit(2);
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.archive.validate()?;
        self.storage.validate()?;
        Ok(())
    }
}

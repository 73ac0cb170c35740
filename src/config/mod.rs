mod archive_config;
mod logging_config;
mod storage_config;
pub mod config;

pub use archive_config::ArchiveConfig;
pub use config::{Config, ConfigError};
pub use logging_config::LoggingConfig;
pub use storage_config::{
    AutoDisposition, DuplicatePolicy, FilesystemConfig, QueueConfig, ReconcileConfig, RulesConfig,
    StorageConfig,
};

/// Structure representing application startup arguments or metadata.
#[derive(Debug)]
pub struct Cli {
    /// Path to the configuration file.
    pub config_path: String,
}

impl Cli {
    /// Creates a new `Cli` instance with the provided configuration path.
    ///
    /// # Arguments
    /// - `config_path`: The path to the configuration file.
    pub fn new(config_path: String) -> Self {
        Self { config_path }
    }

    /// Resolve the configuration path from the command line, falling back to
    /// the `STRATA_CONFIG` environment variable and then to `strata.toml`.
    pub fn from_env() -> Self {
        let config_path = std::env::args()
            .nth(1)
            .or_else(|| std::env::var("STRATA_CONFIG").ok())
            .unwrap_or_else(|| "strata.toml".to_string());
        Self::new(config_path)
    }
}

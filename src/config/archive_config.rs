use crate::config::ConfigError;
use serde::Deserialize;

fn default_group_window() -> u32 {
    15
}

#[derive(Debug, Deserialize, Default)]
pub struct ArchiveConfig {
    pub id: String,
    /// Server partition this archive instance owns.
    pub partition: String,
    /// Directory swept for incoming Part-10 files.
    pub incoming_dir: String,
    /// Path of the embedded state database.
    pub database_path: String,
    /// Width of the arrival-time bucket used to group out-of-order files.
    #[serde(default = "default_group_window")]
    pub group_window_minutes: u32,
}

impl ArchiveConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::InvalidArchiveId);
        }
        if self.partition.trim().is_empty() {
            return Err(ConfigError::InvalidPartition);
        }
        if self.group_window_minutes == 0 {
            return Err(ConfigError::InvalidGroupWindow);
        }
        Ok(())
    }
}

use crate::config::FilesystemConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Snapshot of one storage filesystem, as seen by the selector. Usage
/// numbers are refreshed by the background monitor; the selection hot path
/// only ever reads these values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesystemState {
    pub key: String,
    pub root: PathBuf,
    pub tier: u32,
    pub writable: bool,
    pub capacity_bytes: u64,
    pub high_watermark_pct: u8,
    pub low_watermark_pct: u8,
    pub used_bytes: u64,
}

impl FilesystemState {
    pub fn from_config(config: &FilesystemConfig) -> Self {
        Self {
            key: config.key.clone(),
            root: PathBuf::from(&config.root),
            tier: config.tier,
            writable: config.writable,
            capacity_bytes: config.capacity_bytes,
            high_watermark_pct: config.high_watermark_pct,
            low_watermark_pct: config.low_watermark_pct,
            used_bytes: 0,
        }
    }

    /// Usage level at which the filesystem stops accepting new studies.
    pub fn highwater_bytes(&self) -> u64 {
        self.capacity_bytes / 100 * u64::from(self.high_watermark_pct)
    }

    /// Headroom left before the high watermark. Negative once exceeded.
    pub fn highwater_margin_bytes(&self) -> i64 {
        self.highwater_bytes() as i64 - self.used_bytes as i64
    }

    pub fn above_high_watermark(&self) -> bool {
        self.used_bytes >= self.highwater_bytes()
    }

    /// Whether the filesystem is a candidate destination for a new study.
    pub fn accepting(&self) -> bool {
        self.writable && !self.above_high_watermark()
    }
}

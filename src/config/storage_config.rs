use crate::config::ConfigError;
use serde::Deserialize;
use std::collections::HashSet;

fn default_writable() -> bool {
    true
}

fn default_high_watermark() -> u8 {
    90
}

fn default_low_watermark() -> u8 {
    80
}

fn default_compare_tags() -> Vec<String> {
    vec![
        "PatientID".to_string(),
        "PatientBirthDate".to_string(),
        "AccessionNumber".to_string(),
    ]
}

/// One configured storage filesystem.
#[derive(Debug, Clone, Deserialize)]
pub struct FilesystemConfig {
    pub key: String,
    pub root: String,
    /// Storage class rank; lower tiers are preferred for new studies.
    pub tier: u32,
    #[serde(default = "default_writable")]
    pub writable: bool,
    pub capacity_bytes: u64,
    #[serde(default = "default_high_watermark")]
    pub high_watermark_pct: u8,
    #[serde(default = "default_low_watermark")]
    pub low_watermark_pct: u8,
}

/// What to do with an incoming instance that is byte-identical to one
/// already stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DuplicatePolicy {
    /// Acknowledge and drop the incoming copy.
    #[default]
    Discard,
    /// Park the incoming copy in the duplicates area for operator review.
    Quarantine,
}

/// Automatic disposition applied to a freshly captured conflict. When unset,
/// conflicts wait for an operator decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AutoDisposition {
    ProcessAsIs,
    CreateNew,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconcileConfig {
    /// DICOM keywords compared between an incoming instance and the study's
    /// canonical attributes. Patient name is always checked and is the only
    /// attribute eligible for in-place auto-correction.
    #[serde(default = "default_compare_tags")]
    pub compare_tags: Vec<String>,
    #[serde(default)]
    pub auto_disposition: Option<AutoDisposition>,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            compare_tags: default_compare_tags(),
            auto_disposition: None,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct StorageConfig {
    pub filesystems: Vec<FilesystemConfig>,
    #[serde(default)]
    pub duplicate_policy: DuplicatePolicy,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
}

impl StorageConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.filesystems.is_empty() {
            return Err(ConfigError::NoFilesystems);
        }
        let mut keys = HashSet::new();
        for fs in &self.filesystems {
            if fs.key.trim().is_empty() || fs.root.trim().is_empty() {
                return Err(ConfigError::InvalidFilesystem(fs.key.clone()));
            }
            if !keys.insert(fs.key.as_str()) {
                return Err(ConfigError::DuplicateFilesystemKey(fs.key.clone()));
            }
            if fs.capacity_bytes == 0 {
                return Err(ConfigError::InvalidFilesystem(fs.key.clone()));
            }
            if fs.high_watermark_pct > 100 || fs.low_watermark_pct >= fs.high_watermark_pct {
                return Err(ConfigError::InvalidWatermarks(fs.key.clone()));
            }
        }
        Ok(())
    }
}

fn default_poll_interval() -> u64 {
    5
}

fn default_batch_size() -> usize {
    10
}

fn default_lease_secs() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    60
}

/// Work-queue consumption settings (polling/lease model).
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// A claimed item becomes visible for retry once its lease expires.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            batch_size: default_batch_size(),
            lease_secs: default_lease_secs(),
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay(),
        }
    }
}

/// Rule-document settings.
#[derive(Debug, Deserialize, Default)]
pub struct RulesConfig {
    /// Directory of TOML rule documents, one rule per file.
    #[serde(default)]
    pub rules_dir: Option<String>,
    /// Devices auto-route actions may reference. An action naming any other
    /// device is logged and skipped.
    #[serde(default)]
    pub known_devices: Vec<String>,
    /// Authority groups grant-access actions may reference.
    #[serde(default)]
    pub known_groups: Vec<String>,
}

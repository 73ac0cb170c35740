//! Per-study header index.
//!
//! Every study folder carries a `study_index.json` summarising the key
//! attributes of each instance stored under it (UID, transfer syntax, size,
//! content digest), so duplicate and conflict checks never have to re-read
//! the DICOM files themselves. The index mirrors the folder contents: one
//! entry per physical file, added only after the file write is durable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use thiserror::Error;

/// File name of the serialized index inside a study folder.
pub const INDEX_FILE_NAME: &str = "study_index.json";

/// Result type alias for index operations
pub type Result<T> = std::result::Result<T, IndexError>;

/// Error types that can occur while reading or mutating a study index
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("index I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("index serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("instance {0} already present in index")]
    DuplicateInstance(String),

    #[error("instance {0} not present in index")]
    UnknownInstance(String),
}

/// Canonical study-level attributes, captured from the first accepted
/// instance. These are what incoming instances are compared against.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudyAttributes {
    pub patient_name: Option<String>,
    pub patient_id: Option<String>,
    pub patient_birth_date: Option<String>,
    pub accession_number: Option<String>,
    pub study_date: Option<String>,
    pub study_description: Option<String>,
}

impl StudyAttributes {
    pub fn is_empty(&self) -> bool {
        self.patient_name.is_none()
            && self.patient_id.is_none()
            && self.patient_birth_date.is_none()
            && self.accession_number.is_none()
            && self.study_date.is_none()
            && self.study_description.is_none()
    }

    /// Look up an attribute by its DICOM keyword.
    pub fn get(&self, keyword: &str) -> Option<&str> {
        let v = match keyword {
            "PatientName" => &self.patient_name,
            "PatientID" => &self.patient_id,
            "PatientBirthDate" | "PatientsBirthDate" => &self.patient_birth_date,
            "AccessionNumber" => &self.accession_number,
            "StudyDate" => &self.study_date,
            "StudyDescription" => &self.study_description,
            _ => &None,
        };
        v.as_deref()
    }
}

/// Index entry for a single SOP instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceEntry {
    pub sop_instance_uid: String,
    pub sop_class_uid: String,
    pub transfer_syntax_uid: String,
    pub file_size: u64,
    /// blake3 digest (hex) of the file as written.
    pub content_digest: String,
    pub received_at: DateTime<Utc>,
}

/// All instances of one series, keyed by SOP Instance UID.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeriesNode {
    pub instances: BTreeMap<String, InstanceEntry>,
}

/// The header index of a single study.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudyIndex {
    pub study_instance_uid: String,
    pub attributes: StudyAttributes,
    /// Series keyed by Series Instance UID.
    pub series: BTreeMap<String, SeriesNode>,
}

impl StudyIndex {
    pub fn new(study_instance_uid: impl Into<String>) -> Self {
        Self {
            study_instance_uid: study_instance_uid.into(),
            attributes: StudyAttributes::default(),
            series: BTreeMap::new(),
        }
    }

    /// Load the index from `dir`, or start a fresh one if no index file
    /// exists there yet.
    pub fn load_or_new(dir: &Path, study_instance_uid: &str) -> Result<Self> {
        let path = dir.join(INDEX_FILE_NAME);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::new(study_instance_uid))
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Save the index into `dir` via a temp file and atomic rename, so a
    /// crash mid-write never leaves a truncated index behind.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let path = dir.join(INDEX_FILE_NAME);
        let tmp = dir.join(format!("{}.tmp", INDEX_FILE_NAME));
        let data = serde_json::to_string_pretty(self)?;
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(data.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn instance_count(&self) -> usize {
        self.series.values().map(|s| s.instances.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.instance_count() == 0
    }

    /// Find an instance entry anywhere in the study, returning the owning
    /// series UID alongside it.
    pub fn find_instance(&self, sop_instance_uid: &str) -> Option<(&str, &InstanceEntry)> {
        for (series_uid, node) in &self.series {
            if let Some(entry) = node.instances.get(sop_instance_uid) {
                return Some((series_uid.as_str(), entry));
            }
        }
        None
    }

    pub fn contains(&self, sop_instance_uid: &str) -> bool {
        self.find_instance(sop_instance_uid).is_some()
    }

    /// Add an entry under the given series. Rejects a second entry for the
    /// same SOP Instance UID anywhere in the study.
    pub fn add_instance(&mut self, series_instance_uid: &str, entry: InstanceEntry) -> Result<()> {
        if self.contains(&entry.sop_instance_uid) {
            return Err(IndexError::DuplicateInstance(entry.sop_instance_uid));
        }
        self.series
            .entry(series_instance_uid.to_string())
            .or_default()
            .instances
            .insert(entry.sop_instance_uid.clone(), entry);
        Ok(())
    }

    /// Remove an entry, dropping its series node if it becomes empty.
    pub fn remove_instance(&mut self, sop_instance_uid: &str) -> Result<InstanceEntry> {
        let series_uid = self
            .find_instance(sop_instance_uid)
            .map(|(s, _)| s.to_string())
            .ok_or_else(|| IndexError::UnknownInstance(sop_instance_uid.to_string()))?;
        let node = self
            .series
            .get_mut(&series_uid)
            .ok_or_else(|| IndexError::UnknownInstance(sop_instance_uid.to_string()))?;
        let entry = node
            .instances
            .remove(sop_instance_uid)
            .ok_or_else(|| IndexError::UnknownInstance(sop_instance_uid.to_string()))?;
        if node.instances.is_empty() {
            self.series.remove(&series_uid);
        }
        Ok(entry)
    }

    /// Iterate over all entries with their series UIDs.
    pub fn all_instances(&self) -> impl Iterator<Item = (&str, &InstanceEntry)> {
        self.series.iter().flat_map(|(series_uid, node)| {
            node.instances
                .values()
                .map(move |entry| (series_uid.as_str(), entry))
        })
    }
}

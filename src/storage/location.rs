use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Lifecycle status of a stored study.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StudyStatus {
    Online,
    OnlineLossy,
    OnlineLossless,
    Nearline,
    Archived,
}

/// Coarse processing state of the study's queue activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueState {
    Idle,
    Pending,
    Processing,
}

/// The durable record mapping a study to its on-disk folder on a specific
/// filesystem. Created on the first instance of a study, mutated by every
/// later ingestion/reconciliation/archival operation, and only removed by
/// an explicit purge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudyStorageLocation {
    pub partition: String,
    pub study_instance_uid: String,
    pub filesystem_key: String,
    /// Date-bucketed folder, relative to the partition root:
    /// `YYYY/MM/DD/<study uid>`.
    pub study_folder: String,
    pub transfer_syntax_uid: String,
    pub status: StudyStatus,
    pub queue_state: QueueState,
    pub instance_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

impl StudyStorageLocation {
    pub fn new(
        partition: impl Into<String>,
        study_instance_uid: impl Into<String>,
        filesystem_key: impl Into<String>,
        transfer_syntax_uid: impl Into<String>,
        received_at: DateTime<Utc>,
    ) -> Self {
        let study_instance_uid = study_instance_uid.into();
        let study_folder = format!(
            "{:04}/{:02}/{:02}/{}",
            received_at.year(),
            received_at.month(),
            received_at.day(),
            study_instance_uid
        );
        Self {
            partition: partition.into(),
            study_instance_uid,
            filesystem_key: filesystem_key.into(),
            study_folder,
            transfer_syntax_uid: transfer_syntax_uid.into(),
            status: StudyStatus::Online,
            queue_state: QueueState::Idle,
            instance_count: 0,
            created_at: received_at,
            last_accessed: received_at,
        }
    }

    /// A location is active while the study has not been pushed out to the
    /// archive tier.
    pub fn is_active(&self) -> bool {
        self.status != StudyStatus::Archived
    }

    /// Whether the study may be mutated (new instances, reconciliation).
    /// Archived and nearline studies must be restored first.
    pub fn is_updatable(&self) -> bool {
        matches!(
            self.status,
            StudyStatus::Online | StudyStatus::OnlineLossy | StudyStatus::OnlineLossless
        )
    }

    /// Absolute study folder under the owning filesystem root.
    pub fn study_path(&self, filesystem_root: &Path) -> PathBuf {
        filesystem_root
            .join(&self.partition)
            .join(&self.study_folder)
    }

    /// Absolute path of the header index file.
    pub fn index_path(&self, filesystem_root: &Path) -> PathBuf {
        self.study_path(filesystem_root)
            .join(study_index::INDEX_FILE_NAME)
    }

    /// Instance path relative to the study folder.
    pub fn instance_rel_path(series_instance_uid: &str, sop_instance_uid: &str) -> String {
        format!("{}/{}.dcm", series_instance_uid, sop_instance_uid)
    }

    /// Absolute path an instance is stored at.
    pub fn instance_path(
        &self,
        filesystem_root: &Path,
        series_instance_uid: &str,
        sop_instance_uid: &str,
    ) -> PathBuf {
        self.study_path(filesystem_root)
            .join(Self::instance_rel_path(series_instance_uid, sop_instance_uid))
    }
}

/// Park area for conflicting instances awaiting reconciliation, bucketed by
/// arrival group.
pub fn reconcile_area(filesystem_root: &Path, partition: &str, group: &str) -> PathBuf {
    filesystem_root.join(partition).join("reconcile").join(group)
}

/// Park area for duplicate instances kept for operator review.
pub fn duplicate_area(filesystem_root: &Path, partition: &str, group: &str) -> PathBuf {
    filesystem_root.join(partition).join("duplicates").join(group)
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of background work driven by the work queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkKind {
    StudyProcess,
    ReconcileStudy,
    CompressStudy,
    AutoRoute,
}

/// Work item lifecycle. `Failed` is terminal only once retries are
/// exhausted; before that a failed item is rescheduled back to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkStatus {
    Pending,
    Processing,
    Complete,
    Failed,
}

/// A durable, retryable unit of background work tied to one study.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkQueueEntry {
    pub id: String,
    pub kind: WorkKind,
    pub partition: String,
    pub study_instance_uid: String,
    pub status: WorkStatus,
    pub scheduled_at: DateTime<Utc>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl WorkQueueEntry {
    pub fn new(
        kind: WorkKind,
        partition: impl Into<String>,
        study_instance_uid: impl Into<String>,
        scheduled_at: DateTime<Utc>,
        max_retries: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            partition: partition.into(),
            study_instance_uid: study_instance_uid.into(),
            status: WorkStatus::Pending,
            scheduled_at,
            lease_expires_at: None,
            retry_count: 0,
            max_retries,
            failure_reason: None,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, WorkStatus::Complete | WorkStatus::Failed)
    }
}

/// One file attached to a work item, e.g. a conflicting instance parked in
/// the reconcile area awaiting a disposition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkQueueUid {
    pub id: String,
    pub work_queue_id: String,
    pub series_instance_uid: String,
    pub sop_instance_uid: String,
    /// Path of the parked file, relative to the filesystem root.
    pub relative_path: String,
    pub duplicate: bool,
}

impl WorkQueueUid {
    pub fn new(
        work_queue_id: impl Into<String>,
        series_instance_uid: impl Into<String>,
        sop_instance_uid: impl Into<String>,
        relative_path: impl Into<String>,
        duplicate: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            work_queue_id: work_queue_id.into(),
            series_instance_uid: series_instance_uid.into(),
            sop_instance_uid: sop_instance_uid.into(),
            relative_path: relative_path.into(),
            duplicate,
        }
    }
}

/// Kind of filesystem-level maintenance scheduled by rule actions. These
/// entries are produced here and consumed by separate background services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FilesystemQueueKind {
    LosslessCompress,
    LossyCompress,
    PurgeStudy,
    MigrateStudy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesystemQueueEntry {
    pub id: String,
    pub kind: FilesystemQueueKind,
    pub filesystem_key: String,
    pub partition: String,
    pub study_instance_uid: String,
    pub scheduled_at: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl FilesystemQueueEntry {
    pub fn new(
        kind: FilesystemQueueKind,
        filesystem_key: impl Into<String>,
        partition: impl Into<String>,
        study_instance_uid: impl Into<String>,
        scheduled_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            filesystem_key: filesystem_key.into(),
            partition: partition.into(),
            study_instance_uid: study_instance_uid.into(),
            scheduled_at,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// How a captured conflict was (or is yet to be) resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReconcileDecision {
    /// Conflict captured and parked; awaiting a disposition.
    Deferred,
    ProcessAsIs,
    Merge { target_study_uid: String },
    CreateNew { new_study_uid: String },
}

/// Append-only audit record of a reconciliation event. Never updated or
/// deleted once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileHistoryRecord {
    pub id: String,
    pub partition: String,
    pub study_instance_uid: String,
    pub decision: ReconcileDecision,
    /// Serialized description of what was observed or changed.
    pub change_description: serde_json::Value,
    pub sop_instance_uids: Vec<String>,
    pub recorded_at: DateTime<Utc>,
}

impl ReconcileHistoryRecord {
    pub fn new(
        partition: impl Into<String>,
        study_instance_uid: impl Into<String>,
        decision: ReconcileDecision,
        change_description: serde_json::Value,
        sop_instance_uids: Vec<String>,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            partition: partition.into(),
            study_instance_uid: study_instance_uid.into(),
            decision,
            change_description,
            sop_instance_uids,
            recorded_at,
        }
    }
}

/// Access granted to an authority group for one study, produced by
/// grant-access rule actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessGrant {
    pub id: String,
    pub partition: String,
    pub study_instance_uid: String,
    pub group: String,
    pub granted_at: DateTime<Utc>,
}

impl AccessGrant {
    pub fn new(
        partition: impl Into<String>,
        study_instance_uid: impl Into<String>,
        group: impl Into<String>,
        granted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            partition: partition.into(),
            study_instance_uid: study_instance_uid.into(),
            group: group.into(),
            granted_at,
        }
    }
}

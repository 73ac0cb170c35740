//! Persistence boundary for the archive core.
//!
//! The core never manages connections or tables directly: reads go through
//! [`ArchiveStore`] queries, and every mutation goes through an
//! [`UpdateContext`] opened by the command processor and committed or rolled
//! back as a unit.

mod entities;
mod store;

pub use entities::{
    AccessGrant, FilesystemQueueEntry, FilesystemQueueKind, ReconcileDecision,
    ReconcileHistoryRecord, WorkKind, WorkQueueEntry, WorkQueueUid, WorkStatus,
};
pub use store::RedbStore;

use crate::error::Result;
use crate::storage::StudyStorageLocation;
use chrono::{DateTime, Utc};

/// A single open update transaction. All durable side effects of one logical
/// operation happen through one of these; nothing is visible until
/// [`UpdateContext::commit`] succeeds.
pub trait UpdateContext: Send {
    fn upsert_study_location(&mut self, location: &StudyStorageLocation) -> Result<()>;

    fn insert_work_queue(&mut self, entry: &WorkQueueEntry) -> Result<()>;
    fn update_work_queue(&mut self, entry: &WorkQueueEntry) -> Result<()>;
    fn delete_work_queue(&mut self, id: &str) -> Result<()>;
    /// Full scan of the work queue, readable inside the transaction so
    /// claim-and-mark is atomic.
    fn list_work_queue(&mut self) -> Result<Vec<WorkQueueEntry>>;

    fn insert_work_queue_uid(&mut self, uid: &WorkQueueUid) -> Result<()>;
    fn delete_work_queue_uid(&mut self, id: &str) -> Result<()>;

    fn insert_filesystem_queue(&mut self, entry: &FilesystemQueueEntry) -> Result<()>;
    fn insert_reconcile_history(&mut self, record: &ReconcileHistoryRecord) -> Result<()>;
    fn insert_access_grant(&mut self, grant: &AccessGrant) -> Result<()>;

    fn commit(self: Box<Self>) -> Result<()>;
    fn rollback(self: Box<Self>) -> Result<()>;
}

/// Read queries plus the entry point for update transactions.
pub trait ArchiveStore: Send + Sync {
    fn begin_update(&self) -> Result<Box<dyn UpdateContext>>;

    fn study_location(
        &self,
        partition: &str,
        study_instance_uid: &str,
    ) -> Result<Option<StudyStorageLocation>>;

    fn work_queue_entry(&self, id: &str) -> Result<Option<WorkQueueEntry>>;
    fn work_queue_entries(&self) -> Result<Vec<WorkQueueEntry>>;
    fn work_queue_uids(&self, work_queue_id: &str) -> Result<Vec<WorkQueueUid>>;

    /// The open reconcile work item for a study's arrival group, if any.
    /// Used to attach further conflicting files from the same burst to one
    /// queue entry instead of opening a new one per file.
    fn find_reconcile_item(
        &self,
        partition: &str,
        study_instance_uid: &str,
        group: &str,
    ) -> Result<Option<WorkQueueEntry>>;

    fn reconcile_history(
        &self,
        partition: &str,
        study_instance_uid: &str,
    ) -> Result<Vec<ReconcileHistoryRecord>>;

    fn filesystem_queue_entries(&self, study_instance_uid: &str)
        -> Result<Vec<FilesystemQueueEntry>>;

    fn access_grants(
        &self,
        partition: &str,
        study_instance_uid: &str,
    ) -> Result<Vec<AccessGrant>>;
}

/// Items claimable at `now`: pending and due, or claimed by a consumer whose
/// lease has expired (crash recovery).
pub fn is_claimable(entry: &WorkQueueEntry, now: DateTime<Utc>) -> bool {
    match entry.status {
        WorkStatus::Pending => entry.scheduled_at <= now,
        WorkStatus::Processing => entry
            .lease_expires_at
            .map(|lease| lease <= now)
            .unwrap_or(false),
        WorkStatus::Complete | WorkStatus::Failed => false,
    }
}

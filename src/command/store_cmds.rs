use crate::command::{Command, CommandContext};
use crate::error::Result;
use crate::persistence::{
    AccessGrant, FilesystemQueueEntry, ReconcileHistoryRecord, WorkQueueEntry, WorkQueueUid,
};
use crate::storage::StudyStorageLocation;

// Store-backed commands write exclusively through the shared update
// transaction, so their undo is the transaction rollback itself; the
// `undo` bodies below are intentionally empty.

macro_rules! store_command {
    ($(#[$meta:meta])* $name:ident, $entity:ty, $label:literal, $method:ident) => {
        $(#[$meta])*
        pub struct $name {
            entity: $entity,
        }

        impl $name {
            pub fn new(entity: $entity) -> Self {
                Self { entity }
            }
        }

        impl Command for $name {
            fn name(&self) -> &str {
                $label
            }

            fn requires_transaction(&self) -> bool {
                true
            }

            fn execute(&mut self, ctx: &mut CommandContext) -> Result<()> {
                ctx.update()?.$method(&self.entity)
            }

            fn undo(&mut self, _ctx: &mut CommandContext) -> Result<()> {
                Ok(())
            }
        }
    };
}

store_command!(
    /// Insert or update a study's storage location record.
    UpsertStudyLocationCommand,
    StudyStorageLocation,
    "upsert study location",
    upsert_study_location
);

store_command!(
    /// Insert a work-queue entry.
    InsertWorkQueueCommand,
    WorkQueueEntry,
    "insert work queue entry",
    insert_work_queue
);

store_command!(
    /// Attach a file record to a work-queue entry.
    InsertWorkQueueUidCommand,
    WorkQueueUid,
    "insert work queue uid",
    insert_work_queue_uid
);

store_command!(
    /// Insert a filesystem-queue entry for a downstream service.
    InsertFilesystemQueueCommand,
    FilesystemQueueEntry,
    "insert filesystem queue entry",
    insert_filesystem_queue
);

store_command!(
    /// Append a reconciliation history record.
    InsertReconcileHistoryCommand,
    ReconcileHistoryRecord,
    "insert reconcile history",
    insert_reconcile_history
);

store_command!(
    /// Record an access grant for an authority group.
    InsertAccessGrantCommand,
    AccessGrant,
    "insert access grant",
    insert_access_grant
);

/// Delete a work-queue uid row once its file has been dealt with.
pub struct DeleteWorkQueueUidCommand {
    id: String,
}

impl DeleteWorkQueueUidCommand {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl Command for DeleteWorkQueueUidCommand {
    fn name(&self) -> &str {
        "delete work queue uid"
    }

    fn requires_transaction(&self) -> bool {
        true
    }

    fn execute(&mut self, ctx: &mut CommandContext) -> Result<()> {
        ctx.update()?.delete_work_queue_uid(&self.id)
    }

    fn undo(&mut self, _ctx: &mut CommandContext) -> Result<()> {
        Ok(())
    }
}

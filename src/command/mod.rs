//! Transactional unit-of-work primitive.
//!
//! A [`CommandProcessor`] runs an ordered list of [`Command`]s as one
//! logical, reversible operation: all durable side effects become visible
//! together, or the already-executed commands are undone in reverse order
//! and the shared store transaction is rolled back.

mod file_cmds;
mod processor;
mod store_cmds;

pub use file_cmds::{
    CopyFileCommand, CreateDirCommand, DeleteFileCommand, SaveStudyIndexCommand, WriteFileCommand,
};
pub use processor::CommandProcessor;
pub use store_cmds::{
    DeleteWorkQueueUidCommand, InsertAccessGrantCommand, InsertFilesystemQueueCommand,
    InsertReconcileHistoryCommand, InsertWorkQueueCommand, InsertWorkQueueUidCommand,
    UpsertStudyLocationCommand,
};

use crate::error::{ArchiveError, Result};
use crate::persistence::{ArchiveStore, UpdateContext};
use std::sync::Arc;

/// One reversible step of a command sequence.
///
/// `execute` and `undo` form an explicit capability pair; commands whose
/// durable effect lives in the store set `requires_transaction` and write
/// through [`CommandContext::update`], so the rollback of the shared
/// transaction reverts them wholesale.
pub trait Command: Send {
    fn name(&self) -> &str;

    fn requires_transaction(&self) -> bool {
        false
    }

    fn execute(&mut self, ctx: &mut CommandContext) -> Result<()>;

    fn undo(&mut self, ctx: &mut CommandContext) -> Result<()>;
}

/// Execution context shared by all commands of one processor run. Owns the
/// lazily opened update transaction.
pub struct CommandContext {
    store: Arc<dyn ArchiveStore>,
    txn: Option<Box<dyn UpdateContext>>,
}

impl CommandContext {
    pub fn new(store: Arc<dyn ArchiveStore>) -> Self {
        Self { store, txn: None }
    }

    pub fn store(&self) -> &dyn ArchiveStore {
        self.store.as_ref()
    }

    /// The shared update transaction, opened on first use.
    pub fn update(&mut self) -> Result<&mut (dyn UpdateContext + 'static)> {
        if self.txn.is_none() {
            self.txn = Some(self.store.begin_update()?);
        }
        self.txn
            .as_deref_mut()
            .ok_or_else(|| ArchiveError::internal("update transaction not open"))
    }

    pub(crate) fn take_transaction(&mut self) -> Option<Box<dyn UpdateContext>> {
        self.txn.take()
    }
}

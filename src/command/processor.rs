use crate::command::{Command, CommandContext};
use crate::error::{ArchiveError, Result};
use tracing::{debug, warn};

/// Executes an ordered list of commands as a single reversible operation.
///
/// Commands run strictly in insertion order. The first failure stops the
/// sequence: every already-executed command is undone in reverse order, the
/// shared transaction (if one was opened) is rolled back, and the failure
/// is recorded for the caller instead of being re-thrown.
pub struct CommandProcessor {
    description: String,
    commands: Vec<Box<dyn Command>>,
    started: bool,
    failure_reason: Option<String>,
    failure: Option<ArchiveError>,
}

impl CommandProcessor {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            commands: Vec::new(),
            started: false,
            failure_reason: None,
            failure: None,
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Append a command. Rejected once execution has started.
    pub fn add(&mut self, command: Box<dyn Command>) -> Result<()> {
        if self.started {
            return Err(ArchiveError::command(format!(
                "'{}' already started executing, cannot add '{}'",
                self.description,
                command.name()
            )));
        }
        self.commands.push(command);
        Ok(())
    }

    /// Run the sequence. Returns true if every command succeeded and the
    /// shared transaction committed; on failure the reason and error are
    /// available via [`failure_reason`](Self::failure_reason) and
    /// [`take_failure`](Self::take_failure).
    pub fn execute(&mut self, ctx: &mut CommandContext) -> bool {
        self.started = true;
        let mut executed = 0usize;

        for i in 0..self.commands.len() {
            let name = self.commands[i].name().to_string();
            if self.commands[i].requires_transaction() {
                if let Err(e) = ctx.update() {
                    self.record_failure(&name, e);
                    self.unwind(executed, ctx);
                    return false;
                }
            }
            debug!(
                "'{}': executing command {}/{} '{}'",
                self.description,
                i + 1,
                self.commands.len(),
                name
            );
            match self.commands[i].execute(ctx) {
                Ok(()) => executed += 1,
                Err(e) => {
                    self.record_failure(&name, e);
                    self.unwind(executed, ctx);
                    return false;
                }
            }
        }

        if let Some(txn) = ctx.take_transaction() {
            if let Err(e) = txn.commit() {
                self.record_failure("commit", e);
                // The transaction is gone with the failed commit; only the
                // non-transactional side effects are left to undo.
                self.undo_executed(executed, ctx);
                return false;
            }
        }
        true
    }

    fn record_failure(&mut self, command_name: &str, error: ArchiveError) {
        warn!(
            "'{}' failed at '{}': {}",
            self.description, command_name, error
        );
        self.failure_reason = Some(format!("{}: {}", command_name, error));
        self.failure = Some(error);
    }

    /// Undo executed commands in reverse order, then roll back the shared
    /// transaction if one was opened.
    fn unwind(&mut self, executed: usize, ctx: &mut CommandContext) {
        self.undo_executed(executed, ctx);
        if let Some(txn) = ctx.take_transaction() {
            if let Err(e) = txn.rollback() {
                warn!("'{}': rollback failed: {}", self.description, e);
            }
        }
    }

    fn undo_executed(&mut self, executed: usize, ctx: &mut CommandContext) {
        for i in (0..executed).rev() {
            let name = self.commands[i].name().to_string();
            if let Err(e) = self.commands[i].undo(ctx) {
                warn!("'{}': undo of '{}' failed: {}", self.description, name, e);
            }
        }
    }

    /// Human-readable reason of the recorded failure.
    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    /// Take ownership of the recorded failure, if any.
    pub fn take_failure(&mut self) -> Option<ArchiveError> {
        self.failure.take()
    }

    /// The recorded failure as an error, for callers that treat a failed
    /// run as fatal to the surrounding operation.
    pub fn into_failure(mut self) -> ArchiveError {
        self.failure.take().unwrap_or_else(|| {
            ArchiveError::command(format!("'{}' failed", self.description))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::RedbStore;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    /// Test command that records execute/undo calls into a shared journal.
    struct Recording {
        label: &'static str,
        fail: bool,
        journal: Arc<Mutex<Vec<String>>>,
    }

    impl Recording {
        fn boxed(
            label: &'static str,
            fail: bool,
            journal: &Arc<Mutex<Vec<String>>>,
        ) -> Box<dyn Command> {
            Box::new(Self {
                label,
                fail,
                journal: Arc::clone(journal),
            })
        }

        fn log(&self, event: &str) {
            self.journal
                .lock()
                .unwrap()
                .push(format!("{} {}", event, self.label));
        }
    }

    impl Command for Recording {
        fn name(&self) -> &str {
            self.label
        }

        fn execute(&mut self, _ctx: &mut CommandContext) -> crate::error::Result<()> {
            if self.fail {
                return Err(ArchiveError::command("boom"));
            }
            self.log("exec");
            Ok(())
        }

        fn undo(&mut self, _ctx: &mut CommandContext) -> crate::error::Result<()> {
            self.log("undo");
            Ok(())
        }
    }

    fn test_ctx(dir: &TempDir) -> CommandContext {
        let store = RedbStore::open(&dir.path().join("state.redb")).unwrap();
        CommandContext::new(Arc::new(store))
    }

    #[test]
    fn all_commands_run_in_order() {
        let dir = TempDir::new().unwrap();
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut processor = CommandProcessor::new("test");
        processor.add(Recording::boxed("a", false, &journal)).unwrap();
        processor.add(Recording::boxed("b", false, &journal)).unwrap();
        processor.add(Recording::boxed("c", false, &journal)).unwrap();

        let mut ctx = test_ctx(&dir);
        assert!(processor.execute(&mut ctx));
        assert_eq!(*journal.lock().unwrap(), vec!["exec a", "exec b", "exec c"]);
        assert!(processor.failure_reason().is_none());
    }

    #[test]
    fn failure_undoes_prior_commands_in_reverse_order() {
        let dir = TempDir::new().unwrap();
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut processor = CommandProcessor::new("test");
        processor.add(Recording::boxed("a", false, &journal)).unwrap();
        processor.add(Recording::boxed("b", false, &journal)).unwrap();
        processor.add(Recording::boxed("bad", true, &journal)).unwrap();
        processor.add(Recording::boxed("never", false, &journal)).unwrap();

        let mut ctx = test_ctx(&dir);
        assert!(!processor.execute(&mut ctx));
        // a and b executed once, undone exactly once in reverse order, and
        // nothing after the failing command ran.
        assert_eq!(
            *journal.lock().unwrap(),
            vec!["exec a", "exec b", "undo b", "undo a"]
        );
        assert!(processor.failure_reason().unwrap().contains("bad"));
        assert!(matches!(
            processor.take_failure(),
            Some(ArchiveError::Command(_))
        ));
    }

    #[test]
    fn add_after_execute_rejected() {
        let dir = TempDir::new().unwrap();
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut processor = CommandProcessor::new("test");
        processor.add(Recording::boxed("a", false, &journal)).unwrap();

        let mut ctx = test_ctx(&dir);
        assert!(processor.execute(&mut ctx));
        assert!(processor.add(Recording::boxed("late", false, &journal)).is_err());
    }

    #[test]
    fn empty_processor_succeeds() {
        let dir = TempDir::new().unwrap();
        let mut processor = CommandProcessor::new("empty");
        let mut ctx = test_ctx(&dir);
        assert!(processor.execute(&mut ctx));
    }
}

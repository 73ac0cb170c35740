use crate::command::{Command, CommandContext};
use crate::error::{ArchiveError, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use study_index::StudyIndex;

/// Create a directory (and its parents). Undo removes the deepest directory
/// only if this command created it and it is still empty.
pub struct CreateDirCommand {
    path: PathBuf,
    created: bool,
}

impl CreateDirCommand {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            created: false,
        }
    }
}

impl Command for CreateDirCommand {
    fn name(&self) -> &str {
        "create directory"
    }

    fn execute(&mut self, _ctx: &mut CommandContext) -> Result<()> {
        if !self.path.exists() {
            fs::create_dir_all(&self.path)?;
            self.created = true;
        }
        Ok(())
    }

    fn undo(&mut self, _ctx: &mut CommandContext) -> Result<()> {
        if self.created {
            // Best effort: leave the directory in place if something else
            // already put files into it.
            let _ = fs::remove_dir(&self.path);
        }
        Ok(())
    }
}

/// Durably write a new file: temp file in the destination directory, fsync,
/// atomic rename. Refuses to overwrite. Undo removes the written file.
pub struct WriteFileCommand {
    dest: PathBuf,
    contents: Vec<u8>,
    written: bool,
}

impl WriteFileCommand {
    pub fn new(dest: PathBuf, contents: Vec<u8>) -> Self {
        Self {
            dest,
            contents,
            written: false,
        }
    }
}

impl Command for WriteFileCommand {
    fn name(&self) -> &str {
        "write file"
    }

    fn execute(&mut self, _ctx: &mut CommandContext) -> Result<()> {
        if self.dest.exists() {
            return Err(ArchiveError::command(format!(
                "destination already exists: {}",
                self.dest.display()
            )));
        }
        write_durably(&self.dest, &self.contents)?;
        self.written = true;
        Ok(())
    }

    fn undo(&mut self, _ctx: &mut CommandContext) -> Result<()> {
        if self.written {
            fs::remove_file(&self.dest)?;
            self.written = false;
        }
        Ok(())
    }
}

/// Copy an existing file to a new destination. Undo removes the copy.
pub struct CopyFileCommand {
    src: PathBuf,
    dest: PathBuf,
    copied: bool,
}

impl CopyFileCommand {
    pub fn new(src: PathBuf, dest: PathBuf) -> Self {
        Self {
            src,
            dest,
            copied: false,
        }
    }
}

impl Command for CopyFileCommand {
    fn name(&self) -> &str {
        "copy file"
    }

    fn execute(&mut self, _ctx: &mut CommandContext) -> Result<()> {
        if self.dest.exists() {
            return Err(ArchiveError::command(format!(
                "destination already exists: {}",
                self.dest.display()
            )));
        }
        if let Some(parent) = self.dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&self.src, &self.dest)?;
        fs::File::open(&self.dest)?.sync_all()?;
        self.copied = true;
        Ok(())
    }

    fn undo(&mut self, _ctx: &mut CommandContext) -> Result<()> {
        if self.copied {
            fs::remove_file(&self.dest)?;
            self.copied = false;
        }
        Ok(())
    }
}

/// Delete a file, keeping its bytes in memory so undo can restore it.
pub struct DeleteFileCommand {
    path: PathBuf,
    backup: Option<Vec<u8>>,
}

impl DeleteFileCommand {
    pub fn new(path: PathBuf) -> Self {
        Self { path, backup: None }
    }
}

impl Command for DeleteFileCommand {
    fn name(&self) -> &str {
        "delete file"
    }

    fn execute(&mut self, _ctx: &mut CommandContext) -> Result<()> {
        self.backup = Some(fs::read(&self.path)?);
        fs::remove_file(&self.path)?;
        Ok(())
    }

    fn undo(&mut self, _ctx: &mut CommandContext) -> Result<()> {
        if let Some(bytes) = self.backup.take() {
            write_durably(&self.path, &bytes)?;
        }
        Ok(())
    }
}

/// Save a study's header index, preserving the previous serialized form so
/// undo can put it back (or remove the file if none existed).
pub struct SaveStudyIndexCommand {
    study_dir: PathBuf,
    index: StudyIndex,
    previous: Option<Vec<u8>>,
    saved: bool,
}

impl SaveStudyIndexCommand {
    pub fn new(study_dir: PathBuf, index: StudyIndex) -> Self {
        Self {
            study_dir,
            index,
            previous: None,
            saved: false,
        }
    }

    fn index_path(&self) -> PathBuf {
        self.study_dir.join(study_index::INDEX_FILE_NAME)
    }
}

impl Command for SaveStudyIndexCommand {
    fn name(&self) -> &str {
        "save study index"
    }

    fn execute(&mut self, _ctx: &mut CommandContext) -> Result<()> {
        let path = self.index_path();
        if path.exists() {
            self.previous = Some(fs::read(&path)?);
        }
        self.index.save(&self.study_dir)?;
        self.saved = true;
        Ok(())
    }

    fn undo(&mut self, _ctx: &mut CommandContext) -> Result<()> {
        if !self.saved {
            return Ok(());
        }
        let path = self.index_path();
        match self.previous.take() {
            Some(bytes) => write_durably_replacing(&path, &bytes)?,
            None => fs::remove_file(&path)?,
        }
        self.saved = false;
        Ok(())
    }
}

fn write_durably(dest: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = dest.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, dest)?;
    Ok(())
}

fn write_durably_replacing(dest: &Path, contents: &[u8]) -> Result<()> {
    if dest.exists() {
        fs::remove_file(dest)?;
    }
    write_durably(dest, contents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandProcessor;
    use crate::persistence::RedbStore;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn test_ctx(dir: &TempDir) -> CommandContext {
        let store = RedbStore::open(&dir.path().join("state.redb")).unwrap();
        CommandContext::new(Arc::new(store))
    }

    #[test]
    fn write_then_undo_removes_file() {
        let dir = TempDir::new().unwrap();
        let mut ctx = test_ctx(&dir);
        let dest = dir.path().join("data/file.dcm");

        let mut cmd = WriteFileCommand::new(dest.clone(), b"payload".to_vec());
        cmd.execute(&mut ctx).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"payload");

        cmd.undo(&mut ctx).unwrap();
        assert!(!dest.exists());
    }

    #[test]
    fn write_refuses_to_overwrite() {
        let dir = TempDir::new().unwrap();
        let mut ctx = test_ctx(&dir);
        let dest = dir.path().join("file.dcm");
        fs::write(&dest, b"original").unwrap();

        let mut cmd = WriteFileCommand::new(dest.clone(), b"other".to_vec());
        assert!(cmd.execute(&mut ctx).is_err());
        assert_eq!(fs::read(&dest).unwrap(), b"original");
    }

    #[test]
    fn delete_undo_restores_contents() {
        let dir = TempDir::new().unwrap();
        let mut ctx = test_ctx(&dir);
        let path = dir.path().join("file.dcm");
        fs::write(&path, b"keep me").unwrap();

        let mut cmd = DeleteFileCommand::new(path.clone());
        cmd.execute(&mut ctx).unwrap();
        assert!(!path.exists());

        cmd.undo(&mut ctx).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"keep me");
    }

    #[test]
    fn failed_sequence_leaves_no_partial_files() {
        let dir = TempDir::new().unwrap();
        let store = RedbStore::open(&dir.path().join("state.redb")).unwrap();
        let mut ctx = CommandContext::new(Arc::new(store));

        let good = dir.path().join("a.dcm");
        let clash = dir.path().join("b.dcm");
        fs::write(&clash, b"already here").unwrap();

        let mut processor = CommandProcessor::new("write pair");
        processor
            .add(Box::new(WriteFileCommand::new(good.clone(), b"a".to_vec())))
            .unwrap();
        processor
            .add(Box::new(WriteFileCommand::new(clash.clone(), b"b".to_vec())))
            .unwrap();

        assert!(!processor.execute(&mut ctx));
        assert!(!good.exists());
        assert_eq!(fs::read(&clash).unwrap(), b"already here");
    }

    #[test]
    fn index_save_undo_restores_previous_version() {
        let dir = TempDir::new().unwrap();
        let mut ctx = test_ctx(&dir);
        let study_dir = dir.path().join("study");
        fs::create_dir_all(&study_dir).unwrap();

        let v1 = StudyIndex::new("1.2.3");
        v1.save(&study_dir).unwrap();
        let before = fs::read(study_dir.join(study_index::INDEX_FILE_NAME)).unwrap();

        let mut v2 = StudyIndex::new("1.2.3");
        v2.attributes.patient_id = Some("PID".to_string());
        let mut cmd = SaveStudyIndexCommand::new(study_dir.clone(), v2);
        cmd.execute(&mut ctx).unwrap();
        let after = fs::read(study_dir.join(study_index::INDEX_FILE_NAME)).unwrap();
        assert_ne!(before, after);

        cmd.undo(&mut ctx).unwrap();
        let restored = fs::read(study_dir.join(study_index::INDEX_FILE_NAME)).unwrap();
        assert_eq!(before, restored);
    }
}

use crate::command::{
    CommandContext, CommandProcessor, CreateDirCommand, DeleteFileCommand,
    InsertReconcileHistoryCommand, InsertWorkQueueCommand, InsertWorkQueueUidCommand,
    SaveStudyIndexCommand, UpsertStudyLocationCommand, WriteFileCommand,
};
use crate::config::{Config, DuplicatePolicy};
use crate::error::{ArchiveError, Result};
use crate::persistence::{
    ArchiveStore, ReconcileDecision, ReconcileHistoryRecord, WorkKind, WorkQueueEntry,
    WorkQueueUid,
};
use crate::processor::{PatientNameRules, UpdateItem};
use crate::rules::{element_str, tag_for_keyword, RuleContext, RulesEngine, Trigger};
use crate::storage::{
    duplicate_area, reconcile_area, FilesystemMonitor, QueueState, StudyStorageLocation,
};
use crate::study::StudyLockMap;
use chrono::{DateTime, Datelike, Timelike, Utc};
use dicom_dictionary_std::tags;
use dicom_object::mem::InMemDicomObject;
use dicom_object::FileDicomObject;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use study_index::{InstanceEntry, StudyAttributes, StudyIndex};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How an instance was filed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingOutcome {
    /// Accepted into the study.
    Success,
    /// Already stored (or parked for duplicate review); nothing written to
    /// the study itself.
    Duplicate,
    /// Conflicting identity attributes: parked and queued for
    /// reconciliation instead of being written.
    Reconciled,
}

#[derive(Debug)]
pub struct ProcessingReport {
    pub outcome: ProcessingOutcome,
    pub study_instance_uid: String,
    pub sop_instance_uid: String,
    /// The in-place patient-name correction, when one was applied.
    pub name_update: Option<UpdateItem>,
}

/// Whether this is first-pass intake or a replay driven by the
/// reconciliation engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessMode {
    Intake,
    ReconcilePass,
}

/// Identifying attributes pulled off an incoming object.
struct InstanceIds {
    study_uid: String,
    series_uid: String,
    sop_uid: String,
    sop_class_uid: String,
    transfer_syntax_uid: String,
}

impl InstanceIds {
    fn from_object(object: &FileDicomObject<InMemDicomObject>) -> Result<Self> {
        let dataset: &InMemDicomObject = object;
        let get = |tag, name: &str| {
            element_str(dataset, tag)
                .ok_or_else(|| ArchiveError::dicom(format!("missing {}", name)))
        };
        Ok(Self {
            study_uid: get(tags::STUDY_INSTANCE_UID, "StudyInstanceUID")?,
            series_uid: get(tags::SERIES_INSTANCE_UID, "SeriesInstanceUID")?,
            sop_uid: get(tags::SOP_INSTANCE_UID, "SOPInstanceUID")?,
            sop_class_uid: get(tags::SOP_CLASS_UID, "SOPClassUID")?,
            transfer_syntax_uid: object.meta().transfer_syntax().to_string(),
        })
    }
}

/// Ingests parsed DICOM instances into the archive: duplicate detection
/// against the study's header index, identity-attribute conflict checks,
/// and the atomic accept sequence (file write, index update, location
/// upsert, rule-triggered enqueues) through one command processor.
pub struct SopInstanceProcessor {
    partition: String,
    group_window_minutes: u32,
    duplicate_policy: DuplicatePolicy,
    compare_tags: Vec<String>,
    max_retries: u32,
    roots: HashMap<String, PathBuf>,
    store: Arc<dyn ArchiveStore>,
    monitor: Arc<FilesystemMonitor>,
    locks: Arc<StudyLockMap>,
    rules: Arc<RulesEngine>,
}

impl SopInstanceProcessor {
    pub fn new(
        config: &Config,
        store: Arc<dyn ArchiveStore>,
        monitor: Arc<FilesystemMonitor>,
        locks: Arc<StudyLockMap>,
        rules: Arc<RulesEngine>,
    ) -> Self {
        let roots = config
            .storage
            .filesystems
            .iter()
            .map(|fs| (fs.key.clone(), PathBuf::from(&fs.root)))
            .collect();
        Self {
            partition: config.archive.partition.clone(),
            group_window_minutes: config.archive.group_window_minutes,
            duplicate_policy: config.storage.duplicate_policy,
            compare_tags: config.storage.reconcile.compare_tags.clone(),
            max_retries: config.queue.max_retries,
            roots,
            store,
            monitor,
            locks,
            rules,
        }
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    pub fn store(&self) -> &Arc<dyn ArchiveStore> {
        &self.store
    }

    pub fn filesystem_root(&self, key: &str) -> Result<PathBuf> {
        self.roots
            .get(key)
            .cloned()
            .ok_or_else(|| ArchiveError::config(format!("unknown filesystem '{}'", key)))
    }

    /// Arrival-group identifier: insertion time truncated to the configured
    /// window, so one burst of out-of-order files shares a park folder.
    pub fn instance_group(&self, now: DateTime<Utc>) -> String {
        let window = self.group_window_minutes.max(1);
        let minute_of_day = now.hour() * 60 + now.minute();
        let bucket = minute_of_day - minute_of_day % window;
        format!(
            "{:04}{:02}{:02}{:02}{:02}",
            now.year(),
            now.month(),
            now.day(),
            bucket / 60,
            bucket % 60
        )
    }

    /// Ingest one Part-10 file from the incoming area.
    pub async fn process_file(&self, path: &Path, now: DateTime<Utc>) -> Result<ProcessingReport> {
        let mut object = dicom_object::open_file(path).map_err(ArchiveError::dicom)?;
        self.process_object(&mut object, ProcessMode::Intake, None, now)
            .await
    }

    /// Ingest one parsed instance.
    ///
    /// In `ReconcilePass` mode the instance is accepted into `target` even
    /// when its attributes diverge from the study's canonical record; a
    /// same-UID different-content collision surfaces as
    /// [`ArchiveError::InstanceAlreadyExists`] so the caller can route that
    /// one file to duplicate handling without aborting its batch.
    pub async fn process_object(
        &self,
        object: &mut FileDicomObject<InMemDicomObject>,
        mode: ProcessMode,
        target: Option<&StudyStorageLocation>,
        now: DateTime<Utc>,
    ) -> Result<ProcessingReport> {
        let ids = InstanceIds::from_object(object)?;

        let lock = self.locks.lock_for(&ids.study_uid);
        let _guard = lock.lock().await;

        let location = match target {
            Some(target) => target.clone(),
            None => match self.store.study_location(&self.partition, &ids.study_uid)? {
                Some(existing) => existing,
                None => {
                    let fs = self
                        .monitor
                        .select_filesystem()
                        .await
                        .ok_or(ArchiveError::NoWritableFilesystem)?;
                    StudyStorageLocation::new(
                        &self.partition,
                        &ids.study_uid,
                        &fs.key,
                        &ids.transfer_syntax_uid,
                        now,
                    )
                }
            },
        };
        if !location.is_updatable() {
            return Err(ArchiveError::StudyNotUpdatable(ids.study_uid));
        }

        let root = self.filesystem_root(&location.filesystem_key)?;
        let study_dir = location.study_path(&root);
        let index = StudyIndex::load_or_new(&study_dir, &ids.study_uid)?;

        // Duplicate check against the header index, before any conflict
        // handling: a resend of a stored instance must never mutate the
        // study, whatever its attributes say.
        if let Some((_, existing)) = index.find_instance(&ids.sop_uid) {
            let bytes = object_bytes(object)?;
            let digest = blake3::hash(&bytes).to_hex().to_string();
            return if existing.content_digest == digest {
                match mode {
                    ProcessMode::ReconcilePass => {
                        debug!("Instance {} already recorded, skipping", ids.sop_uid);
                        Ok(report(ProcessingOutcome::Duplicate, &ids, None))
                    }
                    ProcessMode::Intake => match self.duplicate_policy {
                        DuplicatePolicy::Discard => {
                            info!("Discarding duplicate instance {}", ids.sop_uid);
                            Ok(report(ProcessingOutcome::Duplicate, &ids, None))
                        }
                        DuplicatePolicy::Quarantine => {
                            self.park_duplicate(&ids, &root, bytes, false, now)?;
                            Ok(report(ProcessingOutcome::Duplicate, &ids, None))
                        }
                    },
                }
            } else {
                match mode {
                    ProcessMode::ReconcilePass => Err(ArchiveError::InstanceAlreadyExists {
                        sop_instance_uid: ids.sop_uid,
                    }),
                    ProcessMode::Intake => {
                        warn!(
                            "Instance {} exists with different content, parking for review",
                            ids.sop_uid
                        );
                        self.park_duplicate(&ids, &root, bytes, true, now)?;
                        Ok(report(ProcessingOutcome::Duplicate, &ids, None))
                    }
                }
            };
        }

        // Identity-attribute check against the study's canonical record.
        let mut name_update = None;
        let mut mismatches = Vec::new();
        if !index.attributes.is_empty() {
            if let Some(canonical) = index.attributes.patient_name.clone() {
                let incoming = element_str(object, tags::PATIENT_NAME).unwrap_or_default();
                if incoming != canonical {
                    if PatientNameRules::is_same_name(&incoming, &canonical) {
                        name_update = PatientNameRules::apply(&mut **object, &canonical);
                    } else {
                        mismatches.push(("PatientName", canonical, incoming));
                    }
                }
            }
            for keyword in &self.compare_tags {
                if keyword == "PatientName" {
                    continue;
                }
                if let Some(expected) = index.attributes.get(keyword) {
                    let actual = tag_for_keyword(keyword)
                        .and_then(|tag| element_str(object, tag))
                        .unwrap_or_default();
                    if actual != expected {
                        mismatches.push((
                            keyword.as_str(),
                            expected.to_string(),
                            actual,
                        ));
                    }
                }
            }
        }

        if !mismatches.is_empty() && mode == ProcessMode::Intake {
            return self.park_conflict(&ids, &location, &root, object, mismatches, now);
        }
        if !mismatches.is_empty() {
            debug!(
                "Accepting instance {} as-is despite {} attribute mismatches",
                ids.sop_uid,
                mismatches.len()
            );
        }

        self.accept(&ids, location, &root, object, index, name_update, now)
    }

    /// Park a duplicate in the duplicates area and queue it for review.
    fn park_duplicate(
        &self,
        ids: &InstanceIds,
        root: &Path,
        bytes: Vec<u8>,
        content_differs: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let group = self.instance_group(now);
        let dest = duplicate_area(root, &self.partition, &group)
            .join(format!("{}.{}.dcm", ids.sop_uid, Uuid::new_v4()));
        let relative = relative_to(&dest, root);

        let mut processor = CommandProcessor::new(format!("Park duplicate {}", ids.sop_uid));
        processor.add(Box::new(WriteFileCommand::new(dest, bytes)))?;

        let work_id = match self
            .store
            .find_reconcile_item(&self.partition, &ids.study_uid, &group)?
        {
            Some(entry) => entry.id,
            None => {
                let entry = WorkQueueEntry::new(
                    WorkKind::ReconcileStudy,
                    &self.partition,
                    &ids.study_uid,
                    now,
                    self.max_retries,
                )
                .with_payload(serde_json::json!({ "group": group }));
                let id = entry.id.clone();
                processor.add(Box::new(InsertWorkQueueCommand::new(entry)))?;
                id
            }
        };
        processor.add(Box::new(InsertWorkQueueUidCommand::new(WorkQueueUid::new(
            work_id,
            &ids.series_uid,
            &ids.sop_uid,
            relative,
            true,
        ))))?;
        if content_differs {
            processor.add(Box::new(InsertReconcileHistoryCommand::new(
                ReconcileHistoryRecord::new(
                    &self.partition,
                    &ids.study_uid,
                    ReconcileDecision::Deferred,
                    serde_json::json!({ "reason": "duplicate content mismatch" }),
                    vec![ids.sop_uid.clone()],
                    now,
                ),
            )))?;
        }

        let mut ctx = CommandContext::new(self.store.clone());
        if !processor.execute(&mut ctx) {
            return Err(processor.into_failure());
        }
        Ok(())
    }

    /// Park a conflicting instance in the reconcile area and queue it for a
    /// disposition, recording the captured mismatches in the history.
    fn park_conflict(
        &self,
        ids: &InstanceIds,
        location: &StudyStorageLocation,
        root: &Path,
        object: &FileDicomObject<InMemDicomObject>,
        mismatches: Vec<(&str, String, String)>,
        now: DateTime<Utc>,
    ) -> Result<ProcessingReport> {
        let group = self.instance_group(now);
        let dest = reconcile_area(root, &self.partition, &group)
            .join(format!("{}.{}.dcm", ids.sop_uid, Uuid::new_v4()));
        let relative = relative_to(&dest, root);
        let bytes = object_bytes(object)?;

        info!(
            "Instance {} conflicts with study {} on {:?}, queueing for reconciliation",
            ids.sop_uid,
            ids.study_uid,
            mismatches.iter().map(|(k, _, _)| *k).collect::<Vec<_>>()
        );

        let mut processor = CommandProcessor::new(format!("Park conflict {}", ids.sop_uid));
        processor.add(Box::new(WriteFileCommand::new(dest, bytes)))?;

        let work_id = match self
            .store
            .find_reconcile_item(&self.partition, &ids.study_uid, &group)?
        {
            Some(entry) => entry.id,
            None => {
                let entry = WorkQueueEntry::new(
                    WorkKind::ReconcileStudy,
                    &self.partition,
                    &ids.study_uid,
                    now,
                    self.max_retries,
                )
                .with_payload(serde_json::json!({ "group": group }));
                let id = entry.id.clone();
                processor.add(Box::new(InsertWorkQueueCommand::new(entry)))?;
                id
            }
        };
        processor.add(Box::new(InsertWorkQueueUidCommand::new(WorkQueueUid::new(
            work_id,
            &ids.series_uid,
            &ids.sop_uid,
            relative,
            false,
        ))))?;

        let description: Vec<serde_json::Value> = mismatches
            .iter()
            .map(|(keyword, expected, actual)| {
                serde_json::json!({
                    "attribute": keyword,
                    "expected": expected,
                    "actual": actual,
                })
            })
            .collect();
        processor.add(Box::new(InsertReconcileHistoryCommand::new(
            ReconcileHistoryRecord::new(
                &self.partition,
                &ids.study_uid,
                ReconcileDecision::Deferred,
                serde_json::json!({ "mismatches": description }),
                vec![ids.sop_uid.clone()],
                now,
            ),
        )))?;

        let mut queued_location = location.clone();
        queued_location.queue_state = QueueState::Pending;
        queued_location.last_accessed = now;
        processor.add(Box::new(UpsertStudyLocationCommand::new(queued_location)))?;

        let mut ctx = CommandContext::new(self.store.clone());
        if !processor.execute(&mut ctx) {
            return Err(processor.into_failure());
        }
        Ok(report(ProcessingOutcome::Reconciled, ids, None))
    }

    /// The atomic accept sequence.
    #[allow(clippy::too_many_arguments)]
    fn accept(
        &self,
        ids: &InstanceIds,
        location: StudyStorageLocation,
        root: &Path,
        object: &FileDicomObject<InMemDicomObject>,
        index: StudyIndex,
        name_update: Option<UpdateItem>,
        now: DateTime<Utc>,
    ) -> Result<ProcessingReport> {
        let dest = location.instance_path(root, &ids.series_uid, &ids.sop_uid);
        let bytes = object_bytes(object)?;
        let digest = blake3::hash(&bytes).to_hex().to_string();

        let mut updated_index = index;
        if updated_index.attributes.is_empty() {
            updated_index.attributes = capture_attributes(object);
        }
        updated_index.add_instance(
            &ids.series_uid,
            InstanceEntry {
                sop_instance_uid: ids.sop_uid.clone(),
                sop_class_uid: ids.sop_class_uid.clone(),
                transfer_syntax_uid: ids.transfer_syntax_uid.clone(),
                file_size: bytes.len() as u64,
                content_digest: digest,
                received_at: now,
            },
        )?;

        let mut updated_location = location;
        updated_location.instance_count = updated_index.instance_count() as u64;
        updated_location.transfer_syntax_uid = ids.transfer_syntax_uid.clone();
        updated_location.last_accessed = now;

        let mut processor = CommandProcessor::new(format!("Process SOP {}", ids.sop_uid));
        if let Some(parent) = dest.parent() {
            processor.add(Box::new(CreateDirCommand::new(parent.to_path_buf())))?;
        }
        if dest.exists() {
            // A file with no index entry is debris of a crash between the
            // file write and the index write; replace it.
            warn!("Replacing orphaned file {}", dest.display());
            processor.add(Box::new(DeleteFileCommand::new(dest.clone())))?;
        }
        processor.add(Box::new(WriteFileCommand::new(dest, bytes)))?;
        processor.add(Box::new(SaveStudyIndexCommand::new(
            updated_location.study_path(root),
            updated_index.clone(),
        )))?;
        processor.add(Box::new(UpsertStudyLocationCommand::new(
            updated_location.clone(),
        )))?;

        let attributes = updated_index.attributes.clone();
        let rule_ctx = RuleContext::new(Some(&**object), &attributes, &updated_location, now);
        self.rules
            .apply(Trigger::SopProcessed, &rule_ctx, &mut processor)?;

        let mut ctx = CommandContext::new(self.store.clone());
        if !processor.execute(&mut ctx) {
            return Err(processor.into_failure());
        }

        info!(
            "Stored instance {} into study {} ({} instances)",
            ids.sop_uid, ids.study_uid, updated_location.instance_count
        );
        Ok(report(ProcessingOutcome::Success, ids, name_update))
    }

    /// Evaluate study-level rules for a study that just finished a batch of
    /// instance work.
    pub fn fire_study_processed(&self, study_instance_uid: &str, now: DateTime<Utc>) -> Result<usize> {
        let Some(location) = self
            .store
            .study_location(&self.partition, study_instance_uid)?
        else {
            return Ok(0);
        };
        let root = self.filesystem_root(&location.filesystem_key)?;
        let index =
            StudyIndex::load_or_new(&location.study_path(&root), study_instance_uid)?;

        let mut processor = CommandProcessor::new(format!(
            "Study processed {}",
            study_instance_uid
        ));
        let ctx = RuleContext::new(None, &index.attributes, &location, now);
        let scheduled = self
            .rules
            .apply(Trigger::StudyProcessed, &ctx, &mut processor)?;
        if scheduled == 0 {
            return Ok(0);
        }
        let mut cmd_ctx = CommandContext::new(self.store.clone());
        if !processor.execute(&mut cmd_ctx) {
            return Err(processor.into_failure());
        }
        Ok(scheduled)
    }
}

fn report(
    outcome: ProcessingOutcome,
    ids: &InstanceIds,
    name_update: Option<UpdateItem>,
) -> ProcessingReport {
    ProcessingReport {
        outcome,
        study_instance_uid: ids.study_uid.clone(),
        sop_instance_uid: ids.sop_uid.clone(),
        name_update,
    }
}

/// Serialize an object to Part-10 bytes. Stored digests are computed over
/// exactly these bytes, so duplicate comparison stays consistent across
/// intake and replay.
fn object_bytes(object: &FileDicomObject<InMemDicomObject>) -> Result<Vec<u8>> {
    let tmp = tempfile::NamedTempFile::new()?;
    object
        .write_to_file(tmp.path())
        .map_err(ArchiveError::dicom)?;
    Ok(std::fs::read(tmp.path())?)
}

fn capture_attributes(object: &InMemDicomObject) -> StudyAttributes {
    StudyAttributes {
        patient_name: element_str(object, tags::PATIENT_NAME),
        patient_id: element_str(object, tags::PATIENT_ID),
        patient_birth_date: element_str(object, tags::PATIENT_BIRTH_DATE),
        accession_number: element_str(object, tags::ACCESSION_NUMBER),
        study_date: element_str(object, tags::STUDY_DATE),
        study_description: element_str(object, tags::STUDY_DESCRIPTION),
    }
}

fn relative_to(path: &Path, root: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .to_string()
}

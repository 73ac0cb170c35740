use crate::command::{
    CommandContext, CommandProcessor, DeleteFileCommand, DeleteWorkQueueUidCommand,
    InsertReconcileHistoryCommand, UpsertStudyLocationCommand,
};
use crate::config::AutoDisposition;
use crate::error::{ArchiveError, Result};
use crate::persistence::{
    ReconcileDecision, ReconcileHistoryRecord, WorkQueueEntry, WorkQueueUid,
};
use crate::processor::{ProcessMode, SopInstanceProcessor};
use crate::queues::{HandlerOutcome, WorkItemHandler};
use crate::rules::element_str;
use crate::storage::{duplicate_area, FilesystemMonitor, QueueState, StudyStorageLocation};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dicom_core::{DataElement, PrimitiveValue, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_object::mem::InMemDicomObject;
use dicom_object::FileDicomObject;
use std::path::Path;
use std::sync::Arc;
use study_index::{StudyAttributes, StudyIndex};
use tracing::{info, warn};
use uuid::Uuid;

/// How to file a batch of parked conflicting instances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Accept into the target study unchanged.
    ProcessAsIs,
    /// The instances belong to a different, existing study.
    Merge { target_study_uid: String },
    /// Spin up a new study for them.
    CreateNew,
}

impl Disposition {
    /// The operator-chosen disposition recorded on a work item's payload.
    pub fn from_payload(payload: &serde_json::Value) -> Option<Self> {
        match payload.get("disposition")?.as_str()? {
            "process-as-is" => Some(Disposition::ProcessAsIs),
            "create-new" => Some(Disposition::CreateNew),
            "merge" => payload
                .get("target_study_uid")
                .and_then(|t| t.as_str())
                .map(|t| Disposition::Merge {
                    target_study_uid: t.to_string(),
                }),
            _ => None,
        }
    }
}

/// Identity attributes rewritten on merge, with their VRs.
const MERGE_TAGS: &[(Tag, VR, &str)] = &[
    (tags::PATIENT_NAME, VR::PN, "PatientName"),
    (tags::PATIENT_ID, VR::LO, "PatientID"),
    (tags::PATIENT_BIRTH_DATE, VR::DA, "PatientBirthDate"),
    (tags::ACCESSION_NUMBER, VR::SH, "AccessionNumber"),
];

/// Replays parked conflicting instances into their resolved destination.
///
/// Every resolution is recorded as an immutable history record before the
/// work item is considered done, so decisions stay auditable and a
/// reprocessed batch is a no-op instead of a second side effect.
pub struct ReconcileEngine {
    processor: Arc<SopInstanceProcessor>,
    monitor: Arc<FilesystemMonitor>,
    auto_disposition: Option<AutoDisposition>,
}

impl ReconcileEngine {
    pub fn new(
        processor: Arc<SopInstanceProcessor>,
        monitor: Arc<FilesystemMonitor>,
        auto_disposition: Option<AutoDisposition>,
    ) -> Self {
        Self {
            processor,
            monitor,
            auto_disposition,
        }
    }

    pub fn auto_disposition(&self) -> Option<Disposition> {
        match self.auto_disposition {
            Some(AutoDisposition::ProcessAsIs) => Some(Disposition::ProcessAsIs),
            Some(AutoDisposition::CreateNew) => Some(Disposition::CreateNew),
            None => None,
        }
    }

    /// Resolve one reconcile work item with the given disposition.
    pub async fn resolve(
        &self,
        item: &WorkQueueEntry,
        disposition: Disposition,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let store = self.processor.store().clone();
        let uids = store.work_queue_uids(&item.id)?;
        if uids.is_empty() {
            info!("Reconcile item {} has no files attached, nothing to do", item.id);
            return Ok(());
        }

        // The parked files live under the filesystem of the study they were
        // originally addressed to.
        let origin = store
            .study_location(&item.partition, &item.study_instance_uid)?
            .ok_or_else(|| {
                ArchiveError::store(format!(
                    "no storage location for study {}",
                    item.study_instance_uid
                ))
            })?;
        let park_root = self.processor.filesystem_root(&origin.filesystem_key)?;

        let (target, decision) = match &disposition {
            Disposition::ProcessAsIs => {
                let target_uid = self
                    .recorded_target(&item.partition, &item.study_instance_uid)?
                    .unwrap_or_else(|| item.study_instance_uid.clone());
                let target = store
                    .study_location(&item.partition, &target_uid)?
                    .ok_or_else(|| {
                        ArchiveError::store(format!("no storage location for study {}", target_uid))
                    })?;
                (target, ReconcileDecision::ProcessAsIs)
            }
            Disposition::Merge { target_study_uid } => {
                let target = store
                    .study_location(&item.partition, target_study_uid)?
                    .ok_or_else(|| {
                        ArchiveError::store(format!(
                            "merge target study {} has no storage location",
                            target_study_uid
                        ))
                    })?;
                (
                    target,
                    ReconcileDecision::Merge {
                        target_study_uid: target_study_uid.clone(),
                    },
                )
            }
            Disposition::CreateNew => {
                let new_uid = format!("2.25.{}", Uuid::new_v4().as_u128());
                let fs = self
                    .monitor
                    .select_filesystem()
                    .await
                    .ok_or(ArchiveError::NoWritableFilesystem)?;
                let target = StudyStorageLocation::new(
                    &item.partition,
                    &new_uid,
                    &fs.key,
                    origin.transfer_syntax_uid.clone(),
                    now,
                );
                (
                    target,
                    ReconcileDecision::CreateNew {
                        new_study_uid: new_uid,
                    },
                )
            }
        };

        if !target.is_updatable() {
            return Err(ArchiveError::StudyNotUpdatable(
                target.study_instance_uid.clone(),
            ));
        }

        let target_attributes = self.target_attributes(&target)?;
        let mut changes = Vec::new();
        let mut replayed = Vec::new();
        let mut succeeded = 0usize;
        let mut failed = 0usize;
        let mut last_error: Option<ArchiveError> = None;

        for uid in &uids {
            let path = park_root.join(&uid.relative_path);
            let mut object = match dicom_object::open_file(&path) {
                Ok(object) => object,
                Err(e) => {
                    warn!("Cannot read parked file {}: {}", path.display(), e);
                    failed += 1;
                    last_error = Some(ArchiveError::dicom(e));
                    continue;
                }
            };

            match &decision {
                ReconcileDecision::Merge { .. } | ReconcileDecision::CreateNew { .. } => {
                    changes.extend(retarget_object(
                        &mut object,
                        &target.study_instance_uid,
                        &target_attributes,
                    ));
                }
                // Process-as-is keeps the instance's own attributes; only a
                // previously recorded destination changes where it files.
                _ => {
                    changes.extend(retarget_object(
                        &mut object,
                        &target.study_instance_uid,
                        &StudyAttributes::default(),
                    ));
                }
            }

            match self
                .processor
                .process_object(&mut object, ProcessMode::ReconcilePass, Some(&target), now)
                .await
            {
                Ok(report) => {
                    succeeded += 1;
                    replayed.push(report.sop_instance_uid);
                    self.cleanup_instance(uid, &path)?;
                }
                Err(e @ ArchiveError::InstanceAlreadyExists { .. }) => {
                    warn!(
                        "Instance {} collides during reconcile, routing to duplicates: {}",
                        uid.sop_instance_uid, e
                    );
                    self.route_to_duplicates(uid, &path, &park_root, &item.partition, now)?;
                    failed += 1;
                    last_error = Some(e);
                }
                Err(e) => {
                    warn!(
                        "Replaying instance {} failed: {}",
                        uid.sop_instance_uid, e
                    );
                    failed += 1;
                    last_error = Some(e);
                }
            }
        }

        if succeeded == 0 {
            if let Some(e) = last_error {
                return Err(e);
            }
        }

        // Record the resolution before the item is considered complete.
        let mut processor = CommandProcessor::new(format!("Resolve reconcile {}", item.id));
        processor.add(Box::new(InsertReconcileHistoryCommand::new(
            ReconcileHistoryRecord::new(
                &item.partition,
                &item.study_instance_uid,
                decision,
                serde_json::json!({
                    "replayed": succeeded,
                    "failed": failed,
                    "changes": changes,
                }),
                replayed,
                now,
            ),
        )))?;
        let mut idle_origin = store
            .study_location(&item.partition, &item.study_instance_uid)?
            .unwrap_or(origin);
        idle_origin.queue_state = QueueState::Idle;
        idle_origin.last_accessed = now;
        processor.add(Box::new(UpsertStudyLocationCommand::new(idle_origin)))?;

        let mut ctx = CommandContext::new(store.clone());
        if !processor.execute(&mut ctx) {
            return Err(processor.into_failure());
        }

        info!(
            "Reconcile item {} resolved: {} replayed, {} failed",
            item.id, succeeded, failed
        );
        Ok(())
    }

    /// The destination a previous resolution of this study recorded, if any.
    fn recorded_target(&self, partition: &str, study_uid: &str) -> Result<Option<String>> {
        let history = self
            .processor
            .store()
            .reconcile_history(partition, study_uid)?;
        Ok(history.iter().rev().find_map(|record| match &record.decision {
            ReconcileDecision::Merge { target_study_uid } => Some(target_study_uid.clone()),
            ReconcileDecision::CreateNew { new_study_uid } => Some(new_study_uid.clone()),
            _ => None,
        }))
    }

    fn target_attributes(&self, target: &StudyStorageLocation) -> Result<StudyAttributes> {
        let root = self.processor.filesystem_root(&target.filesystem_key)?;
        let index = StudyIndex::load_or_new(
            &target.study_path(&root),
            &target.study_instance_uid,
        )?;
        Ok(index.attributes)
    }

    /// Remove a landed instance's parked file and its queue row together.
    fn cleanup_instance(&self, uid: &WorkQueueUid, path: &Path) -> Result<()> {
        let mut processor = CommandProcessor::new(format!("Clear parked {}", uid.sop_instance_uid));
        processor.add(Box::new(DeleteFileCommand::new(path.to_path_buf())))?;
        processor.add(Box::new(DeleteWorkQueueUidCommand::new(uid.id.clone())))?;
        let mut ctx = CommandContext::new(self.processor.store().clone());
        if !processor.execute(&mut ctx) {
            return Err(processor.into_failure());
        }
        Ok(())
    }

    /// Move a colliding parked file into the duplicates area and drop its
    /// queue row; an operator reviews it from there.
    fn route_to_duplicates(
        &self,
        uid: &WorkQueueUid,
        path: &Path,
        park_root: &Path,
        partition: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let group = self.processor.instance_group(now);
        let area = duplicate_area(park_root, partition, &group);
        std::fs::create_dir_all(&area)?;
        let dest = area.join(format!("{}.{}.dcm", uid.sop_instance_uid, Uuid::new_v4()));
        std::fs::rename(path, &dest)?;

        let mut processor =
            CommandProcessor::new(format!("Route duplicate {}", uid.sop_instance_uid));
        processor.add(Box::new(DeleteWorkQueueUidCommand::new(uid.id.clone())))?;
        let mut ctx = CommandContext::new(self.processor.store().clone());
        if !processor.execute(&mut ctx) {
            return Err(processor.into_failure());
        }
        Ok(())
    }
}

/// Rewrite the study-level identity attributes of a parked object to its
/// new destination, returning a change record per rewritten tag.
fn retarget_object(
    object: &mut FileDicomObject<InMemDicomObject>,
    target_study_uid: &str,
    target_attributes: &StudyAttributes,
) -> Vec<serde_json::Value> {
    let mut changes = Vec::new();

    let current_uid = element_str(object, tags::STUDY_INSTANCE_UID).unwrap_or_default();
    if current_uid != target_study_uid {
        object.put(DataElement::new(
            tags::STUDY_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(target_study_uid),
        ));
        changes.push(serde_json::json!({
            "attribute": "StudyInstanceUID",
            "from": current_uid,
            "to": target_study_uid,
        }));
    }

    for (tag, vr, keyword) in MERGE_TAGS {
        let Some(expected) = target_attributes.get(keyword) else {
            continue;
        };
        let current = element_str(object, *tag).unwrap_or_default();
        if current != expected {
            object.put(DataElement::new(*tag, *vr, PrimitiveValue::from(expected)));
            changes.push(serde_json::json!({
                "attribute": keyword,
                "from": current,
                "to": expected,
            }));
        }
    }
    changes
}

/// Work-queue handler driving the engine. Items with neither an operator
/// disposition nor an automatic policy are deferred, not failed.
pub struct ReconcileHandler {
    engine: Arc<ReconcileEngine>,
}

impl ReconcileHandler {
    pub fn new(engine: Arc<ReconcileEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl WorkItemHandler for ReconcileHandler {
    async fn handle(&self, entry: &WorkQueueEntry) -> Result<HandlerOutcome> {
        let disposition =
            Disposition::from_payload(&entry.payload).or_else(|| self.engine.auto_disposition());
        match disposition {
            Some(disposition) => {
                self.engine.resolve(entry, disposition, Utc::now()).await?;
                Ok(HandlerOutcome::Complete)
            }
            None => {
                info!(
                    "Reconcile item {} awaiting operator disposition",
                    entry.id
                );
                Ok(HandlerOutcome::Defer)
            }
        }
    }
}

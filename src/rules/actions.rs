use crate::command::{
    CommandProcessor, InsertAccessGrantCommand, InsertFilesystemQueueCommand,
    InsertWorkQueueCommand,
};
use crate::error::Result;
use crate::persistence::{
    AccessGrant, FilesystemQueueEntry, FilesystemQueueKind, WorkKind, WorkQueueEntry,
};
use crate::rules::{RuleCompileError, RuleContext};
use chrono::{DateTime, Duration, Utc};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Minutes,
    Hours,
    Days,
    Weeks,
}

impl TimeUnit {
    pub fn parse(raw: &str) -> std::result::Result<Self, RuleCompileError> {
        match raw.to_ascii_lowercase().as_str() {
            "minutes" => Ok(TimeUnit::Minutes),
            "hours" => Ok(TimeUnit::Hours),
            "days" => Ok(TimeUnit::Days),
            "weeks" => Ok(TimeUnit::Weeks),
            other => Err(RuleCompileError::UnknownTimeUnit(other.to_string())),
        }
    }
}

/// Signed schedule offset relative to an evaluated base time.
#[derive(Debug, Clone, Copy)]
pub struct Offset {
    pub time: i64,
    pub unit: TimeUnit,
}

impl Offset {
    fn duration(&self) -> Duration {
        match self.unit {
            TimeUnit::Minutes => Duration::minutes(self.time),
            TimeUnit::Hours => Duration::hours(self.time),
            TimeUnit::Days => Duration::days(self.time),
            TimeUnit::Weeks => Duration::weeks(self.time),
        }
    }
}

/// A compiled action of a rule. Scheduling an action only ever appends
/// commands to the caller's processor, so the enqueued work shares the
/// atomic unit of the event that triggered it.
#[derive(Debug, Clone)]
pub enum ActionItem {
    AutoRoute {
        device: String,
        offset: Option<Offset>,
        ref_value: Option<String>,
    },
    CompressLossless {
        codec: String,
        offset: Option<Offset>,
        ref_value: Option<String>,
    },
    CompressLossy {
        codec: String,
        ratio: Option<f64>,
        quality: Option<u8>,
        offset: Option<Offset>,
        ref_value: Option<String>,
    },
    GrantAccess {
        group: String,
    },
}

/// Resolve the scheduled time: the reference field when given and
/// resolvable, otherwise the processing clock, plus the offset.
fn scheduled_at(
    ctx: &RuleContext,
    ref_value: Option<&str>,
    offset: Option<Offset>,
) -> DateTime<Utc> {
    let base = ref_value
        .and_then(|field| ctx.datetime(field))
        .unwrap_or(ctx.now);
    match offset {
        Some(offset) => base + offset.duration(),
        None => base,
    }
}

impl ActionItem {
    /// Append this action's enqueue command to `processor`. Returns false
    /// when the action was skipped because it references an unknown device
    /// or authority group.
    pub fn schedule(
        &self,
        ctx: &RuleContext,
        known_devices: &[String],
        known_groups: &[String],
        max_retries: u32,
        processor: &mut CommandProcessor,
    ) -> Result<bool> {
        let location = ctx.location;
        match self {
            ActionItem::AutoRoute {
                device,
                offset,
                ref_value,
            } => {
                if !known_devices.is_empty() && !known_devices.contains(device) {
                    warn!(
                        "Auto-route for study {} references unknown device '{}', skipping",
                        location.study_instance_uid, device
                    );
                    return Ok(false);
                }
                let entry = WorkQueueEntry::new(
                    WorkKind::AutoRoute,
                    location.partition.clone(),
                    location.study_instance_uid.clone(),
                    scheduled_at(ctx, ref_value.as_deref(), *offset),
                    max_retries,
                )
                .with_payload(serde_json::json!({ "device": device }));
                processor.add(Box::new(InsertWorkQueueCommand::new(entry)))?;
            }
            ActionItem::CompressLossless {
                codec,
                offset,
                ref_value,
            } => {
                let entry = FilesystemQueueEntry::new(
                    FilesystemQueueKind::LosslessCompress,
                    location.filesystem_key.clone(),
                    location.partition.clone(),
                    location.study_instance_uid.clone(),
                    scheduled_at(ctx, ref_value.as_deref(), *offset),
                )
                .with_payload(serde_json::json!({ "codec": codec }));
                processor.add(Box::new(InsertFilesystemQueueCommand::new(entry)))?;
            }
            ActionItem::CompressLossy {
                codec,
                ratio,
                quality,
                offset,
                ref_value,
            } => {
                let entry = FilesystemQueueEntry::new(
                    FilesystemQueueKind::LossyCompress,
                    location.filesystem_key.clone(),
                    location.partition.clone(),
                    location.study_instance_uid.clone(),
                    scheduled_at(ctx, ref_value.as_deref(), *offset),
                )
                .with_payload(serde_json::json!({
                    "codec": codec,
                    "ratio": ratio,
                    "quality": quality,
                }));
                processor.add(Box::new(InsertFilesystemQueueCommand::new(entry)))?;
            }
            ActionItem::GrantAccess { group } => {
                if !known_groups.is_empty() && !known_groups.contains(group) {
                    warn!(
                        "Grant-access for study {} references unknown authority group '{}', skipping",
                        location.study_instance_uid, group
                    );
                    return Ok(false);
                }
                let grant = AccessGrant::new(
                    location.partition.clone(),
                    location.study_instance_uid.clone(),
                    group.clone(),
                    ctx.now,
                );
                processor.add(Box::new(InsertAccessGrantCommand::new(grant)))?;
            }
        }
        Ok(true)
    }
}

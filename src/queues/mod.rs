//! Work-queue consumption: polling/lease claim model with bounded retries.
//!
//! A consumer claims a batch of due items, stamps a lease on each, and
//! marks every item complete or failed individually. Items whose lease
//! expires without completion become claimable again, so a crashed worker
//! never strands its batch.

use crate::config::QueueConfig;
use crate::error::{ArchiveError, Result};
use crate::persistence::{is_claimable, ArchiveStore, WorkKind, WorkQueueEntry, WorkStatus};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Claim up to `batch` due items of the given kinds, marking each
/// `Processing` with a fresh lease inside one store transaction.
pub fn claim_pending(
    store: &dyn ArchiveStore,
    kinds: &[WorkKind],
    now: DateTime<Utc>,
    batch: usize,
    lease: Duration,
) -> Result<Vec<WorkQueueEntry>> {
    let mut txn = store.begin_update()?;
    let mut due: Vec<WorkQueueEntry> = txn
        .list_work_queue()?
        .into_iter()
        .filter(|entry| kinds.contains(&entry.kind) && is_claimable(entry, now))
        .collect();
    due.sort_by_key(|entry| entry.scheduled_at);
    due.truncate(batch);

    let mut claimed = Vec::with_capacity(due.len());
    for mut entry in due {
        if entry.status == WorkStatus::Processing {
            warn!(
                "Reclaiming work item {} after lease expiry (retry {})",
                entry.id, entry.retry_count
            );
        }
        entry.status = WorkStatus::Processing;
        entry.lease_expires_at = Some(now + lease);
        txn.update_work_queue(&entry)?;
        claimed.push(entry);
    }
    txn.commit()?;
    Ok(claimed)
}

/// Mark a claimed item complete.
pub fn complete(store: &dyn ArchiveStore, id: &str) -> Result<()> {
    let mut entry = store
        .work_queue_entry(id)?
        .ok_or_else(|| ArchiveError::store(format!("work item {} not found", id)))?;
    entry.status = WorkStatus::Complete;
    entry.lease_expires_at = None;
    entry.failure_reason = None;
    let mut txn = store.begin_update()?;
    txn.update_work_queue(&entry)?;
    txn.commit()
}

/// Record a failure. While retries remain the item is rescheduled back to
/// `Pending`; otherwise it parks in terminal `Failed` with its reason and
/// retry count visible to operators.
pub fn fail(
    store: &dyn ArchiveStore,
    id: &str,
    reason: &str,
    now: DateTime<Utc>,
    retry_delay: Duration,
) -> Result<()> {
    let mut entry = store
        .work_queue_entry(id)?
        .ok_or_else(|| ArchiveError::store(format!("work item {} not found", id)))?;
    entry.retry_count += 1;
    entry.failure_reason = Some(reason.to_string());
    entry.lease_expires_at = None;
    if entry.retry_count < entry.max_retries {
        entry.status = WorkStatus::Pending;
        entry.scheduled_at = now + retry_delay;
        info!(
            "Work item {} failed ({}), rescheduled (retry {}/{})",
            id, reason, entry.retry_count, entry.max_retries
        );
    } else {
        entry.status = WorkStatus::Failed;
        warn!(
            "Work item {} permanently failed after {} retries: {}",
            id, entry.retry_count, reason
        );
    }
    let mut txn = store.begin_update()?;
    txn.update_work_queue(&entry)?;
    txn.commit()
}

/// Park an item in terminal `Failed` immediately, without consuming the
/// remaining retries. Used for defects retrying cannot fix.
pub fn fail_permanently(store: &dyn ArchiveStore, id: &str, reason: &str) -> Result<()> {
    let mut entry = store
        .work_queue_entry(id)?
        .ok_or_else(|| ArchiveError::store(format!("work item {} not found", id)))?;
    entry.status = WorkStatus::Failed;
    entry.failure_reason = Some(reason.to_string());
    entry.lease_expires_at = None;
    warn!("Work item {} permanently failed: {}", id, reason);
    let mut txn = store.begin_update()?;
    txn.update_work_queue(&entry)?;
    txn.commit()
}

/// Release a claimed item back to `Pending` without counting a retry.
/// Used when the item is not ready to run (e.g. awaiting an operator
/// decision).
pub fn release(
    store: &dyn ArchiveStore,
    id: &str,
    next_attempt: DateTime<Utc>,
) -> Result<()> {
    let mut entry = store
        .work_queue_entry(id)?
        .ok_or_else(|| ArchiveError::store(format!("work item {} not found", id)))?;
    entry.status = WorkStatus::Pending;
    entry.scheduled_at = next_attempt;
    entry.lease_expires_at = None;
    let mut txn = store.begin_update()?;
    txn.update_work_queue(&entry)?;
    txn.commit()
}

/// Cancel an item that has not been claimed. Claimed items run to
/// completion or failure; they cannot be cancelled mid-flight.
pub fn cancel(store: &dyn ArchiveStore, id: &str) -> Result<()> {
    let entry = store
        .work_queue_entry(id)?
        .ok_or_else(|| ArchiveError::store(format!("work item {} not found", id)))?;
    if entry.status != WorkStatus::Pending {
        return Err(ArchiveError::store(format!(
            "work item {} is {:?} and cannot be cancelled",
            id, entry.status
        )));
    }
    let mut txn = store.begin_update()?;
    txn.delete_work_queue(id)?;
    txn.commit()
}

/// What a handler did with a claimed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    Complete,
    /// Not ready to run; put it back in `Pending` without counting a retry.
    Defer,
}

/// Handles one kind of claimed work item.
#[async_trait]
pub trait WorkItemHandler: Send + Sync {
    async fn handle(&self, entry: &WorkQueueEntry) -> Result<HandlerOutcome>;
}

/// Polls the work queue and dispatches claimed items to the handlers
/// registered for their kind. Kinds without a handler are produced for
/// external services and are never claimed here.
pub struct WorkQueueConsumer {
    store: Arc<dyn ArchiveStore>,
    handlers: HashMap<WorkKind, Arc<dyn WorkItemHandler>>,
    batch_size: usize,
    lease: Duration,
    retry_delay: Duration,
}

impl WorkQueueConsumer {
    pub fn new(store: Arc<dyn ArchiveStore>, config: &QueueConfig) -> Self {
        Self {
            store,
            handlers: HashMap::new(),
            batch_size: config.batch_size,
            lease: Duration::seconds(config.lease_secs as i64),
            retry_delay: Duration::seconds(config.retry_delay_secs as i64),
        }
    }

    pub fn register(&mut self, kind: WorkKind, handler: Arc<dyn WorkItemHandler>) {
        self.handlers.insert(kind, handler);
    }

    /// One poll cycle: claim a batch and process it, marking each item
    /// individually. Returns the number of items processed.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<usize> {
        let kinds: Vec<WorkKind> = self.handlers.keys().copied().collect();
        if kinds.is_empty() {
            return Ok(0);
        }
        let claimed = claim_pending(
            self.store.as_ref(),
            &kinds,
            now,
            self.batch_size,
            self.lease,
        )?;
        let count = claimed.len();
        for entry in claimed {
            let Some(handler) = self.handlers.get(&entry.kind) else {
                continue;
            };
            debug!("Processing work item {} ({:?})", entry.id, entry.kind);
            match handler.handle(&entry).await {
                Ok(HandlerOutcome::Complete) => complete(self.store.as_ref(), &entry.id)?,
                Ok(HandlerOutcome::Defer) => release(
                    self.store.as_ref(),
                    &entry.id,
                    Utc::now() + self.retry_delay,
                )?,
                Err(e) if e.is_recoverable() => {
                    error!("Work item {} failed: {}", entry.id, e);
                    fail(
                        self.store.as_ref(),
                        &entry.id,
                        &e.to_string(),
                        Utc::now(),
                        self.retry_delay,
                    )?;
                }
                Err(e) => {
                    error!("Work item {} failed fatally: {}", entry.id, e);
                    fail_permanently(self.store.as_ref(), &entry.id, &e.to_string())?;
                }
            }
        }
        Ok(count)
    }

    /// Spawn the polling loop.
    pub fn spawn(self: Arc<Self>, poll_interval: std::time::Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if let Err(e) = self.run_once(Utc::now()).await {
                    error!("Work queue poll failed: {}", e);
                }
                tokio::time::sleep(poll_interval).await;
            }
        })
    }
}

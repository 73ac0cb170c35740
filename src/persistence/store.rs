use crate::error::{ArchiveError, Result};
use crate::persistence::{
    AccessGrant, ArchiveStore, FilesystemQueueEntry, ReconcileHistoryRecord, UpdateContext,
    WorkKind, WorkQueueEntry, WorkQueueUid,
};
use crate::storage::StudyStorageLocation;
use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

const STUDY_LOCATIONS: TableDefinition<&str, &str> = TableDefinition::new("study_locations");
const WORK_QUEUE: TableDefinition<&str, &str> = TableDefinition::new("work_queue");
const WORK_QUEUE_UIDS: TableDefinition<&str, &str> = TableDefinition::new("work_queue_uids");
const FILESYSTEM_QUEUE: TableDefinition<&str, &str> = TableDefinition::new("filesystem_queue");
const RECONCILE_HISTORY: TableDefinition<&str, &str> = TableDefinition::new("reconcile_history");
const ACCESS_GRANTS: TableDefinition<&str, &str> = TableDefinition::new("access_grants");

const ALL_TABLES: &[TableDefinition<&str, &str>] = &[
    STUDY_LOCATIONS,
    WORK_QUEUE,
    WORK_QUEUE_UIDS,
    FILESYSTEM_QUEUE,
    RECONCILE_HISTORY,
    ACCESS_GRANTS,
];

fn encode<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| ArchiveError::store(format!("encode: {}", e)))
}

fn decode<T: DeserializeOwned>(raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| ArchiveError::store(format!("decode: {}", e)))
}

/// Embedded state store: one redb database, string-keyed tables holding
/// JSON-serialized entities.
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open (or create) the database at `path` and make sure every table
    /// exists, so later read transactions never race table creation.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        tracing::info!("Opening state database: {}", path.display());
        let db = Database::create(path)
            .map_err(|e| ArchiveError::store(format!("open database: {}", e)))?;

        let txn = db
            .begin_write()
            .map_err(|e| ArchiveError::store(format!("begin write: {}", e)))?;
        for table in ALL_TABLES {
            txn.open_table(*table)
                .map_err(|e| ArchiveError::store(format!("open table: {}", e)))?;
        }
        txn.commit()
            .map_err(|e| ArchiveError::store(format!("initialize tables: {}", e)))?;

        Ok(Self { db: Arc::new(db) })
    }

    fn get_one<T: DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &str>,
        key: &str,
    ) -> Result<Option<T>> {
        let txn = self
            .db
            .begin_read()
            .map_err(|e| ArchiveError::store(format!("begin read: {}", e)))?;
        let table = txn
            .open_table(table)
            .map_err(|e| ArchiveError::store(format!("open table: {}", e)))?;
        let guard = table
            .get(key)
            .map_err(|e| ArchiveError::store(format!("get: {}", e)))?;
        match guard {
            Some(g) => Ok(Some(decode(g.value())?)),
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(&self, table: TableDefinition<&str, &str>) -> Result<Vec<T>> {
        let txn = self
            .db
            .begin_read()
            .map_err(|e| ArchiveError::store(format!("begin read: {}", e)))?;
        let table = txn
            .open_table(table)
            .map_err(|e| ArchiveError::store(format!("open table: {}", e)))?;
        let mut out = Vec::new();
        let iter = table
            .iter()
            .map_err(|e| ArchiveError::store(format!("iterate: {}", e)))?;
        for item in iter {
            let (_, value) = item.map_err(|e| ArchiveError::store(format!("iterate: {}", e)))?;
            out.push(decode(value.value())?);
        }
        Ok(out)
    }
}

impl ArchiveStore for RedbStore {
    fn begin_update(&self) -> Result<Box<dyn UpdateContext>> {
        let txn = self
            .db
            .begin_write()
            .map_err(|e| ArchiveError::store(format!("begin write: {}", e)))?;
        Ok(Box::new(RedbUpdateContext { txn }))
    }

    fn study_location(
        &self,
        partition: &str,
        study_instance_uid: &str,
    ) -> Result<Option<StudyStorageLocation>> {
        let key = location_key(partition, study_instance_uid);
        self.get_one(STUDY_LOCATIONS, &key)
    }

    fn work_queue_entry(&self, id: &str) -> Result<Option<WorkQueueEntry>> {
        self.get_one(WORK_QUEUE, id)
    }

    fn work_queue_entries(&self) -> Result<Vec<WorkQueueEntry>> {
        self.scan(WORK_QUEUE)
    }

    fn work_queue_uids(&self, work_queue_id: &str) -> Result<Vec<WorkQueueUid>> {
        let all: Vec<WorkQueueUid> = self.scan(WORK_QUEUE_UIDS)?;
        Ok(all
            .into_iter()
            .filter(|u| u.work_queue_id == work_queue_id)
            .collect())
    }

    fn find_reconcile_item(
        &self,
        partition: &str,
        study_instance_uid: &str,
        group: &str,
    ) -> Result<Option<WorkQueueEntry>> {
        let all: Vec<WorkQueueEntry> = self.scan(WORK_QUEUE)?;
        Ok(all.into_iter().find(|e| {
            e.kind == WorkKind::ReconcileStudy
                && !e.is_terminal()
                && e.partition == partition
                && e.study_instance_uid == study_instance_uid
                && e.payload.get("group").and_then(|g| g.as_str()) == Some(group)
        }))
    }

    fn reconcile_history(
        &self,
        partition: &str,
        study_instance_uid: &str,
    ) -> Result<Vec<ReconcileHistoryRecord>> {
        let all: Vec<ReconcileHistoryRecord> = self.scan(RECONCILE_HISTORY)?;
        let mut records: Vec<_> = all
            .into_iter()
            .filter(|r| r.partition == partition && r.study_instance_uid == study_instance_uid)
            .collect();
        records.sort_by_key(|r| r.recorded_at);
        Ok(records)
    }

    fn filesystem_queue_entries(
        &self,
        study_instance_uid: &str,
    ) -> Result<Vec<FilesystemQueueEntry>> {
        let all: Vec<FilesystemQueueEntry> = self.scan(FILESYSTEM_QUEUE)?;
        Ok(all
            .into_iter()
            .filter(|e| e.study_instance_uid == study_instance_uid)
            .collect())
    }

    fn access_grants(
        &self,
        partition: &str,
        study_instance_uid: &str,
    ) -> Result<Vec<AccessGrant>> {
        let all: Vec<AccessGrant> = self.scan(ACCESS_GRANTS)?;
        Ok(all
            .into_iter()
            .filter(|g| g.partition == partition && g.study_instance_uid == study_instance_uid)
            .collect())
    }
}

fn location_key(partition: &str, study_instance_uid: &str) -> String {
    format!("{}/{}", partition, study_instance_uid)
}

struct RedbUpdateContext {
    txn: WriteTransaction,
}

impl RedbUpdateContext {
    fn insert(&mut self, table: TableDefinition<&str, &str>, key: &str, raw: &str) -> Result<()> {
        let mut table = self
            .txn
            .open_table(table)
            .map_err(|e| ArchiveError::store(format!("open table: {}", e)))?;
        table
            .insert(key, raw)
            .map_err(|e| ArchiveError::store(format!("insert: {}", e)))?;
        Ok(())
    }

    fn remove(&mut self, table: TableDefinition<&str, &str>, key: &str) -> Result<()> {
        let mut table = self
            .txn
            .open_table(table)
            .map_err(|e| ArchiveError::store(format!("open table: {}", e)))?;
        table
            .remove(key)
            .map_err(|e| ArchiveError::store(format!("remove: {}", e)))?;
        Ok(())
    }
}

impl UpdateContext for RedbUpdateContext {
    fn upsert_study_location(&mut self, location: &StudyStorageLocation) -> Result<()> {
        let key = location_key(&location.partition, &location.study_instance_uid);
        // At most one active storage location per study per partition: a
        // record may only be replaced by an update of itself, never by a
        // second active location somewhere else.
        {
            let table = self
                .txn
                .open_table(STUDY_LOCATIONS)
                .map_err(|e| ArchiveError::store(format!("open table: {}", e)))?;
            let existing_raw = table
                .get(key.as_str())
                .map_err(|e| ArchiveError::store(format!("get: {}", e)))?;
            if let Some(existing) = existing_raw {
                let existing: StudyStorageLocation = decode(existing.value())?;
                if existing.is_active()
                    && location.is_active()
                    && existing.filesystem_key != location.filesystem_key
                {
                    return Err(ArchiveError::store(format!(
                        "study {} already has an active location on '{}'",
                        location.study_instance_uid, existing.filesystem_key
                    )));
                }
            }
        }
        let raw = encode(location)?;
        self.insert(STUDY_LOCATIONS, &key, &raw)
    }

    fn insert_work_queue(&mut self, entry: &WorkQueueEntry) -> Result<()> {
        let raw = encode(entry)?;
        self.insert(WORK_QUEUE, &entry.id, &raw)
    }

    fn update_work_queue(&mut self, entry: &WorkQueueEntry) -> Result<()> {
        let raw = encode(entry)?;
        self.insert(WORK_QUEUE, &entry.id, &raw)
    }

    fn delete_work_queue(&mut self, id: &str) -> Result<()> {
        self.remove(WORK_QUEUE, id)
    }

    fn list_work_queue(&mut self) -> Result<Vec<WorkQueueEntry>> {
        let table = self
            .txn
            .open_table(WORK_QUEUE)
            .map_err(|e| ArchiveError::store(format!("open table: {}", e)))?;
        let mut out = Vec::new();
        let iter = table
            .iter()
            .map_err(|e| ArchiveError::store(format!("iterate: {}", e)))?;
        for item in iter {
            let (_, value) = item.map_err(|e| ArchiveError::store(format!("iterate: {}", e)))?;
            out.push(decode(value.value())?);
        }
        Ok(out)
    }

    fn insert_work_queue_uid(&mut self, uid: &WorkQueueUid) -> Result<()> {
        let raw = encode(uid)?;
        self.insert(WORK_QUEUE_UIDS, &uid.id, &raw)
    }

    fn delete_work_queue_uid(&mut self, id: &str) -> Result<()> {
        self.remove(WORK_QUEUE_UIDS, id)
    }

    fn insert_filesystem_queue(&mut self, entry: &FilesystemQueueEntry) -> Result<()> {
        let raw = encode(entry)?;
        self.insert(FILESYSTEM_QUEUE, &entry.id, &raw)
    }

    fn insert_reconcile_history(&mut self, record: &ReconcileHistoryRecord) -> Result<()> {
        let raw = encode(record)?;
        self.insert(RECONCILE_HISTORY, &record.id, &raw)
    }

    fn insert_access_grant(&mut self, grant: &AccessGrant) -> Result<()> {
        let raw = encode(grant)?;
        self.insert(ACCESS_GRANTS, &grant.id, &raw)
    }

    fn commit(self: Box<Self>) -> Result<()> {
        self.txn
            .commit()
            .map_err(|e| ArchiveError::store(format!("commit: {}", e)))
    }

    fn rollback(self: Box<Self>) -> Result<()> {
        self.txn
            .abort()
            .map_err(|e| ArchiveError::store(format!("abort: {}", e)))
    }
}

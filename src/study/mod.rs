//! Per-study serialization.
//!
//! The study folder and its header index are not safe for concurrent
//! mutation, so every operation against one study takes its lock first.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::Arc;

/// Hands out one async mutex per Study Instance UID. Worker tasks hold the
/// guard for the whole per-instance operation (file write, index update,
/// store commit).
#[derive(Default)]
pub struct StudyLockMap {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl StudyLockMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_for(&self, study_instance_uid: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.entry(study_instance_uid.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

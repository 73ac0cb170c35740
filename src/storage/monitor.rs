use crate::config::FilesystemConfig;
use crate::storage::FilesystemState;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Tracks the configured storage filesystems and picks a destination for
/// new studies.
///
/// Usage figures live in an in-memory snapshot refreshed by a background
/// task; `select_filesystem` never touches the disk.
pub struct FilesystemMonitor {
    snapshot: Arc<RwLock<Vec<FilesystemState>>>,
}

impl FilesystemMonitor {
    pub fn new(configs: &[FilesystemConfig]) -> Self {
        let states = configs.iter().map(FilesystemState::from_config).collect();
        Self {
            snapshot: Arc::new(RwLock::new(states)),
        }
    }

    /// Build a monitor over pre-computed states. Used by tests and by
    /// callers that manage refresh themselves.
    pub fn with_states(states: Vec<FilesystemState>) -> Self {
        Self {
            snapshot: Arc::new(RwLock::new(states)),
        }
    }

    pub async fn snapshot(&self) -> Vec<FilesystemState> {
        self.snapshot.read().await.clone()
    }

    /// Recompute used space for every filesystem by walking its root.
    pub async fn refresh(&self) {
        let roots: Vec<(String, std::path::PathBuf)> = {
            let snap = self.snapshot.read().await;
            snap.iter().map(|fs| (fs.key.clone(), fs.root.clone())).collect()
        };

        for (key, root) in roots {
            let used = walk_used_bytes(&root);
            let mut snap = self.snapshot.write().await;
            if let Some(fs) = snap.iter_mut().find(|fs| fs.key == key) {
                fs.used_bytes = used;
                debug!(
                    "Filesystem '{}': {} bytes used, margin {} bytes",
                    fs.key,
                    used,
                    fs.highwater_margin_bytes()
                );
            }
        }
    }

    /// Pick the destination filesystem for a new study.
    ///
    /// Candidates are the writable filesystems below their high watermark,
    /// ordered by ascending tier, then descending highwater margin, then
    /// ascending key. The key comparison makes the selection a total order:
    /// identical inputs always produce the same choice.
    pub async fn select_filesystem(&self) -> Option<FilesystemState> {
        let snap = self.snapshot.read().await;
        let mut candidates: Vec<&FilesystemState> =
            snap.iter().filter(|fs| fs.accepting()).collect();
        if candidates.is_empty() {
            warn!("No writable filesystem available for a new study");
            return None;
        }
        candidates.sort_by(|a, b| {
            a.tier
                .cmp(&b.tier)
                .then(b.highwater_margin_bytes().cmp(&a.highwater_margin_bytes()))
                .then(a.key.cmp(&b.key))
        });
        candidates.first().map(|fs| (*fs).clone())
    }

    /// Spawn the periodic refresh task.
    pub fn spawn_refresh(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                self.refresh().await;
                tokio::time::sleep(interval).await;
            }
        })
    }
}

fn walk_used_bytes(root: &Path) -> u64 {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}

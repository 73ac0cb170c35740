//! Intake service: sweeps the incoming directory and drives the
//! per-instance processor.

use crate::config::Config;
use crate::error::Result;
use crate::processor::{ProcessingOutcome, SopInstanceProcessor};
use chrono::Utc;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

pub struct IntakeService {
    incoming_dir: PathBuf,
    poll_interval: Duration,
    processor: Arc<SopInstanceProcessor>,
}

impl IntakeService {
    pub fn new(config: &Config, processor: Arc<SopInstanceProcessor>) -> Self {
        Self {
            incoming_dir: PathBuf::from(&config.archive.incoming_dir),
            poll_interval: Duration::from_secs(config.queue.poll_interval_secs),
            processor,
        }
    }

    /// One sweep over the incoming directory. Returns the number of files
    /// handled. Files hit by a recoverable failure (e.g. no writable
    /// filesystem) stay in place for the next sweep; unreadable or
    /// fatally-failed files move to the `failed` subfolder.
    pub async fn sweep_once(&self) -> Result<usize> {
        std::fs::create_dir_all(&self.incoming_dir)?;
        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.incoming_dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_file() && path.extension().map(|ext| ext == "dcm").unwrap_or(false)
            })
            .collect();
        files.sort();

        let mut handled = 0usize;
        let mut touched_studies = BTreeSet::new();
        for path in files {
            let now = Utc::now();
            match self.processor.process_file(&path, now).await {
                Ok(report) => {
                    match report.outcome {
                        ProcessingOutcome::Success => {
                            touched_studies.insert(report.study_instance_uid.clone());
                        }
                        ProcessingOutcome::Duplicate => {
                            info!("Instance {} handled as duplicate", report.sop_instance_uid);
                        }
                        ProcessingOutcome::Reconciled => {
                            info!(
                                "Instance {} queued for reconciliation",
                                report.sop_instance_uid
                            );
                        }
                    }
                    std::fs::remove_file(&path)?;
                    handled += 1;
                }
                Err(e) if e.is_recoverable() => {
                    warn!(
                        "Leaving {} for the next sweep: {}",
                        path.display(),
                        e
                    );
                }
                Err(e) => {
                    error!("Cannot ingest {}: {}", path.display(), e);
                    self.park_failed(&path)?;
                    handled += 1;
                }
            }
        }

        for study_uid in touched_studies {
            if let Err(e) = self.processor.fire_study_processed(&study_uid, Utc::now()) {
                error!("Study rules for {} failed: {}", study_uid, e);
            }
        }
        Ok(handled)
    }

    fn park_failed(&self, path: &std::path::Path) -> Result<()> {
        let failed_dir = self.incoming_dir.join("failed");
        std::fs::create_dir_all(&failed_dir)?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "unnamed.dcm".to_string());
        std::fs::rename(path, failed_dir.join(file_name))?;
        Ok(())
    }

    /// Run the sweep loop until the process is stopped.
    pub async fn run(&self) {
        info!(
            "Watching {} for incoming instances",
            self.incoming_dir.display()
        );
        loop {
            if let Err(e) = self.sweep_once().await {
                error!("Intake sweep failed: {}", e);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

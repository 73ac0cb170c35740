pub mod command;
pub mod config;
pub mod error;
pub mod persistence;
pub mod processor;
pub mod queues;
pub mod reconcile;
pub mod rules;
pub mod service;
pub mod storage;
pub mod study;

use crate::config::Config;
use crate::error::Result;
use crate::persistence::{ArchiveStore, RedbStore, WorkKind};
use crate::processor::SopInstanceProcessor;
use crate::queues::WorkQueueConsumer;
use crate::reconcile::{ReconcileEngine, ReconcileHandler};
use crate::rules::{OperatorRegistry, RulesEngine};
use crate::service::IntakeService;
use crate::storage::FilesystemMonitor;
use crate::study::StudyLockMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{self, prelude::*};

fn init_logging(config: &Config) -> Result<()> {
    if config.logging.log_to_file {
        // Create a file appender
        let file_appender = tracing_subscriber::fmt::layer()
            .with_file(true)
            .with_line_number(true)
            .with_writer(std::fs::File::create(&config.logging.log_file_path)?);

        // Create a stdout appender
        let stdout_appender = tracing_subscriber::fmt::layer()
            .with_file(true)
            .with_line_number(true);

        // Combine both appenders
        tracing_subscriber::registry()
            .with(file_appender)
            .with(stdout_appender)
            .try_init()
            .map_err(|e| error::ArchiveError::internal(format!("logging init: {}", e)))?;
    } else {
        // Just stdout if file logging is disabled
        tracing_subscriber::fmt()
            .with_file(true)
            .with_line_number(true)
            .init();
    }
    Ok(())
}

pub async fn run(config: Config) -> Result<()> {
    init_logging(&config)?;

    tracing::info!("🔧 Starting Strata archive '{}'", config.archive.id);

    let store: Arc<dyn ArchiveStore> =
        Arc::new(RedbStore::open(Path::new(&config.archive.database_path))?);

    let monitor = Arc::new(FilesystemMonitor::new(&config.storage.filesystems));
    monitor.refresh().await;
    let _refresh_task = monitor.clone().spawn_refresh(Duration::from_secs(60));

    let registry = OperatorRegistry::with_builtins();
    let rules = Arc::new(RulesEngine::load(&config.rules, &config.queue, &registry)?);

    let locks = Arc::new(StudyLockMap::new());
    let processor = Arc::new(SopInstanceProcessor::new(
        &config,
        store.clone(),
        monitor.clone(),
        locks,
        rules,
    ));

    let reconcile_engine = Arc::new(ReconcileEngine::new(
        processor.clone(),
        monitor.clone(),
        config.storage.reconcile.auto_disposition,
    ));
    let mut consumer = WorkQueueConsumer::new(store.clone(), &config.queue);
    consumer.register(
        WorkKind::ReconcileStudy,
        Arc::new(ReconcileHandler::new(reconcile_engine)),
    );
    let _consumer_task =
        Arc::new(consumer).spawn(Duration::from_secs(config.queue.poll_interval_secs));

    tracing::info!("🚀 Intake pipeline ready on partition '{}'", config.archive.partition);

    let intake = IntakeService::new(&config, processor);
    intake.run().await;
    Ok(())
}

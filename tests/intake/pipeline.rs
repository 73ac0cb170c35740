use chrono::Utc;
use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::{tags, uids};
use dicom_object::mem::InMemDicomObject;
use dicom_object::meta::FileMetaTableBuilder;
use dicom_object::FileDicomObject;
use std::path::PathBuf;
use std::sync::Arc;
use strata::config::Config;
use strata::persistence::{ArchiveStore, RedbStore, ReconcileDecision, WorkKind};
use strata::processor::{ProcessingOutcome, SopInstanceProcessor};
use strata::rules::RulesEngine;
use strata::storage::{FilesystemMonitor, FilesystemState};
use strata::study::StudyLockMap;
use study_index::StudyIndex;
use tempfile::TempDir;

const SC_SOP_CLASS: &str = "1.2.840.10008.5.1.4.1.1.7";

struct TestEnv {
    _dir: TempDir,
    fs_root: PathBuf,
    incoming: PathBuf,
    store: Arc<dyn ArchiveStore>,
    processor: Arc<SopInstanceProcessor>,
}

fn test_env() -> TestEnv {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let fs_root = dir.path().join("fs0");
    let incoming = dir.path().join("incoming");
    std::fs::create_dir_all(&incoming).unwrap();

    let toml = format!(
        r#"
        [archive]
        id = "test-archive"
        partition = "main"
        incoming_dir = "{incoming}"
        database_path = "{db}"

        [[storage.filesystems]]
        key = "fast"
        root = "{root}"
        tier = 0
        capacity_bytes = 1000000000
    "#,
        incoming = incoming.display(),
        db = dir.path().join("state.redb").display(),
        root = fs_root.display(),
    );
    let config: Config = toml::from_str(&toml).expect("TOML parse error");
    config.validate().expect("config should validate");

    let store: Arc<dyn ArchiveStore> = Arc::new(
        RedbStore::open(&dir.path().join("state.redb")).expect("Failed to open store"),
    );
    let monitor = Arc::new(FilesystemMonitor::new(&config.storage.filesystems));
    let rules = Arc::new(RulesEngine::from_rules(Vec::new(), Vec::new(), Vec::new(), 3));
    let processor = Arc::new(SopInstanceProcessor::new(
        &config,
        store.clone(),
        monitor,
        Arc::new(StudyLockMap::new()),
        rules,
    ));

    TestEnv {
        _dir: dir,
        fs_root,
        incoming,
        store,
        processor,
    }
}

fn make_instance(
    study: &str,
    series: &str,
    sop: &str,
    patient_name: &str,
) -> FileDicomObject<InMemDicomObject> {
    let mut object = InMemDicomObject::new_empty();
    let put_str = |object: &mut InMemDicomObject, tag, vr, value: &str| {
        object.put(DataElement::new(tag, vr, PrimitiveValue::from(value)));
    };
    put_str(&mut object, tags::SOP_CLASS_UID, VR::UI, SC_SOP_CLASS);
    put_str(&mut object, tags::SOP_INSTANCE_UID, VR::UI, sop);
    put_str(&mut object, tags::STUDY_INSTANCE_UID, VR::UI, study);
    put_str(&mut object, tags::SERIES_INSTANCE_UID, VR::UI, series);
    put_str(&mut object, tags::PATIENT_NAME, VR::PN, patient_name);
    put_str(&mut object, tags::PATIENT_ID, VR::LO, "PID-1");
    put_str(&mut object, tags::STUDY_DATE, VR::DA, "20260501");
    put_str(&mut object, tags::MODALITY, VR::CS, "OT");

    object
        .with_meta(
            FileMetaTableBuilder::new()
                .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
                .media_storage_sop_class_uid(SC_SOP_CLASS),
        )
        .expect("Failed to build file meta")
}

/// Write an instance into the incoming folder and return its path.
fn stage(env: &TestEnv, object: &FileDicomObject<InMemDicomObject>, name: &str) -> PathBuf {
    let path = env.incoming.join(name);
    object.write_to_file(&path).expect("Failed to write file");
    path
}

fn study_dir(env: &TestEnv, study: &str) -> PathBuf {
    let location = env
        .store
        .study_location("main", study)
        .unwrap()
        .expect("study location should exist");
    location.study_path(&env.fs_root)
}

#[tokio::test]
async fn first_instance_creates_study_and_index() {
    let env = test_env();
    let object = make_instance("1.2.3", "1.2.3.1", "1.2.3.1.1", "DOE^JOHN");
    let path = stage(&env, &object, "a.dcm");

    let report = env.processor.process_file(&path, Utc::now()).await.unwrap();
    assert_eq!(report.outcome, ProcessingOutcome::Success);
    assert!(report.name_update.is_none());

    let location = env.store.study_location("main", "1.2.3").unwrap().unwrap();
    assert_eq!(location.instance_count, 1);
    assert_eq!(location.filesystem_key, "fast");

    let dir = study_dir(&env, "1.2.3");
    assert!(dir.join("1.2.3.1/1.2.3.1.1.dcm").exists());

    let index = StudyIndex::load_or_new(&dir, "1.2.3").unwrap();
    assert_eq!(index.instance_count(), 1);
    assert_eq!(index.attributes.patient_name.as_deref(), Some("DOE^JOHN"));
    let (_, entry) = index.find_instance("1.2.3.1.1").unwrap();
    assert!(!entry.content_digest.is_empty());
}

#[tokio::test]
async fn reprocessing_identical_instance_is_a_no_op() {
    let env = test_env();
    let object = make_instance("1.2.3", "1.2.3.1", "1.2.3.1.1", "DOE^JOHN");
    let path = stage(&env, &object, "a.dcm");

    let first = env.processor.process_file(&path, Utc::now()).await.unwrap();
    assert_eq!(first.outcome, ProcessingOutcome::Success);
    let second = env.processor.process_file(&path, Utc::now()).await.unwrap();
    assert_eq!(second.outcome, ProcessingOutcome::Duplicate);

    let dir = study_dir(&env, "1.2.3");
    let index = StudyIndex::load_or_new(&dir, "1.2.3").unwrap();
    assert_eq!(index.instance_count(), 1);
    // Exactly one file under the series folder.
    let files: Vec<_> = std::fs::read_dir(dir.join("1.2.3.1"))
        .unwrap()
        .filter_map(|e| e.ok())
        .collect();
    assert_eq!(files.len(), 1);
}

#[tokio::test]
async fn same_uid_different_content_is_parked_for_review() {
    let env = test_env();
    let object = make_instance("1.2.3", "1.2.3.1", "1.2.3.1.1", "DOE^JOHN");
    let path = stage(&env, &object, "a.dcm");
    env.processor.process_file(&path, Utc::now()).await.unwrap();

    // Same SOP Instance UID, different dataset bytes.
    let mut altered = make_instance("1.2.3", "1.2.3.1", "1.2.3.1.1", "DOE^JOHN");
    altered.put(DataElement::new(
        tags::MODALITY,
        VR::CS,
        PrimitiveValue::from("CT"),
    ));
    let altered_path = stage(&env, &altered, "b.dcm");

    let report = env
        .processor
        .process_file(&altered_path, Utc::now())
        .await
        .unwrap();
    assert_eq!(report.outcome, ProcessingOutcome::Duplicate);

    // Nothing in the study changed.
    let dir = study_dir(&env, "1.2.3");
    let index = StudyIndex::load_or_new(&dir, "1.2.3").unwrap();
    assert_eq!(index.instance_count(), 1);

    // The copy is parked under the duplicates area with a work item.
    let duplicates = env.fs_root.join("main/duplicates");
    assert!(duplicates.exists());
    let entries = env.store.work_queue_entries().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].kind, WorkKind::ReconcileStudy);

    let history = env.store.reconcile_history("main", "1.2.3").unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].decision, ReconcileDecision::Deferred);
}

#[tokio::test]
async fn conflicting_patient_name_is_reconciled_not_stored() {
    let env = test_env();
    let object = make_instance("1.2.3", "1.2.3.1", "1.2.3.1.1", "DOE^JOHN");
    let path = stage(&env, &object, "a.dcm");
    env.processor.process_file(&path, Utc::now()).await.unwrap();

    let conflicting = make_instance("1.2.3", "1.2.3.1", "1.2.3.1.2", "SMITH^ALICE");
    let conflicting_path = stage(&env, &conflicting, "b.dcm");
    let report = env
        .processor
        .process_file(&conflicting_path, Utc::now())
        .await
        .unwrap();
    assert_eq!(report.outcome, ProcessingOutcome::Reconciled);

    // The instance was not written into the study.
    let dir = study_dir(&env, "1.2.3");
    let index = StudyIndex::load_or_new(&dir, "1.2.3").unwrap();
    assert_eq!(index.instance_count(), 1);
    assert!(!index.contains("1.2.3.1.2"));

    // Parked in the reconcile area, queued, and captured in the history.
    assert!(env.fs_root.join("main/reconcile").exists());
    let entries = env.store.work_queue_entries().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].kind, WorkKind::ReconcileStudy);
    let uids = env.store.work_queue_uids(&entries[0].id).unwrap();
    assert_eq!(uids.len(), 1);
    assert_eq!(uids[0].sop_instance_uid, "1.2.3.1.2");
    assert!(!uids[0].duplicate);

    let history = env.store.reconcile_history("main", "1.2.3").unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].decision, ReconcileDecision::Deferred);
}

#[tokio::test]
async fn look_alike_name_is_corrected_in_place() {
    let env = test_env();
    let object = make_instance("1.2.3", "1.2.3.1", "1.2.3.1.1", "DOE^JOHN");
    let path = stage(&env, &object, "a.dcm");
    env.processor.process_file(&path, Utc::now()).await.unwrap();

    let near_match = make_instance("1.2.3", "1.2.3.1", "1.2.3.1.2", "doe^ john");
    let near_path = stage(&env, &near_match, "b.dcm");
    let report = env
        .processor
        .process_file(&near_path, Utc::now())
        .await
        .unwrap();
    assert_eq!(report.outcome, ProcessingOutcome::Success);
    let update = report.name_update.expect("name should have been corrected");
    assert_eq!(update.original, "doe^ john");
    assert_eq!(update.replacement, "DOE^JOHN");

    // The stored file carries the canonical spelling.
    let stored = study_dir(&env, "1.2.3").join("1.2.3.1/1.2.3.1.2.dcm");
    let reloaded = dicom_object::open_file(&stored).unwrap();
    let name = reloaded
        .element(tags::PATIENT_NAME)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert_eq!(name.trim(), "DOE^JOHN");
}

#[tokio::test]
async fn index_and_folder_stay_consistent() {
    let env = test_env();
    for (series, sop) in [
        ("1.2.3.1", "1.2.3.1.1"),
        ("1.2.3.1", "1.2.3.1.2"),
        ("1.2.3.2", "1.2.3.2.1"),
    ] {
        let object = make_instance("1.2.3", series, sop, "DOE^JOHN");
        let path = stage(&env, &object, &format!("{}.dcm", sop));
        let report = env.processor.process_file(&path, Utc::now()).await.unwrap();
        assert_eq!(report.outcome, ProcessingOutcome::Success);
    }

    let dir = study_dir(&env, "1.2.3");
    let index = StudyIndex::load_or_new(&dir, "1.2.3").unwrap();
    assert_eq!(index.instance_count(), 3);

    // Every index entry has a readable file, and every file an entry.
    let mut on_disk = 0;
    for (series_uid, entry) in index.all_instances() {
        let file = dir.join(series_uid).join(format!("{}.dcm", entry.sop_instance_uid));
        assert!(file.exists(), "missing file for {}", entry.sop_instance_uid);
        assert_eq!(std::fs::metadata(&file).unwrap().len(), entry.file_size);
    }
    for series in std::fs::read_dir(&dir).unwrap().filter_map(|e| e.ok()) {
        if !series.path().is_dir() {
            continue;
        }
        for file in std::fs::read_dir(series.path()).unwrap().filter_map(|e| e.ok()) {
            let sop = file
                .path()
                .file_stem()
                .unwrap()
                .to_string_lossy()
                .to_string();
            assert!(index.contains(&sop), "file {} not in index", sop);
            on_disk += 1;
        }
    }
    assert_eq!(on_disk, 3);
}

#[tokio::test]
async fn no_writable_filesystem_is_a_recoverable_error() {
    let env = test_env();
    // Replace the monitor with one whose only filesystem is read-only.
    let monitor = Arc::new(FilesystemMonitor::with_states(vec![FilesystemState {
        key: "fast".to_string(),
        root: env.fs_root.clone(),
        tier: 0,
        writable: false,
        capacity_bytes: 1_000_000_000,
        high_watermark_pct: 90,
        low_watermark_pct: 80,
        used_bytes: 0,
    }]));
    let toml = format!(
        r#"
        [archive]
        id = "test-archive"
        partition = "main"
        incoming_dir = "{incoming}"
        database_path = "{db}"

        [[storage.filesystems]]
        key = "fast"
        root = "{root}"
        tier = 0
        capacity_bytes = 1000000000
    "#,
        incoming = env.incoming.display(),
        db = env._dir.path().join("state.redb").display(),
        root = env.fs_root.display(),
    );
    let config: Config = toml::from_str(&toml).unwrap();
    let processor = SopInstanceProcessor::new(
        &config,
        env.store.clone(),
        monitor,
        Arc::new(StudyLockMap::new()),
        Arc::new(RulesEngine::from_rules(Vec::new(), Vec::new(), Vec::new(), 3)),
    );

    let object = make_instance("9.8.7", "9.8.7.1", "9.8.7.1.1", "DOE^JOHN");
    let path = stage(&env, &object, "a.dcm");
    let err = processor.process_file(&path, Utc::now()).await.unwrap_err();
    assert!(matches!(err, strata::error::ArchiveError::NoWritableFilesystem));
    assert!(err.is_recoverable());
    // The source file is untouched, ready for the next sweep.
    assert!(path.exists());
}

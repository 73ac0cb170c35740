use chrono::Utc;
use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::{tags, uids};
use dicom_object::mem::InMemDicomObject;
use dicom_object::meta::FileMetaTableBuilder;
use dicom_object::FileDicomObject;
use std::path::PathBuf;
use std::sync::Arc;
use strata::config::Config;
use strata::error::ArchiveError;
use strata::persistence::{ArchiveStore, RedbStore, ReconcileDecision, WorkKind, WorkQueueEntry};
use strata::processor::{ProcessingOutcome, SopInstanceProcessor};
use strata::reconcile::{Disposition, ReconcileEngine};
use strata::rules::RulesEngine;
use strata::storage::{FilesystemMonitor, StudyStatus};
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
    engine: ReconcileEngine,
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
        monitor.clone(),
        Arc::new(StudyLockMap::new()),
        rules,
    ));
    let engine = ReconcileEngine::new(processor.clone(), monitor, None);

    TestEnv {
        _dir: dir,
        fs_root,
        incoming,
        store,
        processor,
        engine,
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

async fn ingest(env: &TestEnv, object: &FileDicomObject<InMemDicomObject>, name: &str) -> ProcessingOutcome {
    let path = env.incoming.join(name);
    object.write_to_file(&path).expect("Failed to write file");
    env.processor
        .process_file(&path, Utc::now())
        .await
        .expect("processing should not error")
        .outcome
}

/// Seed a study with one accepted instance, then park two conflicting ones.
async fn seed_conflict(env: &TestEnv) -> WorkQueueEntry {
    let accepted = make_instance("1.2.3", "1.2.3.1", "1.2.3.1.1", "DOE^JOHN");
    assert_eq!(ingest(env, &accepted, "a.dcm").await, ProcessingOutcome::Success);

    for (sop, name, file) in [
        ("1.2.3.1.2", "SMITH^ALICE", "b.dcm"),
        ("1.2.3.1.3", "SMITH^ALICE", "c.dcm"),
    ] {
        let conflicting = make_instance("1.2.3", "1.2.3.1", sop, name);
        assert_eq!(
            ingest(env, &conflicting, file).await,
            ProcessingOutcome::Reconciled
        );
    }

    let entries = env.store.work_queue_entries().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].kind, WorkKind::ReconcileStudy);
    assert_eq!(env.store.work_queue_uids(&entries[0].id).unwrap().len(), 2);
    entries.into_iter().next().unwrap()
}

fn study_index_of(env: &TestEnv, study: &str) -> StudyIndex {
    let location = env.store.study_location("main", study).unwrap().unwrap();
    StudyIndex::load_or_new(&location.study_path(&env.fs_root), study).unwrap()
}

#[tokio::test]
async fn process_as_is_replays_the_whole_batch() {
    let env = test_env();
    let item = seed_conflict(&env).await;

    env.engine
        .resolve(&item, Disposition::ProcessAsIs, Utc::now())
        .await
        .unwrap();

    let index = study_index_of(&env, "1.2.3");
    assert_eq!(index.instance_count(), 3);
    assert!(index.contains("1.2.3.1.2"));
    assert!(index.contains("1.2.3.1.3"));
    // The study's canonical name is unchanged by a process-as-is.
    assert_eq!(index.attributes.patient_name.as_deref(), Some("DOE^JOHN"));

    // Parked files and their queue rows are gone.
    assert!(env.store.work_queue_uids(&item.id).unwrap().is_empty());

    // The resolution is on the books after the two capture records.
    let history = env.store.reconcile_history("main", "1.2.3").unwrap();
    assert_eq!(history.len(), 3);
    let resolution = history.last().unwrap();
    assert_eq!(resolution.decision, ReconcileDecision::ProcessAsIs);
    assert_eq!(resolution.sop_instance_uids.len(), 2);
}

#[tokio::test]
async fn resolving_an_empty_item_is_a_no_op() {
    let env = test_env();
    let item = seed_conflict(&env).await;
    env.engine
        .resolve(&item, Disposition::ProcessAsIs, Utc::now())
        .await
        .unwrap();
    let before = env.store.reconcile_history("main", "1.2.3").unwrap().len();

    // All uid rows were consumed by the first resolution.
    env.engine
        .resolve(&item, Disposition::ProcessAsIs, Utc::now())
        .await
        .unwrap();
    let after = env.store.reconcile_history("main", "1.2.3").unwrap().len();
    assert_eq!(before, after);
}

#[tokio::test]
async fn merge_files_instances_into_the_target_study() {
    let env = test_env();
    // An existing target study with its own demographics.
    let target = make_instance("7.7.7", "7.7.7.1", "7.7.7.1.1", "TARGET^PATIENT");
    assert_eq!(ingest(&env, &target, "t.dcm").await, ProcessingOutcome::Success);

    let item = seed_conflict(&env).await;
    env.engine
        .resolve(
            &item,
            Disposition::Merge {
                target_study_uid: "7.7.7".to_string(),
            },
            Utc::now(),
        )
        .await
        .unwrap();

    let target_index = study_index_of(&env, "7.7.7");
    assert_eq!(target_index.instance_count(), 3);
    assert!(target_index.contains("1.2.3.1.2"));

    // The merged file on disk carries the target's identity.
    let location = env.store.study_location("main", "7.7.7").unwrap().unwrap();
    let merged = location.instance_path(&env.fs_root, "1.2.3.1", "1.2.3.1.2");
    let reloaded = dicom_object::open_file(&merged).unwrap();
    let name = reloaded
        .element(tags::PATIENT_NAME)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert_eq!(name.trim(), "TARGET^PATIENT");
    let study_uid = reloaded
        .element(tags::STUDY_INSTANCE_UID)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert_eq!(study_uid.trim_end_matches('\0').trim(), "7.7.7");

    // History records the merge with its rewrites.
    let history = env.store.reconcile_history("main", "1.2.3").unwrap();
    let resolution = history.last().unwrap();
    assert_eq!(
        resolution.decision,
        ReconcileDecision::Merge {
            target_study_uid: "7.7.7".to_string()
        }
    );
    let changes = resolution.change_description["changes"].as_array().unwrap();
    assert!(!changes.is_empty());
}

#[tokio::test]
async fn create_new_spins_up_a_fresh_study() {
    let env = test_env();
    let item = seed_conflict(&env).await;

    env.engine
        .resolve(&item, Disposition::CreateNew, Utc::now())
        .await
        .unwrap();

    let history = env.store.reconcile_history("main", "1.2.3").unwrap();
    let new_uid = match &history.last().unwrap().decision {
        ReconcileDecision::CreateNew { new_study_uid } => new_study_uid.clone(),
        other => panic!("expected create-new resolution, got {:?}", other),
    };
    assert!(new_uid.starts_with("2.25."));

    let new_location = env.store.study_location("main", &new_uid).unwrap().unwrap();
    assert_eq!(new_location.instance_count, 2);
    let new_index = study_index_of(&env, &new_uid);
    assert_eq!(new_index.instance_count(), 2);
    // The new study keeps the conflicting instances' own demographics.
    assert_eq!(new_index.attributes.patient_name.as_deref(), Some("SMITH^ALICE"));

    // The original study is untouched.
    assert_eq!(study_index_of(&env, "1.2.3").instance_count(), 1);
}

#[tokio::test]
async fn archived_study_fails_fatally() {
    let env = test_env();
    let item = seed_conflict(&env).await;

    // Push the study out to the archive tier before resolving.
    let mut location = env.store.study_location("main", "1.2.3").unwrap().unwrap();
    location.status = StudyStatus::Archived;
    let mut txn = env.store.begin_update().unwrap();
    txn.upsert_study_location(&location).unwrap();
    txn.commit().unwrap();

    let err = env
        .engine
        .resolve(&item, Disposition::ProcessAsIs, Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, ArchiveError::StudyNotUpdatable(_)));
    assert!(!err.is_recoverable());
}

#[tokio::test]
async fn colliding_replay_routes_to_duplicates_and_fails_the_batch() {
    let env = test_env();
    let accepted = make_instance("1.2.3", "1.2.3.1", "1.2.3.1.1", "DOE^JOHN");
    assert_eq!(ingest(&env, &accepted, "a.dcm").await, ProcessingOutcome::Success);

    // Park a conflicting instance with SOP UID X...
    let conflicting = make_instance("1.2.3", "1.2.3.1", "1.2.3.1.9", "SMITH^ALICE");
    assert_eq!(
        ingest(&env, &conflicting, "b.dcm").await,
        ProcessingOutcome::Reconciled
    );

    // ...then accept a different instance that takes the same UID.
    let mut occupying = make_instance("1.2.3", "1.2.3.1", "1.2.3.1.9", "DOE^JOHN");
    occupying.put(DataElement::new(
        tags::MODALITY,
        VR::CS,
        PrimitiveValue::from("MR"),
    ));
    assert_eq!(ingest(&env, &occupying, "c.dcm").await, ProcessingOutcome::Success);

    let item = env
        .store
        .work_queue_entries()
        .unwrap()
        .into_iter()
        .find(|e| e.kind == WorkKind::ReconcileStudy)
        .unwrap();

    // The only instance in the batch collides, so the whole resolve fails
    // with that error, and the file is routed to the duplicates area.
    let err = env
        .engine
        .resolve(&item, Disposition::ProcessAsIs, Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, ArchiveError::InstanceAlreadyExists { .. }));
    assert!(env.store.work_queue_uids(&item.id).unwrap().is_empty());
    assert!(env.fs_root.join("main/duplicates").exists());
}

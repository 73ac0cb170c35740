use chrono::Utc;
use study_index::{IndexError, InstanceEntry, StudyIndex, INDEX_FILE_NAME};
use tempfile::TempDir;

fn entry(sop: &str) -> InstanceEntry {
    InstanceEntry {
        sop_instance_uid: sop.to_string(),
        sop_class_uid: "1.2.840.10008.5.1.4.1.1.4".to_string(),
        transfer_syntax_uid: "1.2.840.10008.1.2.1".to_string(),
        file_size: 2048,
        content_digest: "deadbeef".to_string(),
        received_at: Utc::now(),
    }
}

#[test]
fn save_and_load_roundtrip() {
    let dir = TempDir::new().expect("Failed to create temp dir");

    let mut index = StudyIndex::new("1.2.840.1.1");
    index.attributes.patient_name = Some("DOE^JOHN".to_string());
    index.attributes.patient_id = Some("PID-1".to_string());
    index.add_instance("1.2.840.1.1.1", entry("1.2.840.1.1.1.1")).unwrap();
    index.add_instance("1.2.840.1.1.1", entry("1.2.840.1.1.1.2")).unwrap();
    index.add_instance("1.2.840.1.1.2", entry("1.2.840.1.1.2.1")).unwrap();

    index.save(dir.path()).expect("Failed to save index");
    assert!(dir.path().join(INDEX_FILE_NAME).exists());

    let loaded = StudyIndex::load_or_new(dir.path(), "1.2.840.1.1").unwrap();
    assert_eq!(loaded.study_instance_uid, "1.2.840.1.1");
    assert_eq!(loaded.attributes.patient_name.as_deref(), Some("DOE^JOHN"));
    assert_eq!(loaded.instance_count(), 3);
    assert_eq!(loaded.series.len(), 2);
    assert!(loaded.contains("1.2.840.1.1.2.1"));
}

#[test]
fn load_or_new_without_file_starts_empty() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let index = StudyIndex::load_or_new(dir.path(), "1.2.3").unwrap();
    assert!(index.is_empty());
    assert!(index.attributes.is_empty());
}

#[test]
fn save_replaces_previous_contents() {
    let dir = TempDir::new().expect("Failed to create temp dir");

    let mut index = StudyIndex::new("1.2.3");
    index.add_instance("1.2.3.1", entry("1.2.3.1.1")).unwrap();
    index.save(dir.path()).unwrap();

    index.remove_instance("1.2.3.1.1").unwrap();
    index.save(dir.path()).unwrap();

    let loaded = StudyIndex::load_or_new(dir.path(), "1.2.3").unwrap();
    assert!(loaded.is_empty());
    // No temp file left behind by the atomic save.
    assert!(!dir.path().join(format!("{}.tmp", INDEX_FILE_NAME)).exists());
}

#[test]
fn corrupt_index_reported_as_serialization_error() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    std::fs::write(dir.path().join(INDEX_FILE_NAME), b"{not json").unwrap();
    let err = StudyIndex::load_or_new(dir.path(), "1.2.3").unwrap_err();
    assert!(matches!(err, IndexError::Serialization(_)));
}

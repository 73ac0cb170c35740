use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use dicom_core::Tag;
use dicom_dictionary_std::tags;
use dicom_object::mem::InMemDicomObject;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use study_index::StudyAttributes;

use crate::storage::StudyStorageLocation;

/// DICOM keywords the rule engine can reference, mapped to their tags.
static KEYWORD_TAGS: Lazy<HashMap<&'static str, Tag>> = Lazy::new(|| {
    HashMap::from([
        ("PatientName", tags::PATIENT_NAME),
        ("PatientID", tags::PATIENT_ID),
        ("PatientBirthDate", tags::PATIENT_BIRTH_DATE),
        ("PatientSex", tags::PATIENT_SEX),
        ("AccessionNumber", tags::ACCESSION_NUMBER),
        ("StudyDate", tags::STUDY_DATE),
        ("StudyTime", tags::STUDY_TIME),
        ("StudyDescription", tags::STUDY_DESCRIPTION),
        ("StudyInstanceUID", tags::STUDY_INSTANCE_UID),
        ("SeriesInstanceUID", tags::SERIES_INSTANCE_UID),
        ("SeriesDescription", tags::SERIES_DESCRIPTION),
        ("Modality", tags::MODALITY),
        ("SOPInstanceUID", tags::SOP_INSTANCE_UID),
        ("SOPClassUID", tags::SOP_CLASS_UID),
        ("BodyPartExamined", tags::BODY_PART_EXAMINED),
        ("InstitutionName", tags::INSTITUTION_NAME),
        ("ReferringPhysicianName", tags::REFERRING_PHYSICIAN_NAME),
        ("StationName", tags::STATION_NAME),
    ])
});

pub fn tag_for_keyword(keyword: &str) -> Option<Tag> {
    KEYWORD_TAGS.get(keyword).copied()
}

/// Read a string attribute off a DICOM object, trimming the padding DICOM
/// string values carry.
pub fn element_str(object: &InMemDicomObject, tag: Tag) -> Option<String> {
    object
        .element(tag)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim_end_matches(['\0', ' ']).trim_start().to_string())
        .filter(|s| !s.is_empty())
}

/// Evaluation context handed to rule predicates and action items.
///
/// Field lookups resolve against the triggering instance first, then fall
/// back to the study's canonical attributes, so study-level triggers (which
/// carry no instance) still see the demographics.
pub struct RuleContext<'a> {
    pub instance: Option<&'a InMemDicomObject>,
    pub study: &'a StudyAttributes,
    pub location: &'a StudyStorageLocation,
    /// The processing clock: base time for offsets with no reference field.
    pub now: DateTime<Utc>,
}

impl<'a> RuleContext<'a> {
    pub fn new(
        instance: Option<&'a InMemDicomObject>,
        study: &'a StudyAttributes,
        location: &'a StudyStorageLocation,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            instance,
            study,
            location,
            now,
        }
    }

    pub fn field(&self, keyword: &str) -> Option<String> {
        if let Some(object) = self.instance {
            if let Some(tag) = tag_for_keyword(keyword) {
                if let Some(value) = element_str(object, tag) {
                    return Some(value);
                }
            }
        }
        self.study.get(keyword).map(|s| s.to_string())
    }

    /// Resolve a field as a point in time. DA values (`YYYYMMDD`) evaluate
    /// to midnight UTC of that day.
    pub fn datetime(&self, keyword: &str) -> Option<DateTime<Utc>> {
        let raw = self.field(keyword)?;
        let date = NaiveDate::parse_from_str(&raw, "%Y%m%d").ok()?;
        Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?).into()
    }
}

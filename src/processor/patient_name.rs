use crate::rules::element_str;
use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_object::mem::InMemDicomObject;

/// Record of one in-place attribute correction, kept for auditing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateItem {
    pub keyword: String,
    pub original: String,
    pub replacement: String,
}

/// Patient-name correction rules.
///
/// Patient name is the only identity attribute ever corrected in place, and
/// only when the incoming spelling normalizes to the same name as the
/// study's canonical one. Any other divergence is a reconciliation
/// candidate, never an automatic edit.
pub struct PatientNameRules;

impl PatientNameRules {
    /// Normalized comparison form of a person name: component-wise
    /// uppercase with surrounding and repeated whitespace collapsed, and
    /// empty trailing `^` components dropped.
    pub fn normalize(name: &str) -> String {
        let mut components: Vec<String> = name
            .split('^')
            .map(|component| {
                component
                    .split_whitespace()
                    .collect::<Vec<_>>()
                    .join(" ")
                    .to_uppercase()
            })
            .collect();
        while components.last().map(|c| c.is_empty()).unwrap_or(false) {
            components.pop();
        }
        components.join("^")
    }

    /// Whether two spellings denote the same name under normalization.
    pub fn is_same_name(a: &str, b: &str) -> bool {
        Self::normalize(a) == Self::normalize(b)
    }

    /// Rewrite the object's PatientName to the study's canonical spelling
    /// when the two differ only in normalization. Returns the applied
    /// change, `None` when the names are already identical, or when they
    /// are genuinely different names (left untouched for reconciliation).
    pub fn apply(object: &mut InMemDicomObject, canonical: &str) -> Option<UpdateItem> {
        let current = element_str(object, tags::PATIENT_NAME).unwrap_or_default();
        if current == canonical {
            return None;
        }
        if !Self::is_same_name(&current, canonical) {
            return None;
        }
        object.put(DataElement::new(
            tags::PATIENT_NAME,
            VR::PN,
            PrimitiveValue::from(canonical),
        ));
        Some(UpdateItem {
            keyword: "PatientName".to_string(),
            original: current,
            replacement: canonical.to_string(),
        })
    }
}

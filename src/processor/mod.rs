//! Per-instance ingestion pipeline.

mod patient_name;
mod sop;

pub use patient_name::{PatientNameRules, UpdateItem};
pub use sop::{ProcessMode, ProcessingOutcome, ProcessingReport, SopInstanceProcessor};

//! Conflict resolution for instances whose identity attributes do not
//! match their nominal destination study.

mod engine;

pub use engine::{Disposition, ReconcileEngine, ReconcileHandler};

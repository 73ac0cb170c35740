mod filesystem;
mod location;
mod monitor;

pub use filesystem::FilesystemState;
pub use location::{duplicate_area, reconcile_area, QueueState, StudyStatus, StudyStorageLocation};
pub use monitor::FilesystemMonitor;

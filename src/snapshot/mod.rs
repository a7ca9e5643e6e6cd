mod format;
mod restore;
mod store;

pub use format::SnapshotManifest;

pub(crate) use restore::default_workers;
pub(crate) use restore::plan_restore;
pub(crate) use restore::restore_entities;
pub(crate) use restore::RestorePlan;
pub(crate) use restore::RestoreSummary;
pub(crate) use store::SnapshotReader;
pub(crate) use store::SnapshotStore;
pub(crate) use store::SnapshotWriter;
pub(crate) use store::StagedSnapshotFile;

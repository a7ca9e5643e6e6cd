mod in_memory;
mod log;
mod storage;

pub use in_memory::InMemoryLog;
pub use log::Entry;
pub use log::Index;
pub use log::Log;
pub use storage::SegmentedDiskLog;
pub use storage::StorageConfig;

pub(crate) use storage::entry_path;
pub(crate) use storage::list_entry_indexes;
pub(crate) use storage::write_atomically;

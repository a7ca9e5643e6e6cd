//! Encrypted persistence: everything here stores ciphertext sealed by the node's key ring, except
//! the applied-index marker.
mod applied_index;
mod encrypted_log;
mod entity_store;
mod key_scan;
mod stable_store;

pub use applied_index::AppliedIndexStore;
pub use applied_index::AppliedMarker;
pub use encrypted_log::EncryptedLog;
pub use encrypted_log::SealedEntry;
pub use entity_store::EntityStore;
pub use key_scan::KeyScan;
pub use stable_store::EncryptedStableStore;
pub use stable_store::FileStableStore;
pub use stable_store::MemoryStableStore;
pub use stable_store::StableStore;

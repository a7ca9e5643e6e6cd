mod key_file;
mod key_gc;
mod key_rotation;
mod keyring;

pub use key_file::KeyFile;
pub use key_file::SecretFileError;
pub use key_gc::KeyGarbageCollector;
pub use key_gc::KeyReferences;
pub use key_rotation::KeyRotation;
pub use key_rotation::Reseal;
pub use key_rotation::RotationReport;
pub use keyring::sealed_key_id;
pub use keyring::IntegrityError;
pub use keyring::KeyId;
pub use keyring::KeyRing;
pub use keyring::KeyRingHandle;

pub(crate) use key_file::SecretFile;

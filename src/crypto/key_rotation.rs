use crate::crypto::{KeyId, KeyRingHandle};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// A store that can rewrite everything it holds under the ring's active key.
pub trait Reseal: Send + Sync {
    /// Returns how many values were rewritten.
    fn reseal(&self) -> Result<usize, io::Error>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct RotationReport {
    pub active_key: KeyId,
    pub resealed: usize,
}

/// KeyRotation retires the active key and moves mutable stores onto its successor. Snapshots and
/// log segments keep their old key until they are pruned; the GC only erases a key once none of
/// them reference it.
pub struct KeyRotation {
    logger: slog::Logger,
    key_ring: KeyRingHandle,
    stores: Vec<Arc<dyn Reseal>>,
}

impl KeyRotation {
    pub fn new(logger: slog::Logger, key_ring: KeyRingHandle, stores: Vec<Arc<dyn Reseal>>) -> Self {
        KeyRotation {
            logger: logger.new(slog::o!("Task" => "KeyRotation")),
            key_ring,
            stores,
        }
    }

    /// Blocking. The new key is persisted before anything is sealed under it, so a crash midway
    /// leaves stores readable under either key.
    pub fn rotate_now(&self) -> Result<RotationReport, io::Error> {
        let active_key = self.key_ring.rotate()?;
        let mut resealed = 0;
        for store in self.stores.iter() {
            resealed += store.reseal()?;
        }

        let report = RotationReport { active_key, resealed };
        slog::info!(self.logger, "Rotated keys: {:?}", report);
        Ok(report)
    }

    /// Runs `rotate_now()` every `interval` on the blocking pool until `stop` fires.
    pub fn spawn(self: Arc<Self>, interval: Duration, mut stop: oneshot::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = &mut stop => break,
                    _ = ticker.tick() => {}
                }

                let rotation = self.clone();
                match tokio::task::spawn_blocking(move || rotation.rotate_now()).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => slog::warn!(self.logger, "Key rotation failed: {:?}", e),
                    Err(e) => slog::error!(self.logger, "Key rotation task panicked: {:?}", e),
                }
            }
            slog::info!(self.logger, "Key rotation stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{KeyGarbageCollector, KeyReferences};
    use crate::storage::{EncryptedStableStore, MemoryStableStore, StableStore};

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    #[test]
    fn rotation_reseals_so_gc_can_erase_the_old_key() {
        let ring = KeyRingHandle::ephemeral();
        let store = Arc::new(EncryptedStableStore::new(MemoryStableStore::new(), ring.clone()));
        store.put("term", b"7").unwrap();
        store.put("vote", b"node-a").unwrap();

        let rotation = KeyRotation::new(logger(), ring.clone(), vec![store.clone()]);
        let gc = KeyGarbageCollector::new(logger(), ring.clone(), vec![store.clone()]);

        let first = rotation.rotate_now().unwrap();
        assert_eq!(
            first,
            RotationReport {
                active_key: KeyId::new(2),
                resealed: 2,
            }
        );
        let second = rotation.rotate_now().unwrap();
        assert_eq!(second.active_key, KeyId::new(3));
        assert_eq!(second.resealed, 2);

        assert_eq!(store.oldest_referenced_key().unwrap(), Some(KeyId::new(3)));
        assert_eq!(gc.collect_once().unwrap(), vec![KeyId::new(1)]);
        assert_eq!(store.get("term").unwrap(), Some(b"7".to_vec()));
        assert_eq!(store.get("vote").unwrap(), Some(b"node-a".to_vec()));
    }

    #[tokio::test]
    async fn periodic_rotation_advances_the_active_key() {
        let ring = KeyRingHandle::ephemeral();
        let rotation = Arc::new(KeyRotation::new(logger(), ring.clone(), vec![]));
        let (stop, stop_rx) = oneshot::channel();
        let task = rotation.spawn(Duration::from_millis(10), stop_rx);

        tokio::time::sleep(Duration::from_millis(100)).await;
        stop.send(()).unwrap();
        task.await.unwrap();
        assert!(ring.active_key_id() > KeyId::new(1));
    }
}

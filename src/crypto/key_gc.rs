use crate::crypto::{KeyId, KeyRingHandle};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Anything that retains sealed data reports the oldest key that data still needs.
pub trait KeyReferences: Send + Sync {
    /// `None` if nothing sealed is retained.
    fn oldest_referenced_key(&self) -> Result<Option<KeyId>, io::Error>;
}

/// KeyGarbageCollector periodically erases retired keys that no retained snapshot, un-truncated
/// log segment, stable value or entity still references. The ring itself always keeps its two
/// newest keys, which covers data sealed during the scan.
pub struct KeyGarbageCollector {
    logger: slog::Logger,
    key_ring: KeyRingHandle,
    references: Vec<Arc<dyn KeyReferences>>,
}

impl KeyGarbageCollector {
    pub fn new(
        logger: slog::Logger,
        key_ring: KeyRingHandle,
        references: Vec<Arc<dyn KeyReferences>>,
    ) -> Self {
        KeyGarbageCollector {
            logger: logger.new(slog::o!("Task" => "KeyGc")),
            key_ring,
            references,
        }
    }

    /// One scan-and-erase pass. Returns erased key ids.
    pub fn collect_once(&self) -> Result<Vec<KeyId>, io::Error> {
        let mut horizon = self.key_ring.active_key_id();
        for refs in self.references.iter() {
            if let Some(oldest) = refs.oldest_referenced_key()? {
                horizon = std::cmp::min(horizon, oldest);
            }
        }

        let erased = self.key_ring.erase_below(horizon)?;
        if !erased.is_empty() {
            slog::info!(self.logger, "Erased retired keys {:?} (horizon {:?})", erased, horizon);
        }
        Ok(erased)
    }

    /// Runs `collect_once()` every `interval` on the blocking pool until `stop` fires.
    pub fn spawn(self, interval: Duration, mut stop: oneshot::Receiver<()>) -> JoinHandle<()> {
        let gc = Arc::new(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = &mut stop => break,
                    _ = ticker.tick() => {}
                }

                let gc_ref = gc.clone();
                match tokio::task::spawn_blocking(move || gc_ref.collect_once()).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => slog::warn!(gc.logger, "Key GC pass failed: {:?}", e),
                    Err(e) => slog::error!(gc.logger, "Key GC task panicked: {:?}", e),
                }
            }
            slog::info!(gc.logger, "Key GC stopped");
        })
    }
}

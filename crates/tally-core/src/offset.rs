use std::sync::Arc;

use crate::{ports::OffsetStore, Result};

/// Checkpoint of the last fully handled update id.
///
/// An update only counts as handled once `advance` has returned `Ok`. Anything
/// handled but not yet advanced is redelivered after a crash, so every handler
/// behind this must be idempotent.
#[derive(Clone)]
pub struct OffsetTracker {
    store: Arc<dyn OffsetStore>,
}

impl OffsetTracker {
    pub fn new(store: Arc<dyn OffsetStore>) -> Self {
        Self { store }
    }

    /// Last acknowledged update id, 0 when nothing was ever acknowledged.
    pub async fn load(&self) -> Result<i64> {
        Ok(self.store.load_offset().await?.unwrap_or(0))
    }

    /// Persist `new_offset` if it moves the checkpoint forward.
    ///
    /// Returns `false` (and writes nothing) for duplicate or out-of-order acks.
    pub async fn advance(&self, new_offset: i64) -> Result<bool> {
        let current = self.load().await?;
        if new_offset <= current {
            tracing::debug!(current, new_offset, "offset not advanced (stale ack)");
            return Ok(false);
        }
        self.store.store_offset(new_offset).await?;
        tracing::debug!(from = current, to = new_offset, "offset advanced");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{errors::Error, store::memory::InMemoryStore};

    #[tokio::test]
    async fn starts_at_zero_and_only_moves_forward() {
        let store = Arc::new(InMemoryStore::new());
        let tracker = OffsetTracker::new(store.clone());

        assert_eq!(tracker.load().await.unwrap(), 0);
        assert!(tracker.advance(5).await.unwrap());
        assert!(!tracker.advance(5).await.unwrap());
        assert!(!tracker.advance(3).await.unwrap());
        assert_eq!(tracker.load().await.unwrap(), 5);
        assert!(tracker.advance(6).await.unwrap());
        assert_eq!(tracker.load().await.unwrap(), 6);
    }

    #[tokio::test]
    async fn storage_failure_surfaces_and_keeps_old_value() {
        let store = Arc::new(InMemoryStore::new());
        let tracker = OffsetTracker::new(store.clone());
        tracker.advance(2).await.unwrap();

        store.fail_next_offset_write();
        let err = tracker.advance(3).await.unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
        assert_eq!(tracker.load().await.unwrap(), 2);
    }
}

//! TTL cache for escrow records.

use octagon_trust::EscrowRecord;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Caches the last `fetch_viable_bottles` answer for `ttl`.
///
/// Invalidated whenever the local peer's membership changes.
#[derive(Debug)]
pub struct EscrowCache {
    ttl: Duration,
    entry: Mutex<Option<(Instant, Vec<EscrowRecord>)>>,
}

impl EscrowCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entry: Mutex::new(None),
        }
    }

    /// Cached records, if fetched less than `ttl` ago.
    pub fn get(&self) -> Option<Vec<EscrowRecord>> {
        let entry = self.entry.lock().unwrap_or_else(|e| e.into_inner());
        match entry.as_ref() {
            Some((fetched, records)) if fetched.elapsed() < self.ttl => Some(records.clone()),
            _ => None,
        }
    }

    pub fn put(&self, records: Vec<EscrowRecord>) {
        *self.entry.lock().unwrap_or_else(|e| e.into_inner()) = Some((Instant::now(), records));
    }

    pub fn invalidate(&self) {
        let had = self
            .entry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .is_some();
        if had {
            debug!("escrow cache invalidated");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = EscrowCache::new(Duration::from_secs(60));
        assert!(cache.get().is_none());

        cache.put(Vec::new());
        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(cache.get(), Some(Vec::new()));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(cache.get().is_none());
    }

    #[tokio::test]
    async fn invalidate_drops_entry() {
        let cache = EscrowCache::new(Duration::from_secs(60));
        cache.put(Vec::new());
        cache.invalidate();
        assert!(cache.get().is_none());
    }
}

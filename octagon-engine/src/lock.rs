//! Device lock state.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Tracks whether the device is locked. Clones share state.
///
/// While locked, the keychain refuses to hand out secrets and the state
/// machine parks in `WaitForUnlock`.
#[derive(Debug, Clone)]
pub struct LockStateTracker {
    locked: Arc<watch::Sender<bool>>,
}

impl LockStateTracker {
    pub fn new(locked: bool) -> Self {
        let (tx, _) = watch::channel(locked);
        Self {
            locked: Arc::new(tx),
        }
    }

    pub fn unlocked() -> Self {
        Self::new(false)
    }

    pub fn set_locked(&self, locked: bool) {
        let previous = self.locked.send_replace(locked);
        if previous != locked {
            debug!(locked, "lock state changed");
        }
    }

    pub fn is_locked(&self) -> bool {
        *self.locked.borrow()
    }

    /// Receiver that observes every change.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.locked.subscribe()
    }
}

impl Default for LockStateTracker {
    fn default() -> Self {
        Self::unlocked()
    }
}

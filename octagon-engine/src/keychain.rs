//! Secret persistence for the local identity and bottle entropy.

use crate::error::{OctagonError, OctagonResult};
use crate::lock::LockStateTracker;
use octagon_store::AccountStore;
use octagon_trust::{BottleSecret, LocalIdentity};
use octagon_types::{ContainerName, ContextId};
use tracing::debug;

const IDENTITY_KIND: &str = "identity";
const BOTTLE_SECRET_KIND: &str = "bottle_secret";

/// Secret storage for one device.
///
/// Reads and writes fail with [`OctagonError::DeviceLocked`] while the
/// device is locked. Deletion always works.
pub trait Keychain: Send + Sync {
    fn save_identity(
        &self,
        container: &ContainerName,
        context: &ContextId,
        identity: &LocalIdentity,
    ) -> OctagonResult<()>;

    fn load_identity(
        &self,
        container: &ContainerName,
        context: &ContextId,
    ) -> OctagonResult<Option<LocalIdentity>>;

    fn save_bottle_secret(
        &self,
        container: &ContainerName,
        context: &ContextId,
        secret: &BottleSecret,
    ) -> OctagonResult<()>;

    fn load_bottle_secret(
        &self,
        container: &ContainerName,
        context: &ContextId,
    ) -> OctagonResult<Option<BottleSecret>>;

    /// Removes every secret for (container, context).
    fn delete_all(&self, container: &ContainerName, context: &ContextId) -> OctagonResult<()>;
}

/// [`Keychain`] backed by the account store's secret table.
#[derive(Debug, Clone)]
pub struct StoreKeychain {
    store: AccountStore,
    lock: LockStateTracker,
}

impl StoreKeychain {
    pub fn new(store: AccountStore, lock: LockStateTracker) -> Self {
        Self { store, lock }
    }

    fn ensure_unlocked(&self) -> OctagonResult<()> {
        if self.lock.is_locked() {
            return Err(OctagonError::DeviceLocked);
        }
        Ok(())
    }
}

impl Keychain for StoreKeychain {
    fn save_identity(
        &self,
        container: &ContainerName,
        context: &ContextId,
        identity: &LocalIdentity,
    ) -> OctagonResult<()> {
        self.ensure_unlocked()?;
        self.store
            .save_secret(container, context, IDENTITY_KIND, &identity.to_secret_bytes()?)?;
        debug!(%container, %context, peer = %identity.peer_id(), "saved identity");
        Ok(())
    }

    fn load_identity(
        &self,
        container: &ContainerName,
        context: &ContextId,
    ) -> OctagonResult<Option<LocalIdentity>> {
        self.ensure_unlocked()?;
        match self.store.load_secret(container, context, IDENTITY_KIND)? {
            Some(bytes) => Ok(Some(LocalIdentity::from_secret_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    fn save_bottle_secret(
        &self,
        container: &ContainerName,
        context: &ContextId,
        secret: &BottleSecret,
    ) -> OctagonResult<()> {
        self.ensure_unlocked()?;
        self.store.save_secret(
            container,
            context,
            BOTTLE_SECRET_KIND,
            &serde_json::to_vec(secret)?,
        )?;
        Ok(())
    }

    fn load_bottle_secret(
        &self,
        container: &ContainerName,
        context: &ContextId,
    ) -> OctagonResult<Option<BottleSecret>> {
        self.ensure_unlocked()?;
        match self.store.load_secret(container, context, BOTTLE_SECRET_KIND)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn delete_all(&self, container: &ContainerName, context: &ContextId) -> OctagonResult<()> {
        let removed = self.store.delete_secrets(container, context)?;
        debug!(%container, %context, removed, "deleted secrets");
        Ok(())
    }
}

//! Per-view key hierarchy sync, gated on trust.
//!
//! Each view has a top-level key (TLK) stored in its zone together with
//! boxed copies for every peer allowed to read it. While the local peer is
//! trusted the coordinator creates missing TLKs, shares them with trusted
//! peers, and adopts a zone's TLK only through a share sent by a peer it
//! trusts. A zone whose TLK changes underneath a cached key puts the view
//! back into [`ViewKeyState::WaitForTlk`].

use crate::cloud::{KeyZone, TlkShare, ZoneKeySet};
use crate::error::{OctagonError, OctagonResult};
use octagon_crypto::{
    generate_random_key, open_from, seal_to, EncryptionKeyPair, PublicEncryptionKey, SymmetricKey,
    KEY_SIZE,
};
use octagon_types::{ContainerName, PeerId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Attempts at a conditional zone write before giving up for now.
const MAX_ZONE_WRITES: usize = 3;

/// Key hierarchy state of one view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewKeyState {
    LoggedOut,
    WaitForTrust,
    /// The zone has a TLK this peer has not been given.
    WaitForTlk,
    Ready,
}

/// What the coordinator needs while the local peer is trusted.
#[derive(Debug, Clone)]
pub struct TrustedOperation {
    pub self_peer: PeerId,
    pub encryption: EncryptionKeyPair,
    /// Trusted peers other than self, with their encryption keys.
    pub trusted_peers: BTreeMap<PeerId, PublicEncryptionKey>,
    pub views: BTreeSet<String>,
}

struct CachedTlk {
    uuid: Uuid,
    key: SymmetricKey,
}

#[derive(Default)]
struct Inner {
    operation: Option<TrustedOperation>,
    tlks: HashMap<String, CachedTlk>,
}

pub struct KeySyncCoordinator {
    container: ContainerName,
    zone: Arc<dyn KeyZone>,
    inner: Mutex<Inner>,
    states: watch::Sender<BTreeMap<String, ViewKeyState>>,
}

impl KeySyncCoordinator {
    pub fn new(container: ContainerName, zone: Arc<dyn KeyZone>) -> Self {
        let (states, _) = watch::channel(BTreeMap::new());
        Self {
            container,
            zone,
            inner: Mutex::new(Inner::default()),
            states,
        }
    }

    pub fn view_states(&self) -> BTreeMap<String, ViewKeyState> {
        self.states.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<BTreeMap<String, ViewKeyState>> {
        self.states.subscribe()
    }

    /// Fingerprint of the cached TLK for `view`.
    pub async fn tlk_fingerprint(&self, view: &str) -> Option<String> {
        self.inner
            .lock()
            .await
            .tlks
            .get(view)
            .map(|cached| cached.key.fingerprint())
    }

    /// Starts (or restarts) syncing as a trusted peer.
    pub async fn begin_trusted_operation(&self, operation: TrustedOperation) {
        let mut inner = self.inner.lock().await;
        info!(
            container = %self.container,
            peer = %operation.self_peer,
            views = operation.views.len(),
            trusted = operation.trusted_peers.len(),
            "key sync: trusted operation"
        );
        inner.tlks.retain(|view, _| operation.views.contains(view));
        let views = operation.views.clone();
        inner.operation = Some(operation);
        self.states.send_modify(|states| {
            states.retain(|view, _| views.contains(view));
            for view in &views {
                states
                    .entry(view.clone())
                    .and_modify(|s| {
                        if *s != ViewKeyState::Ready {
                            *s = ViewKeyState::WaitForTlk;
                        }
                    })
                    .or_insert(ViewKeyState::WaitForTlk);
            }
        });
        for view in views {
            self.sync_and_publish(&mut inner, &view).await;
        }
    }

    /// New trusted peer set: shares TLKs with newcomers.
    pub async fn update_trusted_peers(&self, trusted_peers: BTreeMap<PeerId, PublicEncryptionKey>) {
        let mut inner = self.inner.lock().await;
        let Some(operation) = inner.operation.as_mut() else {
            return;
        };
        operation.trusted_peers = trusted_peers;
        let views = operation.views.clone();
        for view in views {
            self.sync_and_publish(&mut inner, &view).await;
        }
    }

    /// Trust was lost: drop keys and wait for trust.
    pub async fn end_trusted_operation(&self) {
        self.stop(ViewKeyState::WaitForTrust).await;
    }

    /// The account went away.
    pub async fn logout(&self) {
        self.stop(ViewKeyState::LoggedOut).await;
    }

    async fn stop(&self, state: ViewKeyState) {
        let mut inner = self.inner.lock().await;
        inner.operation = None;
        inner.tlks.clear();
        self.states.send_modify(|states| {
            for s in states.values_mut() {
                *s = state;
            }
        });
        debug!(container = %self.container, ?state, "key sync stopped");
    }

    /// Deletes every zone of the container and forgets cached keys.
    pub async fn reset_zones(&self) -> OctagonResult<()> {
        let mut inner = self.inner.lock().await;
        self.zone.delete_zones(&self.container).await?;
        inner.tlks.clear();
        info!(container = %self.container, "key zones reset");
        Ok(())
    }

    /// A zone was written by someone; re-examine it.
    pub async fn handle_zone_change(&self, view: &str) {
        let mut inner = self.inner.lock().await;
        let tracked = inner
            .operation
            .as_ref()
            .is_some_and(|op| op.views.contains(view));
        if tracked {
            self.sync_and_publish(&mut inner, view).await;
        }
    }

    /// Waits until every tracked view is ready.
    pub async fn wait_for_views_ready(&self, timeout: Duration) -> OctagonResult<()> {
        let mut rx = self.states.subscribe();
        let ready = rx.wait_for(|states| {
            !states.is_empty() && states.values().all(|s| *s == ViewKeyState::Ready)
        });
        match tokio::time::timeout(timeout, ready).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(OctagonError::ChannelClosed),
            Err(_) => Err(OctagonError::Timeout),
        }
    }

    async fn sync_and_publish(&self, inner: &mut Inner, view: &str) {
        let state = match self.sync_view(inner, view).await {
            Ok(state) => state,
            Err(e) => {
                warn!(container = %self.container, view, error = %e, "view sync failed");
                ViewKeyState::WaitForTlk
            }
        };
        self.states.send_modify(|states| {
            states.insert(view.to_string(), state);
        });
    }

    async fn sync_view(&self, inner: &mut Inner, view: &str) -> OctagonResult<ViewKeyState> {
        let Some(operation) = inner.operation.clone() else {
            return Ok(ViewKeyState::WaitForTrust);
        };

        for _ in 0..MAX_ZONE_WRITES {
            let current = self.zone.fetch_key_set(&self.container, view).await?;
            let Some(key_set) = current else {
                let tlk = generate_random_key();
                let uuid = Uuid::new_v4();
                let mut receivers: BTreeSet<PeerId> =
                    operation.trusted_peers.keys().cloned().collect();
                receivers.insert(operation.self_peer.clone());
                let key_set = ZoneKeySet {
                    tlk_uuid: uuid,
                    fingerprint: tlk.fingerprint(),
                    created_by: operation.self_peer.clone(),
                    shares: make_shares(&operation, uuid, &tlk, &receivers)?,
                };
                match self
                    .zone
                    .save_key_set(&self.container, view, key_set, None)
                    .await
                {
                    Ok(()) => {
                        info!(container = %self.container, view, tlk = %uuid, "created TLK");
                        inner.tlks.insert(view.to_string(), CachedTlk { uuid, key: tlk });
                        return Ok(ViewKeyState::Ready);
                    }
                    Err(OctagonError::ZoneConflict(reason)) => {
                        debug!(view, reason, "zone created concurrently, refetching");
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            };

            let cached_uuid = inner.tlks.get(view).map(|c| c.uuid);
            if cached_uuid != Some(key_set.tlk_uuid) {
                if cached_uuid.is_some() {
                    warn!(
                        container = %self.container,
                        view,
                        tlk = %key_set.tlk_uuid,
                        "zone TLK changed, discarding cached key"
                    );
                    inner.tlks.remove(view);
                }
                let Some(key) = adopt(&operation, &key_set) else {
                    debug!(view, tlk = %key_set.tlk_uuid, "no trusted share for this peer");
                    return Ok(ViewKeyState::WaitForTlk);
                };
                debug!(view, tlk = %key_set.tlk_uuid, "adopted TLK from share");
                inner.tlks.insert(
                    view.to_string(),
                    CachedTlk {
                        uuid: key_set.tlk_uuid,
                        key,
                    },
                );
            }

            let Some(cached) = inner.tlks.get(view) else {
                return Ok(ViewKeyState::WaitForTlk);
            };
            let have = key_set.receivers();
            let missing: BTreeSet<PeerId> = operation
                .trusted_peers
                .keys()
                .filter(|peer| !have.contains(*peer))
                .cloned()
                .collect();
            if missing.is_empty() {
                return Ok(ViewKeyState::Ready);
            }

            let mut updated = key_set.clone();
            updated
                .shares
                .extend(make_shares(&operation, cached.uuid, &cached.key, &missing)?);
            match self
                .zone
                .save_key_set(&self.container, view, updated, Some(key_set.tlk_uuid))
                .await
            {
                Ok(()) => {
                    debug!(view, shared_with = missing.len(), "shared TLK");
                    return Ok(ViewKeyState::Ready);
                }
                Err(OctagonError::ZoneConflict(reason)) => {
                    debug!(view, reason, "zone changed while sharing, refetching");
                }
                Err(e) => return Err(e),
            }
        }

        warn!(container = %self.container, view, "zone kept changing, will retry on next change");
        Ok(ViewKeyState::WaitForTlk)
    }
}

impl std::fmt::Debug for KeySyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeySyncCoordinator")
            .field("container", &self.container)
            .field("states", &*self.states.borrow())
            .finish_non_exhaustive()
    }
}

fn make_shares(
    operation: &TrustedOperation,
    uuid: Uuid,
    tlk: &SymmetricKey,
    receivers: &BTreeSet<PeerId>,
) -> OctagonResult<Vec<TlkShare>> {
    let own_key = operation.encryption.public_key();
    receivers
        .iter()
        .filter_map(|receiver| {
            let key = if receiver == &operation.self_peer {
                own_key.clone()
            } else {
                operation.trusted_peers.get(receiver)?.clone()
            };
            Some((receiver, key))
        })
        .map(|(receiver, key)| {
            Ok(TlkShare {
                tlk_uuid: uuid,
                sender: operation.self_peer.clone(),
                receiver: receiver.clone(),
                sender_public_key: own_key.to_base64(),
                boxed: seal_to(&key, &operation.encryption, tlk.as_bytes())?,
            })
        })
        .collect()
}

/// Opens a share addressed to us from a sender we trust, checking the
/// fingerprint the zone advertises.
fn adopt(operation: &TrustedOperation, key_set: &ZoneKeySet) -> Option<SymmetricKey> {
    let own_key = operation.encryption.public_key();
    key_set.share_for(&operation.self_peer).find_map(|share| {
        let sender_key = if share.sender == operation.self_peer {
            own_key.clone()
        } else {
            operation.trusted_peers.get(&share.sender)?.clone()
        };
        if sender_key.to_base64() != share.sender_public_key {
            return None;
        }
        let bytes = open_from(&sender_key, &operation.encryption, &share.boxed).ok()?;
        let bytes: [u8; KEY_SIZE] = bytes.try_into().ok()?;
        let key = SymmetricKey::from_bytes(bytes);
        (key.fingerprint() == key_set.fingerprint).then_some(key)
    })
}

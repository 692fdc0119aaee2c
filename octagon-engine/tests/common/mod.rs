//! Shared harness: an in-process cloud and devices that talk to it.

#![allow(dead_code)]

use octagon_crypto::KdfParams;
use octagon_engine::{
    Collaborators, InMemoryPeerListService, LockStateTracker, OctagonConfig, OctagonResult,
    OctagonState, SimulatedAccount, SimulatedCloud, TrustContext,
};
use octagon_store::AccountStore;
use octagon_trust::DeviceInfo;
use octagon_types::{ContainerName, ContextId};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub const WAIT: Duration = Duration::from_secs(60);
pub const ALT_DSID: &str = "altdsid-1234";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn device_info(machine_id: &str, model_id: &str) -> DeviceInfo {
    DeviceInfo {
        machine_id: machine_id.to_string(),
        model_id: model_id.to_string(),
        device_name: format!("{model_id} ({machine_id})"),
        os_version: "18.0".to_string(),
    }
}

pub fn test_config(device: DeviceInfo) -> OctagonConfig {
    OctagonConfig {
        recovery_kdf: KdfParams::minimal(),
        device,
        ..OctagonConfig::default()
    }
}

/// The shared backend: peer list service plus key zones and pushes.
pub struct Cloud {
    pub service: Arc<InMemoryPeerListService>,
    pub zones: Arc<SimulatedCloud>,
}

impl Cloud {
    pub fn new() -> Self {
        let zones = Arc::new(SimulatedCloud::new());
        let service = Arc::new(InMemoryPeerListService::new().with_notifier(zones.notifier()));
        Self { service, zones }
    }

    pub fn peer_count(&self) -> usize {
        self.service.peer_count(&ContainerName::default())
    }
}

/// One device: its account, lock state, store and running context.
pub struct Device {
    pub account: Arc<SimulatedAccount>,
    pub lock: LockStateTracker,
    pub store: AccountStore,
    pub info: DeviceInfo,
    pub context: TrustContext,
}

impl Device {
    pub fn start(cloud: &Cloud, machine_id: &str, model_id: &str) -> Self {
        Self::start_with(
            cloud,
            device_info(machine_id, model_id),
            AccountStore::open_in_memory().unwrap(),
            LockStateTracker::unlocked(),
            Arc::new(SimulatedAccount::new()),
        )
    }

    pub fn start_with(
        cloud: &Cloud,
        info: DeviceInfo,
        store: AccountStore,
        lock: LockStateTracker,
        account: Arc<SimulatedAccount>,
    ) -> Self {
        let collaborators = Collaborators::new(
            store.clone(),
            cloud.service.clone(),
            cloud.zones.clone(),
            account.clone(),
            lock.clone(),
        );
        let context = TrustContext::start(
            ContainerName::default(),
            ContextId::default(),
            collaborators,
            test_config(info.clone()),
        );
        Self {
            account,
            lock,
            store,
            info,
            context,
        }
    }

    /// Restarts the context over the same store, as after a reboot.
    pub fn restart(self, cloud: &Cloud) -> Self {
        let Device {
            account,
            lock,
            store,
            info,
            context,
        } = self;
        context.shutdown();
        drop(context);
        Self::start_with(cloud, info, store, lock, account)
    }

    pub fn state(&self) -> OctagonState {
        self.context.current_state()
    }

    pub async fn sign_in(&self, expect: OctagonState) {
        self.context.sign_in(Some(ALT_DSID.to_string()));
        self.context.wait_for_state(expect, WAIT).await.unwrap();
    }

    pub async fn wait_for(&self, state: OctagonState) {
        self.context
            .wait_for_state(state, WAIT)
            .await
            .unwrap_or_else(|e| panic!("waiting for {state}, stuck in {}: {e}", self.state()));
    }

    pub async fn settle(&self) {
        self.context.wait_for_pause(WAIT).await.unwrap();
    }
}

/// A device that signed in to an empty container and established it.
pub async fn establish(cloud: &Cloud, machine_id: &str) -> Device {
    let device = Device::start(cloud, machine_id, "iPhone17,1");
    device.sign_in(OctagonState::WaitForCDP).await;
    device.context.reset_and_establish(WAIT).await.unwrap();
    device.wait_for(OctagonState::Ready).await;
    device
}

/// A device that joined through `sponsor`'s voucher.
pub async fn join_via(cloud: &Cloud, sponsor: &Device, machine_id: &str, model_id: &str) -> Device {
    let device = Device::start(cloud, machine_id, model_id);
    device.sign_in(OctagonState::Untrusted).await;
    let prepared = device.context.prepare_identity(WAIT).await.unwrap();
    let voucher = sponsor.context.vouch(prepared, WAIT).await.unwrap();
    device.context.join_with_voucher(voucher, WAIT).await.unwrap();
    device.wait_for(OctagonState::Ready).await;
    device
}

/// Polls `check` until it holds or `WAIT` passes.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let poll = async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    if tokio::time::timeout(WAIT, poll).await.is_err() {
        panic!("timed out waiting until {what}");
    }
}

/// Trusted peers (other than self) as `device` sees them.
pub async fn trusted_count(device: &Device) -> OctagonResult<usize> {
    Ok(device
        .context
        .fetch_trust_status(WAIT)
        .await?
        .trusted_peer_count)
}

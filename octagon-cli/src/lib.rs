//! Simulated multi-device scenarios for the `octagon` binary.
//!
//! Every device gets its own store, account and lock state; all of them
//! share one in-process peer list service and key-zone cloud.

use anyhow::{bail, Context, Result};
use octagon_engine::{
    Collaborators, InMemoryPeerListService, LockStateTracker, OctagonConfig, OctagonManager,
    OctagonState, SimulatedAccount, SimulatedCloud, TrustContext, TrustDump, TrustStatus,
};
use octagon_store::AccountStore;
use octagon_trust::DeviceInfo;
use octagon_types::ContainerName;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Models handed out round-robin. All of them may introduce each other.
const MODELS: [&str; 3] = ["iPhone17,1", "Mac16,1", "iPad16,3"];

const ALT_DSID: &str = "simulated-account";

#[derive(Debug, Clone)]
pub struct SimulationOptions {
    pub devices: usize,
    /// Shared by every device; `device` is replaced per device.
    pub config: OctagonConfig,
    /// Budget for each request and for the clique to converge.
    pub timeout: Duration,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            devices: 3,
            config: OctagonConfig::default(),
            timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceReport {
    pub machine_id: String,
    pub model_id: String,
    pub status: TrustStatus,
    pub dump: TrustDump,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub devices: Vec<DeviceReport>,
    pub service_peers: usize,
}

struct SimDevice {
    info: DeviceInfo,
    manager: OctagonManager,
    context: Arc<TrustContext>,
}

pub fn device_info(index: usize) -> DeviceInfo {
    let model_id = MODELS[index % MODELS.len()];
    let machine_id = format!("machine-{index}");
    DeviceInfo {
        device_name: format!("{model_id} ({machine_id})"),
        machine_id,
        model_id: model_id.to_string(),
        os_version: "18.0".to_string(),
    }
}

fn start_device(
    index: usize,
    options: &SimulationOptions,
    service: &Arc<InMemoryPeerListService>,
    cloud: &Arc<SimulatedCloud>,
) -> Result<SimDevice> {
    let info = device_info(index);
    let store = AccountStore::open_in_memory().context("opening device store")?;
    let collaborators = Collaborators::new(
        store,
        service.clone(),
        cloud.clone(),
        Arc::new(SimulatedAccount::new()),
        LockStateTracker::unlocked(),
    );
    let manager = OctagonManager::new(collaborators, options.config.for_device(info.clone()));
    let context = manager.default_context();
    Ok(SimDevice {
        info,
        manager,
        context,
    })
}

async fn sign_in(device: &SimDevice, expect: OctagonState, timeout: Duration) -> Result<()> {
    device.context.sign_in(Some(ALT_DSID.to_string()));
    device
        .context
        .wait_for_state(expect, timeout)
        .await
        .with_context(|| format!("{} never reached {expect}", device.info.machine_id))
}

/// Waits until every device trusts every other one.
async fn converge(devices: &[SimDevice], timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let want = devices.len().saturating_sub(1);
    loop {
        let mut settled = true;
        for device in devices {
            let status = device.context.fetch_trust_status(timeout).await?;
            if status.trusted_peer_count != want {
                debug!(
                    machine = %device.info.machine_id,
                    trusted = status.trusted_peer_count,
                    want,
                    "not converged yet"
                );
                settled = false;
            }
        }
        if settled {
            return Ok(());
        }
        if Instant::now() >= deadline {
            bail!("clique did not converge within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Establishes a clique on the first device, joins the rest through its
/// vouchers, and reports every device once they all trust each other.
pub async fn simulate(options: &SimulationOptions) -> Result<SimulationReport> {
    if options.devices == 0 {
        bail!("need at least one device");
    }
    let cloud = Arc::new(SimulatedCloud::new());
    let service = Arc::new(InMemoryPeerListService::new().with_notifier(cloud.notifier()));
    let timeout = options.timeout;

    let mut devices = Vec::with_capacity(options.devices);
    let founder = start_device(0, options, &service, &cloud)?;
    sign_in(&founder, OctagonState::WaitForCDP, timeout).await?;
    let peer = founder.context.reset_and_establish(timeout).await?;
    founder.context.wait_for_ready(timeout).await?;
    info!(machine = %founder.info.machine_id, %peer, "established");
    devices.push(founder);

    for index in 1..options.devices {
        let device = start_device(index, options, &service, &cloud)?;
        sign_in(&device, OctagonState::Untrusted, timeout).await?;
        let prepared = device.context.prepare_identity(timeout).await?;
        let voucher = devices[0].context.vouch(prepared, timeout).await?;
        let peer = device.context.join_with_voucher(voucher, timeout).await?;
        device.context.wait_for_ready(timeout).await?;
        info!(machine = %device.info.machine_id, %peer, "joined");
        devices.push(device);
    }

    converge(&devices, timeout).await?;
    for device in &devices {
        device.context.wait_for_views_ready(timeout).await?;
    }

    let mut reports = Vec::with_capacity(devices.len());
    for device in &devices {
        reports.push(DeviceReport {
            machine_id: device.info.machine_id.clone(),
            model_id: device.info.model_id.clone(),
            status: device.context.fetch_trust_status(timeout).await?,
            dump: device.context.dump()?,
        });
    }
    let service_peers = service.peer_count(&ContainerName::default());
    for device in &devices {
        device.manager.shutdown();
    }
    Ok(SimulationReport {
        devices: reports,
        service_peers,
    })
}

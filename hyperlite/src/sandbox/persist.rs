//! Snapshot of a running sandbox, enough to reattach after a restart.
//!
//! The snapshot is the ground truth on load: hardware bindings are not
//! re-verified against the monitor.

use super::context::{BlockBinding, Counters, HwState, NetworkBinding};
use super::spec::{ContainerInfo, PodSpec, VmPod, VolumeInfo};
use super::tracker::DeviceKey;
use crate::portal::SessionInfo;
use crate::runtime::BootConfig;
use crate::vmm::DriverState;
use hyperlite_shared::{HyperliteError, HyperliteResult};
use serde::{Deserialize, Serialize};

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub id: String,
    pub boot: BootConfig,
    pub driver: DriverState,
    pub counters: Counters,
    pub pod: Option<PodSpec>,
    pub runtime: Option<VmPod>,
    pub containers: Vec<ContainerInfo>,
    pub volumes: Vec<VolumeInfo>,
    pub block_devices: Vec<BlockBinding>,
    pub networks: Vec<NetworkBinding>,
    pub tty_sessions: Vec<SessionInfo>,
}

impl Snapshot {
    /// Capture the hardware and pod state of a sandbox.
    pub fn dump(
        id: &str,
        boot: &BootConfig,
        driver: DriverState,
        hw: &HwState,
        tty_sessions: Vec<SessionInfo>,
    ) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            id: id.to_string(),
            boot: boot.clone(),
            driver,
            counters: hw.counters,
            pod: hw.pod.clone(),
            runtime: hw.runtime.clone(),
            containers: hw.containers.clone(),
            volumes: hw.volumes.clone(),
            block_devices: hw.block_devices.values().cloned().collect(),
            networks: hw.networks.values().cloned().collect(),
            // Only console sessions survive; exec clients are gone after a restart.
            tty_sessions: tty_sessions.into_iter().filter(|s| s.persistent).collect(),
        }
    }

    /// Rebuild the hardware state. Every bound device is marked attached.
    pub fn load(&self) -> HwState {
        let mut hw = HwState {
            counters: self.counters,
            pod: self.pod.clone(),
            runtime: self.runtime.clone(),
            containers: self.containers.clone(),
            volumes: self.volumes.clone(),
            ..Default::default()
        };

        for binding in &self.block_devices {
            hw.tracker.mark_adding(binding.key());
            hw.tracker.confirm(&binding.key());
            hw.block_devices.insert(binding.name.clone(), binding.clone());
        }
        for binding in &self.networks {
            let key = DeviceKey::Network(binding.settings.index);
            hw.tracker.mark_adding(key.clone());
            hw.tracker.confirm(&key);
            hw.networks.insert(binding.settings.index, binding.clone());
        }
        hw
    }

    pub fn to_bytes(&self) -> HyperliteResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> HyperliteResult<Self> {
        let snapshot: Snapshot = serde_json::from_slice(bytes)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(HyperliteError::InvalidState(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        Ok(snapshot)
    }
}

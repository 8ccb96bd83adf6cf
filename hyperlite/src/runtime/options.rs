//! Runtime configuration.

use crate::monitor::RetryPolicy;
use crate::portal::FinishPolicy;
use hyperlite_shared::{HyperliteError, HyperliteResult};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

pub const HOME_ENV: &str = "HYPERLITE_HOME";
const DEFAULT_KERNEL: &str = "/var/lib/hyper/kernel";
const DEFAULT_INITRD: &str = "/var/lib/hyper/hyper-initrd.img";

/// Serialize a `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Options for a [`SandboxRuntime`](crate::SandboxRuntime).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeOptions {
    pub home_dir: PathBuf,
    pub qemu_binary: PathBuf,
    pub timeouts: Timeouts,
    pub monitor_retry: RetryPolicy,
    pub finish_policy: FinishPolicy,
    /// Capacity of each sandbox's event queue.
    pub event_queue_capacity: usize,
    pub network: NetworkOptions,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        let home_dir = std::env::var_os(HOME_ENV)
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|h| h.join(".hyperlite")))
            .unwrap_or_else(|| PathBuf::from("/var/run/hyperlite"));

        Self {
            home_dir,
            qemu_binary: PathBuf::from("qemu-system-x86_64"),
            timeouts: Timeouts::default(),
            monitor_retry: RetryPolicy::default(),
            finish_policy: FinishPolicy::default(),
            event_queue_capacity: 128,
            network: NetworkOptions::default(),
        }
    }
}

impl RuntimeOptions {
    pub fn sanitize(&self) -> HyperliteResult<()> {
        if !self.home_dir.is_absolute() {
            return Err(HyperliteError::Config(format!(
                "home_dir must be absolute path, got: {}",
                self.home_dir.display()
            )));
        }
        if self.event_queue_capacity == 0 {
            return Err(HyperliteError::Config(
                "event_queue_capacity must be positive".into(),
            ));
        }
        if self.monitor_retry.max_attempts == 0 {
            return Err(HyperliteError::Config(
                "monitor_retry.max_attempts must be positive".into(),
            ));
        }
        self.network.sanitize()
    }
}

/// Deadlines applied by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Hotplug plus start-pod acknowledgement.
    #[serde(with = "duration_ms")]
    pub start_pod: Duration,
    #[serde(with = "duration_ms")]
    pub stop_pod: Duration,
    #[serde(with = "duration_ms")]
    pub destroy_pod: Duration,
    /// Grace period between monitor `quit` and SIGKILL.
    #[serde(with = "duration_ms")]
    pub kill_grace: Duration,
    /// Wait for unplug confirmations after the hypervisor exited.
    #[serde(with = "duration_ms")]
    pub close_grace: Duration,
    #[serde(with = "duration_ms")]
    pub monitor_handshake: Duration,
    #[serde(with = "duration_ms")]
    pub guest_connect: Duration,
    #[serde(with = "duration_ms")]
    pub ping_interval: Duration,
    #[serde(with = "duration_ms")]
    pub pong_timeout: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            start_pod: Duration::from_secs(60),
            stop_pod: Duration::from_secs(30),
            destroy_pod: Duration::from_secs(10),
            kill_grace: Duration::from_secs(10),
            close_grace: Duration::from_secs(60),
            monitor_handshake: Duration::from_secs(10),
            guest_connect: Duration::from_secs(30),
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(30),
        }
    }
}

/// Boot parameters of one sandbox. Immutable once the sandbox is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootConfig {
    pub cpus: u32,
    pub memory_mib: u32,
    pub kernel: Option<PathBuf>,
    pub initrd: Option<PathBuf>,
    /// Firmware image; when set the VM boots from it instead of kernel/initrd.
    pub bios: Option<PathBuf>,
    pub cbfs: Option<PathBuf>,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            cpus: 1,
            memory_mib: 128,
            kernel: Some(PathBuf::from(DEFAULT_KERNEL)),
            initrd: Some(PathBuf::from(DEFAULT_INITRD)),
            bios: None,
            cbfs: None,
        }
    }
}

impl BootConfig {
    pub fn sanitize(&self) -> HyperliteResult<()> {
        if self.cpus == 0 {
            return Err(HyperliteError::Config("cpus must be at least 1".into()));
        }
        if self.memory_mib < 64 {
            return Err(HyperliteError::Config(format!(
                "memory_mib {} is below the 64 MiB minimum",
                self.memory_mib
            )));
        }
        if self.bios.is_none() && self.kernel.is_none() {
            return Err(HyperliteError::Config(
                "either a kernel or a bios image is required".into(),
            ));
        }
        Ok(())
    }
}

/// Host networking for sandbox interfaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkOptions {
    /// Bridge every tap device is enslaved to. `None` leaves taps unbridged.
    pub bridge: Option<String>,
    pub subnet: Ipv4Addr,
    pub prefix_len: u8,
    pub gateway: Ipv4Addr,
}

impl Default for NetworkOptions {
    fn default() -> Self {
        Self {
            bridge: Some("hyper0".to_string()),
            subnet: Ipv4Addr::new(192, 168, 123, 0),
            prefix_len: 24,
            gateway: Ipv4Addr::new(192, 168, 123, 1),
        }
    }
}

impl NetworkOptions {
    pub fn sanitize(&self) -> HyperliteResult<()> {
        if !(8..=30).contains(&self.prefix_len) {
            return Err(HyperliteError::Config(format!(
                "network prefix /{} out of range",
                self.prefix_len
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timeouts() {
        let t = Timeouts::default();
        assert_eq!(t.start_pod, Duration::from_secs(60));
        assert_eq!(t.stop_pod, Duration::from_secs(30));
        assert_eq!(t.ping_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_options_from_partial_json() {
        let json = r#"{"home_dir":"/srv/hl","timeouts":{"start_pod":5000}}"#;
        let options: RuntimeOptions = serde_json::from_str(json).unwrap();
        assert_eq!(options.home_dir, PathBuf::from("/srv/hl"));
        assert_eq!(options.timeouts.start_pod, Duration::from_secs(5));
        assert_eq!(options.timeouts.stop_pod, Duration::from_secs(30));
        assert_eq!(options.event_queue_capacity, 128);
        options.sanitize().unwrap();
    }

    #[test]
    fn test_relative_home_rejected() {
        let options = RuntimeOptions {
            home_dir: PathBuf::from("relative"),
            ..Default::default()
        };
        assert!(matches!(options.sanitize(), Err(HyperliteError::Config(_))));
    }

    #[test]
    fn test_boot_config_requires_image() {
        let boot = BootConfig {
            kernel: None,
            ..Default::default()
        };
        assert!(boot.sanitize().is_err());
        BootConfig::default().sanitize().unwrap();
    }
}

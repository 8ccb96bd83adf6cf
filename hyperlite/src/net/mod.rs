//! Host-side network interfaces for sandboxes.
//!
//! The control plane only needs a tap file descriptor plus addressing for
//! each guest interface; [`NetworkAllocator`] hides how the host provides
//! them. [`TapAllocator`] is the default, backed by `/dev/net/tun` and an
//! IPv4 address pool.

mod pool;
mod tap;

pub use pool::Ipv4Pool;
pub use tap::TapAllocator;

use async_trait::async_trait;
use hyperlite_shared::HyperliteResult;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::os::fd::OwnedFd;
use std::sync::Arc;

/// Guest interface name for an interface index.
pub fn guest_device_name(index: usize) -> String {
    format!("eth{}", index)
}

/// Everything needed to plug one interface into a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceSettings {
    pub index: usize,
    /// Host tap device, also used as the monitor id of the NIC.
    pub host_device: String,
    pub mac: String,
    pub ip_addr: Ipv4Addr,
    pub prefix_len: u8,
    pub gateway: Ipv4Addr,
    pub bridge: Option<String>,
    /// Tap file descriptor handed to the hypervisor. Not persisted.
    #[serde(skip)]
    pub fd: Option<SharedFd>,
}

impl InterfaceSettings {
    pub fn netmask(&self) -> Ipv4Addr {
        prefix_to_netmask(self.prefix_len)
    }

    /// Interface 0 carries the default route.
    pub fn is_primary(&self) -> bool {
        self.index == 0
    }
}

/// Reference-counted tap descriptor.
///
/// Equality compares identity so settings stay comparable in tests.
#[derive(Debug, Clone)]
pub struct SharedFd(pub Arc<OwnedFd>);

impl PartialEq for SharedFd {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for SharedFd {}

pub fn prefix_to_netmask(prefix_len: u8) -> Ipv4Addr {
    if prefix_len == 0 {
        return Ipv4Addr::UNSPECIFIED;
    }
    Ipv4Addr::from(u32::MAX << (32 - u32::from(prefix_len.min(32))))
}

#[async_trait]
pub trait NetworkAllocator: Send + Sync {
    /// Create the host side of interface `index` for a sandbox.
    async fn allocate(&self, sandbox_id: &str, index: usize) -> HyperliteResult<InterfaceSettings>;

    /// Release host resources of an interface. Releasing twice is harmless.
    async fn release(&self, settings: &InterfaceSettings) -> HyperliteResult<()>;

    /// Take back an interface that survived a control plane restart.
    fn restore(&self, _settings: &InterfaceSettings) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_to_netmask() {
        assert_eq!(prefix_to_netmask(24), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(prefix_to_netmask(16), Ipv4Addr::new(255, 255, 0, 0));
        assert_eq!(prefix_to_netmask(0), Ipv4Addr::UNSPECIFIED);
    }

    #[test]
    fn test_guest_device_name() {
        assert_eq!(guest_device_name(0), "eth0");
        assert_eq!(guest_device_name(3), "eth3");
    }
}

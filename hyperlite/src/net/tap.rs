use super::{InterfaceSettings, Ipv4Pool, NetworkAllocator, SharedFd};
use crate::runtime::NetworkOptions;
use async_trait::async_trait;
use hyperlite_shared::{HyperliteError, HyperliteResult};
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::os::fd::OwnedFd;
use std::sync::Arc;

/// Creates one tap device per interface and enslaves it to a bridge.
pub struct TapAllocator {
    options: NetworkOptions,
    pool: Mutex<Ipv4Pool>,
}

impl TapAllocator {
    pub fn new(options: NetworkOptions) -> Self {
        let pool = Ipv4Pool::new(options.subnet, options.prefix_len, options.gateway);
        Self {
            options,
            pool: Mutex::new(pool),
        }
    }
}

/// Locally administered MAC derived from the sandbox and interface index.
pub(crate) fn generate_mac(sandbox_id: &str, index: usize) -> String {
    let mut hasher = DefaultHasher::new();
    sandbox_id.hash(&mut hasher);
    index.hash(&mut hasher);
    let bytes = hasher.finish().to_be_bytes();
    format!(
        "52:54:00:{:02x}:{:02x}:{:02x}",
        bytes[0], bytes[1], bytes[2]
    )
}

#[async_trait]
impl NetworkAllocator for TapAllocator {
    async fn allocate(&self, sandbox_id: &str, index: usize) -> HyperliteResult<InterfaceSettings> {
        let ip_addr = self.pool.lock().allocate()?;

        let bridge = self.options.bridge.clone();
        let created = tokio::task::spawn_blocking(move || create_tap(bridge.as_deref()))
            .await
            .map_err(|e| HyperliteError::Internal(format!("tap creation task failed: {}", e)))
            .and_then(|r| r);

        let (fd, host_device) = match created {
            Ok(created) => created,
            Err(e) => {
                self.pool.lock().release(ip_addr);
                return Err(e);
            }
        };

        tracing::debug!(
            sandbox_id = %sandbox_id,
            index,
            device = %host_device,
            ip = %ip_addr,
            "Allocated tap interface"
        );

        Ok(InterfaceSettings {
            index,
            host_device,
            mac: generate_mac(sandbox_id, index),
            ip_addr,
            prefix_len: self.options.prefix_len,
            gateway: self.options.gateway,
            bridge: self.options.bridge.clone(),
            fd: Some(SharedFd(Arc::new(fd))),
        })
    }

    async fn release(&self, settings: &InterfaceSettings) -> HyperliteResult<()> {
        // The tap is not persistent; it disappears once the hypervisor and we
        // have both closed the descriptor.
        if self.pool.lock().release(settings.ip_addr) {
            tracing::debug!(device = %settings.host_device, ip = %settings.ip_addr, "Released tap interface");
        }
        Ok(())
    }

    fn restore(&self, settings: &InterfaceSettings) {
        if !self.pool.lock().reserve(settings.ip_addr) {
            tracing::warn!(device = %settings.host_device, ip = %settings.ip_addr, "Restored address outside pool or already taken");
        }
    }
}

#[cfg(target_os = "linux")]
fn create_tap(bridge: Option<&str>) -> HyperliteResult<(OwnedFd, String)> {
    use std::os::fd::{AsRawFd, FromRawFd};

    const TUNSETIFF: libc::c_ulong = 0x400454ca;

    let raw = unsafe { libc::open(c"/dev/net/tun".as_ptr(), libc::O_RDWR | libc::O_CLOEXEC) };
    if raw < 0 {
        return Err(os_error("open /dev/net/tun"));
    }
    let tap = unsafe { OwnedFd::from_raw_fd(raw) };

    let mut req = new_ifreq("hltap%d");
    req.ifr_ifru.ifru_flags = (libc::IFF_TAP | libc::IFF_NO_PI) as libc::c_short;
    if unsafe { libc::ioctl(tap.as_raw_fd(), TUNSETIFF as _, &mut req) } < 0 {
        return Err(os_error("TUNSETIFF"));
    }
    let name = ifreq_name(&req);

    let sock = control_socket()?;
    let mut flags = new_ifreq(&name);
    if unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCGIFFLAGS as _, &mut flags) } < 0 {
        return Err(os_error("SIOCGIFFLAGS"));
    }
    let current = unsafe { flags.ifr_ifru.ifru_flags };
    flags.ifr_ifru.ifru_flags = current | libc::IFF_UP as libc::c_short;
    if unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCSIFFLAGS as _, &mut flags) } < 0 {
        return Err(os_error("SIOCSIFFLAGS"));
    }

    if let Some(bridge) = bridge {
        const SIOCBRADDIF: libc::c_ulong = 0x89a2;

        let c_name = std::ffi::CString::new(name.as_str())
            .map_err(|e| HyperliteError::Network(e.to_string()))?;
        let ifindex = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
        if ifindex == 0 {
            return Err(os_error("if_nametoindex"));
        }
        let mut br = new_ifreq(bridge);
        br.ifr_ifru.ifru_ifindex = ifindex as libc::c_int;
        if unsafe { libc::ioctl(sock.as_raw_fd(), SIOCBRADDIF as _, &mut br) } < 0 {
            return Err(os_error(&format!("attach {} to bridge {}", name, bridge)));
        }
    }

    Ok((tap, name))
}

#[cfg(not(target_os = "linux"))]
fn create_tap(_bridge: Option<&str>) -> HyperliteResult<(OwnedFd, String)> {
    Err(HyperliteError::Network(
        "tap devices are only supported on Linux".into(),
    ))
}

#[cfg(target_os = "linux")]
fn new_ifreq(name: &str) -> libc::ifreq {
    let mut req: libc::ifreq = unsafe { std::mem::zeroed() };
    for (dst, src) in req
        .ifr_name
        .iter_mut()
        .zip(name.bytes().take(libc::IFNAMSIZ - 1))
    {
        *dst = src as libc::c_char;
    }
    req
}

#[cfg(target_os = "linux")]
fn ifreq_name(req: &libc::ifreq) -> String {
    let bytes: Vec<u8> = req
        .ifr_name
        .iter()
        .take_while(|c| **c != 0)
        .map(|c| *c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(target_os = "linux")]
fn control_socket() -> HyperliteResult<OwnedFd> {
    use std::os::fd::FromRawFd;

    let raw = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
    if raw < 0 {
        return Err(os_error("socket"));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

#[cfg(target_os = "linux")]
fn os_error(op: &str) -> HyperliteError {
    HyperliteError::Network(format!("{}: {}", op, std::io::Error::last_os_error()))
}

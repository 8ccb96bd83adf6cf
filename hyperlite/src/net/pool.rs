use hyperlite_shared::{HyperliteError, HyperliteResult};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;

/// Allocates host addresses out of an IPv4 subnet.
///
/// The network, broadcast and gateway addresses are never handed out.
#[derive(Debug, Clone)]
pub struct Ipv4Pool {
    network: u32,
    prefix_len: u8,
    gateway: u32,
    allocated: BTreeSet<u32>,
}

impl Ipv4Pool {
    pub fn new(subnet: Ipv4Addr, prefix_len: u8, gateway: Ipv4Addr) -> Self {
        let mask = if prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(prefix_len.min(32)))
        };
        Self {
            network: u32::from(subnet) & mask,
            prefix_len,
            gateway: u32::from(gateway),
            allocated: BTreeSet::new(),
        }
    }

    fn broadcast(&self) -> u32 {
        let host_bits = 32 - u32::from(self.prefix_len.min(32));
        self.network | ((1u64 << host_bits) - 1) as u32
    }

    pub fn allocate(&mut self) -> HyperliteResult<Ipv4Addr> {
        let broadcast = self.broadcast();
        let candidate = (self.network + 1..broadcast)
            .find(|addr| *addr != self.gateway && !self.allocated.contains(addr));

        match candidate {
            Some(addr) => {
                self.allocated.insert(addr);
                Ok(Ipv4Addr::from(addr))
            }
            None => Err(HyperliteError::Network(format!(
                "address pool {}/{} exhausted",
                Ipv4Addr::from(self.network),
                self.prefix_len
            ))),
        }
    }

    /// Mark an address handed out by a previous process as taken.
    ///
    /// Returns false when the address is outside the pool or already taken.
    pub fn reserve(&mut self, addr: Ipv4Addr) -> bool {
        let addr = u32::from(addr);
        if addr <= self.network || addr >= self.broadcast() || addr == self.gateway {
            return false;
        }
        self.allocated.insert(addr)
    }

    pub fn release(&mut self, addr: Ipv4Addr) -> bool {
        self.allocated.remove(&u32::from(addr))
    }

    pub fn allocated(&self) -> usize {
        self.allocated.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skips_network_and_gateway() {
        let mut pool = Ipv4Pool::new(
            Ipv4Addr::new(10, 0, 0, 0),
            24,
            Ipv4Addr::new(10, 0, 0, 1),
        );
        assert_eq!(pool.allocate().unwrap(), Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(pool.allocate().unwrap(), Ipv4Addr::new(10, 0, 0, 3));
    }

    #[test]
    fn test_released_address_reused() {
        let mut pool = Ipv4Pool::new(
            Ipv4Addr::new(10, 0, 0, 0),
            24,
            Ipv4Addr::new(10, 0, 0, 1),
        );
        let a = pool.allocate().unwrap();
        let _b = pool.allocate().unwrap();
        assert!(pool.release(a));
        assert!(!pool.release(a));
        assert_eq!(pool.allocate().unwrap(), a);
    }

    #[test]
    fn test_reserved_address_skipped() {
        let mut pool = Ipv4Pool::new(
            Ipv4Addr::new(10, 0, 0, 0),
            24,
            Ipv4Addr::new(10, 0, 0, 1),
        );
        assert!(pool.reserve(Ipv4Addr::new(10, 0, 0, 2)));
        assert!(!pool.reserve(Ipv4Addr::new(10, 0, 0, 2)));
        assert!(!pool.reserve(Ipv4Addr::new(10, 0, 0, 1)));
        assert!(!pool.reserve(Ipv4Addr::new(10, 0, 1, 2)));
        assert_eq!(pool.allocate().unwrap(), Ipv4Addr::new(10, 0, 0, 3));
    }

    #[test]
    fn test_exhaustion() {
        // /30 has two host addresses, one of them is the gateway.
        let mut pool = Ipv4Pool::new(
            Ipv4Addr::new(10, 0, 0, 0),
            30,
            Ipv4Addr::new(10, 0, 0, 1),
        );
        assert_eq!(pool.allocate().unwrap(), Ipv4Addr::new(10, 0, 0, 2));
        assert!(matches!(pool.allocate(), Err(HyperliteError::Network(_))));
    }
}

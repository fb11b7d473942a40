//! IPv4 CIDR parsing and host enumeration

use std::net::Ipv4Addr;

use crate::error::{AppError, Result};

/// Shortest prefix accepted for a scan (65534 hosts)
pub const MIN_SCAN_PREFIX: u8 = 16;

/// A parsed IPv4 network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    network: Ipv4Addr,
    prefix: u8,
}

impl Subnet {
    /// Parse `a.b.c.d/len`; host bits in the address are masked off
    pub fn parse(cidr: &str) -> Result<Self> {
        let (addr, prefix) = cidr
            .trim()
            .split_once('/')
            .ok_or_else(|| AppError::Discovery(format!("Invalid CIDR format: {}", cidr)))?;

        let base: Ipv4Addr = addr
            .parse()
            .map_err(|e| AppError::Discovery(format!("Invalid IP in {}: {}", cidr, e)))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|e| AppError::Discovery(format!("Invalid prefix in {}: {}", cidr, e)))?;
        if prefix > 32 {
            return Err(AppError::Discovery(format!(
                "Invalid prefix: {} (must be 0-32)",
                prefix
            )));
        }

        let network = Ipv4Addr::from(u32::from(base) & mask(prefix));
        Ok(Self { network, prefix })
    }

    /// The /24 containing `ip`
    pub fn slash24(ip: Ipv4Addr) -> Self {
        Self {
            network: Ipv4Addr::from(u32::from(ip) & mask(24)),
            prefix: 24,
        }
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) | !mask(self.prefix))
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & mask(self.prefix) == u32::from(self.network)
    }

    /// Host addresses, network and broadcast excluded.
    ///
    /// /31 and /32 have no addresses strictly between network and
    /// broadcast, so they yield nothing.
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> {
        let network = u32::from(self.network);
        let broadcast = u32::from(self.broadcast());
        let (start, end) = if broadcast - network < 2 {
            (1, 0)
        } else {
            (network + 1, broadcast - 1)
        };
        (start..=end).map(Ipv4Addr::from)
    }

    pub fn host_count(&self) -> u32 {
        let size = u32::from(self.broadcast()) - u32::from(self.network);
        size.saturating_sub(1)
    }
}

impl std::fmt::Display for Subnet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

fn mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        !((1u32 << (32 - prefix)) - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_masks_host_bits() {
        let subnet = Subnet::parse("192.168.1.77/24").unwrap();
        assert_eq!(subnet.network(), Ipv4Addr::new(192, 168, 1, 0));
        assert_eq!(subnet.broadcast(), Ipv4Addr::new(192, 168, 1, 255));
        assert_eq!(subnet.to_string(), "192.168.1.0/24");
    }

    #[test]
    fn test_hosts_exclude_network_and_broadcast() {
        for cidr in ["192.168.1.0/24", "10.20.0.0/22", "172.16.5.64/27", "10.0.0.0/30"] {
            let subnet = Subnet::parse(cidr).unwrap();
            let hosts: Vec<Ipv4Addr> = subnet.hosts().collect();

            assert_eq!(hosts.len() as u32, subnet.host_count(), "{}", cidr);
            assert!(!hosts.contains(&subnet.network()), "{}", cidr);
            assert!(!hosts.contains(&subnet.broadcast()), "{}", cidr);
            assert!(hosts.iter().all(|ip| subnet.contains(*ip)), "{}", cidr);
        }

        let hosts: Vec<Ipv4Addr> = Subnet::parse("192.168.1.0/24").unwrap().hosts().collect();
        assert_eq!(hosts.len(), 254);
        assert_eq!(hosts[0], Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(hosts[253], Ipv4Addr::new(192, 168, 1, 254));
    }

    #[test]
    fn test_tiny_prefixes_have_no_hosts() {
        assert_eq!(Subnet::parse("10.0.0.4/31").unwrap().hosts().count(), 0);
        assert_eq!(Subnet::parse("10.0.0.4/32").unwrap().hosts().count(), 0);
        assert_eq!(Subnet::parse("10.0.0.4/32").unwrap().host_count(), 0);
        assert_eq!(Subnet::parse("10.0.0.4/30").unwrap().hosts().count(), 2);
    }

    #[test]
    fn test_slash24() {
        let subnet = Subnet::slash24(Ipv4Addr::new(10, 1, 2, 3));
        assert_eq!(subnet.to_string(), "10.1.2.0/24");
    }

    #[test]
    fn test_parse_errors() {
        for bad in ["", "192.168.1.0", "192.168.1.0/33", "192.168.1/24", "x/24", "10.0.0.0/ab"] {
            assert!(
                matches!(Subnet::parse(bad), Err(AppError::Discovery(_))),
                "{:?} should not parse",
                bad
            );
        }
    }
}

//! IP allow list for the admin API.
use std::net::IpAddr;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid ip address: {0}")]
pub struct InvalidIp(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IpNet {
    addr: IpAddr,
    prefix: u8,
}

impl IpNet {
    fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX.checked_shl(32 - self.prefix as u32).unwrap_or(0);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX.checked_shl(128 - self.prefix as u32).unwrap_or(0);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

/// A set of single addresses and CIDR ranges.
#[derive(Debug, Clone, Default)]
pub struct IpList {
    nets: Vec<IpNet>,
}

impl IpList {
    /// Parse entries such as `127.0.0.1`, `10.0.0.0/8` or `::1`.
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self, InvalidIp> {
        let mut list = Self::default();
        for entry in entries {
            list.add(entry.as_ref())?;
        }
        Ok(list)
    }

    pub fn add(&mut self, entry: &str) -> Result<(), InvalidIp> {
        let invalid = || InvalidIp(entry.to_string());
        let (addr, prefix) = match entry.split_once('/') {
            Some((ip, bits)) => {
                let addr: IpAddr = ip.parse().map_err(|_| invalid())?;
                let bits: u8 = bits.parse().map_err(|_| invalid())?;
                (addr, bits)
            }
            None => {
                let addr: IpAddr = entry.parse().map_err(|_| invalid())?;
                (addr, if addr.is_ipv4() { 32 } else { 128 })
            }
        };
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(invalid());
        }
        self.nets.push(IpNet { addr, prefix });
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nets.len()
    }

    /// IPv4-mapped IPv6 addresses are matched as IPv4.
    pub fn contains(&self, ip: IpAddr) -> bool {
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
            v4 => v4,
        };
        self.nets.iter().any(|net| net.contains(ip))
    }
}

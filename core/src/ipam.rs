//! Overlay IP address management
//!
//! Allocates addresses for peers out of the virtual subnet. Allocation walks
//! /24 blocks inside the base network, expanding to the next block only when
//! the current one is full. Network (`.0`) and broadcast (`.255`) addresses
//! are never handed out.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum IpamError {
    #[error("invalid base subnet {0}")]
    InvalidSubnet(String),
    #[error("IP pool exhausted: cannot allocate more than {0} addresses")]
    Exhausted(u32),
}

/// Pool statistics
#[derive(Debug, Clone, PartialEq)]
pub struct PoolStats {
    pub base_subnet: String,
    pub current_subnet_index: u32,
    pub allocated: u32,
    pub available: u32,
    pub capacity: u32,
    pub utilization_percent: f64,
}

/// Allocates and releases overlay addresses from a base network.
pub struct IpAddressPool {
    base: u32,
    prefix: u8,
    allocated: HashSet<Ipv4Addr>,
    by_peer: HashMap<String, Ipv4Addr>,
    current_subnet_index: u32,
}

impl IpAddressPool {
    /// Create a pool over the default `10.66.0.0/16` network.
    pub fn new() -> Self {
        Self::with_base("10.66.0.0/16").expect("default subnet is valid")
    }

    /// Create a pool over an arbitrary base network. The prefix must be /24
    /// or wider so that at least one /24 block fits.
    pub fn with_base(cidr: &str) -> Result<Self, IpamError> {
        let (addr, prefix) = parse_cidr(cidr)?;
        if prefix > 24 {
            return Err(IpamError::InvalidSubnet(cidr.to_string()));
        }
        let mask = u32::MAX << (32 - prefix);
        let base = u32::from(addr) & mask;

        info!("IPAM initialized with base subnet {}/{}", Ipv4Addr::from(base), prefix);

        Ok(Self {
            base,
            prefix,
            allocated: HashSet::new(),
            by_peer: HashMap::new(),
            current_subnet_index: 0,
        })
    }

    /// Number of /24 blocks inside the base network.
    fn subnet_count(&self) -> u32 {
        1u32 << (24 - self.prefix)
    }

    fn max_capacity(&self) -> u32 {
        self.subnet_count() * 254
    }

    /// Network address of the /24 block at `index`.
    fn subnet_base(&self, index: u32) -> u32 {
        self.base + index * 256
    }

    /// Allocate an address for `peer_id`. Idempotent: a peer that already
    /// holds an address gets the same one back.
    pub fn allocate(&mut self, peer_id: &str) -> Result<Ipv4Addr, IpamError> {
        if let Some(ip) = self.by_peer.get(peer_id) {
            debug!("peer {} already allocated {}", peer_id, ip);
            return Ok(*ip);
        }

        loop {
            let subnet = self.subnet_base(self.current_subnet_index);
            // Host addresses only: .0 is the network, .255 the broadcast.
            for host in 1..=254u32 {
                let candidate = Ipv4Addr::from(subnet + host);
                if !self.allocated.contains(&candidate) {
                    self.allocated.insert(candidate);
                    self.by_peer.insert(peer_id.to_string(), candidate);
                    info!("allocated {} to peer {}", candidate, peer_id);
                    return Ok(candidate);
                }
            }

            if self.current_subnet_index + 1 >= self.subnet_count() {
                return Err(IpamError::Exhausted(self.max_capacity()));
            }
            self.current_subnet_index += 1;
            info!(
                "subnet {}/24 full, expanding to index {}",
                Ipv4Addr::from(subnet),
                self.current_subnet_index
            );
        }
    }

    /// Release the address held by `peer_id`, making it reusable.
    pub fn release(&mut self, peer_id: &str) -> Option<Ipv4Addr> {
        match self.by_peer.remove(peer_id) {
            Some(ip) => {
                self.allocated.remove(&ip);
                info!("released {} from peer {}", ip, peer_id);
                Some(ip)
            }
            None => {
                warn!("peer {} not found in allocation table", peer_id);
                None
            }
        }
    }

    /// Address currently held by `peer_id`, if any.
    pub fn get(&self, peer_id: &str) -> Option<Ipv4Addr> {
        self.by_peer.get(peer_id).copied()
    }

    pub fn stats(&self) -> PoolStats {
        let capacity = (self.current_subnet_index + 1) * 254;
        let allocated = self.allocated.len() as u32;
        PoolStats {
            base_subnet: format!("{}/{}", Ipv4Addr::from(self.base), self.prefix),
            current_subnet_index: self.current_subnet_index,
            allocated,
            available: capacity - allocated,
            capacity,
            utilization_percent: if capacity > 0 {
                allocated as f64 / capacity as f64 * 100.0
            } else {
                0.0
            },
        }
    }

    /// Integrity check: every allocation lies inside a /24 block with index
    /// at or below the current one.
    pub fn validate(&self) -> bool {
        for (peer_id, ip) in &self.by_peer {
            let offset = u32::from(*ip).wrapping_sub(self.base);
            let index = offset / 256;
            let host = offset % 256;
            if index > self.current_subnet_index || host == 0 || host == 255 {
                warn!("invalid allocation {} for peer {}", ip, peer_id);
                return false;
            }
        }
        true
    }
}

impl Default for IpAddressPool {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_cidr(cidr: &str) -> Result<(Ipv4Addr, u8), IpamError> {
    let (addr, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| IpamError::InvalidSubnet(cidr.to_string()))?;
    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|_| IpamError::InvalidSubnet(cidr.to_string()))?;
    let prefix: u8 = prefix
        .parse()
        .map_err(|_| IpamError::InvalidSubnet(cidr.to_string()))?;
    if prefix > 32 {
        return Err(IpamError::InvalidSubnet(cidr.to_string()));
    }
    Ok((addr, prefix))
}

//! Captured broadcast/multicast datagrams and their overlay wire format

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::net::Ipv4Addr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PacketCodecError {
    #[error("failed to encode packet: {0}")]
    Encode(String),
    #[error("failed to decode packet: {0}")]
    Decode(String),
}

/// Transport the packet was captured from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PacketProtocol {
    Udp,
    Multicast,
}

impl PacketProtocol {
    fn label(&self) -> &'static str {
        match self {
            PacketProtocol::Udp => "udp",
            PacketProtocol::Multicast => "multicast",
        }
    }
}

/// A captured LAN-discovery datagram, carried over the overlay and
/// re-emitted on the far side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastPacket {
    pub data: Vec<u8>,
    pub source_ip: Ipv4Addr,
    pub source_port: u16,
    pub dest_port: u16,
    pub protocol: PacketProtocol,
}

impl BroadcastPacket {
    /// SHA-256 over payload, source address, destination port, and protocol.
    /// Identical datagrams from the same origin produce identical
    /// fingerprints, which is what the dedup window keys on.
    pub fn fingerprint(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(&self.data);
        hasher.update(self.source_ip.octets());
        hasher.update(self.source_port.to_be_bytes());
        hasher.update(self.dest_port.to_be_bytes());
        hasher.update(self.protocol.label().as_bytes());
        hasher.finalize().into()
    }

    /// Encode for transport through the tunnel.
    pub fn to_wire(&self) -> Result<Vec<u8>, PacketCodecError> {
        bincode::serialize(self).map_err(|e| PacketCodecError::Encode(e.to_string()))
    }

    /// Decode a packet received from a peer.
    pub fn from_wire(bytes: &[u8]) -> Result<Self, PacketCodecError> {
        bincode::deserialize(bytes).map_err(|e| PacketCodecError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_round_trip() {
        let packet = BroadcastPacket {
            data: vec![0xAA, 0xBB, 0xCC],
            source_ip: Ipv4Addr::new(192, 168, 1, 100),
            source_port: 12345,
            dest_port: 4445,
            protocol: PacketProtocol::Udp,
        };
        let wire = packet.to_wire().unwrap();
        let decoded = BroadcastPacket::from_wire(&wire).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_from_wire_rejects_garbage() {
        assert!(BroadcastPacket::from_wire(&[0xFF]).is_err());
    }

    #[test]
    fn test_fingerprint_is_sha256() {
        let packet = BroadcastPacket {
            data: vec![1, 2, 3],
            source_ip: Ipv4Addr::new(10, 0, 0, 1),
            source_port: 1,
            dest_port: 2,
            protocol: PacketProtocol::Multicast,
        };
        assert_eq!(packet.fingerprint().len(), 32);
    }
}

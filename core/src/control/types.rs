//! Control-plane wire types
//!
//! JSON structs shared by the in-process store, the HTTP server, and the
//! HTTP client. Timestamps are RFC 3339 strings on the wire.

use crate::nat::NatType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;

/// Directory entry for a peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer_id: String,
    pub name: String,
    /// Hex-encoded 32-byte Curve25519 tunnel public key
    pub public_key: String,
    pub nat_type: NatType,
    pub public_ip: Ipv4Addr,
    pub public_port: u16,
    pub local_ip: Ipv4Addr,
    pub local_port: u16,
    /// Assigned overlay address, once the peer has one
    #[serde(default)]
    pub virtual_ip: Option<Ipv4Addr>,
    pub last_seen: DateTime<Utc>,
}

impl PeerInfo {
    /// Decode the tunnel public key. `None` if the hex is malformed or not
    /// 32 bytes.
    pub fn public_key_bytes(&self) -> Option<[u8; 32]> {
        let raw = hex::decode(&self.public_key).ok()?;
        raw.try_into().ok()
    }

    /// Public endpoint as `ip:port`
    pub fn public_endpoint(&self) -> std::net::SocketAddrV4 {
        std::net::SocketAddrV4::new(self.public_ip, self.public_port)
    }
}

/// A named group of peers sharing an overlay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartyInfo {
    pub party_id: String,
    pub name: String,
    pub host_id: String,
    pub created_at: DateTime<Utc>,
    pub peers: HashMap<String, PeerInfo>,
}

/// Registered relay server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayInfo {
    pub relay_id: String,
    pub public_ip: Ipv4Addr,
    pub port: u16,
    pub region: String,
    pub capacity: u32,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl RelayInfo {
    pub fn endpoint(&self) -> std::net::SocketAddrV4 {
        std::net::SocketAddrV4::new(self.public_ip, self.port)
    }
}

/// Relay registration request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayRegistration {
    pub relay_id: String,
    pub public_ip: Ipv4Addr,
    pub port: u16,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_capacity")]
    pub capacity: u32,
}

fn default_region() -> String {
    "unknown".to_string()
}

fn default_capacity() -> u32 {
    100
}

/// Bearer token bound to a peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthToken {
    pub token: String,
    pub peer_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl AuthToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Result of leaving a party
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaveOutcome {
    /// Peer removed, party still alive
    Left,
    /// Host left or the party emptied: the party was deleted
    PartyDeleted,
}

/// Generate a 6-byte hex party identifier.
pub fn generate_party_id() -> String {
    random_hex(6)
}

/// Generate an 8-byte hex peer identifier.
pub fn generate_peer_id() -> String {
    random_hex(8)
}

/// Generate a 32-byte bearer token.
pub fn generate_token() -> String {
    random_hex(32)
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut buf);
    hex::encode(buf)
}

//! The `ControlPlane` seam
//!
//! One interface over the authoritative registry, implemented by the
//! in-process [`crate::control::ControlStore`] and by the HTTP client
//! [`crate::control::HttpControlClient`]. Consumers (connection manager,
//! coordinator, CLI) only ever see this trait.

use super::types::{
    AuthToken, LeaveOutcome, PartyInfo, PeerInfo, RelayInfo, RelayRegistration,
};
use super::ControlError;
use async_trait::async_trait;
use std::collections::HashMap;

#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Register a peer and obtain a bearer token (24 h TTL).
    async fn register_peer(&self, peer_id: &str) -> Result<AuthToken, ControlError>;

    /// Create a party with the given host. A fresh party id is generated.
    async fn create_party(&self, name: &str, host: PeerInfo) -> Result<PartyInfo, ControlError>;

    /// Join an existing party, or refresh the peer's entry if already in it.
    async fn join_party(&self, party_id: &str, peer: PeerInfo) -> Result<PartyInfo, ControlError>;

    /// Remove a peer. Deletes the party when the host leaves or it empties.
    async fn leave_party(&self, party_id: &str, peer_id: &str)
        -> Result<LeaveOutcome, ControlError>;

    async fn get_party(&self, party_id: &str) -> Result<Option<PartyInfo>, ControlError>;

    async fn get_peers(&self, party_id: &str)
        -> Result<HashMap<String, PeerInfo>, ControlError>;

    async fn discover_peer(
        &self,
        party_id: &str,
        peer_id: &str,
    ) -> Result<Option<PeerInfo>, ControlError>;

    /// Advance the peer's `last_seen`.
    async fn heartbeat(&self, party_id: &str, peer_id: &str) -> Result<(), ControlError>;

    async fn register_relay(&self, relay: RelayRegistration) -> Result<(), ControlError>;

    async fn list_relays(&self) -> Result<Vec<RelayInfo>, ControlError>;

    async fn list_relays_by_region(&self, region: &str) -> Result<Vec<RelayInfo>, ControlError>;
}

// Control plane — party registry, peer directory, relay registry, token auth

pub mod client;
pub mod plane;
pub mod server;
pub mod store;
pub mod types;

use thiserror::Error;

pub use client::HttpControlClient;
pub use plane::ControlPlane;
pub use server::serve;
pub use store::ControlStore;
pub use types::{
    generate_party_id, generate_peer_id, generate_token, AuthToken, LeaveOutcome, PartyInfo,
    PeerInfo, RelayInfo, RelayRegistration,
};

/// Control-plane errors shared by the store, the HTTP server, and the client
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("party {0} not found")]
    PartyNotFound(String),
    #[error("peer {0} not found")]
    PeerNotFound(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("http error: {0}")]
    Http(String),
    #[error("request timeout")]
    Timeout,
    #[error("server returned {code}: {detail}")]
    Status { code: u16, detail: String },
}

impl ControlError {
    /// Whether this error corresponds to an HTTP 404.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ControlError::PartyNotFound(_)
                | ControlError::PeerNotFound(_)
                | ControlError::Status { code: 404, .. }
        )
    }
}

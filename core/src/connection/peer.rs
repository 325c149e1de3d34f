//! Per-peer connection record and lifecycle states

use crate::control::PeerInfo;
use crate::nat::PathStrategy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};
use tracing::info;

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Degraded,
    Failed,
    Cleanup,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Degraded => "degraded",
            ConnectionState::Failed => "failed",
            ConnectionState::Cleanup => "cleanup",
        };
        f.write_str(s)
    }
}

/// A connection to one peer. Owned exclusively by the connection manager;
/// everything external sees value copies via [`ConnectionStatus`].
#[derive(Debug, Clone)]
pub struct PeerConnection {
    pub peer_id: String,
    pub peer_info: PeerInfo,
    pub virtual_ip: Ipv4Addr,
    pub endpoint: SocketAddrV4,
    pub strategy: PathStrategy,
    pub relay_id: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub state: ConnectionState,
    pub last_latency: Option<f64>,
    pub failed_at: Option<Instant>,
}

impl PeerConnection {
    pub fn new(
        peer_info: PeerInfo,
        virtual_ip: Ipv4Addr,
        endpoint: SocketAddrV4,
        strategy: PathStrategy,
        relay_id: Option<String>,
    ) -> Self {
        Self {
            peer_id: peer_info.peer_id.clone(),
            peer_info,
            virtual_ip,
            endpoint,
            strategy,
            relay_id,
            connected_at: Utc::now(),
            state: ConnectionState::Connecting,
            last_latency: None,
            failed_at: None,
        }
    }

    /// Transition to `new_state`, stamping `failed_at` on entry to `Failed`.
    pub fn set_state(&mut self, new_state: ConnectionState) {
        if self.state == new_state {
            return;
        }
        info!("peer {}: {} -> {}", self.peer_id, self.state, new_state);
        self.state = new_state;
        if new_state == ConnectionState::Failed {
            self.failed_at = Some(Instant::now());
        }
    }

    /// A failed connection is torn down once it has sat in `Failed` longer
    /// than the cleanup timeout.
    pub fn should_cleanup(&self, now: Instant, cleanup_timeout: Duration) -> bool {
        self.state == ConnectionState::Failed
            && self
                .failed_at
                .is_some_and(|failed_at| now.duration_since(failed_at) > cleanup_timeout)
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            peer_id: self.peer_id.clone(),
            virtual_ip: self.virtual_ip,
            endpoint: self.endpoint.to_string(),
            strategy: self.strategy,
            state: self.state,
            latency_ms: self.last_latency,
            connected_at: self.connected_at,
        }
    }
}

/// Observable snapshot of a connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub peer_id: String,
    pub virtual_ip: Ipv4Addr,
    pub endpoint: String,
    pub strategy: PathStrategy,
    pub state: ConnectionState,
    pub latency_ms: Option<f64>,
    pub connected_at: DateTime<Utc>,
}

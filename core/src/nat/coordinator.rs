//! Connection coordination
//!
//! Decides, for one remote peer, whether to go direct (optionally after a
//! hole punch) or through a relay, and resolves the concrete endpoint the
//! tunnel should be pointed at.

use super::probe::{NatType, ProbeResult};
use super::{punch, NatError};
use crate::config::Config;
use crate::control::ControlPlane;
use crate::control::PeerInfo;
use crate::relay::{RelayCandidate, RelaySelection, RelaySelector, SelectionMode};
use serde::{Deserialize, Serialize};
use std::net::SocketAddrV4;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Path the tunnel takes to a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathStrategy {
    Direct,
    Relay,
}

impl std::fmt::Display for PathStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathStrategy::Direct => f.write_str("direct"),
            PathStrategy::Relay => f.write_str("relay"),
        }
    }
}

/// What the compatibility matrix allows for a NAT-type pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathDecision {
    /// Reachable without coordination
    Direct,
    /// Reachable once both sides punch
    DirectWithPunch,
    /// A relay is required
    Relay,
}

/// Direct-connection compatibility matrix.
pub fn direct_compatibility(local: NatType, peer: NatType) -> PathDecision {
    use NatType::*;

    if local == Open || peer == Open {
        return PathDecision::Direct;
    }
    if local == FullCone && peer == FullCone {
        return PathDecision::Direct;
    }

    let cone = |t: NatType| matches!(t, FullCone | RestrictedCone | PortRestrictedCone);
    if cone(local) && cone(peer) {
        return PathDecision::DirectWithPunch;
    }

    // Symmetric on either side, or unknown classifications.
    PathDecision::Relay
}

/// Chosen strategy plus the endpoint to install
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStrategy {
    pub path: PathStrategy,
    pub endpoint: SocketAddrV4,
    /// Relay id when `path` is `Relay` and the endpoint came from the
    /// registry rather than static configuration.
    pub relay_id: Option<String>,
}

/// Coordinates strategy selection and relay resolution for peer connections.
pub struct ConnectionCoordinator {
    config: Config,
    control: Arc<dyn ControlPlane>,
    selector: Arc<RelaySelector>,
}

impl ConnectionCoordinator {
    pub fn new(config: Config, control: Arc<dyn ControlPlane>, selector: Arc<RelaySelector>) -> Self {
        Self {
            config,
            control,
            selector,
        }
    }

    pub fn selector(&self) -> &Arc<RelaySelector> {
        &self.selector
    }

    /// Pick a strategy and endpoint for connecting to `peer`.
    ///
    /// Hole-punch failure is not an error: it falls back to a relay. The
    /// call only fails when a relay is needed and none can be resolved.
    pub async fn coordinate(
        &self,
        local: &ProbeResult,
        local_peer_id: &str,
        peer: &PeerInfo,
    ) -> Result<ConnectionStrategy, NatError> {
        let decision = direct_compatibility(local.nat_type, peer.nat_type);
        debug!(
            "path decision for {} ({} vs {}): {:?}",
            peer.peer_id, local.nat_type, peer.nat_type, decision
        );

        match decision {
            PathDecision::Direct => Ok(ConnectionStrategy {
                path: PathStrategy::Direct,
                endpoint: peer.public_endpoint(),
                relay_id: None,
            }),
            PathDecision::DirectWithPunch => {
                let endpoint = peer.public_endpoint();
                if punch::attempt_hole_punch(self.config.tunnel_port, endpoint).await {
                    info!("hole punch to {} succeeded", peer.peer_id);
                    Ok(ConnectionStrategy {
                        path: PathStrategy::Direct,
                        endpoint,
                        relay_id: None,
                    })
                } else {
                    info!(
                        "hole punch to {} failed, falling back to relay",
                        peer.peer_id
                    );
                    self.resolve_relay_endpoint(local_peer_id, &peer.peer_id).await
                }
            }
            PathDecision::Relay => self.resolve_relay_endpoint(local_peer_id, &peer.peer_id).await,
        }
    }

    /// Resolve the best relay endpoint for a peer pair.
    ///
    /// Candidates come from the control-plane registry; a statically
    /// configured relay is the fallback when the registry is empty or
    /// unreachable.
    pub async fn resolve_relay_endpoint(
        &self,
        local_peer_id: &str,
        peer_id: &str,
    ) -> Result<ConnectionStrategy, NatError> {
        let relays = match self.control.list_relays().await {
            Ok(relays) => relays,
            Err(e) => {
                warn!("relay discovery via control plane failed: {}", e);
                Vec::new()
            }
        };

        if !relays.is_empty() {
            let candidates: Vec<RelayCandidate> = relays
                .iter()
                .map(|r| {
                    let mut candidate = RelayCandidate::new(r.relay_id.clone());
                    candidate.region = r.region.clone();
                    // The registry carries no live quality samples; rank on
                    // health/load defaults until metrics feed real numbers.
                    candidate
                        .peer_quality
                        .insert(local_peer_id.to_string(), 70.0);
                    candidate.peer_quality.insert(peer_id.to_string(), 70.0);
                    candidate
                })
                .collect();

            // Direct quality zero: the caller already ruled direct out.
            let selection: RelaySelection =
                self.selector
                    .select(local_peer_id, peer_id, 0.0, 0.0, &candidates, None);

            if let RelaySelection {
                mode: SelectionMode::Relay,
                selected_relay: Some(relay_id),
                ..
            } = selection
            {
                if let Some(info) = relays.iter().find(|r| r.relay_id == relay_id) {
                    info!("using relay {} at {}", relay_id, info.endpoint());
                    return Ok(ConnectionStrategy {
                        path: PathStrategy::Relay,
                        endpoint: info.endpoint(),
                        relay_id: Some(relay_id),
                    });
                }
            }
        }

        if let Some(ip) = &self.config.relay_public_ip {
            let addr = ip
                .parse()
                .map_err(|_| NatError::NoRelayAvailable(format!("invalid relay ip {ip}")))?;
            info!("using configured relay {}:{}", ip, self.config.relay_port);
            return Ok(ConnectionStrategy {
                path: PathStrategy::Relay,
                endpoint: SocketAddrV4::new(addr, self.config.relay_port),
                relay_id: None,
            });
        }

        Err(NatError::NoRelayAvailable(
            "no relays registered and none configured".to_string(),
        ))
    }
}

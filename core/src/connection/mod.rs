//! Connection management
//!
//! Orchestrates the full life of a peer connection: discovery through the
//! control plane, strategy selection and hole punching, overlay address
//! allocation, tunnel installation, liveness monitoring, relay switching,
//! and teardown. Each connection gets a monitor task and a cleanup task;
//! neither ever raises, they only drive state transitions.

pub mod peer;

pub use peer::{ConnectionState, ConnectionStatus, PeerConnection};

use crate::broadcast::BroadcastManager;
use crate::control::{ControlError, ControlPlane};
use crate::dataplane::DataPlane;
use crate::ipam::{IpAddressPool, IpamError};
use crate::metrics::MetricsCollector;
use crate::nat::{ConnectionCoordinator, PathStrategy, ProbeResult};
use crate::tasks::TaskRegistry;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum PeerConnectionError {
    #[error("peer {0} not found")]
    PeerNotFound(String),
    #[error("failed to determine connection strategy: {0}")]
    StrategyFailed(String),
    #[error("IP pool exhausted")]
    PoolExhausted,
    #[error("peer has an invalid tunnel key")]
    InvalidPeerKey,
    #[error("local endpoint has not been probed")]
    NotProbed,
    #[error("network error: {0}")]
    Network(String),
    #[error("control plane error: {0}")]
    Control(#[from] ControlError),
    #[error("invalid overlay subnet: {0}")]
    InvalidSubnet(#[from] IpamError),
}

/// Tunables for the connection manager's loops
#[derive(Debug, Clone)]
pub struct ConnectionManagerConfig {
    pub monitor_interval: Duration,
    pub cleanup_interval: Duration,
    /// How long a `Failed` connection is held before teardown
    pub cleanup_timeout: Duration,
    /// Latency above this marks a connection degraded
    pub degraded_threshold_ms: f64,
    /// Consecutive unanswered probes before a connection is failed
    pub max_latency_failures: u32,
    /// Settle time after a tunnel re-install before resampling
    pub reinstall_wait: Duration,
    /// Settle time after pointing the tunnel at a new relay
    pub relay_switch_wait: Duration,
}

impl Default for ConnectionManagerConfig {
    fn default() -> Self {
        Self {
            monitor_interval: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(30),
            cleanup_timeout: Duration::from_secs(300),
            degraded_threshold_ms: 200.0,
            max_latency_failures: 3,
            reinstall_wait: Duration::from_secs(5),
            relay_switch_wait: Duration::from_secs(3),
        }
    }
}

/// Owns every peer connection and its background tasks.
pub struct ConnectionManager {
    config: ConnectionManagerConfig,
    local_peer_id: String,
    control: Arc<dyn ControlPlane>,
    dataplane: Arc<dyn DataPlane>,
    coordinator: ConnectionCoordinator,
    registry: Arc<TaskRegistry>,
    broadcast: RwLock<Option<Arc<BroadcastManager>>>,
    metrics: RwLock<Option<Arc<MetricsCollector>>>,
    local_endpoint: RwLock<Option<ProbeResult>>,
    pool: Mutex<IpAddressPool>,
    connections: RwLock<HashMap<String, PeerConnection>>,
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionManagerConfig,
        virtual_subnet: &str,
        local_peer_id: &str,
        control: Arc<dyn ControlPlane>,
        dataplane: Arc<dyn DataPlane>,
        coordinator: ConnectionCoordinator,
        registry: Arc<TaskRegistry>,
    ) -> Result<Arc<Self>, PeerConnectionError> {
        Ok(Arc::new(Self {
            config,
            local_peer_id: local_peer_id.to_string(),
            control,
            dataplane,
            coordinator,
            registry,
            broadcast: RwLock::new(None),
            metrics: RwLock::new(None),
            local_endpoint: RwLock::new(None),
            pool: Mutex::new(IpAddressPool::with_base(virtual_subnet)?),
            connections: RwLock::new(HashMap::new()),
        }))
    }

    /// Provide the local NAT probe result; required before connecting.
    pub fn set_local_endpoint(&self, probe: ProbeResult) {
        *self.local_endpoint.write() = Some(probe);
    }

    /// Wire in the broadcast manager so the active-peer set tracks
    /// connection state. Non-owning from the emulator's perspective.
    pub fn attach_broadcast(&self, broadcast: Arc<BroadcastManager>) {
        *self.broadcast.write() = Some(broadcast);
    }

    pub fn attach_metrics(&self, metrics: Arc<MetricsCollector>) {
        *self.metrics.write() = Some(metrics);
    }

    /// Connect to a peer in a party, driving the full sequence: discovery,
    /// strategy, overlay address, tunnel install, monitoring.
    pub async fn connect_to_peer(
        self: &Arc<Self>,
        party_id: &str,
        peer_id: &str,
    ) -> Result<ConnectionStatus, PeerConnectionError> {
        if let Some(existing) = self.connections.read().get(peer_id) {
            debug!("already connected to {}", peer_id);
            return Ok(existing.status());
        }

        info!("connecting to peer {} in party {}", peer_id, party_id);

        let peer_info = self
            .control
            .discover_peer(party_id, peer_id)
            .await?
            .ok_or_else(|| PeerConnectionError::PeerNotFound(peer_id.to_string()))?;

        let local = self
            .local_endpoint
            .read()
            .ok_or(PeerConnectionError::NotProbed)?;

        info!(
            "connecting to {} (nat: {}, local nat: {})",
            peer_id, peer_info.nat_type, local.nat_type
        );

        let strategy = self
            .coordinator
            .coordinate(&local, &self.local_peer_id, &peer_info)
            .await
            .map_err(|e| PeerConnectionError::StrategyFailed(e.to_string()))?;

        info!("strategy for {}: {} via {}", peer_id, strategy.path, strategy.endpoint);

        let key = peer_info
            .public_key_bytes()
            .ok_or(PeerConnectionError::InvalidPeerKey)?;
        let peer_name = peer_info.name.clone();

        let virtual_ip = self.pool.lock().allocate(peer_id).map_err(|e| match e {
            IpamError::Exhausted(_) => PeerConnectionError::PoolExhausted,
            other => PeerConnectionError::InvalidSubnet(other),
        })?;

        let allowed = [format!("{virtual_ip}/32")];
        if let Err(e) = self
            .dataplane
            .add_peer(&key, strategy.endpoint, &allowed)
            .await
        {
            self.pool.lock().release(peer_id);
            return Err(PeerConnectionError::Network(e.to_string()));
        }

        let mut connection = PeerConnection::new(
            peer_info,
            virtual_ip,
            strategy.endpoint,
            strategy.path,
            strategy.relay_id,
        );
        connection.set_state(ConnectionState::Connected);
        let status = connection.status();
        self.connections
            .write()
            .insert(peer_id.to_string(), connection);

        if let Some(broadcast) = self.broadcast.read().as_ref() {
            broadcast.mark_peer_active(peer_id);
        }
        if let Some(metrics) = self.metrics.read().as_ref() {
            metrics.add_peer(peer_id, &peer_name);
        }

        let monitor = Arc::clone(self);
        let monitor_peer = peer_id.to_string();
        self.registry.spawn(
            &format!("monitor_connection_{peer_id}"),
            async move { monitor.monitor_loop(monitor_peer).await },
        );

        let cleanup = Arc::clone(self);
        let cleanup_peer = peer_id.to_string();
        self.registry.spawn(
            &format!("cleanup_connection_{peer_id}"),
            async move { cleanup.cleanup_loop(cleanup_peer).await },
        );

        Ok(status)
    }

    /// Tear down the connection to a peer: remove the tunnel peer, release
    /// the overlay address, drop the record. Idempotent.
    pub async fn disconnect_from_peer(&self, peer_id: &str) -> Result<(), PeerConnectionError> {
        let Some(connection) = self.connections.write().remove(peer_id) else {
            debug!("disconnect requested for unknown peer {}", peer_id);
            return Ok(());
        };

        if let Some(key) = connection.peer_info.public_key_bytes() {
            if let Err(e) = self.dataplane.remove_peer(&key).await {
                warn!("tunnel peer removal for {} failed: {}", peer_id, e);
            }
        }

        if let Some(ip) = self.pool.lock().release(peer_id) {
            debug!("released {} for {}", ip, peer_id);
        }

        if let Some(broadcast) = self.broadcast.read().as_ref() {
            broadcast.unregister_peer(peer_id);
        }
        if let Some(metrics) = self.metrics.read().as_ref() {
            metrics.remove_peer(peer_id);
        }

        info!("disconnected from peer {}", peer_id);
        Ok(())
    }

    /// Live status for one peer, with a fresh latency sample.
    pub async fn connection_status(&self, peer_id: &str) -> Option<ConnectionStatus> {
        let virtual_ip = self.connections.read().get(peer_id)?.virtual_ip;
        let latency = self.dataplane.measure_latency(virtual_ip).await;

        let mut connections = self.connections.write();
        let connection = connections.get_mut(peer_id)?;
        connection.last_latency = latency;
        Some(connection.status())
    }

    /// Snapshots of every connection (last known latency, no fresh probe).
    pub fn list_connections(&self) -> Vec<ConnectionStatus> {
        self.connections
            .read()
            .values()
            .map(PeerConnection::status)
            .collect()
    }

    pub fn virtual_ip_of(&self, peer_id: &str) -> Option<Ipv4Addr> {
        self.pool.lock().get(peer_id)
    }

    fn set_state(&self, peer_id: &str, state: ConnectionState) {
        let mut connections = self.connections.write();
        if let Some(connection) = connections.get_mut(peer_id) {
            connection.set_state(state);
        }
        drop(connections);

        if let Some(broadcast) = self.broadcast.read().as_ref() {
            match state {
                ConnectionState::Connected | ConnectionState::Degraded => {
                    broadcast.mark_peer_active(peer_id)
                }
                ConnectionState::Failed | ConnectionState::Cleanup => {
                    broadcast.mark_peer_inactive(peer_id)
                }
                ConnectionState::Connecting => {}
            }
        }
    }

    fn record_latency(&self, peer_id: &str, latency: Option<f64>) {
        if let Some(connection) = self.connections.write().get_mut(peer_id) {
            connection.last_latency = latency;
        }
        if let Some(metrics) = self.metrics.read().as_ref() {
            metrics.record_latency(peer_id, latency);
        }
    }

    /// Liveness monitor for one connection. Exits when the connection is
    /// gone, enters cleanup, or fails permanently.
    async fn monitor_loop(self: Arc<Self>, peer_id: String) {
        debug!("monitoring connection to {}", peer_id);
        let mut failures = 0u32;

        loop {
            tokio::time::sleep(self.config.monitor_interval).await;

            let snapshot = {
                let connections = self.connections.read();
                connections.get(&peer_id).map(|c| {
                    (
                        c.state,
                        c.virtual_ip,
                        c.endpoint,
                        c.strategy,
                        c.peer_info.public_key_bytes(),
                    )
                })
            };
            let Some((state, virtual_ip, endpoint, strategy, key)) = snapshot else {
                break;
            };
            if state == ConnectionState::Cleanup || state == ConnectionState::Failed {
                break;
            }

            let latency = self.dataplane.measure_latency(virtual_ip).await;
            self.record_latency(&peer_id, latency);

            match latency {
                None => {
                    failures += 1;
                    warn!(
                        "connection to {} unresponsive ({}/{})",
                        peer_id, failures, self.config.max_latency_failures
                    );

                    if failures >= self.config.max_latency_failures {
                        error!("connection to {} failed", peer_id);
                        self.set_state(&peer_id, ConnectionState::Failed);
                        break;
                    }

                    if let Some(recovered) =
                        self.reinstall_tunnel(&peer_id, key, endpoint, virtual_ip).await
                    {
                        info!("reconnected to {} ({}ms)", peer_id, recovered);
                        failures = 0;
                        self.record_latency(&peer_id, Some(recovered));
                        self.set_state(&peer_id, ConnectionState::Connected);
                    }
                }
                Some(value) if value > self.config.degraded_threshold_ms => {
                    failures = 0;
                    warn!("high latency to {}: {}ms", peer_id, value);
                    self.set_state(&peer_id, ConnectionState::Degraded);

                    if strategy == PathStrategy::Relay {
                        self.switch_relay(&peer_id).await;
                    }
                }
                Some(_) => {
                    failures = 0;
                    self.set_state(&peer_id, ConnectionState::Connected);
                }
            }
        }

        debug!("monitor for {} exited", peer_id);
    }

    /// Best-effort tunnel re-install after an unanswered probe. Returns the
    /// post-install latency if the peer came back.
    async fn reinstall_tunnel(
        &self,
        peer_id: &str,
        key: Option<[u8; 32]>,
        endpoint: SocketAddrV4,
        virtual_ip: Ipv4Addr,
    ) -> Option<f64> {
        let key = key?;
        let allowed = [format!("{virtual_ip}/32")];

        if let Err(e) = self.dataplane.remove_peer(&key).await {
            warn!("tunnel removal for {} failed: {}", peer_id, e);
        }
        if let Err(e) = self.dataplane.add_peer(&key, endpoint, &allowed).await {
            warn!("tunnel re-install for {} failed: {}", peer_id, e);
            return None;
        }

        tokio::time::sleep(self.config.reinstall_wait).await;
        self.dataplane.measure_latency(virtual_ip).await
    }

    /// Try to move a relayed connection to a better relay. The tunnel ends
    /// up pointing at whichever endpoint measured better; on any partial
    /// failure the previous endpoint is restored.
    async fn switch_relay(&self, peer_id: &str) {
        let snapshot = {
            let connections = self.connections.read();
            connections
                .get(peer_id)
                .map(|c| (c.virtual_ip, c.endpoint, c.peer_info.public_key_bytes()))
        };
        let Some((virtual_ip, current_endpoint, Some(key))) = snapshot else {
            return;
        };

        let Some(current_latency) = self.dataplane.measure_latency(virtual_ip).await else {
            warn!("cannot measure current latency, aborting relay switch");
            return;
        };

        let candidate = match self
            .coordinator
            .resolve_relay_endpoint(&self.local_peer_id, peer_id)
            .await
        {
            Ok(candidate) => candidate,
            Err(e) => {
                warn!("relay switch for {} found no endpoint: {}", peer_id, e);
                return;
            }
        };

        if candidate.endpoint == current_endpoint {
            debug!("already on the best available relay for {}", peer_id);
            return;
        }

        info!(
            "trying relay switch for {}: {} -> {}",
            peer_id, current_endpoint, candidate.endpoint
        );

        let allowed = [format!("{virtual_ip}/32")];
        if let Err(e) = self.dataplane.remove_peer(&key).await {
            warn!("relay switch removal failed: {}", e);
        }
        if let Err(e) = self
            .dataplane
            .add_peer(&key, candidate.endpoint, &allowed)
            .await
        {
            warn!("relay switch install failed, restoring {}: {}", current_endpoint, e);
            self.restore_endpoint(&key, current_endpoint, &allowed).await;
            return;
        }

        tokio::time::sleep(self.config.relay_switch_wait).await;

        match self.dataplane.measure_latency(virtual_ip).await {
            Some(new_latency) if new_latency < current_latency => {
                info!(
                    "switched {} to relay at {} ({}ms, was {}ms)",
                    peer_id, candidate.endpoint, new_latency, current_latency
                );
                let mut connections = self.connections.write();
                if let Some(connection) = connections.get_mut(peer_id) {
                    connection.endpoint = candidate.endpoint;
                    connection.relay_id = candidate.relay_id;
                    connection.last_latency = Some(new_latency);
                    connection.set_state(if new_latency <= self.config.degraded_threshold_ms {
                        ConnectionState::Connected
                    } else {
                        ConnectionState::Degraded
                    });
                }
            }
            Some(new_latency) => {
                info!(
                    "new relay is slower for {} ({}ms vs {}ms), reverting",
                    peer_id, new_latency, current_latency
                );
                if let Err(e) = self.dataplane.remove_peer(&key).await {
                    warn!("relay revert removal failed: {}", e);
                }
                self.restore_endpoint(&key, current_endpoint, &allowed).await;
            }
            None => {
                warn!("new relay for {} did not answer, reverting", peer_id);
                if let Some(relay_id) = &candidate.relay_id {
                    self.coordinator.selector().mark_failed(relay_id);
                }
                if let Err(e) = self.dataplane.remove_peer(&key).await {
                    warn!("relay revert removal failed: {}", e);
                }
                self.restore_endpoint(&key, current_endpoint, &allowed).await;
            }
        }
    }

    async fn restore_endpoint(&self, key: &[u8; 32], endpoint: SocketAddrV4, allowed: &[String]) {
        if let Err(e) = self.dataplane.add_peer(key, endpoint, allowed).await {
            error!("failed to restore tunnel endpoint {}: {}", endpoint, e);
        }
    }

    /// Tears down this connection once it has sat in `Failed` past the
    /// cleanup timeout.
    async fn cleanup_loop(self: Arc<Self>, peer_id: String) {
        debug!("cleanup watcher for {} started", peer_id);

        loop {
            tokio::time::sleep(self.config.cleanup_interval).await;

            let should_cleanup = {
                let connections = self.connections.read();
                match connections.get(&peer_id) {
                    None => break,
                    Some(connection) => {
                        connection.should_cleanup(Instant::now(), self.config.cleanup_timeout)
                    }
                }
            };

            if should_cleanup {
                info!("auto-cleaning up failed connection to {}", peer_id);
                self.set_state(&peer_id, ConnectionState::Cleanup);
                if let Err(e) = self.disconnect_from_peer(&peer_id).await {
                    error!("cleanup of {} failed: {}", peer_id, e);
                }
                break;
            }
        }

        debug!("cleanup watcher for {} exited", peer_id);
    }
}

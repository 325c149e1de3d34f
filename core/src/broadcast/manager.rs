//! Broadcast manager
//!
//! Bridges the local capture side and the overlay. Locally captured packets
//! pass the dedup window and are pushed into every registered peer's
//! forwarding channel; packets received from remote peers are re-injected
//! onto the local segment. Peers that cannot keep up lose packets instead
//! of building queues.

use super::dedup::{BroadcastDeduplicator, DedupMetrics};
use super::emulator::{
    inject_broadcast, inject_multicast, multicast_group_for_port, spawn_broadcast_listener,
    spawn_multicast_listener, BroadcastSocketError, GAME_DISCOVERY_PORTS, MULTICAST_GROUPS,
};
use super::packet::{BroadcastPacket, PacketProtocol};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Queue depth per peer forwarder before packets are dropped
const FORWARDER_CAPACITY: usize = 256;

/// Manages broadcast capture, dedup, and per-peer forwarding.
pub struct BroadcastManager {
    dedup: Arc<BroadcastDeduplicator>,
    /// Per-peer forwarding channels into the tunnel layer
    forwarders: RwLock<HashMap<String, mpsc::Sender<BroadcastPacket>>>,
    /// Peer ids with live connections, maintained by the connection manager
    active_peers: RwLock<HashSet<String>>,
    /// Extra ports added at runtime on top of the defaults
    extra_ports: RwLock<Vec<u16>>,
    dropped_packets: AtomicU64,
    listener_handles: RwLock<Vec<JoinHandle<()>>>,
}

impl BroadcastManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            dedup: Arc::new(BroadcastDeduplicator::new()),
            forwarders: RwLock::new(HashMap::new()),
            active_peers: RwLock::new(HashSet::new()),
            extra_ports: RwLock::new(Vec::new()),
            dropped_packets: AtomicU64::new(0),
            listener_handles: RwLock::new(Vec::new()),
        })
    }

    pub fn dedup(&self) -> &Arc<BroadcastDeduplicator> {
        &self.dedup
    }

    /// Start listeners on the default game-discovery ports and multicast
    /// groups, plus any ports added with [`BroadcastManager::add_port`].
    /// Returns the capture channel consumer handle. Ports that fail to bind
    /// are logged and skipped.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let (tx, rx) = mpsc::channel(1024);

        let mut ports: Vec<u16> = GAME_DISCOVERY_PORTS.to_vec();
        ports.extend(self.extra_ports.read().iter().copied());

        let mut handles = self.listener_handles.write();
        for port in ports {
            match spawn_broadcast_listener(port, tx.clone()) {
                Ok(handle) => handles.push(handle),
                Err(e) => warn!("could not start listener on port {}: {}", port, e),
            }
        }
        for (group, port) in MULTICAST_GROUPS {
            match spawn_multicast_listener(*group, *port, tx.clone()) {
                Ok(handle) => handles.push(handle),
                Err(e) => warn!("could not start multicast listener {}:{}: {}", group, port, e),
            }
        }
        drop(handles);

        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.capture_loop(rx).await })
    }

    /// Stop all capture listeners.
    pub fn stop(&self) {
        let mut handles = self.listener_handles.write();
        for handle in handles.drain(..) {
            handle.abort();
        }
        info!("broadcast emulation stopped");
    }

    /// Monitor an additional discovery port (takes effect at next start).
    pub fn add_port(&self, port: u16) {
        let mut ports = self.extra_ports.write();
        if !ports.contains(&port) {
            ports.push(port);
        }
    }

    async fn capture_loop(&self, mut rx: mpsc::Receiver<BroadcastPacket>) {
        while let Some(packet) = rx.recv().await {
            self.process_local(&packet, None);
        }
    }

    /// Run a locally captured packet through dedup and fan it out to every
    /// active peer. Returns `true` if the packet was forwarded.
    pub fn process_local(&self, packet: &BroadcastPacket, source_peer: Option<&str>) -> bool {
        if !self.dedup.should_forward(packet, source_peer) {
            return false;
        }

        let active = self.active_peers.read();
        if active.is_empty() {
            return true;
        }

        let forwarders = self.forwarders.read();
        for peer_id in active.iter() {
            let Some(sender) = forwarders.get(peer_id) else {
                continue;
            };
            if sender.try_send(packet.clone()).is_err() {
                self.dropped_packets.fetch_add(1, Ordering::Relaxed);
                debug!("forwarder for peer {} full, packet dropped", peer_id);
            }
        }
        true
    }

    /// Re-inject a packet received from a remote peer onto the local
    /// segment. Send failures are logged, never raised.
    pub async fn handle_remote(&self, packet: BroadcastPacket) {
        let result = match packet.protocol {
            PacketProtocol::Multicast => {
                let group = multicast_group_for_port(packet.dest_port);
                inject_multicast(&packet, group).await
            }
            PacketProtocol::Udp => inject_broadcast(&packet).await,
        };

        if let Err(e) = result {
            log_inject_error(&packet, e);
        }
    }

    /// Register a peer's forwarding channel; packets for it are produced on
    /// the returned receiver.
    pub fn register_peer(&self, peer_id: &str) -> mpsc::Receiver<BroadcastPacket> {
        let (tx, rx) = mpsc::channel(FORWARDER_CAPACITY);
        self.forwarders.write().insert(peer_id.to_string(), tx);
        rx
    }

    pub fn unregister_peer(&self, peer_id: &str) {
        self.forwarders.write().remove(peer_id);
        self.active_peers.write().remove(peer_id);
    }

    /// Mark a peer connection live (packets start flowing to it).
    pub fn mark_peer_active(&self, peer_id: &str) {
        self.active_peers.write().insert(peer_id.to_string());
    }

    pub fn mark_peer_inactive(&self, peer_id: &str) {
        self.active_peers.write().remove(peer_id);
    }

    pub fn active_peer_count(&self) -> usize {
        self.active_peers.read().len()
    }

    pub fn metrics(&self) -> DedupMetrics {
        self.dedup.metrics()
    }

    pub fn dropped_packets(&self) -> u64 {
        self.dropped_packets.load(Ordering::Relaxed)
    }
}

fn log_inject_error(packet: &BroadcastPacket, error: BroadcastSocketError) {
    warn!(
        "failed to re-inject packet for port {}: {}",
        packet.dest_port, error
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn packet(data: &[u8]) -> BroadcastPacket {
        BroadcastPacket {
            data: data.to_vec(),
            source_ip: Ipv4Addr::new(192, 168, 1, 100),
            source_port: 12345,
            dest_port: 4445,
            protocol: PacketProtocol::Udp,
        }
    }

    #[tokio::test]
    async fn test_forwarding_to_active_peers() {
        let manager = BroadcastManager::new();
        let mut rx = manager.register_peer("peer-1");
        manager.mark_peer_active("peer-1");

        assert!(manager.process_local(&packet(b"hello"), None));
        let received = tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.data, b"hello");
    }

    #[tokio::test]
    async fn test_inactive_peer_receives_nothing() {
        let manager = BroadcastManager::new();
        let mut rx = manager.register_peer("peer-1");
        // Registered but never marked active.
        manager.process_local(&packet(b"hello"), None);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), rx.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_duplicate_not_forwarded() {
        let manager = BroadcastManager::new();
        let mut rx = manager.register_peer("peer-1");
        manager.mark_peer_active("peer-1");

        let p = packet(b"dup");
        assert!(manager.process_local(&p, None));
        assert!(!manager.process_local(&p, None));

        // Exactly one copy arrives.
        assert!(rx.recv().await.is_some());
        assert!(
            tokio::time::timeout(Duration::from_millis(50), rx.recv())
                .await
                .is_err()
        );

        let metrics = manager.metrics();
        assert_eq!(metrics.total_packets, 2);
        assert_eq!(metrics.forwarded_packets, 1);
        assert_eq!(metrics.deduplicated_packets, 1);
    }

    #[tokio::test]
    async fn test_backpressure_drops_when_full() {
        let manager = BroadcastManager::new();
        let _rx = manager.register_peer("slow-peer");
        manager.mark_peer_active("slow-peer");

        // Overfill the forwarder without draining it.
        for i in 0..(FORWARDER_CAPACITY + 10) {
            manager.process_local(&packet(&(i as u32).to_be_bytes()), None);
        }
        assert!(manager.dropped_packets() >= 10);
    }

    #[tokio::test]
    async fn test_unregister_stops_forwarding() {
        let manager = BroadcastManager::new();
        let _rx = manager.register_peer("peer-1");
        manager.mark_peer_active("peer-1");
        manager.unregister_peer("peer-1");
        assert_eq!(manager.active_peer_count(), 0);
        assert!(manager.process_local(&packet(b"x"), None));
    }
}

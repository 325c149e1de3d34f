//! Stateless relay server
//!
//! A UDP reflector for peers that cannot connect directly. Tunnel datagrams
//! are forwarded verbatim; the relay holds no cryptographic keys and never
//! looks past the handshake header. Peers are paired by the client public
//! key found in handshake initiation/response packets, falling back to the
//! source address when a datagram carries no handshake.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    /// Bind address for the UDP listener
    pub bind_addr: SocketAddr,
    /// Clients silent for longer than this are evicted
    pub client_timeout: Duration,
    /// How often stale clients are scanned for
    pub cleanup_interval: Duration,
    /// How often a stats summary is logged (zero disables)
    pub stats_interval: Duration,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:51820".parse().expect("valid bind address"),
            client_timeout: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
            stats_interval: Duration::from_secs(30),
        }
    }
}

/// A client known to the relay
#[derive(Debug, Clone)]
struct RelayClient {
    address: SocketAddr,
    last_seen: Instant,
    bytes_relayed: u64,
    packets_relayed: u64,
}

/// Snapshot of relay counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayStats {
    pub active_clients: usize,
    pub total_packets: u64,
    pub total_bytes: u64,
    pub blocked_ips: usize,
}

/// Extract the 32-byte client public key from a tunnel handshake packet.
///
/// Handshake initiations (type 1) and responses (type 2) carry the sender's
/// key at offset 8; the type field is a little-endian u32 at offset 0. Data
/// packets (type 4) and anything shorter than 40 bytes yield no identity.
pub fn extract_handshake_key(data: &[u8]) -> Option<[u8; 32]> {
    if data.len() < 4 {
        return None;
    }
    let msg_type = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    if (msg_type == 1 || msg_type == 2) && data.len() >= 40 {
        let key: [u8; 32] = data[8..40].try_into().ok()?;
        return Some(key);
    }
    None
}

/// The stateless relay
pub struct RelayServer {
    config: RelayServerConfig,
    clients: RwLock<HashMap<String, RelayClient>>,
    blocked_ips: RwLock<HashSet<IpAddr>>,
    total_packets: AtomicU64,
    total_bytes: AtomicU64,
}

impl RelayServer {
    pub fn new(config: RelayServerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            clients: RwLock::new(HashMap::new()),
            blocked_ips: RwLock::new(HashSet::new()),
            total_packets: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
        })
    }

    /// Drop all traffic from an address.
    pub fn block_ip(&self, ip: IpAddr) {
        self.blocked_ips.write().insert(ip);
    }

    pub fn unblock_ip(&self, ip: IpAddr) {
        self.blocked_ips.write().remove(&ip);
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            active_clients: self.clients.read().len(),
            total_packets: self.total_packets.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            blocked_ips: self.blocked_ips.read().len(),
        }
    }

    /// Bind the configured address and run the forwarding loop. Pair with
    /// [`RelayServer::eviction_loop`] and [`RelayServer::stats_loop`] as
    /// background tasks. Runs until cancelled.
    pub async fn run(self: Arc<Self>) -> std::io::Result<()> {
        let socket = UdpSocket::bind(self.config.bind_addr).await?;
        info!("relay server listening on {}", socket.local_addr()?);
        self.forward_loop(socket).await
    }

    /// Forwarding loop over an already-bound socket.
    pub async fn forward_loop(self: Arc<Self>, socket: UdpSocket) -> std::io::Result<()> {
        let mut buf = vec![0u8; 65536];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, addr)) => {
                    self.handle_packet(&socket, &buf[..len], addr).await;
                }
                Err(e) => {
                    warn!("relay recv error: {}", e);
                }
            }
        }
    }

    /// Identify the sender, refresh its record, and forward the datagram to
    /// every other known client through the same socket.
    pub async fn handle_packet(&self, socket: &UdpSocket, data: &[u8], addr: SocketAddr) {
        if self.blocked_ips.read().contains(&addr.ip()) {
            return;
        }

        let client_id = match extract_handshake_key(data) {
            Some(key) => hex::encode(key),
            None => addr.to_string(),
        };

        let targets: Vec<(String, SocketAddr)> = {
            let mut clients = self.clients.write();
            let entry = clients.entry(client_id.clone()).or_insert_with(|| {
                debug!("relay learned client {} at {}", client_id, addr);
                RelayClient {
                    address: addr,
                    last_seen: Instant::now(),
                    bytes_relayed: 0,
                    packets_relayed: 0,
                }
            });
            entry.last_seen = Instant::now();
            // NAT rebinding: the mapping may have moved.
            entry.address = addr;

            clients
                .iter()
                .filter(|(id, _)| **id != client_id)
                .map(|(id, c)| (id.clone(), c.address))
                .collect()
        };

        for (target_id, target_addr) in targets {
            match socket.send_to(data, target_addr).await {
                Ok(sent) => {
                    let mut clients = self.clients.write();
                    if let Some(client) = clients.get_mut(&target_id) {
                        client.bytes_relayed += sent as u64;
                        client.packets_relayed += 1;
                    }
                }
                Err(e) => {
                    warn!("relay forward to {} failed: {}", target_addr, e);
                }
            }
        }

        self.total_packets.fetch_add(1, Ordering::Relaxed);
        self.total_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
    }

    /// Remove clients whose last datagram is older than the timeout.
    pub fn evict_stale(&self, now: Instant) -> usize {
        let timeout = self.config.client_timeout;
        let mut clients = self.clients.write();
        let before = clients.len();
        clients.retain(|_, c| now.duration_since(c.last_seen) <= timeout);
        before - clients.len()
    }

    /// Periodic stale-client eviction.
    pub async fn eviction_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.config.cleanup_interval).await;
            let evicted = self.evict_stale(Instant::now());
            if evicted > 0 {
                info!("evicted {} stale relay clients", evicted);
            }
        }
    }

    /// Periodic stats summary.
    pub async fn stats_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.config.stats_interval).await;
            let stats = self.stats();
            if stats.active_clients > 0 {
                info!(
                    "relay stats: {} clients, {} packets, {:.2} MB relayed",
                    stats.active_clients,
                    stats.total_packets,
                    stats.total_bytes as f64 / 1024.0 / 1024.0
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake_packet(msg_type: u32, key: [u8; 32]) -> Vec<u8> {
        let mut data = vec![0u8; 40];
        data[0..4].copy_from_slice(&msg_type.to_le_bytes());
        data[8..40].copy_from_slice(&key);
        data
    }

    #[test]
    fn test_extract_key_from_initiation() {
        let key = [3u8; 32];
        assert_eq!(extract_handshake_key(&handshake_packet(1, key)), Some(key));
        assert_eq!(extract_handshake_key(&handshake_packet(2, key)), Some(key));
    }

    #[test]
    fn test_data_packets_have_no_identity() {
        let key = [3u8; 32];
        assert_eq!(extract_handshake_key(&handshake_packet(4, key)), None);
    }

    #[test]
    fn test_short_handshake_treated_as_data() {
        // Type 1 but under 40 bytes: no key extraction.
        let mut data = vec![0u8; 39];
        data[0..4].copy_from_slice(&1u32.to_le_bytes());
        assert_eq!(extract_handshake_key(&data), None);
        assert_eq!(extract_handshake_key(&[1]), None);
        assert_eq!(extract_handshake_key(&[]), None);
    }

    #[tokio::test]
    async fn test_forwarding_between_clients() {
        let server = RelayServer::new(RelayServerConfig::default());
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let pkt_a = handshake_packet(1, [1u8; 32]);
        let pkt_b = handshake_packet(1, [2u8; 32]);

        // Both clients introduce themselves.
        server
            .handle_packet(&socket, &pkt_a, a.local_addr().unwrap())
            .await;
        server
            .handle_packet(&socket, &pkt_b, b.local_addr().unwrap())
            .await;

        // A's packet was forwarded to nobody (B unknown at the time); B's
        // packet must have reached A.
        let mut buf = [0u8; 64];
        let (len, _) = tokio::time::timeout(Duration::from_secs(1), a.recv_from(&mut buf))
            .await
            .expect("no forwarded packet")
            .unwrap();
        assert_eq!(&buf[..len], pkt_b.as_slice());

        let stats = server.stats();
        assert_eq!(stats.active_clients, 2);
        assert_eq!(stats.total_packets, 2);
    }

    #[tokio::test]
    async fn test_blocked_ip_dropped() {
        let server = RelayServer::new(RelayServerConfig::default());
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        server.block_ip("127.0.0.1".parse().unwrap());

        server
            .handle_packet(&socket, &handshake_packet(1, [1u8; 32]), "127.0.0.1:9999".parse().unwrap())
            .await;

        let stats = server.stats();
        assert_eq!(stats.active_clients, 0);
        assert_eq!(stats.total_packets, 0);
    }

    #[tokio::test]
    async fn test_nat_rebinding_updates_address() {
        let server = RelayServer::new(RelayServerConfig::default());
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let key = [7u8; 32];

        server
            .handle_packet(&socket, &handshake_packet(1, key), "127.0.0.1:1111".parse().unwrap())
            .await;
        server
            .handle_packet(&socket, &handshake_packet(1, key), "127.0.0.1:2222".parse().unwrap())
            .await;

        let clients = server.clients.read();
        let client = clients.get(&hex::encode(key)).unwrap();
        assert_eq!(client.address, "127.0.0.1:2222".parse::<SocketAddr>().unwrap());
        assert_eq!(clients.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_client_eviction() {
        let mut config = RelayServerConfig::default();
        config.client_timeout = Duration::from_millis(10);
        let server = RelayServer::new(config);
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        server
            .handle_packet(&socket, &handshake_packet(1, [1u8; 32]), "127.0.0.1:1111".parse().unwrap())
            .await;
        assert_eq!(server.stats().active_clients, 1);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let evicted = server.evict_stale(Instant::now());
        assert_eq!(evicted, 1);
        assert_eq!(server.stats().active_clients, 0);
    }

    #[tokio::test]
    async fn test_fallback_identity_is_source_address() {
        let server = RelayServer::new(RelayServerConfig::default());
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        // Data packet: identity falls back to ip:port.
        let mut data = vec![0u8; 64];
        data[0..4].copy_from_slice(&4u32.to_le_bytes());
        let addr: SocketAddr = "127.0.0.1:3333".parse().unwrap();
        server.handle_packet(&socket, &data, addr).await;

        assert!(server.clients.read().contains_key(&addr.to_string()));
    }
}

//! Broadcast packet deduplication
//!
//! When several listeners or several peers see the same discovery datagram,
//! only the first copy inside the window may be forwarded. Packets are
//! fingerprinted over payload, source address, destination port, and
//! protocol; a fingerprint seen less than `window` ago is dropped.

use super::packet::BroadcastPacket;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Deduplication counters
#[derive(Debug, Clone, PartialEq)]
pub struct DedupMetrics {
    pub total_packets: u64,
    pub forwarded_packets: u64,
    pub deduplicated_packets: u64,
    /// Percentage of packets dropped as duplicates
    pub dedup_rate: f64,
    pub tracked_hashes: usize,
}

/// Sliding-window duplicate filter for broadcast packets.
pub struct BroadcastDeduplicator {
    window: Duration,
    seen: Mutex<HashMap<[u8; 32], Instant>>,
    enabled: AtomicBool,
    total: AtomicU64,
    forwarded: AtomicU64,
    deduplicated: AtomicU64,
}

impl BroadcastDeduplicator {
    /// Default 2-second window.
    pub fn new() -> Self {
        Self::with_window(Duration::from_secs(2))
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            window,
            seen: Mutex::new(HashMap::new()),
            enabled: AtomicBool::new(true),
            total: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            deduplicated: AtomicU64::new(0),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Decide whether `packet` should be forwarded.
    ///
    /// `source_peer` is the overlay source the packet arrived from, if any;
    /// a packet whose origin address matches it is an echo and is dropped
    /// regardless of the window.
    pub fn should_forward(&self, packet: &BroadcastPacket, source_peer: Option<&str>) -> bool {
        self.total.fetch_add(1, Ordering::Relaxed);

        if let Some(peer) = source_peer {
            if packet.source_ip.to_string() == peer {
                debug!("dropping echo of packet from peer {}", peer);
                self.deduplicated.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        }

        if !self.enabled.load(Ordering::Relaxed) {
            self.forwarded.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        let fingerprint = packet.fingerprint();
        let now = Instant::now();
        let mut seen = self.seen.lock();

        match seen.get(&fingerprint) {
            Some(first_seen) if now.duration_since(*first_seen) < self.window => {
                self.deduplicated.fetch_add(1, Ordering::Relaxed);
                false
            }
            _ => {
                seen.insert(fingerprint, now);
                self.forwarded.fetch_add(1, Ordering::Relaxed);
                true
            }
        }
    }

    /// Drop window entries older than the window. Bounds memory; run it
    /// periodically.
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let mut seen = self.seen.lock();
        let before = seen.len();
        seen.retain(|_, first_seen| now.duration_since(*first_seen) < self.window);
        before - seen.len()
    }

    /// Periodic pruning loop; run it under the task registry.
    pub async fn prune_loop(self: std::sync::Arc<Self>, interval: Duration) {
        loop {
            tokio::time::sleep(interval).await;
            let removed = self.prune();
            if removed > 0 {
                debug!("pruned {} expired dedup entries", removed);
            }
        }
    }

    /// Runtime toggle. While disabled every packet is forwarded.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Reset the window (counters are kept).
    pub fn flush(&self) {
        self.seen.lock().clear();
    }

    pub fn metrics(&self) -> DedupMetrics {
        let total = self.total.load(Ordering::Relaxed);
        let forwarded = self.forwarded.load(Ordering::Relaxed);
        let deduplicated = self.deduplicated.load(Ordering::Relaxed);
        DedupMetrics {
            total_packets: total,
            forwarded_packets: forwarded,
            deduplicated_packets: deduplicated,
            dedup_rate: if total > 0 {
                deduplicated as f64 / total as f64 * 100.0
            } else {
                0.0
            },
            tracked_hashes: self.seen.lock().len(),
        }
    }
}

impl Default for BroadcastDeduplicator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::packet::PacketProtocol;
    use std::net::Ipv4Addr;

    fn sample_packet() -> BroadcastPacket {
        BroadcastPacket {
            data: b"MINECRAFT_CHALLENGE\x00\x00\x00\x00\x00".to_vec(),
            source_ip: Ipv4Addr::new(192, 168, 1, 100),
            source_port: 12345,
            dest_port: 4445,
            protocol: PacketProtocol::Udp,
        }
    }

    fn different_packet() -> BroadcastPacket {
        BroadcastPacket {
            data: b"DIFFERENT_DATA".to_vec(),
            source_ip: Ipv4Addr::new(192, 168, 1, 101),
            source_port: 12346,
            dest_port: 7777,
            protocol: PacketProtocol::Udp,
        }
    }

    #[test]
    fn test_same_packet_not_forwarded_twice() {
        let dedup = BroadcastDeduplicator::new();
        let packet = sample_packet();
        assert!(dedup.should_forward(&packet, None));
        assert!(!dedup.should_forward(&packet, None));
    }

    #[test]
    fn test_different_packets_both_forwarded() {
        let dedup = BroadcastDeduplicator::new();
        assert!(dedup.should_forward(&sample_packet(), None));
        assert!(dedup.should_forward(&different_packet(), None));
    }

    #[test]
    fn test_window_expiry() {
        let dedup = BroadcastDeduplicator::with_window(Duration::from_millis(20));
        let packet = sample_packet();
        assert!(dedup.should_forward(&packet, None));
        assert!(!dedup.should_forward(&packet, None));

        std::thread::sleep(Duration::from_millis(40));
        assert!(dedup.should_forward(&packet, None));
    }

    #[test]
    fn test_echo_from_source_peer_dropped() {
        let dedup = BroadcastDeduplicator::new();
        let packet = sample_packet();
        // Packet originating at the very peer it came from: echo.
        assert!(!dedup.should_forward(&packet, Some("192.168.1.100")));
        // From any other peer it forwards normally.
        assert!(dedup.should_forward(&packet, Some("192.168.1.200")));
    }

    #[test]
    fn test_metrics() {
        let dedup = BroadcastDeduplicator::new();
        let a = sample_packet();
        let b = different_packet();

        dedup.should_forward(&a, None);
        dedup.should_forward(&a, None);
        dedup.should_forward(&b, None);
        dedup.should_forward(&a, None);
        dedup.should_forward(&b, None);

        let metrics = dedup.metrics();
        assert_eq!(metrics.total_packets, 5);
        assert_eq!(metrics.forwarded_packets, 2);
        assert_eq!(metrics.deduplicated_packets, 3);
        assert!((metrics.dedup_rate - 60.0).abs() < 0.1);
    }

    #[test]
    fn test_metrics_empty() {
        let dedup = BroadcastDeduplicator::new();
        let metrics = dedup.metrics();
        assert_eq!(metrics.total_packets, 0);
        assert_eq!(metrics.dedup_rate, 0.0);
    }

    #[test]
    fn test_disable_and_enable() {
        let dedup = BroadcastDeduplicator::new();
        let packet = sample_packet();
        assert!(dedup.should_forward(&packet, None));
        assert!(!dedup.should_forward(&packet, None));

        dedup.disable();
        assert!(dedup.should_forward(&packet, None));

        dedup.enable();
        // Still inside the window from the first sighting.
        assert!(!dedup.should_forward(&packet, None));
    }

    #[test]
    fn test_prune_bounds_memory() {
        let dedup = BroadcastDeduplicator::with_window(Duration::from_millis(10));
        for i in 0..500u32 {
            let packet = BroadcastPacket {
                data: i.to_be_bytes().to_vec(),
                source_ip: Ipv4Addr::new(192, 168, 1, (i % 250) as u8),
                source_port: 10000 + (i % 1000) as u16,
                dest_port: 4445,
                protocol: PacketProtocol::Udp,
            };
            dedup.should_forward(&packet, None);
        }
        assert!(dedup.metrics().tracked_hashes > 0);

        std::thread::sleep(Duration::from_millis(30));
        dedup.prune();
        assert_eq!(dedup.metrics().tracked_hashes, 0);
    }

    #[test]
    fn test_fingerprint_consistency_and_sensitivity() {
        let packet = sample_packet();
        assert_eq!(packet.fingerprint(), sample_packet().fingerprint());

        let mut data_changed = sample_packet();
        data_changed.data[0] ^= 1;
        assert_ne!(packet.fingerprint(), data_changed.fingerprint());

        let mut ip_changed = sample_packet();
        ip_changed.source_ip = Ipv4Addr::new(192, 168, 1, 101);
        assert_ne!(packet.fingerprint(), ip_changed.fingerprint());

        let mut port_changed = sample_packet();
        port_changed.dest_port = 4446;
        assert_ne!(packet.fingerprint(), port_changed.fingerprint());

        let mut protocol_changed = sample_packet();
        protocol_changed.protocol = PacketProtocol::Multicast;
        assert_ne!(packet.fingerprint(), protocol_changed.fingerprint());
    }

    #[test]
    fn test_flush_clears_window() {
        let dedup = BroadcastDeduplicator::new();
        let packet = sample_packet();
        assert!(dedup.should_forward(&packet, None));
        dedup.flush();
        assert!(dedup.should_forward(&packet, None));
    }
}

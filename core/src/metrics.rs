//! Metrics collection and quality scoring
//!
//! Bounded sliding windows per peer (latency) and for the host (CPU), plus
//! cumulative byte/packet counters and game-session summaries. Windows hold
//! ~360 samples; at the 10-second collection cadence that is an hour of
//! history.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

const WINDOW_CAPACITY: usize = 360;
const SESSION_HISTORY: usize = 100;
const DEGRADED_LATENCY_MS: f64 = 200.0;

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// One sample in a sliding window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub timestamp: f64,
    pub value: f64,
}

/// Peer status inferred from latency samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Connected,
    Degraded,
    Disconnected,
}

#[derive(Debug, Clone)]
struct PeerMetrics {
    peer_name: String,
    latency: VecDeque<MetricPoint>,
    bytes_sent: u64,
    bytes_received: u64,
    packets_sent: u64,
    packets_received: u64,
    last_seen: f64,
    status: PeerStatus,
}

impl PeerMetrics {
    fn new(peer_name: &str) -> Self {
        Self {
            peer_name: peer_name.to_string(),
            latency: VecDeque::with_capacity(WINDOW_CAPACITY),
            bytes_sent: 0,
            bytes_received: 0,
            packets_sent: 0,
            packets_received: 0,
            last_seen: unix_now(),
            status: PeerStatus::Connected,
        }
    }
}

/// Aggregate latency figures over a window
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub current: Option<f64>,
    pub average: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

/// Value-copy summary for one peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerSummary {
    pub peer_id: String,
    pub peer_name: String,
    pub status: PeerStatus,
    pub latency: LatencySummary,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub last_seen: f64,
}

/// A recorded game session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameSession {
    pub game_id: String,
    pub game_name: String,
    pub started_at: f64,
    pub ended_at: Option<f64>,
    pub duration: Option<f64>,
    pub peers: Vec<String>,
    pub avg_latency: Option<f64>,
    pub max_latency: Option<f64>,
    pub min_latency: Option<f64>,
}

/// Collects per-peer and host metrics.
pub struct MetricsCollector {
    peers: RwLock<HashMap<String, PeerMetrics>>,
    cpu: RwLock<VecDeque<MetricPoint>>,
    sessions: RwLock<VecDeque<GameSession>>,
    active_session: RwLock<Option<GameSession>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            cpu: RwLock::new(VecDeque::with_capacity(WINDOW_CAPACITY)),
            sessions: RwLock::new(VecDeque::with_capacity(SESSION_HISTORY)),
            active_session: RwLock::new(None),
        }
    }

    pub fn add_peer(&self, peer_id: &str, peer_name: &str) {
        self.peers
            .write()
            .entry(peer_id.to_string())
            .or_insert_with(|| PeerMetrics::new(peer_name));
    }

    /// Mark a peer disconnected; its history is retained.
    pub fn remove_peer(&self, peer_id: &str) {
        if let Some(peer) = self.peers.write().get_mut(peer_id) {
            peer.status = PeerStatus::Disconnected;
        }
    }

    /// Record a latency sample. `None` (no answer) or a sample above 200 ms
    /// marks the peer degraded; anything at or below marks it connected.
    pub fn record_latency(&self, peer_id: &str, latency_ms: Option<f64>) {
        let mut peers = self.peers.write();
        let Some(peer) = peers.get_mut(peer_id) else {
            return;
        };

        match latency_ms {
            Some(value) => {
                push_bounded(&mut peer.latency, value);
                peer.last_seen = unix_now();
                peer.status = if value > DEGRADED_LATENCY_MS {
                    PeerStatus::Degraded
                } else {
                    PeerStatus::Connected
                };
            }
            None => {
                peer.status = PeerStatus::Degraded;
            }
        }
    }

    pub fn record_bandwidth(&self, peer_id: &str, bytes_sent: u64, bytes_received: u64) {
        if let Some(peer) = self.peers.write().get_mut(peer_id) {
            peer.bytes_sent += bytes_sent;
            peer.bytes_received += bytes_received;
        }
    }

    pub fn record_packets(&self, peer_id: &str, sent: u64, received: u64) {
        if let Some(peer) = self.peers.write().get_mut(peer_id) {
            peer.packets_sent += sent;
            peer.packets_received += received;
        }
    }

    /// Host CPU sample, fed by the embedding daemon.
    pub fn record_cpu_percent(&self, percent: f64) {
        push_bounded(&mut self.cpu.write(), percent);
    }

    pub fn peer_summary(&self, peer_id: &str) -> Option<PeerSummary> {
        let peers = self.peers.read();
        let peer = peers.get(peer_id)?;
        Some(PeerSummary {
            peer_id: peer_id.to_string(),
            peer_name: peer.peer_name.clone(),
            status: peer.status,
            latency: summarize(&peer.latency),
            bytes_sent: peer.bytes_sent,
            bytes_received: peer.bytes_received,
            packets_sent: peer.packets_sent,
            packets_received: peer.packets_received,
            last_seen: peer.last_seen,
        })
    }

    pub fn all_peer_summaries(&self) -> Vec<PeerSummary> {
        let ids: Vec<String> = self.peers.read().keys().cloned().collect();
        ids.iter()
            .filter_map(|id| self.peer_summary(id))
            .collect()
    }

    pub fn peer_status(&self, peer_id: &str) -> Option<PeerStatus> {
        self.peers.read().get(peer_id).map(|p| p.status)
    }

    /// Start tracking a game session.
    pub fn start_session(&self, game_id: &str, game_name: &str, peers: Vec<String>) {
        debug!("starting session for {}", game_id);
        *self.active_session.write() = Some(GameSession {
            game_id: game_id.to_string(),
            game_name: game_name.to_string(),
            started_at: unix_now(),
            ended_at: None,
            duration: None,
            peers,
            avg_latency: None,
            max_latency: None,
            min_latency: None,
        });
    }

    /// Close the active session, aggregating min/avg/max latency across the
    /// participating peers' windows.
    pub fn end_session(&self) -> Option<GameSession> {
        let mut session = self.active_session.write().take()?;
        let now = unix_now();
        session.ended_at = Some(now);
        session.duration = Some(now - session.started_at);

        let peers = self.peers.read();
        let samples: Vec<f64> = session
            .peers
            .iter()
            .filter_map(|id| peers.get(id))
            .flat_map(|p| p.latency.iter().map(|point| point.value))
            .collect();
        if !samples.is_empty() {
            session.avg_latency = Some(samples.iter().sum::<f64>() / samples.len() as f64);
            session.max_latency = samples.iter().copied().reduce(f64::max);
            session.min_latency = samples.iter().copied().reduce(f64::min);
        }

        let mut sessions = self.sessions.write();
        if sessions.len() == SESSION_HISTORY {
            sessions.pop_front();
        }
        sessions.push_back(session.clone());
        Some(session)
    }

    pub fn recent_sessions(&self, limit: usize) -> Vec<GameSession> {
        let sessions = self.sessions.read();
        sessions
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Overall network quality, 0-100. Each peer contributes a latency
    /// score (`100 - avg/5`, floor 0), the host contributes a CPU score
    /// (`100 - avg%`, floor 0); the result is the arithmetic mean. No data
    /// at all scores a clean 100.
    pub fn network_quality_score(&self) -> f64 {
        let mut scores = Vec::new();

        for peer in self.peers.read().values() {
            if peer.latency.is_empty() {
                continue;
            }
            let avg =
                peer.latency.iter().map(|p| p.value).sum::<f64>() / peer.latency.len() as f64;
            scores.push((100.0 - avg / 5.0).max(0.0));
        }

        let cpu = self.cpu.read();
        if !cpu.is_empty() {
            let avg = cpu.iter().map(|p| p.value).sum::<f64>() / cpu.len() as f64;
            scores.push((100.0 - avg).max(0.0));
        }

        if scores.is_empty() {
            100.0
        } else {
            scores.iter().sum::<f64>() / scores.len() as f64
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn push_bounded(window: &mut VecDeque<MetricPoint>, value: f64) {
    if window.len() == WINDOW_CAPACITY {
        window.pop_front();
    }
    window.push_back(MetricPoint {
        timestamp: unix_now(),
        value,
    });
}

fn summarize(window: &VecDeque<MetricPoint>) -> LatencySummary {
    if window.is_empty() {
        return LatencySummary::default();
    }
    let values: Vec<f64> = window.iter().map(|p| p.value).collect();
    LatencySummary {
        current: values.last().copied(),
        average: Some(values.iter().sum::<f64>() / values.len() as f64),
        min: values.iter().copied().reduce(f64::min),
        max: values.iter().copied().reduce(f64::max),
    }
}

//! Relay selection
//!
//! Scores relay candidates for a peer pair from path quality, relay health
//! and load, and picks direct connectivity instead whenever the measured
//! direct quality clears the threshold. Relays that just failed sit in a
//! cooldown set and are skipped until the cooldown lapses.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::info;

/// Candidate metrics used for selection
#[derive(Debug, Clone)]
pub struct RelayCandidate {
    pub relay_id: String,
    pub region: String,
    /// 0-100
    pub health_score: f64,
    /// 0-100
    pub load_percent: f64,
    /// Per-peer reachability quality, 0-100
    pub peer_quality: HashMap<String, f64>,
}

impl RelayCandidate {
    pub fn new(relay_id: impl Into<String>) -> Self {
        Self {
            relay_id: relay_id.into(),
            region: "global".to_string(),
            health_score: 100.0,
            load_percent: 0.0,
            peer_quality: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMode {
    Direct,
    Relay,
}

/// Selection result with ordered fallbacks
#[derive(Debug, Clone)]
pub struct RelaySelection {
    pub mode: SelectionMode,
    pub selected_relay: Option<String>,
    pub score: f64,
    pub reason: &'static str,
    pub fallback_relays: Vec<String>,
}

/// Picks the best relay for a peer pair, with automatic failover ordering.
pub struct RelaySelector {
    direct_threshold: f64,
    failover_cooldown: Duration,
    failed: Mutex<HashMap<String, Instant>>,
}

impl RelaySelector {
    pub fn new() -> Self {
        Self::with_params(80.0, Duration::from_secs(2))
    }

    pub fn with_params(direct_threshold: f64, failover_cooldown: Duration) -> Self {
        Self {
            direct_threshold,
            failover_cooldown,
            failed: Mutex::new(HashMap::new()),
        }
    }

    /// Mark a relay as failed; it will not be selected until the cooldown
    /// expires.
    pub fn mark_failed(&self, relay_id: &str) {
        self.mark_failed_at(relay_id, Instant::now());
    }

    pub fn mark_failed_at(&self, relay_id: &str, failed_at: Instant) {
        self.failed.lock().insert(relay_id.to_string(), failed_at);
    }

    fn is_temporarily_failed(&self, relay_id: &str, now: Instant) -> bool {
        let mut failed = self.failed.lock();
        match failed.get(relay_id) {
            None => false,
            Some(failed_at) => {
                if now.duration_since(*failed_at) >= self.failover_cooldown {
                    failed.remove(relay_id);
                    false
                } else {
                    true
                }
            }
        }
    }

    fn score_relay(peer_a: &str, peer_b: &str, candidate: &RelayCandidate) -> f64 {
        let a_quality = clamp(candidate.peer_quality.get(peer_a).copied().unwrap_or(0.0));
        let b_quality = clamp(candidate.peer_quality.get(peer_b).copied().unwrap_or(0.0));
        let health = clamp(candidate.health_score);
        let load_factor = 1.0 - clamp(candidate.load_percent) / 100.0;

        let path_quality = (a_quality * b_quality).sqrt();
        clamp(path_quality * 0.7 + health * 0.3) * load_factor
    }

    /// Select the direct path or the best relay for a peer pair.
    pub fn select(
        &self,
        peer_a: &str,
        peer_b: &str,
        peer_a_direct_quality: f64,
        peer_b_direct_quality: f64,
        candidates: &[RelayCandidate],
        preferred_region: Option<&str>,
    ) -> RelaySelection {
        let direct_score =
            (clamp(peer_a_direct_quality) * clamp(peer_b_direct_quality)).sqrt();
        if direct_score >= self.direct_threshold {
            return RelaySelection {
                mode: SelectionMode::Direct,
                selected_relay: None,
                score: direct_score,
                reason: "direct_quality_above_threshold",
                fallback_relays: Vec::new(),
            };
        }

        let now = Instant::now();
        let mut scored: Vec<(f64, &RelayCandidate)> = Vec::new();
        for candidate in candidates {
            if self.is_temporarily_failed(&candidate.relay_id, now) {
                continue;
            }
            let mut score = Self::score_relay(peer_a, peer_b, candidate);
            if preferred_region.is_some_and(|r| candidate.region == r) {
                score = (score + 5.0).min(100.0);
            }
            scored.push((score, candidate));
        }

        if scored.is_empty() {
            return RelaySelection {
                mode: SelectionMode::Direct,
                selected_relay: None,
                score: direct_score,
                reason: "no_viable_relay",
                fallback_relays: Vec::new(),
            };
        }

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        let (best_score, best) = (scored[0].0, scored[0].1);
        let fallback_relays = scored[1..]
            .iter()
            .take(2)
            .map(|(_, c)| c.relay_id.clone())
            .collect();

        info!(
            "selected relay {} for {}/{} with score {:.1}",
            best.relay_id, peer_a, peer_b, best_score
        );

        RelaySelection {
            mode: SelectionMode::Relay,
            selected_relay: Some(best.relay_id.clone()),
            score: best_score,
            reason: "relay_selected_by_score",
            fallback_relays,
        }
    }
}

impl Default for RelaySelector {
    fn default() -> Self {
        Self::new()
    }
}

fn clamp(value: f64) -> f64 {
    value.clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(
        relay_id: &str,
        health: f64,
        load: f64,
        q_a: f64,
        q_b: f64,
    ) -> RelayCandidate {
        RelayCandidate {
            relay_id: relay_id.to_string(),
            region: "global".to_string(),
            health_score: health,
            load_percent: load,
            peer_quality: HashMap::from([("a".to_string(), q_a), ("b".to_string(), q_b)]),
        }
    }

    #[test]
    fn test_direct_above_threshold() {
        let selector = RelaySelector::new();
        let candidates = vec![candidate("r1", 100.0, 0.0, 90.0, 90.0)];
        let selection = selector.select("a", "b", 90.0, 90.0, &candidates, None);
        assert_eq!(selection.mode, SelectionMode::Direct);
        assert_eq!(selection.selected_relay, None);
        assert_eq!(selection.reason, "direct_quality_above_threshold");
    }

    #[test]
    fn test_relay_ranking_with_fallbacks() {
        // Candidates A and B from the quality/load table; A must win and B
        // come back as the fallback.
        let selector = RelaySelector::with_params(90.0, Duration::from_secs(2));
        let candidates = vec![
            candidate("relay-a", 98.0, 10.0, 85.0, 88.0),
            candidate("relay-b", 90.0, 30.0, 70.0, 80.0),
        ];
        let selection = selector.select("a", "b", 50.0, 50.0, &candidates, None);
        assert_eq!(selection.mode, SelectionMode::Relay);
        assert_eq!(selection.selected_relay.as_deref(), Some("relay-a"));
        assert_eq!(selection.fallback_relays, vec!["relay-b".to_string()]);
    }

    #[test]
    fn test_no_candidates_falls_back_to_direct() {
        let selector = RelaySelector::new();
        let selection = selector.select("a", "b", 10.0, 10.0, &[], None);
        assert_eq!(selection.mode, SelectionMode::Direct);
        assert_eq!(selection.reason, "no_viable_relay");
    }

    #[test]
    fn test_failed_relay_skipped_during_cooldown() {
        let selector = RelaySelector::new();
        let candidates = vec![
            candidate("r1", 100.0, 0.0, 90.0, 90.0),
            candidate("r2", 80.0, 0.0, 60.0, 60.0),
        ];
        selector.mark_failed("r1");
        let selection = selector.select("a", "b", 10.0, 10.0, &candidates, None);
        assert_eq!(selection.selected_relay.as_deref(), Some("r2"));
    }

    #[test]
    fn test_failed_relay_eligible_after_cooldown() {
        let selector = RelaySelector::with_params(80.0, Duration::from_millis(10));
        let candidates = vec![candidate("r1", 100.0, 0.0, 90.0, 90.0)];
        selector.mark_failed_at("r1", Instant::now() - Duration::from_millis(50));
        let selection = selector.select("a", "b", 10.0, 10.0, &candidates, None);
        assert_eq!(selection.selected_relay.as_deref(), Some("r1"));
    }

    #[test]
    fn test_all_relays_cooling_down() {
        let selector = RelaySelector::new();
        let candidates = vec![candidate("r1", 100.0, 0.0, 90.0, 90.0)];
        selector.mark_failed("r1");
        let selection = selector.select("a", "b", 10.0, 10.0, &candidates, None);
        assert_eq!(selection.mode, SelectionMode::Direct);
        assert_eq!(selection.reason, "no_viable_relay");
    }

    #[test]
    fn test_preferred_region_bonus() {
        let selector = RelaySelector::new();
        let mut near = candidate("near", 90.0, 0.0, 70.0, 70.0);
        near.region = "eu-west".to_string();
        let far = candidate("far", 92.0, 0.0, 70.0, 70.0);
        let selection = selector.select("a", "b", 10.0, 10.0, &[near, far], Some("eu-west"));
        assert_eq!(selection.selected_relay.as_deref(), Some("near"));
    }

    #[test]
    fn test_scores_clamped() {
        let selector = RelaySelector::new();
        let candidates = vec![candidate("r1", 500.0, -20.0, 150.0, 150.0)];
        let selection = selector.select("a", "b", 0.0, 0.0, &candidates, Some("global"));
        assert!(selection.score <= 100.0);
        assert!(selection.score >= 0.0);
    }
}

//! Authoritative control-plane store
//!
//! Parties, peers, relays, and bearer tokens persisted in sled, one tree per
//! table plus a `party_id/peer_id` membership index. Multi-key changes
//! (create, join, leave-with-cascade) run inside sled transactions so party
//! writes appear atomic to readers.

use super::types::{
    generate_party_id, generate_token, AuthToken, LeaveOutcome, PartyInfo, PeerInfo, RelayInfo,
    RelayRegistration,
};
use super::{ControlError, ControlPlane};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

const TOKEN_TTL_HOURS: i64 = 24;
const PEER_TIMEOUT_MINUTES: i64 = 5;
const RELAY_TIMEOUT_MINUTES: i64 = 10;

/// Party row, without its peers
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PartyRecord {
    name: String,
    host_id: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// Peer row: directory entry plus the party it belongs to
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PeerRow {
    party_id: String,
    peer: PeerInfo,
}

/// What one reaper pass removed
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReapSummary {
    pub stale_peers: usize,
    pub empty_parties: usize,
    pub expired_tokens: usize,
    pub stale_relays: usize,
}

impl ReapSummary {
    pub fn is_empty(&self) -> bool {
        self.stale_peers == 0
            && self.empty_parties == 0
            && self.expired_tokens == 0
            && self.stale_relays == 0
    }
}

/// sled-backed registry of parties, peers, relays, and tokens.
pub struct ControlStore {
    _db: sled::Db,
    parties: sled::Tree,
    peers: sled::Tree,
    party_index: sled::Tree,
    relays: sled::Tree,
    tokens: sled::Tree,
}

impl ControlStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: &Path) -> Result<Self, ControlError> {
        let db = sled::open(path)?;
        Ok(Self {
            parties: db.open_tree("parties")?,
            peers: db.open_tree("peers")?,
            party_index: db.open_tree("party_peers")?,
            relays: db.open_tree("relay_servers")?,
            tokens: db.open_tree("auth_tokens")?,
            _db: db,
        })
    }

    /// In-memory store for tests and single-process setups.
    pub fn open_temporary() -> Result<Self, ControlError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self {
            parties: db.open_tree("parties")?,
            peers: db.open_tree("peers")?,
            party_index: db.open_tree("party_peers")?,
            relays: db.open_tree("relay_servers")?,
            tokens: db.open_tree("auth_tokens")?,
            _db: db,
        })
    }

    fn index_key(party_id: &str, peer_id: &str) -> Vec<u8> {
        format!("{party_id}/{peer_id}").into_bytes()
    }

    // ------------------------------------------------------------------
    // Tokens
    // ------------------------------------------------------------------

    /// Issue a bearer token for `peer_id` with the standard 24 h TTL.
    pub fn issue_token(&self, peer_id: &str) -> Result<AuthToken, ControlError> {
        self.issue_token_with_ttl(peer_id, ChronoDuration::hours(TOKEN_TTL_HOURS))
    }

    pub fn issue_token_with_ttl(
        &self,
        peer_id: &str,
        ttl: ChronoDuration,
    ) -> Result<AuthToken, ControlError> {
        let now = Utc::now();
        let token = AuthToken {
            token: generate_token(),
            peer_id: peer_id.to_string(),
            created_at: now,
            expires_at: now + ttl,
        };
        self.tokens
            .insert(token.token.as_bytes(), serde_json::to_vec(&token)?)?;
        info!("issued token for peer {}", peer_id);
        Ok(token)
    }

    /// Verify a bearer token, returning the peer it is bound to. Expired
    /// tokens are rejected and removed.
    pub fn verify_token(&self, token: &str) -> Result<String, ControlError> {
        let raw = self
            .tokens
            .get(token.as_bytes())?
            .ok_or_else(|| ControlError::Unauthorized("invalid or expired token".to_string()))?;
        let record: AuthToken = serde_json::from_slice(&raw)?;
        if record.is_expired(Utc::now()) {
            self.tokens.remove(token.as_bytes())?;
            return Err(ControlError::Unauthorized("token expired".to_string()));
        }
        Ok(record.peer_id)
    }

    // ------------------------------------------------------------------
    // Parties
    // ------------------------------------------------------------------

    /// Create a party hosted by `host`. Retries id generation on the
    /// (vanishingly unlikely) collision.
    pub fn create_party_record(
        &self,
        name: &str,
        mut host: PeerInfo,
    ) -> Result<PartyInfo, ControlError> {
        let now = Utc::now();
        host.last_seen = now;

        loop {
            let party_id = generate_party_id();
            let record = PartyRecord {
                name: name.to_string(),
                host_id: host.peer_id.clone(),
                created_at: now,
                updated_at: now,
            };
            let row = PeerRow {
                party_id: party_id.clone(),
                peer: host.clone(),
            };

            let party_bytes = serde_json::to_vec(&record)?;
            let row_bytes = serde_json::to_vec(&row)?;
            let index_key = Self::index_key(&party_id, &host.peer_id);
            let host_key = host.peer_id.clone();

            let result = (&self.parties, &self.peers, &self.party_index).transaction(
                |(parties, peers, index)| {
                    if parties.get(party_id.as_bytes())?.is_some() {
                        // Collision: caller retries with a fresh id.
                        return Err(ConflictableTransactionError::Abort(None));
                    }
                    parties.insert(party_id.as_bytes(), party_bytes.as_slice())?;
                    peers.insert(host_key.as_bytes(), row_bytes.as_slice())?;
                    index.insert(index_key.as_slice(), host_key.as_bytes())?;
                    Ok(())
                },
            );

            match result {
                Ok(()) => {
                    info!("created party {} ({})", party_id, name);
                    return self
                        .get_party_record(&party_id)?
                        .ok_or_else(|| ControlError::PartyNotFound(party_id));
                }
                Err(TransactionError::Abort(None)) => {
                    warn!("party id collision, regenerating");
                    continue;
                }
                Err(TransactionError::Abort(Some(e))) => return Err(e),
                Err(TransactionError::Storage(e)) => return Err(e.into()),
            }
        }
    }

    /// Add `peer` to a party (or refresh its entry) and bump `updated_at`.
    pub fn join_party_record(
        &self,
        party_id: &str,
        mut peer: PeerInfo,
    ) -> Result<PartyInfo, ControlError> {
        let now = Utc::now();
        peer.last_seen = now;

        let row = PeerRow {
            party_id: party_id.to_string(),
            peer: peer.clone(),
        };
        let row_bytes = serde_json::to_vec(&row)?;
        let index_key = Self::index_key(party_id, &peer.peer_id);
        let peer_key = peer.peer_id.clone();

        let result = (&self.parties, &self.peers, &self.party_index).transaction(
            |(parties, peers, index)| {
                let raw = parties.get(party_id.as_bytes())?.ok_or_else(|| {
                    ConflictableTransactionError::Abort(ControlError::PartyNotFound(
                        party_id.to_string(),
                    ))
                })?;
                let mut record: PartyRecord = serde_json::from_slice(&raw)
                    .map_err(|e| ConflictableTransactionError::Abort(e.into()))?;
                record.updated_at = now;
                let record_bytes = serde_json::to_vec(&record)
                    .map_err(|e| ConflictableTransactionError::Abort(e.into()))?;

                parties.insert(party_id.as_bytes(), record_bytes)?;
                peers.insert(peer_key.as_bytes(), row_bytes.as_slice())?;
                index.insert(index_key.as_slice(), peer_key.as_bytes())?;
                Ok(())
            },
        );

        match result {
            Ok(()) => {
                debug!("peer {} joined party {}", peer.peer_id, party_id);
                self.get_party_record(party_id)?
                    .ok_or_else(|| ControlError::PartyNotFound(party_id.to_string()))
            }
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => Err(e.into()),
        }
    }

    /// Remove a peer. Host departure or an emptied party deletes the party
    /// and its remaining peers in the same transaction.
    pub fn leave_party_record(
        &self,
        party_id: &str,
        peer_id: &str,
    ) -> Result<LeaveOutcome, ControlError> {
        // Membership snapshot for the cascade; the transaction re-checks the
        // rows it actually touches.
        let members = self.member_ids(party_id)?;

        let result = (&self.parties, &self.peers, &self.party_index).transaction(
            |(parties, peers, index)| {
                let raw = parties.get(party_id.as_bytes())?.ok_or_else(|| {
                    ConflictableTransactionError::Abort(ControlError::PartyNotFound(
                        party_id.to_string(),
                    ))
                })?;
                let record: PartyRecord = serde_json::from_slice(&raw)
                    .map_err(|e| ConflictableTransactionError::Abort(e.into()))?;

                if index
                    .get(Self::index_key(party_id, peer_id).as_slice())?
                    .is_none()
                {
                    return Err(ConflictableTransactionError::Abort(
                        ControlError::PeerNotFound(peer_id.to_string()),
                    ));
                }

                peers.remove(peer_id.as_bytes())?;
                index.remove(Self::index_key(party_id, peer_id).as_slice())?;

                let remaining = members.iter().filter(|m| m.as_str() != peer_id).count();

                if peer_id == record.host_id || remaining == 0 {
                    for member in members.iter().filter(|m| m.as_str() != peer_id) {
                        peers.remove(member.as_bytes())?;
                        index.remove(Self::index_key(party_id, member).as_slice())?;
                    }
                    parties.remove(party_id.as_bytes())?;
                    Ok(LeaveOutcome::PartyDeleted)
                } else {
                    Ok(LeaveOutcome::Left)
                }
            },
        );

        match result {
            Ok(outcome) => {
                info!("peer {} left party {} ({:?})", peer_id, party_id, outcome);
                Ok(outcome)
            }
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => Err(e.into()),
        }
    }

    fn member_ids(&self, party_id: &str) -> Result<Vec<String>, ControlError> {
        let prefix = format!("{party_id}/");
        let mut members = Vec::new();
        for item in self.party_index.scan_prefix(prefix.as_bytes()) {
            let (_, value) = item?;
            members.push(String::from_utf8_lossy(&value).into_owned());
        }
        Ok(members)
    }

    /// Assemble a full party view (record plus member directory).
    pub fn get_party_record(&self, party_id: &str) -> Result<Option<PartyInfo>, ControlError> {
        let raw = match self.parties.get(party_id.as_bytes())? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        let record: PartyRecord = serde_json::from_slice(&raw)?;

        let mut peers = HashMap::new();
        for member in self.member_ids(party_id)? {
            if let Some(raw) = self.peers.get(member.as_bytes())? {
                let row: PeerRow = serde_json::from_slice(&raw)?;
                peers.insert(member, row.peer);
            }
        }

        Ok(Some(PartyInfo {
            party_id: party_id.to_string(),
            name: record.name,
            host_id: record.host_id,
            created_at: record.created_at,
            peers,
        }))
    }

    /// Advance a peer's `last_seen`. The row is updated in place, never
    /// deleted and re-created.
    pub fn heartbeat_record(&self, party_id: &str, peer_id: &str) -> Result<(), ControlError> {
        if self.parties.get(party_id.as_bytes())?.is_none() {
            return Err(ControlError::PartyNotFound(party_id.to_string()));
        }
        let raw = self
            .peers
            .get(peer_id.as_bytes())?
            .ok_or_else(|| ControlError::PeerNotFound(peer_id.to_string()))?;
        let mut row: PeerRow = serde_json::from_slice(&raw)?;
        if row.party_id != party_id {
            return Err(ControlError::PeerNotFound(peer_id.to_string()));
        }
        row.peer.last_seen = Utc::now();
        self.peers
            .insert(peer_id.as_bytes(), serde_json::to_vec(&row)?)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Relays
    // ------------------------------------------------------------------

    /// Register or refresh a relay server.
    pub fn register_relay_record(&self, reg: RelayRegistration) -> Result<(), ControlError> {
        let now = Utc::now();
        let registered_at = match self.relays.get(reg.relay_id.as_bytes())? {
            Some(raw) => serde_json::from_slice::<RelayInfo>(&raw)?.registered_at,
            None => now,
        };
        let info = RelayInfo {
            relay_id: reg.relay_id.clone(),
            public_ip: reg.public_ip,
            port: reg.port,
            region: reg.region,
            capacity: reg.capacity,
            registered_at,
            last_seen: now,
        };
        self.relays
            .insert(reg.relay_id.as_bytes(), serde_json::to_vec(&info)?)?;
        info!("registered relay {} ({})", info.relay_id, info.region);
        Ok(())
    }

    pub fn list_relay_records(&self) -> Result<Vec<RelayInfo>, ControlError> {
        let mut relays = Vec::new();
        for item in self.relays.iter() {
            let (_, raw) = item?;
            relays.push(serde_json::from_slice::<RelayInfo>(&raw)?);
        }
        relays.sort_by(|a, b| (&a.region, &a.relay_id).cmp(&(&b.region, &b.relay_id)));
        Ok(relays)
    }

    // ------------------------------------------------------------------
    // Reaper
    // ------------------------------------------------------------------

    /// One garbage-collection pass: stale peers, emptied parties, expired
    /// tokens, stale relays, and peer rows orphaned by a deleted party.
    pub fn reap(&self, now: DateTime<Utc>) -> Result<ReapSummary, ControlError> {
        let mut summary = ReapSummary::default();
        let peer_cutoff = now - ChronoDuration::minutes(PEER_TIMEOUT_MINUTES);
        let relay_cutoff = now - ChronoDuration::minutes(RELAY_TIMEOUT_MINUTES);

        // Stale and orphaned peers
        let mut stale = Vec::new();
        for item in self.peers.iter() {
            let (key, raw) = item?;
            let row: PeerRow = serde_json::from_slice(&raw)?;
            let orphaned = self.parties.get(row.party_id.as_bytes())?.is_none();
            if row.peer.last_seen < peer_cutoff || orphaned {
                stale.push((
                    String::from_utf8_lossy(&key).into_owned(),
                    row.party_id.clone(),
                ));
            }
        }
        for (peer_id, party_id) in &stale {
            self.peers.remove(peer_id.as_bytes())?;
            self.party_index
                .remove(Self::index_key(party_id, peer_id).as_slice())?;
            summary.stale_peers += 1;
        }

        // Parties left without members. A join racing this delete leaves an
        // orphaned peer row at worst, which the orphan sweep above removes
        // on the next pass.
        let party_ids: Vec<String> = self
            .parties
            .iter()
            .keys()
            .map(|k| k.map(|k| String::from_utf8_lossy(&k).into_owned()))
            .collect::<Result<_, _>>()?;
        for party_id in party_ids {
            if self.member_ids(&party_id)?.is_empty() {
                self.parties.remove(party_id.as_bytes())?;
                summary.empty_parties += 1;
            }
        }

        // Expired tokens
        let mut expired = Vec::new();
        for item in self.tokens.iter() {
            let (key, raw) = item?;
            let token: AuthToken = serde_json::from_slice(&raw)?;
            if token.is_expired(now) {
                expired.push(key);
            }
        }
        for key in expired {
            self.tokens.remove(key)?;
            summary.expired_tokens += 1;
        }

        // Stale relays
        let mut stale_relays = Vec::new();
        for item in self.relays.iter() {
            let (key, raw) = item?;
            let relay: RelayInfo = serde_json::from_slice(&raw)?;
            if relay.last_seen < relay_cutoff {
                stale_relays.push(key);
            }
        }
        for key in stale_relays {
            self.relays.remove(key)?;
            summary.stale_relays += 1;
        }

        if !summary.is_empty() {
            info!(
                "reaper removed {} peers, {} parties, {} tokens, {} relays",
                summary.stale_peers,
                summary.empty_parties,
                summary.expired_tokens,
                summary.stale_relays
            );
        }
        Ok(summary)
    }

    /// Background reaper loop, run it under the task registry.
    pub async fn reaper_loop(self: std::sync::Arc<Self>, interval: std::time::Duration) {
        loop {
            tokio::time::sleep(interval).await;
            if let Err(e) = self.reap(Utc::now()) {
                warn!("reaper pass failed: {}", e);
            }
        }
    }

    /// Party and relay counts for the health endpoint.
    pub fn counts(&self) -> (usize, usize) {
        (self.parties.len(), self.relays.len())
    }
}

#[async_trait]
impl ControlPlane for ControlStore {
    async fn register_peer(&self, peer_id: &str) -> Result<AuthToken, ControlError> {
        self.issue_token(peer_id)
    }

    async fn create_party(&self, name: &str, host: PeerInfo) -> Result<PartyInfo, ControlError> {
        self.create_party_record(name, host)
    }

    async fn join_party(&self, party_id: &str, peer: PeerInfo) -> Result<PartyInfo, ControlError> {
        self.join_party_record(party_id, peer)
    }

    async fn leave_party(
        &self,
        party_id: &str,
        peer_id: &str,
    ) -> Result<LeaveOutcome, ControlError> {
        self.leave_party_record(party_id, peer_id)
    }

    async fn get_party(&self, party_id: &str) -> Result<Option<PartyInfo>, ControlError> {
        self.get_party_record(party_id)
    }

    async fn get_peers(
        &self,
        party_id: &str,
    ) -> Result<HashMap<String, PeerInfo>, ControlError> {
        match self.get_party_record(party_id)? {
            Some(party) => Ok(party.peers),
            None => Err(ControlError::PartyNotFound(party_id.to_string())),
        }
    }

    async fn discover_peer(
        &self,
        party_id: &str,
        peer_id: &str,
    ) -> Result<Option<PeerInfo>, ControlError> {
        match self.get_party_record(party_id)? {
            Some(party) => Ok(party.peers.get(peer_id).cloned()),
            None => Err(ControlError::PartyNotFound(party_id.to_string())),
        }
    }

    async fn heartbeat(&self, party_id: &str, peer_id: &str) -> Result<(), ControlError> {
        self.heartbeat_record(party_id, peer_id)
    }

    async fn register_relay(&self, relay: RelayRegistration) -> Result<(), ControlError> {
        self.register_relay_record(relay)
    }

    async fn list_relays(&self) -> Result<Vec<RelayInfo>, ControlError> {
        self.list_relay_records()
    }

    async fn list_relays_by_region(&self, region: &str) -> Result<Vec<RelayInfo>, ControlError> {
        Ok(self
            .list_relay_records()?
            .into_iter()
            .filter(|r| r.region == region)
            .collect())
    }
}

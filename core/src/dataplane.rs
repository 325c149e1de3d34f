//! Cryptographic data-plane boundary
//!
//! LANlink does not implement the tunnel cipher itself; it drives an external
//! WireGuard-compatible data-plane through the narrow [`DataPlane`] trait.
//! Peers are identified by their 32-byte Curve25519 public key, endpoints are
//! `ip:port`, and allowed IPs are `/32` host routes inside the overlay.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

#[derive(Debug, Error)]
pub enum DataPlaneError {
    #[error("tunnel configuration failed: {0}")]
    Configuration(String),
    #[error("unknown tunnel peer")]
    UnknownPeer,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Narrow interface to the external tunnel implementation.
#[async_trait]
pub trait DataPlane: Send + Sync {
    /// Install a tunnel peer with the given endpoint and allowed host routes.
    async fn add_peer(
        &self,
        public_key: &[u8; 32],
        endpoint: SocketAddrV4,
        allowed_ips: &[String],
    ) -> Result<(), DataPlaneError>;

    /// Remove a tunnel peer.
    async fn remove_peer(&self, public_key: &[u8; 32]) -> Result<(), DataPlaneError>;

    /// Measure round-trip latency to an overlay address in milliseconds.
    /// `None` means the peer did not answer.
    async fn measure_latency(&self, overlay_ip: Ipv4Addr) -> Option<f64>;
}

/// Local tunnel keypair, persisted under the keys directory.
pub struct TunnelKeys {
    secret: StaticSecret,
    public: PublicKey,
}

impl TunnelKeys {
    /// Load the keypair from `keys_dir`, generating and persisting a fresh
    /// one if none exists. The private key file is created with mode 0600.
    pub fn load_or_generate(keys_dir: &Path) -> Result<Self, DataPlaneError> {
        let private_path = keys_dir.join("private.key");
        let public_path = keys_dir.join("public.key");

        if private_path.exists() && public_path.exists() {
            let raw = Zeroizing::new(std::fs::read(&private_path)?);
            let bytes: [u8; 32] = raw.as_slice().try_into().map_err(|_| {
                DataPlaneError::Configuration("private key file is not 32 bytes".to_string())
            })?;
            let secret = StaticSecret::from(bytes);
            let public = PublicKey::from(&secret);
            debug!("loaded tunnel keypair from {}", keys_dir.display());
            return Ok(Self { secret, public });
        }

        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = PublicKey::from(&secret);

        std::fs::create_dir_all(keys_dir)?;
        std::fs::write(&private_path, secret.to_bytes())?;
        std::fs::write(&public_path, public.as_bytes())?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&private_path, std::fs::Permissions::from_mode(0o600))?;
        }

        info!("generated tunnel keypair in {}", keys_dir.display());
        Ok(Self { secret, public })
    }

    pub fn public_key(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public.as_bytes())
    }

    /// Diffie-Hellman against a peer key, for data-plane backends that need
    /// the shared secret at configuration time.
    pub fn shared_secret(&self, peer_public: &[u8; 32]) -> Zeroizing<[u8; 32]> {
        let peer = PublicKey::from(*peer_public);
        Zeroizing::new(self.secret.diffie_hellman(&peer).to_bytes())
    }
}

/// Installed peer entry as seen by the in-memory data-plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledPeer {
    pub endpoint: SocketAddrV4,
    pub allowed_ips: Vec<String>,
}

/// In-memory data-plane used until a platform tunnel backend is wired in,
/// and by tests. Tracks installed peers and answers latency probes from a
/// configurable table.
pub struct InMemoryDataPlane {
    peers: RwLock<HashMap<[u8; 32], InstalledPeer>>,
    latency: RwLock<HashMap<Ipv4Addr, Option<f64>>>,
}

impl InMemoryDataPlane {
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            latency: RwLock::new(HashMap::new()),
        }
    }

    /// Set the latency the plane reports for an overlay address.
    pub fn set_latency(&self, overlay_ip: Ipv4Addr, latency_ms: Option<f64>) {
        self.latency.write().insert(overlay_ip, latency_ms);
    }

    pub fn installed_peer(&self, public_key: &[u8; 32]) -> Option<InstalledPeer> {
        self.peers.read().get(public_key).cloned()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }
}

impl Default for InMemoryDataPlane {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataPlane for InMemoryDataPlane {
    async fn add_peer(
        &self,
        public_key: &[u8; 32],
        endpoint: SocketAddrV4,
        allowed_ips: &[String],
    ) -> Result<(), DataPlaneError> {
        self.peers.write().insert(
            *public_key,
            InstalledPeer {
                endpoint,
                allowed_ips: allowed_ips.to_vec(),
            },
        );
        debug!("installed tunnel peer at {}", endpoint);
        Ok(())
    }

    async fn remove_peer(&self, public_key: &[u8; 32]) -> Result<(), DataPlaneError> {
        self.peers.write().remove(public_key);
        Ok(())
    }

    async fn measure_latency(&self, overlay_ip: Ipv4Addr) -> Option<f64> {
        self.latency.read().get(&overlay_ip).copied().flatten()
    }
}

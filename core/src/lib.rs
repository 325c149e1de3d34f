// LANlink Core — peer-to-peer gaming overlay
//
// "Does this help a LAN-only game find its players across the internet?"
//
// Encrypted tunnels between hosts, a control plane that keeps the party
// roster, stateless UDP relays for the pairs that can't connect directly,
// and broadcast re-emission so discovery packets cross the overlay.

pub mod broadcast;
pub mod config;
pub mod conflict;
pub mod connection;
pub mod control;
pub mod dataplane;
pub mod ipam;
pub mod locks;
pub mod metrics;
pub mod modsync;
pub mod nat;
pub mod relay;
pub mod tasks;

pub use broadcast::{BroadcastDeduplicator, BroadcastManager, BroadcastPacket, PacketProtocol};
pub use config::{Config, ConfigError, Mode};
pub use conflict::{ConflictResolver, OperationSpec, ResolutionStrategy};
pub use connection::{
    ConnectionManager, ConnectionManagerConfig, ConnectionState, ConnectionStatus,
    PeerConnectionError,
};
pub use control::{
    AuthToken, ControlError, ControlPlane, ControlStore, HttpControlClient, LeaveOutcome,
    PartyInfo, PeerInfo, RelayInfo, RelayRegistration,
};
pub use dataplane::{DataPlane, DataPlaneError, InMemoryDataPlane, TunnelKeys};
pub use ipam::{IpAddressPool, IpamError, PoolStats};
pub use locks::{AtomicOperation, ResourceLockManager};
pub use metrics::{MetricsCollector, PeerStatus};
pub use modsync::{ModArtifact, ModManifest, SyncMode, SyncPlan, SyncPlanner};
pub use nat::{
    ConnectionCoordinator, ConnectionStrategy, NatError, NatProbe, NatType, PathStrategy,
    ProbeResult,
};
pub use relay::{RelaySelector, RelayServer, RelayServerConfig};
pub use tasks::{TaskEngine, TaskPriority, TaskRegistry, TaskSpec, TaskStatus};

// Broadcast emulation — capture LAN discovery, dedup, re-emit across the overlay

pub mod dedup;
pub mod emulator;
pub mod manager;
pub mod packet;

pub use dedup::{BroadcastDeduplicator, DedupMetrics};
pub use emulator::{
    inject_broadcast, inject_multicast, multicast_group_for_port, spawn_broadcast_listener,
    spawn_multicast_listener, BroadcastSocketError, GAME_DISCOVERY_PORTS, MULTICAST_GROUPS,
};
pub use manager::BroadcastManager;
pub use packet::{BroadcastPacket, PacketCodecError, PacketProtocol};

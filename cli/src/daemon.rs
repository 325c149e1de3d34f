// Client daemon — wires the overlay components together and runs until
// interrupted.
//
// Startup order follows the dependency graph leaves-first: keys and NAT
// probe, control-plane registration, party membership, connection manager,
// broadcast emulation, then the background loops (heartbeat, dedup pruner,
// per-peer forwarders). Shutdown cancels the loops in one sweep and leaves
// the party.

use anyhow::{Context, Result};
use colored::Colorize;
use lanlink_core::broadcast::BroadcastManager;
use lanlink_core::config::Config;
use lanlink_core::connection::{ConnectionManager, ConnectionManagerConfig};
use lanlink_core::control::{ControlPlane, HttpControlClient, PeerInfo};
use lanlink_core::dataplane::{InMemoryDataPlane, TunnelKeys};
use lanlink_core::metrics::MetricsCollector;
use lanlink_core::nat::{ConnectionCoordinator, NatProbe, ProbeResult};
use lanlink_core::relay::RelaySelector;
use lanlink_core::tasks::{TaskRegistry, DEFAULT_CANCEL_DEADLINE};
use lanlink_core::BroadcastPacket;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{info, warn};

/// Overlay port that peers exchange broadcast envelopes on
const BROADCAST_FORWARD_PORT: u16 = 8671;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const DEDUP_PRUNE_INTERVAL: Duration = Duration::from_millis(500);

/// Load (or mint) the stable local peer id.
pub fn local_peer_id(config: &Config) -> Result<String> {
    let path = config.config_dir.join("peer_id");
    if path.exists() {
        return Ok(std::fs::read_to_string(&path)?.trim().to_string());
    }
    let peer_id = lanlink_core::control::generate_peer_id();
    std::fs::create_dir_all(&config.config_dir)?;
    std::fs::write(&path, &peer_id)?;
    Ok(peer_id)
}

/// Assemble the local peer's directory entry from keys and probe result.
pub fn build_peer_info(
    peer_id: &str,
    name: &str,
    keys: &TunnelKeys,
    probe: &ProbeResult,
) -> PeerInfo {
    PeerInfo {
        peer_id: peer_id.to_string(),
        name: name.to_string(),
        public_key: keys.public_key_hex(),
        nat_type: probe.nat_type,
        public_ip: probe.public_ip,
        public_port: probe.public_port,
        local_ip: probe.local_ip,
        local_port: probe.local_port,
        virtual_ip: None,
        last_seen: chrono::Utc::now(),
    }
}

/// Run the client daemon. Creates a party when `party` is `None`, joins it
/// otherwise.
pub async fn run(config: Config, party: Option<String>, display_name: String) -> Result<()> {
    let peer_id = local_peer_id(&config)?;
    println!("{} peer id {}", "✓".green(), peer_id);

    let keys = TunnelKeys::load_or_generate(&config.keys_dir)?;
    println!("{} tunnel key {}", "✓".green(), &keys.public_key_hex()[..16]);

    let probe_result = NatProbe::new(config.stun_servers.clone())
        .probe()
        .await
        .context("NAT probe failed")?;
    println!(
        "{} NAT {} (public {}:{})",
        "✓".green(),
        probe_result.nat_type,
        probe_result.public_ip,
        probe_result.public_port
    );

    let control = Arc::new(HttpControlClient::new(&config.control_url));
    control
        .register_peer(&peer_id)
        .await
        .context("control-plane registration failed")?;
    println!("{} registered with {}", "✓".green(), config.control_url);

    let me = build_peer_info(&peer_id, &display_name, &keys, &probe_result);
    let party_info = match &party {
        Some(party_id) => control.join_party(party_id, me).await?,
        None => {
            control
                .create_party(&format!("{display_name}'s party"), me)
                .await?
        }
    };
    println!(
        "{} party {} ({} peers)",
        "✓".green(),
        party_info.party_id.bold(),
        party_info.peers.len()
    );

    let registry = Arc::new(TaskRegistry::new());
    let selector = Arc::new(RelaySelector::new());
    let dataplane = Arc::new(InMemoryDataPlane::new());
    let coordinator = ConnectionCoordinator::new(
        config.clone(),
        control.clone() as Arc<dyn ControlPlane>,
        selector,
    );

    let manager = ConnectionManager::new(
        ConnectionManagerConfig::default(),
        &config.virtual_subnet,
        &peer_id,
        control.clone(),
        dataplane,
        coordinator,
        registry.clone(),
    )?;
    manager.set_local_endpoint(probe_result);

    let broadcast = BroadcastManager::new();
    let metrics = Arc::new(MetricsCollector::new());
    manager.attach_broadcast(broadcast.clone());
    manager.attach_metrics(metrics.clone());

    let _capture = broadcast.start();
    println!("{} broadcast emulation started", "✓".green());

    registry.spawn(
        "dedup_pruner",
        broadcast.dedup().clone().prune_loop(DEDUP_PRUNE_INTERVAL),
    );
    registry.spawn(
        "control_heartbeat",
        control.clone().heartbeat_loop(HEARTBEAT_INTERVAL),
    );

    spawn_broadcast_bridge(&registry, &broadcast).await?;

    // Connect to everyone already in the party.
    for other in party_info.peers.keys().filter(|id| **id != peer_id) {
        match manager.connect_to_peer(&party_info.party_id, other).await {
            Ok(status) => {
                println!(
                    "{} connected to {} via {} ({})",
                    "✓".green(),
                    other,
                    status.strategy,
                    status.virtual_ip
                );
                spawn_peer_forwarder(&registry, &broadcast, &manager, other);
            }
            Err(e) => {
                println!("{} could not connect to {}: {}", "⚠".yellow(), other, e);
            }
        }
    }

    println!("\n{}", "LANlink is up. Ctrl-C to stop.".bold());
    tokio::signal::ctrl_c().await?;
    println!("\nshutting down...");

    registry.cancel_all(DEFAULT_CANCEL_DEADLINE).await;
    broadcast.stop();

    for status in manager.list_connections() {
        if let Err(e) = manager.disconnect_from_peer(&status.peer_id).await {
            warn!("disconnect from {} failed: {}", status.peer_id, e);
        }
    }

    if let Err(e) = control.leave_party(&party_info.party_id, &peer_id).await {
        warn!("leave party failed: {}", e);
    }

    println!("{} stopped", "✓".green());
    Ok(())
}

/// Listener half of the overlay broadcast bridge: envelopes arriving from
/// peers on the forward port are re-injected locally.
async fn spawn_broadcast_bridge(
    registry: &Arc<TaskRegistry>,
    broadcast: &Arc<BroadcastManager>,
) -> Result<()> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, BROADCAST_FORWARD_PORT))
        .await
        .context("failed to bind broadcast forward port")?;
    info!("broadcast bridge listening on {}", socket.local_addr()?);

    let broadcast = broadcast.clone();
    registry.spawn("broadcast_bridge", async move {
        let mut buf = vec![0u8; 65536];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, _from)) => match BroadcastPacket::from_wire(&buf[..len]) {
                    Ok(packet) => broadcast.handle_remote(packet).await,
                    Err(e) => warn!("undecodable broadcast envelope: {}", e),
                },
                Err(e) => warn!("broadcast bridge recv error: {}", e),
            }
        }
    });

    Ok(())
}

/// Sender half: drain the per-peer forwarding channel and ship envelopes to
/// the peer's overlay address.
fn spawn_peer_forwarder(
    registry: &Arc<TaskRegistry>,
    broadcast: &Arc<BroadcastManager>,
    manager: &Arc<ConnectionManager>,
    peer_id: &str,
) {
    let Some(virtual_ip) = manager.virtual_ip_of(peer_id) else {
        return;
    };
    let mut rx = broadcast.register_peer(peer_id);

    registry.spawn(&format!("broadcast_forward_{peer_id}"), async move {
        let Ok(socket) = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await else {
            warn!("could not bind forwarder socket");
            return;
        };
        while let Some(packet) = rx.recv().await {
            match packet.to_wire() {
                Ok(wire) => {
                    if let Err(e) = socket
                        .send_to(&wire, (virtual_ip, BROADCAST_FORWARD_PORT))
                        .await
                    {
                        warn!("broadcast forward to {} failed: {}", virtual_ip, e);
                    }
                }
                Err(e) => warn!("broadcast encode failed: {}", e),
            }
        }
    });
}

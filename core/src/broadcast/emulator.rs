//! Broadcast and multicast capture / re-injection
//!
//! Listeners bind the well-known game-discovery ports with `SO_REUSEADDR`
//! (and `SO_BROADCAST` for broadcast ports, group membership for multicast
//! groups) and feed captured datagrams into the broadcast manager's channel.
//! The re-injection side emits a received packet back onto the local segment
//! as a limited broadcast or into the matching multicast group.

use super::packet::{BroadcastPacket, PacketProtocol};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Discovery ports monitored by default: Minecraft, Terraria, Source games,
/// Warcraft III, Age of Empires II.
pub const GAME_DISCOVERY_PORTS: &[u16] = &[4445, 7777, 27015, 27016, 6112, 6073];

/// Multicast groups monitored by default: mDNS and SSDP.
pub const MULTICAST_GROUPS: &[(Ipv4Addr, u16)] = &[
    (Ipv4Addr::new(224, 0, 0, 251), 5353),
    (Ipv4Addr::new(239, 255, 255, 250), 1900),
];

const LIMITED_BROADCAST: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 255);

#[derive(Debug, Error)]
pub enum BroadcastSocketError {
    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        source: std::io::Error,
    },
    #[error("failed to join multicast group {group}: {source}")]
    JoinGroup {
        group: Ipv4Addr,
        source: std::io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Multicast group a re-injected packet belongs to, from its destination
/// port. mDNS and SSDP map to their groups; everything else goes to the
/// all-hosts group.
pub fn multicast_group_for_port(port: u16) -> Ipv4Addr {
    match port {
        5353 => Ipv4Addr::new(224, 0, 0, 251),
        1900 => Ipv4Addr::new(239, 255, 255, 250),
        _ => Ipv4Addr::new(224, 0, 0, 1),
    }
}

/// `true` for source addresses that mark a local broadcast: directed
/// (`x.y.z.255`) or limited (`255.255.255.255`).
fn is_broadcast_source(ip: Ipv4Addr) -> bool {
    ip.octets()[3] == 255 || ip == LIMITED_BROADCAST
}

fn reusable_udp_socket(port: u16, broadcast: bool) -> Result<std::net::UdpSocket, std::io::Error> {
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;
    socket.set_reuse_address(true)?;
    if broadcast {
        socket.set_broadcast(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).into())?;
    Ok(socket.into())
}

/// Bind a broadcast listener on `port` and spawn its capture loop. Captured
/// packets go into `tx`; datagrams whose source does not look like a
/// broadcast are ignored.
pub fn spawn_broadcast_listener(
    port: u16,
    tx: mpsc::Sender<BroadcastPacket>,
) -> Result<JoinHandle<()>, BroadcastSocketError> {
    let std_socket =
        reusable_udp_socket(port, true).map_err(|source| BroadcastSocketError::Bind {
            port,
            source,
        })?;
    let socket = UdpSocket::from_std(std_socket)?;
    info!("broadcast listener started on port {}", port);

    Ok(tokio::spawn(async move {
        let mut buf = vec![0u8; 65536];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, SocketAddr::V4(src))) => {
                    if !is_broadcast_source(*src.ip()) {
                        continue;
                    }
                    let packet = BroadcastPacket {
                        data: buf[..len].to_vec(),
                        source_ip: *src.ip(),
                        source_port: src.port(),
                        dest_port: port,
                        protocol: PacketProtocol::Udp,
                    };
                    // Unreachable consumer: drop rather than queue.
                    if tx.try_send(packet).is_err() {
                        debug!("broadcast channel full, dropping packet on port {}", port);
                    }
                }
                Ok((_, SocketAddr::V6(_))) => {}
                Err(e) => {
                    warn!("broadcast listener on port {} recv error: {}", port, e);
                }
            }
        }
    }))
}

/// Join `group` on `port` and spawn the multicast capture loop.
pub fn spawn_multicast_listener(
    group: Ipv4Addr,
    port: u16,
    tx: mpsc::Sender<BroadcastPacket>,
) -> Result<JoinHandle<()>, BroadcastSocketError> {
    let std_socket =
        reusable_udp_socket(port, false).map_err(|source| BroadcastSocketError::Bind {
            port,
            source,
        })?;
    let socket = UdpSocket::from_std(std_socket)?;
    socket
        .join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)
        .map_err(|source| BroadcastSocketError::JoinGroup { group, source })?;
    info!("multicast listener started on {}:{}", group, port);

    Ok(tokio::spawn(async move {
        let mut buf = vec![0u8; 65536];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, SocketAddr::V4(src))) => {
                    let packet = BroadcastPacket {
                        data: buf[..len].to_vec(),
                        source_ip: *src.ip(),
                        source_port: src.port(),
                        dest_port: port,
                        protocol: PacketProtocol::Multicast,
                    };
                    if tx.try_send(packet).is_err() {
                        debug!("broadcast channel full, dropping multicast packet");
                    }
                }
                Ok((_, SocketAddr::V6(_))) => {}
                Err(e) => {
                    warn!("multicast listener {}:{} recv error: {}", group, port, e);
                }
            }
        }
    }))
}

/// Re-emit a packet from a remote peer as a local limited broadcast.
pub async fn inject_broadcast(packet: &BroadcastPacket) -> Result<(), BroadcastSocketError> {
    inject_broadcast_to(packet, LIMITED_BROADCAST).await
}

pub async fn inject_broadcast_to(
    packet: &BroadcastPacket,
    target: Ipv4Addr,
) -> Result<(), BroadcastSocketError> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.set_broadcast(true)?;
    socket
        .send_to(&packet.data, (target, packet.dest_port))
        .await?;
    debug!(
        "re-injected broadcast to {}:{} ({} bytes)",
        target,
        packet.dest_port,
        packet.data.len()
    );
    Ok(())
}

/// Re-emit a packet from a remote peer into a multicast group.
pub async fn inject_multicast(
    packet: &BroadcastPacket,
    group: Ipv4Addr,
) -> Result<(), BroadcastSocketError> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket
        .send_to(&packet.data, (group, packet.dest_port))
        .await?;
    debug!(
        "re-injected multicast to {}:{} ({} bytes)",
        group,
        packet.dest_port,
        packet.data.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multicast_group_map() {
        assert_eq!(
            multicast_group_for_port(5353),
            Ipv4Addr::new(224, 0, 0, 251)
        );
        assert_eq!(
            multicast_group_for_port(1900),
            Ipv4Addr::new(239, 255, 255, 250)
        );
        assert_eq!(multicast_group_for_port(4445), Ipv4Addr::new(224, 0, 0, 1));
    }

    #[test]
    fn test_broadcast_source_check() {
        assert!(is_broadcast_source(Ipv4Addr::new(192, 168, 1, 255)));
        assert!(is_broadcast_source(Ipv4Addr::new(255, 255, 255, 255)));
        assert!(!is_broadcast_source(Ipv4Addr::new(192, 168, 1, 100)));
    }

    #[tokio::test]
    async fn test_listener_binds_with_reuse() {
        // Two listeners on the same port must coexist.
        let (tx1, _rx1) = mpsc::channel(16);
        let (tx2, _rx2) = mpsc::channel(16);
        let h1 = spawn_broadcast_listener(34567, tx1).unwrap();
        let h2 = spawn_broadcast_listener(34567, tx2).unwrap();
        h1.abort();
        h2.abort();
    }

    #[tokio::test]
    async fn test_inject_broadcast_loopback() {
        // Loopback delivery is environment-dependent; sending itself must
        // not error.
        let packet = BroadcastPacket {
            data: vec![0xAA],
            source_ip: Ipv4Addr::new(192, 168, 1, 100),
            source_port: 12345,
            dest_port: 34568,
            protocol: PacketProtocol::Udp,
        };
        inject_broadcast_to(&packet, Ipv4Addr::new(127, 0, 0, 1))
            .await
            .unwrap();
    }
}

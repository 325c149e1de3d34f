//! UDP hole punching
//!
//! Sends a burst of marker datagrams to the peer's public endpoint to open a
//! reciprocal NAT mapping, then waits for an acknowledgement. The same bound
//! socket is used for both directions so the mapping created by the outbound
//! burst is the one the acknowledgement arrives on.

use std::net::SocketAddrV4;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

pub const PUNCH_MARKER: &[u8] = b"LANLINK_PUNCH";
pub const PUNCH_ACK: &[u8] = b"LANLINK_PUNCH_ACK";

const MARKER_COUNT: u32 = 5;
const MARKER_INTERVAL: Duration = Duration::from_millis(100);
const ACK_TIMEOUT: Duration = Duration::from_secs(2);

/// Attempt to punch a hole to `peer` from `local_port` (the tunnel port).
///
/// Never fails hard: socket errors are logged and reported as an
/// unsuccessful punch so the caller can fall back to a relay.
pub async fn attempt_hole_punch(local_port: u16, peer: SocketAddrV4) -> bool {
    let socket = match UdpSocket::bind(("0.0.0.0", local_port)).await {
        Ok(s) => s,
        Err(e) => {
            warn!("hole punch bind on port {} failed: {}", local_port, e);
            return false;
        }
    };

    for _ in 0..MARKER_COUNT {
        if let Err(e) = socket.send_to(PUNCH_MARKER, peer).await {
            warn!("hole punch send to {} failed: {}", peer, e);
            return false;
        }
        tokio::time::sleep(MARKER_INTERVAL).await;
    }

    wait_for_ack(&socket, peer).await
}

async fn wait_for_ack(socket: &UdpSocket, peer: SocketAddrV4) -> bool {
    let deadline = tokio::time::Instant::now() + ACK_TIMEOUT;
    let mut buf = [0u8; 64];

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            debug!("hole punch to {} timed out waiting for ack", peer);
            return false;
        }

        match tokio::time::timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, from))) => {
                let data = &buf[..len];
                if data == PUNCH_ACK {
                    debug!("hole punch to {} acknowledged by {}", peer, from);
                    return true;
                }
                if data == PUNCH_MARKER {
                    // The peer is punching simultaneously: acknowledge so its
                    // side converges, keep waiting for our own ack.
                    let _ = socket.send_to(PUNCH_ACK, from).await;
                }
            }
            Ok(Err(e)) => {
                warn!("hole punch recv failed: {}", e);
                return false;
            }
            Err(_) => {
                debug!("hole punch to {} timed out waiting for ack", peer);
                return false;
            }
        }
    }
}

/// Answer incoming punch markers on an already-bound socket, for the side
/// that was asked to cooperate in an exchange. Returns once one marker has
/// been acknowledged or the timeout lapses.
pub async fn answer_punch(socket: &UdpSocket, timeout: Duration) -> bool {
    let mut buf = [0u8; 64];
    match tokio::time::timeout(timeout, socket.recv_from(&mut buf)).await {
        Ok(Ok((len, from))) => {
            if &buf[..len] == PUNCH_MARKER {
                if let Err(e) = socket.send_to(PUNCH_ACK, from).await {
                    warn!("punch ack send to {} failed: {}", from, e);
                    return false;
                }
                debug!("acknowledged punch marker from {}", from);
                return true;
            }
            false
        }
        _ => false,
    }
}

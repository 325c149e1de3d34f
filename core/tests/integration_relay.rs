// Integration tests for the stateless relay over real UDP sockets.

use lanlink_core::relay::{RelayServer, RelayServerConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;

fn handshake_initiation(key: [u8; 32]) -> Vec<u8> {
    let mut data = vec![0u8; 148];
    data[0..4].copy_from_slice(&1u32.to_le_bytes());
    data[8..40].copy_from_slice(&key);
    data
}

fn data_packet(payload: &[u8]) -> Vec<u8> {
    let mut data = vec![0u8; 16 + payload.len()];
    data[0..4].copy_from_slice(&4u32.to_le_bytes());
    data[16..].copy_from_slice(payload);
    data
}

async fn start_relay() -> (Arc<RelayServer>, SocketAddr) {
    let server = RelayServer::new(RelayServerConfig::default());
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(Arc::clone(&server).forward_loop(socket));
    (server, addr)
}

async fn recv_with_timeout(socket: &UdpSocket) -> Option<Vec<u8>> {
    let mut buf = vec![0u8; 65536];
    match tokio::time::timeout(Duration::from_secs(1), socket.recv_from(&mut buf)).await {
        Ok(Ok((len, _))) => Some(buf[..len].to_vec()),
        _ => None,
    }
}

#[tokio::test]
async fn test_relay_pairs_and_forwards() {
    let (_server, relay_addr) = start_relay().await;

    let alice = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let bob = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    // Both sides introduce themselves with handshakes.
    alice
        .send_to(&handshake_initiation([0xAA; 32]), relay_addr)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    bob.send_to(&handshake_initiation([0xBB; 32]), relay_addr)
        .await
        .unwrap();

    // Bob's handshake reaches Alice verbatim.
    let forwarded = recv_with_timeout(&alice).await.expect("nothing forwarded");
    assert_eq!(forwarded, handshake_initiation([0xBB; 32]));
}

#[tokio::test]
async fn test_relay_forwards_data_verbatim() {
    let (_server, relay_addr) = start_relay().await;

    let alice = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let bob = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    alice
        .send_to(&handshake_initiation([0xAA; 32]), relay_addr)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    bob.send_to(&handshake_initiation([0xBB; 32]), relay_addr)
        .await
        .unwrap();

    // Drain the handshake that was forwarded to Alice.
    recv_with_timeout(&alice).await.expect("handshake");

    // An opaque data packet from Alice arrives at Bob unmodified.
    let payload = data_packet(b"ciphertext-bytes");
    alice.send_to(&payload, relay_addr).await.unwrap();

    let received = recv_with_timeout(&bob).await.expect("no data forwarded");
    assert_eq!(received, payload);
}

#[tokio::test]
async fn test_relay_follows_nat_rebind() {
    let (server, relay_addr) = start_relay().await;

    let alice = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let bob_before = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let bob_after = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    alice
        .send_to(&handshake_initiation([0xAA; 32]), relay_addr)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Bob appears, then his NAT rebinds him to a new source port.
    bob_before
        .send_to(&handshake_initiation([0xBB; 32]), relay_addr)
        .await
        .unwrap();
    recv_with_timeout(&alice).await.expect("handshake");
    bob_after
        .send_to(&handshake_initiation([0xBB; 32]), relay_addr)
        .await
        .unwrap();
    recv_with_timeout(&alice).await.expect("rebind handshake");

    // Rebinding updated the existing entry rather than adding one.
    assert_eq!(server.stats().active_clients, 2);

    // Alice's next handshake must land on the new address only.
    alice
        .send_to(&handshake_initiation([0xAA; 32]), relay_addr)
        .await
        .unwrap();

    assert!(recv_with_timeout(&bob_after).await.is_some());
    assert!(recv_with_timeout(&bob_before).await.is_none());
}

#[tokio::test]
async fn test_relay_drops_blocked_sources() {
    let (server, relay_addr) = start_relay().await;
    server.block_ip("127.0.0.1".parse().unwrap());

    let alice = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    alice
        .send_to(&handshake_initiation([0xAA; 32]), relay_addr)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(server.stats().active_clients, 0);
    assert_eq!(server.stats().total_packets, 0);
}

#[tokio::test]
async fn test_relay_counts_traffic() {
    let (server, relay_addr) = start_relay().await;

    let alice = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let packet = handshake_initiation([0xAA; 32]);
    alice.send_to(&packet, relay_addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stats = server.stats();
    assert_eq!(stats.total_packets, 1);
    assert_eq!(stats.total_bytes, packet.len() as u64);
    assert_eq!(stats.active_clients, 1);
}

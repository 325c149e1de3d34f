// Integration tests for the control plane: HTTP server + client against a
// live sled-backed store.

use chrono::Utc;
use lanlink_core::control::{
    server, ControlError, ControlPlane, ControlStore, HttpControlClient, LeaveOutcome, PeerInfo,
    RelayRegistration,
};
use lanlink_core::nat::NatType;
use std::net::Ipv4Addr;
use std::sync::Arc;

async fn start_server() -> (HttpControlClient, Arc<ControlStore>) {
    let store = Arc::new(ControlStore::open_temporary().unwrap());
    let (addr, serve) = server::bind(store.clone(), "127.0.0.1:0".parse().unwrap()).unwrap();
    tokio::spawn(serve);
    (HttpControlClient::new(&format!("http://{addr}")), store)
}

fn peer(id: &str, nat_type: NatType) -> PeerInfo {
    PeerInfo {
        peer_id: id.to_string(),
        name: format!("player-{id}"),
        public_key: hex::encode([0x42u8; 32]),
        nat_type,
        public_ip: Ipv4Addr::new(203, 0, 113, 7),
        public_port: 51820,
        local_ip: Ipv4Addr::new(192, 168, 1, 7),
        local_port: 51820,
        virtual_ip: None,
        last_seen: Utc::now(),
    }
}

#[tokio::test]
async fn test_register_returns_token() {
    let (client, _store) = start_server().await;
    let token = client.register_peer("host").await.unwrap();
    assert_eq!(token.peer_id, "host");
    assert_eq!(token.token.len(), 64);
    assert!(token.expires_at > Utc::now());
}

#[tokio::test]
async fn test_party_routes_require_token() {
    let (client, _store) = start_server().await;
    // No registration: every party call must come back 401.
    let err = client
        .create_party("nope", peer("host", NatType::FullCone))
        .await
        .unwrap_err();
    match err {
        ControlError::Status { code, .. } => assert_eq!(code, 401),
        other => panic!("expected 401, got {other:?}"),
    }
}

#[tokio::test]
async fn test_create_join_and_read_party() {
    let (client, _store) = start_server().await;
    client.register_peer("host").await.unwrap();

    let party = client
        .create_party("friday-lan", peer("host", NatType::FullCone))
        .await
        .unwrap();
    assert_eq!(party.name, "friday-lan");
    assert_eq!(party.host_id, "host");
    assert_eq!(party.party_id.len(), 12);

    let joined = client
        .join_party(&party.party_id, peer("q", NatType::Symmetric))
        .await
        .unwrap();
    assert_eq!(joined.peers.len(), 2);

    let peers = client.get_peers(&party.party_id).await.unwrap();
    assert!(peers.contains_key("host"));
    assert!(peers.contains_key("q"));

    let discovered = client
        .discover_peer(&party.party_id, "q")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(discovered.nat_type, NatType::Symmetric);
    // Wire round-trip preserved the directory entry.
    assert_eq!(discovered.public_key, peer("q", NatType::Symmetric).public_key);
}

#[tokio::test]
async fn test_join_twice_is_one_membership() {
    let (client, _store) = start_server().await;
    client.register_peer("host").await.unwrap();

    let party = client
        .create_party("p", peer("host", NatType::FullCone))
        .await
        .unwrap();
    client
        .join_party(&party.party_id, peer("q", NatType::FullCone))
        .await
        .unwrap();
    let again = client
        .join_party(&party.party_id, peer("q", NatType::FullCone))
        .await
        .unwrap();
    assert_eq!(again.peers.len(), 2);
}

#[tokio::test]
async fn test_unknown_party_reads() {
    let (client, _store) = start_server().await;
    client.register_peer("someone").await.unwrap();

    assert!(client.get_party("000000000000").await.unwrap().is_none());
    assert!(client
        .discover_peer("000000000000", "nobody")
        .await
        .unwrap()
        .is_none());

    let err = client
        .join_party("000000000000", peer("q", NatType::FullCone))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_host_leave_cascades() {
    let (client, store) = start_server().await;
    client.register_peer("host").await.unwrap();

    let party = client
        .create_party("p", peer("host", NatType::FullCone))
        .await
        .unwrap();
    client
        .join_party(&party.party_id, peer("q", NatType::FullCone))
        .await
        .unwrap();

    let outcome = client.leave_party(&party.party_id, "host").await.unwrap();
    assert_eq!(outcome, LeaveOutcome::PartyDeleted);

    // The party and every member are gone from all listings.
    assert!(client.get_party(&party.party_id).await.unwrap().is_none());
    assert!(store.get_party_record(&party.party_id).unwrap().is_none());
}

#[tokio::test]
async fn test_non_host_leave_keeps_party() {
    let (client, _store) = start_server().await;
    client.register_peer("host").await.unwrap();

    let party = client
        .create_party("p", peer("host", NatType::FullCone))
        .await
        .unwrap();
    client
        .join_party(&party.party_id, peer("q", NatType::FullCone))
        .await
        .unwrap();

    let outcome = client.leave_party(&party.party_id, "q").await.unwrap();
    assert_eq!(outcome, LeaveOutcome::Left);

    let remaining = client.get_party(&party.party_id).await.unwrap().unwrap();
    assert_eq!(remaining.peers.len(), 1);
    assert!(remaining.peers.contains_key("host"));
}

#[tokio::test]
async fn test_heartbeat_advances_last_seen() {
    let (client, _store) = start_server().await;
    client.register_peer("host").await.unwrap();

    let party = client
        .create_party("p", peer("host", NatType::FullCone))
        .await
        .unwrap();
    let before = party.peers["host"].last_seen;

    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    client.heartbeat(&party.party_id, "host").await.unwrap();

    let after = client
        .discover_peer(&party.party_id, "host")
        .await
        .unwrap()
        .unwrap()
        .last_seen;
    assert!(after > before);
}

#[tokio::test]
async fn test_heartbeat_unknown_peer_is_404() {
    let (client, _store) = start_server().await;
    client.register_peer("host").await.unwrap();

    let party = client
        .create_party("p", peer("host", NatType::FullCone))
        .await
        .unwrap();
    let err = client
        .heartbeat(&party.party_id, "ghost")
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_relay_registry_round_trip() {
    let (client, _store) = start_server().await;
    client.register_peer("relay-operator").await.unwrap();

    client
        .register_relay(RelayRegistration {
            relay_id: "r-eu".to_string(),
            public_ip: Ipv4Addr::new(198, 51, 100, 4),
            port: 51820,
            region: "eu-west".to_string(),
            capacity: 100,
        })
        .await
        .unwrap();
    client
        .register_relay(RelayRegistration {
            relay_id: "r-us".to_string(),
            public_ip: Ipv4Addr::new(198, 51, 100, 5),
            port: 51820,
            region: "us-east".to_string(),
            capacity: 50,
        })
        .await
        .unwrap();

    let all = client.list_relays().await.unwrap();
    assert_eq!(all.len(), 2);

    let eu = client.list_relays_by_region("eu-west").await.unwrap();
    assert_eq!(eu.len(), 1);
    assert_eq!(eu[0].relay_id, "r-eu");
    assert_eq!(eu[0].endpoint().to_string(), "198.51.100.4:51820");

    let nowhere = client.list_relays_by_region("mars").await.unwrap();
    assert!(nowhere.is_empty());
}

#[tokio::test]
async fn test_expired_token_rejected() {
    let (client, store) = start_server().await;

    // Resume a session with a token that has already expired.
    let stale = store
        .issue_token_with_ttl("host", chrono::Duration::seconds(-1))
        .unwrap();
    client.set_token(&stale.token);

    let err = client
        .create_party("p", peer("host", NatType::FullCone))
        .await
        .unwrap_err();
    match err {
        ControlError::Status { code, .. } => assert_eq!(code, 401),
        other => panic!("expected 401, got {other:?}"),
    }
}

//! NAT endpoint probing via STUN
//!
//! Queries a list of STUN servers until one answers, classifies the local
//! endpoint, and exposes the public/local address tuples. Classification is
//! deliberately simplified: a full RFC 3489 discrimination between
//! restricted and symmetric mappings would need probes from multiple local
//! ports. `Symmetric` is a value peers may declare about themselves, never
//! one this prober infers.

use super::stun::{self, TransactionId};
use super::NatError;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

/// Behavioral NAT classification of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NatType {
    /// No NAT, directly reachable
    Open,
    /// Endpoint-independent mapping, easy to traverse
    FullCone,
    /// Address-restricted mapping
    RestrictedCone,
    /// Address-and-port-restricted mapping
    PortRestrictedCone,
    /// Per-destination mapping, relay required
    Symmetric,
    Unknown,
}

impl std::fmt::Display for NatType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NatType::Open => "open",
            NatType::FullCone => "full_cone",
            NatType::RestrictedCone => "restricted_cone",
            NatType::PortRestrictedCone => "port_restricted_cone",
            NatType::Symmetric => "symmetric",
            NatType::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Outcome of a successful probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResult {
    pub public_ip: Ipv4Addr,
    pub public_port: u16,
    pub local_ip: Ipv4Addr,
    pub local_port: u16,
    pub nat_type: NatType,
}

/// STUN-based NAT prober
pub struct NatProbe {
    servers: Vec<String>,
    timeout: Duration,
}

impl NatProbe {
    /// Probe using the given STUN server list (host:port strings) with a
    /// 3 second per-server timeout.
    pub fn new(servers: Vec<String>) -> Self {
        Self {
            servers,
            timeout: Duration::from_secs(3),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run the probe. Individual server failures are expected and logged;
    /// the probe only fails once every server has failed.
    pub async fn probe(&self) -> Result<ProbeResult, NatError> {
        if self.servers.is_empty() {
            return Err(NatError::Detection(
                "no STUN servers configured".to_string(),
            ));
        }

        let mut last_error = None;

        for server in &self.servers {
            match self.query_server(server).await {
                Ok(result) => {
                    info!(
                        "NAT detected via {}: {} (public {}:{})",
                        server, result.nat_type, result.public_ip, result.public_port
                    );
                    return Ok(result);
                }
                Err(e) => {
                    warn!("STUN server {} failed: {}", server, e);
                    last_error = Some(e);
                }
            }
        }

        let detail = last_error
            .map(|e| format!(". Last error: {e}"))
            .unwrap_or_default();
        Err(NatError::Detection(format!(
            "failed to detect NAT type (all STUN servers failed){detail}"
        )))
    }

    async fn query_server(&self, server: &str) -> Result<ProbeResult, NatError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        // Connecting pins the route and lets the OS report the real local
        // address instead of 0.0.0.0.
        socket.connect(server).await?;

        let (local_ip, local_port) = match socket.local_addr()? {
            SocketAddr::V4(addr) => (*addr.ip(), addr.port()),
            SocketAddr::V6(_) => {
                return Err(NatError::Detection("IPv6 local socket".to_string()))
            }
        };

        let txid = TransactionId::random();
        let request = stun::encode_binding_request(txid);
        socket.send(&request).await?;

        let mut buf = [0u8; 1024];
        let len = tokio::time::timeout(self.timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| NatError::Timeout(server.to_string()))??;

        let mapped = stun::parse_binding_response(&buf[..len], txid)?;
        debug!("STUN {} mapped {} -> {}", server, local_port, mapped);

        let nat_type = classify(local_ip, local_port, *mapped.ip(), mapped.port());

        Ok(ProbeResult {
            public_ip: *mapped.ip(),
            public_port: mapped.port(),
            local_ip,
            local_port,
            nat_type,
        })
    }
}

/// Simplified NAT classification from one observed mapping.
fn classify(local_ip: Ipv4Addr, local_port: u16, public_ip: Ipv4Addr, public_port: u16) -> NatType {
    if public_ip == local_ip {
        NatType::Open
    } else if public_port == local_port {
        NatType::FullCone
    } else {
        // Distinguishing restricted from port-restricted needs more probes.
        NatType::PortRestrictedCone
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_open() {
        let ip = Ipv4Addr::new(203, 0, 113, 5);
        assert_eq!(classify(ip, 40000, ip, 40001), NatType::Open);
    }

    #[test]
    fn test_classify_full_cone() {
        assert_eq!(
            classify(
                Ipv4Addr::new(192, 168, 1, 10),
                40000,
                Ipv4Addr::new(203, 0, 113, 5),
                40000
            ),
            NatType::FullCone
        );
    }

    #[test]
    fn test_classify_port_restricted() {
        assert_eq!(
            classify(
                Ipv4Addr::new(192, 168, 1, 10),
                40000,
                Ipv4Addr::new(203, 0, 113, 5),
                41234
            ),
            NatType::PortRestrictedCone
        );
    }

    #[test]
    fn test_nat_type_serde_names() {
        assert_eq!(
            serde_json::to_string(&NatType::PortRestrictedCone).unwrap(),
            "\"port_restricted_cone\""
        );
        let parsed: NatType = serde_json::from_str("\"symmetric\"").unwrap();
        assert_eq!(parsed, NatType::Symmetric);
    }

    #[tokio::test]
    async fn test_probe_no_servers_fails() {
        let probe = NatProbe::new(vec![]);
        assert!(probe.probe().await.is_err());
    }

    #[tokio::test]
    async fn test_probe_against_local_responder() {
        // A fake STUN server on loopback that answers with MAPPED-ADDRESS.
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(len, stun::HEADER_LEN);
            let mut resp = Vec::new();
            resp.extend_from_slice(&stun::BINDING_RESPONSE.to_be_bytes());
            resp.extend_from_slice(&12u16.to_be_bytes());
            resp.extend_from_slice(&buf[4..20]);
            resp.extend_from_slice(&stun::ATTR_MAPPED_ADDRESS.to_be_bytes());
            resp.extend_from_slice(&8u16.to_be_bytes());
            let port = match from {
                SocketAddr::V4(a) => a.port(),
                _ => unreachable!(),
            };
            resp.extend_from_slice(&[0, 0x01]);
            resp.extend_from_slice(&port.to_be_bytes());
            resp.extend_from_slice(&[127, 0, 0, 1]);
            server.send_to(&resp, from).await.unwrap();
        });

        let probe = NatProbe::new(vec![server_addr.to_string()]);
        let result = probe.probe().await.unwrap();
        // Mapping mirrors the local socket exactly, so this reads as no NAT.
        assert_eq!(result.nat_type, NatType::Open);
        assert_eq!(result.public_ip, Ipv4Addr::new(127, 0, 0, 1));
        assert_eq!(result.public_port, result.local_port);
    }

    #[tokio::test]
    async fn test_probe_all_servers_down() {
        let probe = NatProbe::new(vec!["127.0.0.1:1".to_string()])
            .with_timeout(Duration::from_millis(200));
        let err = probe.probe().await.unwrap_err();
        assert!(matches!(err, NatError::Detection(_)));
    }
}

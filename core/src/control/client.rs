//! Control-plane HTTP client
//!
//! Talks to the control-plane server with bounded timeouts (10 s total,
//! 5 s connect) and up to 3 attempts with exponential backoff on transport
//! failures. HTTP status errors are surfaced immediately. The bearer token
//! obtained from registration is attached to every subsequent request and
//! never logged.

use super::plane::ControlPlane;
use super::types::{
    AuthToken, LeaveOutcome, PartyInfo, PeerInfo, RelayInfo, RelayRegistration,
};
use super::ControlError;
use async_trait::async_trait;
use chrono::Utc;
use hyper::client::HttpConnector;
use hyper::{Body, Client, Method, Request};
use parking_lot::RwLock;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const RETRY_COUNT: u32 = 3;
const RETRY_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// HTTP client for a remote control plane.
pub struct HttpControlClient {
    base_url: String,
    client: Client<HttpConnector>,
    token: RwLock<Option<String>>,
    my_peer_id: RwLock<Option<String>>,
    my_party_id: RwLock<Option<String>>,
}

impl HttpControlClient {
    /// Create a client for `base_url`, e.g. `http://control.example.net:8667`.
    pub fn new(base_url: &str) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(CONNECT_TIMEOUT));
        let client = Client::builder().build(connector);

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            token: RwLock::new(None),
            my_peer_id: RwLock::new(None),
            my_party_id: RwLock::new(None),
        }
    }

    pub fn my_party_id(&self) -> Option<String> {
        self.my_party_id.read().clone()
    }

    pub fn my_peer_id(&self) -> Option<String> {
        self.my_peer_id.read().clone()
    }

    /// Resume a previous session with a saved bearer token.
    pub fn set_token(&self, token: &str) {
        *self.token.write() = Some(token.to_string());
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, ControlError> {
        let mut last_error = None;

        for attempt in 0..RETRY_COUNT {
            if attempt > 0 {
                let backoff = RETRY_BACKOFF_BASE * 2u32.pow(attempt - 1);
                debug!("retrying {} {} after {:?}", method, path, backoff);
                tokio::time::sleep(backoff).await;
            }

            match self.request_once(method.clone(), path, body.clone()).await {
                Ok(value) => return Ok(value),
                // Status errors carry the server's verdict; retrying will
                // not change it.
                Err(e @ ControlError::Status { .. }) => return Err(e),
                Err(e) => {
                    warn!("{} {} failed: {}", method, path, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(ControlError::Timeout))
    }

    async fn request_once(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, ControlError> {
        let uri = format!("{}{}", self.base_url, path);
        let mut builder = Request::builder().method(method).uri(&uri);

        if let Some(token) = self.token.read().as_deref() {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }

        let request = match body {
            Some(value) => builder
                .header("content-type", "application/json")
                .body(Body::from(value.to_string())),
            None => builder.body(Body::empty()),
        }
        .map_err(|e| ControlError::Http(e.to_string()))?;

        let response = tokio::time::timeout(REQUEST_TIMEOUT, self.client.request(request))
            .await
            .map_err(|_| ControlError::Timeout)?
            .map_err(|e| ControlError::Http(e.to_string()))?;

        let status = response.status();
        let bytes = tokio::time::timeout(
            REQUEST_TIMEOUT,
            hyper::body::to_bytes(response.into_body()),
        )
        .await
        .map_err(|_| ControlError::Timeout)?
        .map_err(|e| ControlError::Http(e.to_string()))?;

        if !status.is_success() {
            let detail = serde_json::from_slice::<serde_json::Value>(&bytes)
                .ok()
                .and_then(|v| v.get("detail").and_then(|d| d.as_str()).map(String::from))
                .unwrap_or_else(|| "unknown error".to_string());
            return Err(ControlError::Status {
                code: status.as_u16(),
                detail,
            });
        }

        if bytes.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn field<T: serde::de::DeserializeOwned>(
        value: &serde_json::Value,
        name: &str,
    ) -> Result<T, ControlError> {
        let field = value.get(name).cloned().ok_or_else(|| ControlError::Http(
            format!("response missing field `{name}`"),
        ))?;
        Ok(serde_json::from_value(field)?)
    }

    /// Heartbeat loop for the joined party; run it under the task registry.
    /// Failures are logged, never raised.
    pub async fn heartbeat_loop(self: Arc<Self>, interval: Duration) {
        loop {
            tokio::time::sleep(interval).await;

            let (party_id, peer_id) = {
                (self.my_party_id.read().clone(), self.my_peer_id.read().clone())
            };
            if let (Some(party_id), Some(peer_id)) = (party_id, peer_id) {
                if let Err(e) = self.heartbeat(&party_id, &peer_id).await {
                    warn!("heartbeat failed: {}", e);
                }
            }
        }
    }
}

#[async_trait]
impl ControlPlane for HttpControlClient {
    async fn register_peer(&self, peer_id: &str) -> Result<AuthToken, ControlError> {
        let value = self
            .request(
                Method::POST,
                &format!("/auth/register?peer_id={peer_id}"),
                None,
            )
            .await?;

        let token = AuthToken {
            token: Self::field(&value, "token")?,
            peer_id: Self::field(&value, "peer_id")?,
            created_at: Utc::now(),
            expires_at: Self::field(&value, "expires_at")?,
        };

        *self.token.write() = Some(token.token.clone());
        *self.my_peer_id.write() = Some(peer_id.to_string());
        info!("registered with control plane as {}", peer_id);
        Ok(token)
    }

    async fn create_party(&self, name: &str, host: PeerInfo) -> Result<PartyInfo, ControlError> {
        let value = self
            .request(
                Method::POST,
                "/parties",
                Some(json!({ "name": name, "host_peer_info": host })),
            )
            .await?;
        let party: PartyInfo = Self::field(&value, "party")?;
        *self.my_party_id.write() = Some(party.party_id.clone());
        info!("created party {} ({})", party.party_id, name);
        Ok(party)
    }

    async fn join_party(&self, party_id: &str, peer: PeerInfo) -> Result<PartyInfo, ControlError> {
        let value = self
            .request(
                Method::POST,
                &format!("/parties/{party_id}/join"),
                Some(json!({ "party_id": party_id, "peer_info": peer })),
            )
            .await?;
        let party: PartyInfo = Self::field(&value, "party")?;
        *self.my_party_id.write() = Some(party_id.to_string());
        info!("joined party {}", party_id);
        Ok(party)
    }

    async fn leave_party(
        &self,
        party_id: &str,
        peer_id: &str,
    ) -> Result<LeaveOutcome, ControlError> {
        let value = self
            .request(
                Method::DELETE,
                &format!("/parties/{party_id}/peers/{peer_id}"),
                None,
            )
            .await?;

        if self.my_party_id.read().as_deref() == Some(party_id) {
            *self.my_party_id.write() = None;
        }
        Self::field(&value, "status")
    }

    async fn get_party(&self, party_id: &str) -> Result<Option<PartyInfo>, ControlError> {
        match self
            .request(Method::GET, &format!("/parties/{party_id}"), None)
            .await
        {
            Ok(value) => Ok(Some(Self::field(&value, "party")?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_peers(
        &self,
        party_id: &str,
    ) -> Result<HashMap<String, PeerInfo>, ControlError> {
        let value = self
            .request(Method::GET, &format!("/parties/{party_id}/peers"), None)
            .await?;
        Self::field(&value, "peers")
    }

    async fn discover_peer(
        &self,
        party_id: &str,
        peer_id: &str,
    ) -> Result<Option<PeerInfo>, ControlError> {
        match self
            .request(
                Method::GET,
                &format!("/parties/{party_id}/peers/{peer_id}"),
                None,
            )
            .await
        {
            Ok(value) => Ok(Some(Self::field(&value, "peer")?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn heartbeat(&self, party_id: &str, peer_id: &str) -> Result<(), ControlError> {
        self.request(
            Method::POST,
            &format!("/parties/{party_id}/peers/{peer_id}/heartbeat"),
            None,
        )
        .await?;
        Ok(())
    }

    async fn register_relay(&self, relay: RelayRegistration) -> Result<(), ControlError> {
        self.request(Method::POST, "/relays", Some(serde_json::to_value(&relay)?))
            .await?;
        Ok(())
    }

    async fn list_relays(&self) -> Result<Vec<RelayInfo>, ControlError> {
        let value = self.request(Method::GET, "/relays", None).await?;
        Self::field(&value, "relays")
    }

    async fn list_relays_by_region(&self, region: &str) -> Result<Vec<RelayInfo>, ControlError> {
        let value = self
            .request(Method::GET, &format!("/relays/{region}"), None)
            .await?;
        Self::field(&value, "relays")
    }
}

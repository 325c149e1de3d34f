//! Control-plane HTTP server
//!
//! JSON over HTTP in front of [`ControlStore`]. Every route except the
//! health check and `/auth/register` requires a bearer token. Errors are
//! returned as `{"detail": "..."}` with 404 for unknown parties/peers, 401
//! for missing or expired tokens, and 500 otherwise.

use super::store::ControlStore;
use super::types::{PeerInfo, RelayRegistration};
use super::ControlError;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info};

pub const SERVICE_NAME: &str = "LANlink Control Plane";
pub const SERVICE_VERSION: &str = "1.0.0";

#[derive(Debug, Deserialize)]
struct CreatePartyRequest {
    name: String,
    host_peer_info: PeerInfo,
}

#[derive(Debug, Deserialize)]
struct JoinPartyRequest {
    #[allow(dead_code)]
    party_id: Option<String>,
    peer_info: PeerInfo,
}

/// Bind the server and return the bound address along with the serve
/// future. Useful when binding to port 0.
pub fn bind(
    store: Arc<ControlStore>,
    addr: SocketAddr,
) -> Result<(SocketAddr, impl Future<Output = hyper::Result<()>>), hyper::Error> {
    let make_svc = make_service_fn(move |_conn| {
        let store = store.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| handle_request(req, store.clone())))
        }
    });

    let server = Server::try_bind(&addr)?.serve(make_svc);
    let local_addr = server.local_addr();
    Ok((local_addr, server))
}

/// Run the control-plane server until cancelled.
pub async fn serve(store: Arc<ControlStore>, addr: SocketAddr) -> hyper::Result<()> {
    let (local_addr, server) = bind(store, addr)?;
    info!("control plane listening on {}", local_addr);
    server.await
}

async fn handle_request(
    req: Request<Body>,
    store: Arc<ControlStore>,
) -> Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().trim_matches('/').to_string();
    let segments: Vec<String> = if path.is_empty() {
        Vec::new()
    } else {
        path.split('/').map(|s| s.to_string()).collect()
    };
    let segs: Vec<&str> = segments.iter().map(|s| s.as_str()).collect();

    debug!("{} /{}", method, path);

    let result = route(req, &method, &segs, &store).await;

    Ok(match result {
        Ok(response) => response,
        Err(e) => error_response(e),
    })
}

async fn route(
    req: Request<Body>,
    method: &Method,
    segs: &[&str],
    store: &Arc<ControlStore>,
) -> Result<Response<Body>, ControlError> {
    match (method, segs) {
        (&Method::GET, []) => health(store),

        (&Method::POST, ["auth", "register"]) => {
            let peer_id = query_param(&req, "peer_id").ok_or_else(|| ControlError::Status {
                code: 400,
                detail: "missing peer_id".to_string(),
            })?;
            let token = store.issue_token(&peer_id)?;
            json_response(
                StatusCode::OK,
                &json!({
                    "token": token.token,
                    "peer_id": token.peer_id,
                    "expires_at": token.expires_at,
                }),
            )
        }

        (&Method::POST, ["parties"]) => {
            authorize(&req, store)?;
            let body: CreatePartyRequest = read_json(req).await?;
            if body.name.is_empty() || body.name.len() > 100 {
                return Err(ControlError::Status {
                    code: 400,
                    detail: "party name must be 1-100 characters".to_string(),
                });
            }
            let party = store.create_party_record(&body.name, body.host_peer_info)?;
            json_response(
                StatusCode::OK,
                &json!({ "party_id": party.party_id, "party": party }),
            )
        }

        (&Method::POST, ["parties", party_id, "join"]) => {
            authorize(&req, store)?;
            let party_id = party_id.to_string();
            let body: JoinPartyRequest = read_json(req).await?;
            let party = store.join_party_record(&party_id, body.peer_info)?;
            json_response(StatusCode::OK, &json!({ "party": party }))
        }

        (&Method::DELETE, ["parties", party_id, "peers", peer_id]) => {
            authorize(&req, store)?;
            let outcome = store.leave_party_record(party_id, peer_id)?;
            json_response(StatusCode::OK, &json!({ "status": outcome }))
        }

        (&Method::GET, ["parties", party_id]) => {
            authorize(&req, store)?;
            let party = store
                .get_party_record(party_id)?
                .ok_or_else(|| ControlError::PartyNotFound(party_id.to_string()))?;
            json_response(StatusCode::OK, &json!({ "party": party }))
        }

        (&Method::GET, ["parties", party_id, "peers"]) => {
            authorize(&req, store)?;
            let party = store
                .get_party_record(party_id)?
                .ok_or_else(|| ControlError::PartyNotFound(party_id.to_string()))?;
            json_response(StatusCode::OK, &json!({ "peers": party.peers }))
        }

        (&Method::GET, ["parties", party_id, "peers", peer_id]) => {
            authorize(&req, store)?;
            let party = store
                .get_party_record(party_id)?
                .ok_or_else(|| ControlError::PartyNotFound(party_id.to_string()))?;
            let peer = party
                .peers
                .get(*peer_id)
                .ok_or_else(|| ControlError::PeerNotFound(peer_id.to_string()))?;
            json_response(StatusCode::OK, &json!({ "peer": peer }))
        }

        (&Method::POST, ["parties", party_id, "peers", peer_id, "heartbeat"]) => {
            authorize(&req, store)?;
            store.heartbeat_record(party_id, peer_id)?;
            json_response(StatusCode::OK, &json!({ "status": "ok" }))
        }

        (&Method::POST, ["relays"]) => {
            authorize(&req, store)?;
            let registration: RelayRegistration = read_json(req).await?;
            let relay_id = registration.relay_id.clone();
            store.register_relay_record(registration)?;
            json_response(
                StatusCode::OK,
                &json!({ "status": "registered", "relay_id": relay_id }),
            )
        }

        (&Method::GET, ["relays"]) => {
            authorize(&req, store)?;
            let relays = store.list_relay_records()?;
            json_response(StatusCode::OK, &json!({ "relays": relays }))
        }

        (&Method::GET, ["relays", region]) => {
            authorize(&req, store)?;
            let relays: Vec<_> = store
                .list_relay_records()?
                .into_iter()
                .filter(|r| r.region == *region)
                .collect();
            json_response(StatusCode::OK, &json!({ "relays": relays }))
        }

        _ => Err(ControlError::Status {
            code: 404,
            detail: "not found".to_string(),
        }),
    }
}

fn health(store: &ControlStore) -> Result<Response<Body>, ControlError> {
    let (parties, relays) = store.counts();
    json_response(
        StatusCode::OK,
        &json!({
            "service": SERVICE_NAME,
            "version": SERVICE_VERSION,
            "status": "ok",
            "parties": parties,
            "relays": relays,
        }),
    )
}

/// Check the bearer token and return the peer it belongs to.
fn authorize(req: &Request<Body>, store: &ControlStore) -> Result<String, ControlError> {
    let header = req
        .headers()
        .get(hyper::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ControlError::Unauthorized("missing authorization header".to_string()))?;

    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| ControlError::Unauthorized("invalid authorization format".to_string()))?;

    store.verify_token(token)
}

fn query_param(req: &Request<Body>, name: &str) -> Option<String> {
    req.uri().query()?.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

async fn read_json<T: serde::de::DeserializeOwned>(req: Request<Body>) -> Result<T, ControlError> {
    let bytes = hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|e| ControlError::Http(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| ControlError::Status {
        code: 400,
        detail: format!("invalid request body: {e}"),
    })
}

fn json_response(
    status: StatusCode,
    value: &serde_json::Value,
) -> Result<Response<Body>, ControlError> {
    let body = serde_json::to_string(value)?;
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .map_err(|e| ControlError::Http(e.to_string()))
}

fn error_response(error: ControlError) -> Response<Body> {
    let (status, detail) = match &error {
        ControlError::PartyNotFound(_) | ControlError::PeerNotFound(_) => {
            (StatusCode::NOT_FOUND, error.to_string())
        }
        ControlError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
        ControlError::Status { code, detail } => (
            StatusCode::from_u16(*code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            detail.clone(),
        ),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()),
    };

    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::json!({ "detail": detail }).to_string(),
        ))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

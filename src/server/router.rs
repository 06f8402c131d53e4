//! Application endpoints and request routing.
//!
//! All five endpoints accept POST with JSON bodies. A middleware layer in
//! front of the handlers forwards every request verbatim to the leader's
//! application address when this node is not the leader; only the leader
//! dispatches to a handler, so a non-leader never commits anything locally.
//!
//! Write handlers pre-validate against the local lock store before proposing
//! a command. This is not redundant with the state machine's own check: it
//! surfaces "already held" without paying for a consensus round and keeps
//! rejected commands out of the log. The state machine still re-checks on
//! apply, because a competing command may have preceded this one in log
//! order.

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use openraft::{BasicNode, Raft};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::constants::RAFT_APPLY_TIMEOUT;
use crate::raft::types::{LockCommand, NodeId, TypeConfig};
use crate::server::http_addr_from_raft;
use crate::store::LockStore;

/// Largest request body the proxy will buffer for forwarding.
const MAX_PROXY_BODY: usize = 64 * 1024;

/// Shared state behind every application handler.
#[derive(Clone)]
pub struct AppState {
    pub node_id: NodeId,
    pub raft: Raft<TypeConfig>,
    pub store: Arc<LockStore>,
    pub http: reqwest::Client,
}

/// Body of `/acquire` and `/release`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRequest {
    #[serde(rename = "fileID")]
    pub file_id: String,
    #[serde(rename = "userID")]
    pub user_id: String,
}

/// Body of `/checkAcquire` and `/checkRelease`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockCheckRequest {
    #[serde(rename = "fileID")]
    pub file_id: String,
}

/// 200 body of `/checkAcquire`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckAcquireResponse {
    pub owner: String,
}

/// Body of `/join`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub addr: String,
    pub id: String,
}

/// Router for the client-facing lock protocol.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/acquire", post(acquire))
        .route("/release", post(release))
        .route("/checkAcquire", post(check_acquire))
        .route("/checkRelease", post(check_release))
        .route("/join", post(join))
        .layer(middleware::from_fn_with_state(state.clone(), forward_to_leader))
        .with_state(state)
}

/// Proxy middleware: non-leaders forward to the leader's application
/// address; 503 while no leader is known.
async fn forward_to_leader(State(state): State<AppState>, request: Request, next: Next) -> Response {
    match state.raft.current_leader().await {
        Some(leader) if leader == state.node_id => next.run(request).await,
        Some(leader) => {
            let raft_addr = {
                let metrics = state.raft.metrics().borrow().clone();
                metrics
                    .membership_config
                    .membership()
                    .get_node(&leader)
                    .map(|node| node.addr.clone())
            };
            let http_addr = raft_addr.and_then(|addr| http_addr_from_raft(&addr).ok());
            match http_addr {
                Some(addr) => proxy(&state, &addr, request).await,
                None => {
                    (StatusCode::SERVICE_UNAVAILABLE, "leader address unknown").into_response()
                }
            }
        }
        None => (StatusCode::SERVICE_UNAVAILABLE, "no leader elected").into_response(),
    }
}

async fn proxy(state: &AppState, target: &str, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_PROXY_BODY).await {
        Ok(bytes) => bytes,
        Err(err) => return (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    };

    let url = format!("http://{}{}", target, parts.uri.path());
    debug!(%url, "forwarding request to leader");

    let mut forwarded = state.http.post(&url).body(bytes);
    for (name, value) in &parts.headers {
        forwarded = forwarded.header(name.as_str(), value.as_bytes());
    }

    match forwarded.send().await {
        Ok(response) => {
            let status = response.status().as_u16();
            let content_type = response
                .headers()
                .get("content-type")
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned);
            let body = response.bytes().await.unwrap_or_default();

            let mut builder = Response::builder().status(status);
            if let Some(content_type) = content_type {
                builder = builder.header("content-type", content_type);
            }
            builder
                .body(Body::from(body))
                .unwrap_or_else(|err| (StatusCode::BAD_GATEWAY, err.to_string()).into_response())
        }
        Err(err) => (StatusCode::BAD_GATEWAY, err.to_string()).into_response(),
    }
}

fn validate_object_id(file_id: &str) -> Result<(), Response> {
    if file_id.is_empty() {
        Err((StatusCode::BAD_REQUEST, "fileID must not be empty").into_response())
    } else {
        Ok(())
    }
}

fn validate_lock_request(request: &LockRequest) -> Result<(), Response> {
    validate_object_id(&request.file_id)?;
    if request.user_id.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "userID must not be empty").into_response());
    }
    Ok(())
}

/// Propose a command and wait for the commit, bounded by the raft timeout.
///
/// `Err` means the proposal itself failed (no commit within the timeout, or
/// raft refused it); the command may still commit later, so callers treat
/// acquire as not-yet-acquired and retry.
async fn propose(state: &AppState, command: LockCommand) -> Result<Result<(), crate::store::LockError>, ()> {
    match timeout(RAFT_APPLY_TIMEOUT, state.raft.client_write(command)).await {
        Ok(Ok(response)) => Ok(response.data.into_result()),
        Ok(Err(err)) => {
            warn!(error = %err, "proposal failed");
            Err(())
        }
        Err(_) => {
            warn!("proposal timed out");
            Err(())
        }
    }
}

async fn acquire(State(state): State<AppState>, Json(request): Json<LockRequest>) -> Response {
    if let Err(response) = validate_lock_request(&request) {
        return response;
    }
    if let Err(err) = state.store.try_acquire(&request.file_id, &request.user_id) {
        return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response();
    }
    let command = LockCommand::Acquire {
        key: request.file_id,
        value: request.user_id,
    };
    match propose(&state, command).await {
        Ok(Ok(())) => "lock acquired".into_response(),
        Ok(Err(err)) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
        Err(()) => StatusCode::BAD_REQUEST.into_response(),
    }
}

async fn release(State(state): State<AppState>, Json(request): Json<LockRequest>) -> Response {
    if let Err(response) = validate_lock_request(&request) {
        return response;
    }
    if let Err(err) = state.store.try_release(&request.file_id, &request.user_id) {
        return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response();
    }
    let command = LockCommand::Release {
        key: request.file_id,
        value: request.user_id,
    };
    match propose(&state, command).await {
        Ok(Ok(())) => "lock released".into_response(),
        Ok(Err(err)) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
        Err(()) => StatusCode::BAD_REQUEST.into_response(),
    }
}

async fn check_acquire(
    State(state): State<AppState>,
    Json(request): Json<LockCheckRequest>,
) -> Response {
    if let Err(response) = validate_object_id(&request.file_id) {
        return response;
    }
    match state.store.lookup(&request.file_id) {
        Some(owner) => Json(CheckAcquireResponse { owner }).into_response(),
        None => (StatusCode::INTERNAL_SERVER_ERROR, "file is not acquired").into_response(),
    }
}

async fn check_release(
    State(state): State<AppState>,
    Json(request): Json<LockCheckRequest>,
) -> Response {
    if let Err(response) = validate_object_id(&request.file_id) {
        return response;
    }
    match state.store.lookup(&request.file_id) {
        None => "checkRelease success".into_response(),
        Some(_) => (StatusCode::INTERNAL_SERVER_ERROR, "checkRelease failure").into_response(),
    }
}

/// Add a node to the cluster.
///
/// Re-registering the same id at the same address is a no-op. A stale
/// registration under the same id or the same address is removed before the
/// node is added back as a voter.
async fn join(State(state): State<AppState>, Json(request): Json<JoinRequest>) -> Response {
    let id: NodeId = match request.id.parse() {
        Ok(id) => id,
        Err(_) => return (StatusCode::BAD_REQUEST, "node id must be numeric").into_response(),
    };

    let membership = {
        let metrics = state.raft.metrics().borrow().clone();
        metrics.membership_config.membership().clone()
    };
    let existing_addr = membership.get_node(&id).map(|node| node.addr.clone());
    let addr_conflict: Option<NodeId> = membership
        .nodes()
        .find(|(node_id, node)| node.addr == request.addr && **node_id != id)
        .map(|(node_id, _)| *node_id);
    let mut voters: BTreeSet<NodeId> = membership.voter_ids().collect();

    if existing_addr.as_deref() == Some(request.addr.as_str()) && addr_conflict.is_none() {
        debug!(node_id = id, addr = %request.addr, "node already registered, join is a no-op");
        return "joined cluster".into_response();
    }

    if existing_addr.is_some() || addr_conflict.is_some() {
        voters.remove(&id);
        if let Some(conflict) = addr_conflict {
            voters.remove(&conflict);
        }
        if let Err(err) = state.raft.change_membership(voters.clone(), false).await {
            return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response();
        }
    }

    if let Err(err) = state
        .raft
        .add_learner(id, BasicNode::new(request.addr.clone()), true)
        .await
    {
        return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response();
    }

    voters.insert(id);
    if let Err(err) = state.raft.change_membership(voters, false).await {
        return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response();
    }

    debug!(node_id = id, addr = %request.addr, "node joined cluster");
    "joined cluster".into_response()
}

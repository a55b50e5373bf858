//! Replication endpoints: the `/raft/*` RPCs between members and the `/raftadmin/*` calls
//! joining nodes use. All of them require the shared key when one is configured.
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use openraft::raft::{AppendEntriesRequest, InstallSnapshotRequest, VoteRequest};
use serde::Serialize;
use serde_json::json;

use super::json_data;
use crate::{
    adapters::{
        middleware::create_shared_key_middleware,
        raft::{
            HttpRaftNode, NodeId, TypeConfig,
            network::{
                APPEND_PATH, AddServerRequest, AwaitResponse, LeaderResponse, SNAPSHOT_PATH,
                VOTE_PATH,
            },
        },
    },
    core::replication::{APPLY_TIMEOUT, ReplicationCoordinator},
    ports::raft::{RaftError, RaftNode},
};

#[derive(Clone)]
struct ReplicationRoutes {
    node: Arc<HttpRaftNode>,
    coordinator: Arc<ReplicationCoordinator>,
}

fn leader_response(node: &HttpRaftNode) -> LeaderResponse {
    node.leader_with_id()
        .map(|(id, address)| LeaderResponse { id, address })
        .unwrap_or_default()
}

/// The peer decodes the body as `Result<Resp, Err>`; a node that has not started its
/// consensus engine answers 503.
fn rpc_response<T: Serialize>(result: Result<T, RaftError>) -> Response {
    match result {
        Ok(body) => Json(body).into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn append(
    State(state): State<ReplicationRoutes>,
    Json(req): Json<AppendEntriesRequest<TypeConfig>>,
) -> Response {
    rpc_response(state.node.handle_append(req).await)
}

async fn vote(
    State(state): State<ReplicationRoutes>,
    Json(req): Json<VoteRequest<NodeId>>,
) -> Response {
    rpc_response(state.node.handle_vote(req).await)
}

async fn snapshot(
    State(state): State<ReplicationRoutes>,
    Json(req): Json<InstallSnapshotRequest<TypeConfig>>,
) -> Response {
    rpc_response(state.node.handle_snapshot(req).await)
}

fn await_response(result: Result<u64, RaftError>) -> Response {
    match result {
        Ok(index) => Json(AwaitResponse {
            index,
            error: String::new(),
        })
        .into_response(),
        Err(e) => {
            let status = match e {
                RaftError::NotLeader { .. } => StatusCode::CONFLICT,
                RaftError::NoLeader | RaftError::NotStarted => StatusCode::SERVICE_UNAVAILABLE,
                RaftError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (
                status,
                Json(AwaitResponse {
                    index: 0,
                    error: e.to_string(),
                }),
            )
                .into_response()
        }
    }
}

async fn add_voter(
    State(state): State<ReplicationRoutes>,
    Json(req): Json<AddServerRequest>,
) -> Response {
    tracing::info!(id = %req.id, address = %req.address, "Adding voter");
    await_response(state.node.add_voter(&req.id, &req.address, APPLY_TIMEOUT).await)
}

async fn add_nonvoter(
    State(state): State<ReplicationRoutes>,
    Json(req): Json<AddServerRequest>,
) -> Response {
    tracing::info!(id = %req.id, address = %req.address, "Adding non-voter");
    await_response(state.node.add_nonvoter(&req.id, &req.address, APPLY_TIMEOUT).await)
}

async fn verify_leader(State(state): State<ReplicationRoutes>) -> Response {
    match state.node.verify_leader().await {
        Ok(()) => Json(LeaderResponse {
            id: state.node.id().to_string(),
            address: state.node.address().to_string(),
        })
        .into_response(),
        Err(_) => (StatusCode::CONFLICT, Json(leader_response(&state.node))).into_response(),
    }
}

async fn leader(State(state): State<ReplicationRoutes>) -> Response {
    Json(leader_response(&state.node)).into_response()
}

async fn raft_state(State(state): State<ReplicationRoutes>) -> Response {
    Json(json!({ "state": state.node.state().to_string() })).into_response()
}

async fn stats(State(state): State<ReplicationRoutes>) -> Response {
    let mut response = json_data(StatusCode::OK, state.node.stats());
    if let Ok(value) = HeaderValue::from_str(&state.node.state().to_string()) {
        response.headers_mut().insert("X-Raft-State", value);
    }
    response
}

async fn readyz(State(state): State<ReplicationRoutes>) -> Response {
    let leader = state.node.leader_with_id();
    let body = json!({
        "status": "ok",
        "proxy_ready": state.coordinator.is_ready(),
        "state": state.node.state().to_string(),
        "leader": leader.as_ref().map(|(id, _)| id.as_str()).unwrap_or_default(),
        "leader_addr": leader.as_ref().map(|(_, addr)| addr.as_str()).unwrap_or_default(),
    });
    let status = if leader.is_some() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

/// Replication routes with their own state, ready to merge into the admin router.
pub(crate) fn routes<S>(
    node: Arc<HttpRaftNode>,
    coordinator: Arc<ReplicationCoordinator>,
    shared_key: Option<Arc<str>>,
) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new()
        .route(APPEND_PATH, post(append))
        .route(VOTE_PATH, post(vote))
        .route(SNAPSHOT_PATH, post(snapshot))
        .route("/raftadmin/AddVoter", post(add_voter))
        .route("/raftadmin/AddNonvoter", post(add_nonvoter))
        .route("/raftadmin/VerifyLeader", get(verify_leader))
        .route("/raftadmin/Leader", get(leader))
        .route("/raftadmin/State", get(raft_state))
        .route("/raftadmin/Stats", get(stats))
        .route("/raftadmin/readyz", get(readyz))
        .layer(middleware::from_fn(create_shared_key_middleware(shared_key)))
        .with_state(ReplicationRoutes { node, coordinator })
}

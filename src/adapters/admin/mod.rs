//! Admin HTTP API.
//!
//! Every mutation becomes a [`ChangeLog`] submitted through the [`ReplicationCoordinator`];
//! reads are served from the local resource graph and document store. On a replicated
//! follower mutations are redirected to the leader.
pub mod documents;
pub mod raft;
pub mod resources;

use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    body::Body,
    extract::{Request, State},
    http::{HeaderValue, Method, StatusCode, Uri, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use serde_json::{Value, json};

use super::{
    middleware::{create_allow_list_middleware, request_timing_middleware},
    raft::HttpRaftNode,
};
use crate::{
    config::DGateConfig,
    core::{
        change_log::ChangeLog, engine::ChangeLogEngine, error::ChangeLogError,
        replication::ReplicationCoordinator, resources::DEFAULT_NAMESPACE,
    },
    ports::raft::{RaftError, RaftState},
    utils::{IpList, ip_list::InvalidIp},
};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shared state of the admin handlers.
#[derive(Clone)]
pub struct AdminState {
    pub config: Arc<DGateConfig>,
    pub coordinator: Arc<ReplicationCoordinator>,
    /// Concrete node serving the `/raft/*` RPCs; `None` without replication
    pub raft: Option<Arc<HttpRaftNode>>,
}

impl AdminState {
    pub fn new(
        config: Arc<DGateConfig>,
        coordinator: Arc<ReplicationCoordinator>,
        raft: Option<Arc<HttpRaftNode>>,
    ) -> Self {
        Self {
            config,
            coordinator,
            raft,
        }
    }

    pub fn engine(&self) -> &Arc<ChangeLogEngine> {
        self.coordinator.engine()
    }

    /// Namespace a write targets, falling back to `default` when allowed.
    pub(crate) fn namespace_or_default(&self, given: &str) -> Result<String, ApiError> {
        if !given.is_empty() {
            return Ok(given.to_string());
        }
        if self.config.disable_default_namespace {
            return Err(ApiError::bad_request("namespace is required"));
        }
        Ok(DEFAULT_NAMESPACE.to_string())
    }

    /// Submit `log` and wait until this node has applied it.
    pub(crate) async fn apply(&self, log: &ChangeLog, uri: &Uri) -> Result<(), ApiError> {
        match self.coordinator.apply_change_log(log).await {
            Ok(()) => {}
            Err(ChangeLogError::Raft(RaftError::NotLeader {
                leader: Some(address),
            })) => return Err(self.redirect_to(&address, uri)),
            Err(e) => {
                tracing::warn!(change_id = %log.id, cmd = %log.cmd, error = %e, "Change log rejected");
                return Err(e.into());
            }
        }
        self.coordinator.wait_for_changes().await?;
        Ok(())
    }

    fn redirect_to(&self, leader: &str, uri: &Uri) -> ApiError {
        let scheme = self
            .config
            .replication()
            .map(|r| r.advert_scheme.as_str())
            .unwrap_or("http");
        let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
        ApiError {
            status: StatusCode::TEMPORARY_REDIRECT,
            body: json!({ "error": "not leader", "leader": leader }),
            location: Some(format!("{scheme}://{leader}{path}")),
        }
    }
}

/// Error response: `{"error": message, "status": code}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: Value,
    location: Option<String>,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            status,
            body: json!({ "error": message, "status": status.as_u16() }),
            location: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    /// Schema violations, one entry per failed keyword.
    pub fn validation(errors: Vec<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: json!({ "errors": errors, "status": StatusCode::BAD_REQUEST.as_u16() }),
            location: None,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<ChangeLogError> for ApiError {
    fn from(e: ChangeLogError) -> Self {
        Self::new(e.http_status(), e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.body)).into_response();
        if let Some(location) = self.location
            && let Ok(value) = HeaderValue::from_str(&location)
        {
            response.headers_mut().insert(header::LOCATION, value);
        }
        response
    }
}

/// Success envelope: `{"status_code", "data"}` plus `count` for lists.
pub(crate) fn json_data<T: Serialize>(status: StatusCode, data: T) -> Response {
    let data = match serde_json::to_value(data) {
        Ok(data) => data,
        Err(e) => {
            return ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };
    let body = match &data {
        Value::Array(items) => {
            json!({ "status_code": status.as_u16(), "count": items.len(), "data": data })
        }
        _ => json!({ "status_code": status.as_u16(), "data": data }),
    };
    (status, Json(body)).into_response()
}

/// Parse a JSON request body with the admin API's error message.
pub(crate) fn parse_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| {
        tracing::debug!(error = %e, "Rejected admin request body");
        ApiError::bad_request("error unmarshalling body")
    })
}

/// Mutations on a follower go to the leader; a watch-only node refuses them outright.
async fn replication_gate(State(state): State<AdminState>, req: Request, next: Next) -> Response {
    let mutating = matches!(*req.method(), Method::PUT | Method::DELETE | Method::POST);
    if !mutating {
        return next.run(req).await;
    }
    if state.config.watch_only() {
        return ApiError::new(StatusCode::FORBIDDEN, "admin api is watch only").into_response();
    }
    if let Some(raft) = state.coordinator.raft()
        && raft.state() != RaftState::Leader
    {
        return match raft.leader_with_id() {
            Some((_, address)) => state.redirect_to(&address, req.uri()).into_response(),
            None => ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                RaftError::NoLeader.to_string(),
            )
            .into_response(),
        };
    }
    next.run(req).await
}

async fn root(State(state): State<AdminState>) -> Response {
    let mut response = Response::new(Body::from("DGate Admin API"));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    headers.insert("X-DGate-AdminAPI", HeaderValue::from_static("true"));
    headers.insert(
        "X-DGate-Raft",
        HeaderValue::from_static(if state.coordinator.is_replicated() {
            "true"
        } else {
            "false"
        }),
    );
    headers.insert(
        "X-DGate-WatchOnly",
        HeaderValue::from_static(if state.config.watch_only() {
            "true"
        } else {
            "false"
        }),
    );
    headers.insert(
        "X-DGate-ChangeHash",
        HeaderValue::from(state.coordinator.change_hash()),
    );
    response
}

async fn healthz() -> Response {
    Json(json!({ "status": "ok", "version": VERSION })).into_response()
}

async fn readyz(State(state): State<AdminState>) -> Response {
    if !state.coordinator.is_ready() {
        return not_ready("not ready", None);
    }
    let Some(raft) = state.coordinator.raft() else {
        return Json(json!({ "status": "ok", "version": VERSION })).into_response();
    };
    if let Err(e) = state.coordinator.wait_for_changes().await {
        tracing::debug!(error = %e, "Readiness barrier failed");
        return not_ready("not ready", Some(raft.state()));
    }
    let Some((leader_id, _)) = raft.leader_with_id() else {
        return not_ready("no leader", Some(raft.state()));
    };
    let mut response = Json(json!({ "status": "ok", "version": VERSION })).into_response();
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&raft.state().to_string()) {
        headers.insert("X-Raft-State", value);
    }
    if let Ok(value) = HeaderValue::from_str(&leader_id) {
        headers.insert("X-Raft-Leader", value);
    }
    response
}

fn not_ready(status: &str, raft_state: Option<RaftState>) -> Response {
    let mut response =
        (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "status": status }))).into_response();
    if let Some(raft_state) = raft_state
        && let Ok(value) = HeaderValue::from_str(&raft_state.to_string())
    {
        response.headers_mut().insert("X-Raft-State", value);
    }
    response
}

async fn changelog(State(state): State<AdminState>) -> Result<Response, ApiError> {
    let logs = state.engine().load_persisted()?;
    let latest = logs.last().map(|l| l.id.clone());
    Ok(Json(json!({
        "count": logs.len(),
        "hash": state.coordinator.change_hash(),
        "latest": latest,
    }))
    .into_response())
}

async fn changelog_hash(State(state): State<AdminState>) -> Response {
    json_data(StatusCode::OK, state.coordinator.change_hash())
}

/// Build the admin router. Serve it with
/// `into_make_service_with_connect_info::<SocketAddr>()` so the allow list sees the caller.
pub fn admin_router(state: AdminState) -> Result<Router, InvalidIp> {
    let api = resources::routes()
        .merge(documents::routes())
        .layer(middleware::from_fn_with_state(state.clone(), replication_gate));

    let mut app = Router::new()
        .route("/", get(root))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/changelog", get(changelog))
        .route("/changelog/hash", get(changelog_hash))
        .merge(api);

    if let Some(node) = state.raft.clone() {
        let shared_key = state
            .config
            .replication()
            .and_then(|r| r.shared_key.as_deref())
            .map(Arc::<str>::from);
        app = app.merge(raft::routes(node, state.coordinator.clone(), shared_key));
    }

    let allow = match state.config.admin.as_ref() {
        Some(admin) => IpList::parse(&admin.allow_list)?,
        None => IpList::default(),
    };
    let debug = state.config.debug;
    Ok(app
        .with_state(state)
        .layer(middleware::from_fn(request_timing_middleware))
        .layer(middleware::from_fn(create_allow_list_middleware(
            Arc::new(allow),
            debug,
        ))))
}

/// Address the admin listener binds to.
pub fn admin_bind_address(config: &DGateConfig) -> Option<SocketAddr> {
    let admin = config.admin.as_ref()?;
    format!("{}:{}", admin.host, admin.port).parse().ok()
}


#[cfg(test)]
mod tests {
    use tower::ServiceExt;

    use super::{test_support::*, *};

    #[tokio::test]
    async fn test_root_headers() {
        let app = admin_router(state(config()).await).unwrap();
        let res = app.oneshot(request("GET", "/", Value::Null)).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()["X-DGate-Raft"], "false");
        assert_eq!(res.headers()["X-DGate-WatchOnly"], "false");
        assert!(res.headers().contains_key("X-DGate-ChangeHash"));
    }

    #[tokio::test]
    async fn test_health_and_readiness() {
        let state = state(config()).await;
        let app = admin_router(state.clone()).unwrap();
        let res = app.clone().oneshot(request("GET", "/healthz", Value::Null)).await.unwrap();
        assert_eq!(body_json(res).await["status"], "ok");

        let res = app.oneshot(request("GET", "/readyz", Value::Null)).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        // Same engine behind a status whose readiness latch was never set
        let coordinator = Arc::new(ReplicationCoordinator::new(
            state.engine().clone(),
            None,
            Arc::new(crate::core::status::GatewayStatus::new()),
        ));
        let app = admin_router(AdminState::new(state.config.clone(), coordinator, None)).unwrap();
        let res = app.oneshot(request("GET", "/readyz", Value::Null)).await.unwrap();
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(res).await["status"], "not ready");
    }

    #[tokio::test]
    async fn test_watch_only_refuses_writes() {
        let mut config = config();
        if let Some(admin) = config.admin.as_mut() {
            admin.watch_only = true;
        }
        let app = admin_router(state(config).await).unwrap();
        let res = app
            .clone()
            .oneshot(request("PUT", "/api/v1/namespace", json!({"name": "n1"})))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::FORBIDDEN);

        let res = app
            .oneshot(request("GET", "/api/v1/namespace", Value::Null))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_allow_list_applies_to_admin() {
        let mut config = config();
        if let Some(admin) = config.admin.as_mut() {
            admin.allow_list = vec!["10.0.0.1".into()];
        }
        let app = admin_router(state(config).await).unwrap();
        let res = app.oneshot(request("GET", "/healthz", Value::Null)).await.unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }
}

//! Axum middleware of the admin API.
//!
//! Stateless layers that only read the configuration they are created with: the IP allow
//! list, the shared-key guard of the replication endpoints and request timing.
use std::{net::SocketAddr, sync::Arc, time::Instant};

use axum::{
    body::Body,
    extract::{ConnectInfo, Request},
    http::StatusCode,
    middleware::Next,
    response::Response,
};

use crate::{adapters::raft::SHARED_KEY_HEADER, utils::IpList};

type BoxedMiddleware =
    std::pin::Pin<Box<dyn std::future::Future<Output = Response> + Send>>;

fn plain(status: StatusCode, text: String) -> Response {
    let mut response = Response::new(Body::from(text));
    *response.status_mut() = status;
    response
}

/// Reject callers whose address is not in `allow`. An empty list allows everyone.
pub async fn allow_list_middleware(
    req: Request,
    next: Next,
    allow: Arc<IpList>,
    debug: bool,
) -> Response {
    if allow.is_empty() {
        return next.run(req).await;
    }
    let remote = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    match remote {
        Some(ip) if allow.contains(ip) => next.run(req).await,
        Some(ip) => {
            tracing::warn!(remote = %ip, "Admin request from address outside allow list");
            if debug {
                plain(StatusCode::UNAUTHORIZED, format!("Unauthorized IP Address: {ip}"))
            } else {
                plain(StatusCode::UNAUTHORIZED, "Unauthorized".into())
            }
        }
        None => plain(StatusCode::UNAUTHORIZED, "Unauthorized".into()),
    }
}

/// Create a cloneable closure wrapping [`allow_list_middleware`].
pub fn create_allow_list_middleware(
    allow: Arc<IpList>,
    debug: bool,
) -> impl Fn(Request, Next) -> BoxedMiddleware + Clone {
    move |req, next| {
        let allow = allow.clone();
        Box::pin(async move { allow_list_middleware(req, next, allow, debug).await })
    }
}

/// Require the cluster's shared key on replication endpoints when one is configured.
pub async fn shared_key_middleware(
    req: Request,
    next: Next,
    shared_key: Option<Arc<str>>,
) -> Response {
    if let Some(expected) = shared_key.as_deref() {
        let given = req
            .headers()
            .get(SHARED_KEY_HEADER)
            .and_then(|v| v.to_str().ok());
        if given != Some(expected) {
            return plain(StatusCode::UNAUTHORIZED, "Unauthorized".into());
        }
    }
    next.run(req).await
}

pub fn create_shared_key_middleware(
    shared_key: Option<Arc<str>>,
) -> impl Fn(Request, Next) -> BoxedMiddleware + Clone {
    move |req, next| {
        let shared_key = shared_key.clone();
        Box::pin(async move { shared_key_middleware(req, next, shared_key).await })
    }
}

/// Log every admin request with its latency.
pub async fn request_timing_middleware(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let uri = req.uri().clone();

    let response = next.run(req).await;
    tracing::debug!(
        http.method = %method,
        http.uri = %uri,
        http.status_code = response.status().as_u16(),
        duration_ms = start.elapsed().as_millis() as u64,
        "Admin request completed"
    );
    response
}

#[cfg(test)]
mod tests {
    use axum::{Router, middleware, routing::get};
    use tower::ServiceExt;

    use super::*;

    fn request(from: &str, key: Option<&str>) -> Request {
        let mut builder = Request::builder().uri("/");
        if let Some(key) = key {
            builder = builder.header(SHARED_KEY_HEADER, key);
        }
        let mut req = builder.body(Body::empty()).unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(from.parse::<SocketAddr>().unwrap()));
        req
    }

    #[tokio::test]
    async fn test_allow_list() {
        let allow = Arc::new(IpList::parse(&["10.0.0.0/8"]).unwrap());
        let app = Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(middleware::from_fn(create_allow_list_middleware(allow, false)));

        let res = app.clone().oneshot(request("10.1.2.3:1000", None)).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let res = app.oneshot(request("192.168.0.1:1000", None)).await.unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_shared_key() {
        let app = Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(middleware::from_fn(create_shared_key_middleware(Some(
                Arc::from("s3cret"),
            ))));

        let res = app.clone().oneshot(request("127.0.0.1:1", Some("s3cret"))).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let res = app.clone().oneshot(request("127.0.0.1:1", Some("nope"))).await.unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        let res = app.oneshot(request("127.0.0.1:1", None)).await.unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }
}

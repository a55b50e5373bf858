// End-to-end tests of the proxy data plane against a local upstream
use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    body::{Body, to_bytes},
    extract::{ConnectInfo, Request},
    http::StatusCode,
};
use config::FileFormat;
use dgate::{DGateServer, config::loader::parse_config, metrics::NoopMetrics};
use serde_json::{Value, json};
use tower::ServiceExt;

/// Upstream answering every request with what it received.
async fn spawn_echo_upstream() -> SocketAddr {
    let app = Router::new().fallback(|req: Request| async move {
        let x_test = req
            .headers()
            .get("x-test")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Json(json!({
            "method": req.method().as_str(),
            "path": req.uri().path(),
            "query": req.uri().query(),
            "x_test": x_test,
        }))
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn start(yaml: &str) -> DGateServer {
    let config = parse_config(yaml, FileFormat::Yaml).unwrap();
    let server = DGateServer::build(config, Arc::new(NoopMetrics)).unwrap();
    server.start().await.unwrap();
    server
}

fn request(method: &str, host: &str, uri: &str) -> Request {
    let mut req = Request::builder()
        .method(method)
        .uri(uri)
        .header("host", host)
        .body(Body::empty())
        .unwrap();
    req.extensions_mut()
        .insert(ConnectInfo("127.0.0.1:50000".parse::<SocketAddr>().unwrap()));
    req
}

async fn body_json(res: axum::response::Response) -> Value {
    let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_happy_path_proxy() {
    let upstream = spawn_echo_upstream().await;
    let server = start(&format!(
        r#"
disable_default_namespace: true
proxy:
  init_resources:
    namespaces:
      - name: n1
    domains:
      - name: d1
        namespace: n1
        patterns: ["host.test"]
    services:
      - name: s1
        namespace: n1
        urls: ["http://{upstream}/"]
    routes:
      - name: r1
        namespace: n1
        paths: ["/a"]
        methods: ["GET"]
        service: s1
"#
    ))
    .await;
    let app = server.proxy_router(false);

    let res = app
        .clone()
        .oneshot(request("GET", "host.test", "/a?x=1"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()["via"], "DGate Proxy");
    let body = body_json(res).await;
    assert_eq!(body["method"], "GET");
    assert_eq!(body["path"], "/a");
    assert_eq!(body["query"], "x=1");

    let res = app
        .clone()
        .oneshot(request("POST", "host.test", "/a"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::METHOD_NOT_ALLOWED);

    let res = app
        .oneshot(request("GET", "other.test", "/a"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    server.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_strip_path() {
    let upstream = spawn_echo_upstream().await;
    let server = start(&format!(
        r#"
proxy:
  init_resources:
    services:
      - name: s1
        namespace: default
        urls: ["http://{upstream}"]
    routes:
      - name: api
        namespace: default
        paths: ["/api"]
        methods: ["*"]
        stripPath: true
        service: s1
"#
    ))
    .await;

    let res = server
        .proxy_router(false)
        .oneshot(request("DELETE", "any.test", "/api/x"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = body_json(res).await;
    assert_eq!(body["method"], "DELETE");
    assert_eq!(body["path"], "/x");
    server.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_request_modifier_sets_upstream_header() {
    let upstream = spawn_echo_upstream().await;
    let server = start(&format!(
        r#"
proxy:
  init_resources:
    modules:
      - name: m1
        namespace: default
        payload: |
          export function requestModifier(ctx) {{
            ctx.request().headers.set("X-Test", "1");
          }}
    services:
      - name: s1
        namespace: default
        urls: ["http://{upstream}"]
    routes:
      - name: r1
        namespace: default
        paths: ["/m"]
        methods: ["GET"]
        service: s1
        modules: ["m1"]
"#
    ))
    .await;

    let res = server
        .proxy_router(false)
        .oneshot(request("GET", "any.test", "/m"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(body_json(res).await["x_test"], "1");
    server.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_request_handler_route_without_service() {
    let server = start(
        r#"
proxy:
  init_resources:
    modules:
      - name: hello
        namespace: default
        payload: |
          export function requestHandler(ctx) {
            ctx.response().json({ hello: ctx.pathParam("name") });
          }
    routes:
      - name: hello
        namespace: default
        paths: ["/hello/{name}"]
        methods: ["GET"]
        modules: ["hello"]
"#,
    )
    .await;

    let res = server
        .proxy_router(false)
        .oneshot(request("GET", "any.test", "/hello/world"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(body_json(res).await["hello"], "world");
    server.close().await;
}

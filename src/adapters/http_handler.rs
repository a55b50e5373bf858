use std::{net::SocketAddr, sync::Arc};

use axum::{
    Router,
    body::Body as AxumBody,
    extract::{ConnectInfo, Request},
    routing::any,
};
use hyper::Response;

use crate::adapters::proxy::{ConnInfo, ProxyDispatcher};

/// Axum entry point of the proxy listeners. Every path and method is handed to the
/// dispatcher; the plain and TLS listeners differ only in `secure`.
#[derive(Clone)]
pub struct HttpHandler {
    dispatcher: Arc<ProxyDispatcher>,
    secure: bool,
}

impl HttpHandler {
    pub fn new(dispatcher: Arc<ProxyDispatcher>, secure: bool) -> Self {
        Self { dispatcher, secure }
    }

    /// Main request handler
    pub async fn handle_request(
        &self,
        req: Request<AxumBody>,
        client_addr: SocketAddr,
    ) -> Response<AxumBody> {
        let conn = ConnInfo {
            remote: client_addr,
            secure: self.secure,
        };
        self.dispatcher.handle(req, conn).await
    }

    /// Catch-all router; serve it with `into_make_service_with_connect_info::<SocketAddr>()`.
    pub fn router(self) -> Router {
        let root = self.clone();
        Router::new()
            .route(
                "/",
                any(move |ConnectInfo(addr): ConnectInfo<SocketAddr>, req: Request| {
                    let handler = root.clone();
                    async move { handler.handle_request(req, addr).await }
                }),
            )
            .route(
                "/{*path}",
                any(move |ConnectInfo(addr): ConnectInfo<SocketAddr>, req: Request| {
                    let handler = self.clone();
                    async move { handler.handle_request(req, addr).await }
                }),
            )
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use tower::ServiceExt;

    use super::*;
    use crate::{
        adapters::{HttpClientAdapter, proxy::tls::DomainCertResolver},
        config::DGateConfig,
        core::{resource_graph::ResourceGraph, resources::Namespace},
        metrics::NoopMetrics,
        ports::reload::Reloader,
    };

    #[tokio::test]
    async fn test_router_forwards_to_dispatcher() {
        let graph = Arc::new(ResourceGraph::new());
        graph.add_namespace(Namespace::new("n1")).unwrap();
        let dispatcher = Arc::new(ProxyDispatcher::new(
            Arc::new(DGateConfig::default()),
            graph,
            Arc::new(HttpClientAdapter::new(Default::default())),
            Arc::new(NoopMetrics),
            Arc::new(DomainCertResolver::new(None)),
        ));
        dispatcher.reload().await.unwrap();

        let app = HttpHandler::new(dispatcher, false).router();
        let mut req = Request::builder()
            .uri("/nothing/here")
            .body(AxumBody::empty())
            .unwrap();
        req.extensions_mut()
            .insert(ConnectInfo("127.0.0.1:5000".parse::<SocketAddr>().unwrap()));
        let res = app.oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }
}

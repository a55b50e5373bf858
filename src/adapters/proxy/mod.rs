//! Proxy data plane: resolves the namespace of a request, finds its route and runs the route's
//! pipeline. Routers are rebuilt from the resource graph on every reload and swapped in
//! atomically, so in-flight requests finish on the snapshot they started with.
pub mod pipeline;
pub mod tls;
pub mod transport;

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use axum::body::Body;
use http::{HeaderValue, Request, Response, StatusCode, header, uri::Authority};
use serde_json::Value;
use tracing::{Instrument, debug, error, info, warn};
use url::Url;

use self::{
    pipeline::Matched,
    tls::{DomainCertResolver, TlsDomain},
    transport::{Inbound, ProxyTransport, normalize_scheme},
};
use crate::{
    adapters::scripting::{ModuleCompiler, RuntimeOptions, RuntimePool},
    config::DGateConfig,
    core::{
        load_balancer::RoundRobinStrategy,
        pattern::match_any,
        resource_graph::{ResolvedRoute, ResourceGraph},
        resources::{DEFAULT_NAMESPACE, Route, Service, resource_key},
        router::{Lookup, NamespaceRouter},
    },
    metrics::MetricsSink,
    ports::{
        http_client::{ClientProfile, HttpClient},
        reload::{ReloadError, ReloadResult, Reloader},
    },
    tracing_setup::create_request_span,
};

/// Connection facts the listener knows about a request.
#[derive(Debug, Clone, Copy)]
pub struct ConnInfo {
    pub remote: SocketAddr,
    pub secure: bool,
}

/// Plain-text response carrying the status line, e.g. `404 Not Found`.
pub(crate) fn status_response(status: StatusCode) -> Response<Body> {
    status_response_with(status, None)
}

fn status_response_with(status: StatusCode, detail: Option<&str>) -> Response<Body> {
    let mut text = format!(
        "{} {}",
        status.as_u16(),
        status.canonical_reason().unwrap_or_default()
    );
    if let Some(detail) = detail {
        text.push_str(" - ");
        text.push_str(detail);
    }
    let mut response = Response::new(Body::from(text));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

/// Non-standard status used when the client went away mid-exchange.
pub(crate) fn client_closed() -> StatusCode {
    StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_GATEWAY)
}

/// Everything a request on one route needs, built at reload time.
pub struct RouteHandler {
    pub route: Route,
    pub namespace: String,
    pub service: Option<Service>,
    upstreams: Vec<Url>,
    balancer: RoundRobinStrategy,
    pool: Option<Arc<RuntimePool>>,
    transport: Option<ProxyTransport>,
    /// Module digests the pool was built from
    digests: Vec<String>,
    script_route: Value,
    script_service: Option<Value>,
    script_namespace: Value,
}

impl std::fmt::Debug for RouteHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteHandler")
            .field("route", &self.route.name)
            .field("namespace", &self.namespace)
            .field("service", &self.service.as_ref().map(|s| &s.name))
            .field("modules", &self.digests.len())
            .finish()
    }
}

#[derive(Debug, Clone)]
struct DomainEntry {
    namespace: String,
    patterns: Vec<String>,
}

/// Immutable routing state produced by one reload.
#[derive(Debug, Default)]
pub struct RouterSnapshot {
    routers: HashMap<String, NamespaceRouter<Arc<RouteHandler>>>,
    handlers: HashMap<String, Arc<RouteHandler>>,
    domains: Vec<DomainEntry>,
    namespaces: Vec<String>,
    default_unbound: bool,
}

impl RouterSnapshot {
    /// Namespace serving `host` (port already removed).
    pub fn resolve_namespace(&self, host: &str) -> Option<&str> {
        if self.domains.is_empty() && self.namespaces.len() == 1 {
            return self.namespaces.first().map(String::as_str);
        }
        for domain in &self.domains {
            match match_any(host, &domain.patterns) {
                Ok(Some(_)) => return Some(&domain.namespace),
                Ok(None) => {}
                Err(e) => warn!(namespace = %domain.namespace, error = %e, "Invalid domain pattern"),
            }
        }
        if self.default_unbound {
            return Some(DEFAULT_NAMESPACE);
        }
        None
    }

    pub fn route_count(&self) -> usize {
        self.handlers.len()
    }

    fn pools(&self) -> impl Iterator<Item = &Arc<RuntimePool>> {
        self.handlers.values().filter_map(|h| h.pool.as_ref())
    }
}

fn strip_port(host: &str) -> &str {
    match host.parse::<Authority>() {
        Ok(authority) => {
            let name = authority.host();
            // keep the slice borrowed from `host`
            &host[..name.len().min(host.len())]
        }
        Err(_) => host,
    }
}

fn route_error(route: &Route, reason: impl ToString) -> ReloadError {
    ReloadError::Route {
        route: route.name.clone(),
        namespace: route.namespace.clone(),
        reason: reason.to_string(),
    }
}

fn module_error(namespace: &str, module: String, reason: impl ToString) -> ReloadError {
    ReloadError::Module {
        module,
        namespace: namespace.to_string(),
        reason: reason.to_string(),
    }
}

pub struct ProxyDispatcher {
    config: Arc<DGateConfig>,
    graph: Arc<ResourceGraph>,
    client: Arc<dyn HttpClient>,
    metrics: Arc<dyn MetricsSink>,
    compiler: ModuleCompiler,
    certs: Arc<DomainCertResolver>,
    snapshot: ArcSwap<RouterSnapshot>,
    reload_lock: tokio::sync::Mutex<()>,
}

impl ProxyDispatcher {
    pub fn new(
        config: Arc<DGateConfig>,
        graph: Arc<ResourceGraph>,
        client: Arc<dyn HttpClient>,
        metrics: Arc<dyn MetricsSink>,
        certs: Arc<DomainCertResolver>,
    ) -> Self {
        Self {
            config,
            graph,
            client,
            metrics,
            compiler: ModuleCompiler::new(),
            certs,
            snapshot: ArcSwap::from_pointee(RouterSnapshot::default()),
            reload_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn snapshot(&self) -> Arc<RouterSnapshot> {
        self.snapshot.load_full()
    }

    pub fn cert_resolver(&self) -> Arc<DomainCertResolver> {
        self.certs.clone()
    }

    /// Retire every runtime pool; used on shutdown.
    pub fn close(&self) {
        let snapshot = self.snapshot.swap(Arc::new(RouterSnapshot::default()));
        for pool in snapshot.pools() {
            pool.close();
        }
    }

    /// Serve one proxied request.
    pub async fn handle(&self, req: Request<Body>, conn: ConnInfo) -> Response<Body> {
        let started = Instant::now();
        let host = request_host(&req);
        let method = req.method().clone();
        let span = create_request_span(method.as_str(), req.uri().path(), &host);

        let (response, target) = self
            .dispatch(req, conn, host)
            .instrument(span.clone())
            .await;

        let status = response.status().as_u16();
        let elapsed = started.elapsed();
        span.record("http.status_code", status);
        span.record("duration_ms", elapsed.as_millis() as u64);
        let (namespace, route) = target.unwrap_or_default();
        if !namespace.is_empty() {
            span.record("namespace", namespace.as_str());
            span.record("route", route.as_str());
        }
        self.metrics
            .record_request(&namespace, &route, method.as_str(), status, elapsed);
        span.in_scope(|| {
            info!(
                status,
                duration_ms = elapsed.as_millis() as u64,
                remote = %conn.remote,
                "Request served"
            )
        });
        response
    }

    async fn dispatch(
        &self,
        req: Request<Body>,
        conn: ConnInfo,
        host: String,
    ) -> (Response<Body>, Option<(String, String)>) {
        let hostname = strip_port(&host).to_string();
        let proxy = &self.config.proxy;

        if !proxy.allowed_domains.is_empty() {
            let allowed = match match_any(&hostname, &proxy.allowed_domains) {
                Ok(found) => found.is_some(),
                Err(e) => {
                    error!(error = %e, "Invalid allowed domain pattern");
                    false
                }
            };
            if !allowed {
                let response = if self.config.debug {
                    status_response_with(StatusCode::FORBIDDEN, Some("Domain not allowed"))
                } else {
                    status_response(StatusCode::UNAUTHORIZED)
                };
                return (response, None);
            }
        }

        if !conn.secure && !proxy.redirect_https.is_empty() {
            match match_any(&hostname, &proxy.redirect_https) {
                Ok(Some(_)) => return (self.redirect_to_https(&hostname, &req), None),
                Ok(None) => {}
                Err(e) => {
                    error!(error = %e, "Invalid redirect_https pattern");
                    return (status_response(StatusCode::INTERNAL_SERVER_ERROR), None);
                }
            }
        }

        let snapshot = self.snapshot.load_full();
        let Some(namespace) = snapshot.resolve_namespace(&hostname) else {
            debug!(host = %hostname, "No namespace for host");
            return (status_response(StatusCode::NOT_FOUND), None);
        };
        let Some(router) = snapshot.routers.get(namespace) else {
            return (status_response(StatusCode::NOT_FOUND), None);
        };

        let path = req.uri().path().to_string();
        let (handler, matched) = match router.lookup(req.method(), &path) {
            Lookup::Found(found) => {
                let handler = found.value.clone();
                let strip_prefix = handler.route.strip_path.then(|| {
                    let kept = found.remainder.as_deref().map_or(0, str::len);
                    path[..path.len() - kept].to_string()
                });
                let matched = Matched {
                    params: found.params,
                    strip_prefix,
                };
                (handler, matched)
            }
            Lookup::MethodNotAllowed => {
                return (status_response(StatusCode::METHOD_NOT_ALLOWED), None);
            }
            Lookup::NotFound => return (status_response(StatusCode::NOT_FOUND), None),
        };
        let target = Some((handler.namespace.clone(), handler.route.name.clone()));

        let inbound = Inbound {
            host,
            remote_ip: conn.remote.ip(),
            secure: conn.secure,
        };
        let (response, stats) = pipeline::serve(self, &handler, req, matched, inbound).await;
        for (stage, duration) in stats.stages() {
            self.metrics
                .record_stage(stage, &handler.route.name, *duration);
        }
        debug!(
            route = %handler.route.name,
            namespace = %handler.namespace,
            stages = %stats,
            "Request stats"
        );
        (response, target)
    }

    fn redirect_to_https(&self, hostname: &str, req: &Request<Body>) -> Response<Body> {
        let port = self
            .config
            .proxy
            .tls
            .as_ref()
            .map(|tls| tls.port)
            .filter(|port| *port != 443)
            .map(|port| format!(":{port}"))
            .unwrap_or_default();
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let location = format!("https://{hostname}{port}{path_and_query}");
        let mut response = status_response(StatusCode::TEMPORARY_REDIRECT);
        match HeaderValue::from_str(&location) {
            Ok(value) => {
                response.headers_mut().insert(header::LOCATION, value);
                response
            }
            Err(_) => status_response(StatusCode::BAD_REQUEST),
        }
    }

    async fn build_handler(
        &self,
        resolved: ResolvedRoute,
        previous: &RouterSnapshot,
        created: &mut Vec<Arc<RuntimePool>>,
    ) -> ReloadResult<RouteHandler> {
        let ResolvedRoute {
            route,
            namespace,
            service,
            modules,
        } = resolved;
        let key = resource_key(&route.name, &namespace.name);

        let pool = if modules.is_empty() {
            None
        } else {
            let compiled = self
                .compiler
                .compile_all(&modules)
                .map_err(|(module, e)| module_error(&namespace.name, module, e))?;
            let digests: Vec<String> = compiled
                .iter()
                .map(|m| format!("{}:{}", m.name, m.digest))
                .collect();
            let reusable = previous
                .handlers
                .get(&key)
                .filter(|h| h.digests == digests)
                .and_then(|h| h.pool.clone())
                .filter(|p| !p.is_closed());
            match reusable {
                Some(pool) => Some((pool, digests)),
                None => {
                    let options = RuntimeOptions {
                        label: format!("{}/{}", route.name, namespace.name),
                        console: self.config.proxy.enable_console_logger,
                        loop_iteration_limit: self.config.proxy.module_pool.loop_iteration_limit,
                        recursion_limit: self.config.proxy.module_pool.recursion_limit,
                    };
                    let pool = RuntimePool::new(compiled, options, self.config.proxy.module_pool)
                        .await
                        .map_err(|e| {
                            // runtime load errors are prefixed with the module name
                            let message = e.to_string();
                            let module = message
                                .split_once(": ")
                                .and_then(|(_, rest)| rest.split_once(": "))
                                .map(|(name, _)| name.to_string())
                                .unwrap_or_else(|| route.modules.join(","));
                            module_error(&namespace.name, module, e)
                        })?;
                    created.push(pool.clone());
                    Some((pool, digests))
                }
            }
        };
        let (pool, digests) = match pool {
            Some((pool, digests)) => (Some(pool), digests),
            None => (None, Vec::new()),
        };

        let mut upstreams = Vec::new();
        let transport = match &service {
            Some(service) => {
                for raw in &service.urls {
                    let mut url = Url::parse(raw).map_err(|e| route_error(&route, e))?;
                    normalize_scheme(&mut url);
                    upstreams.push(url);
                }
                let transport_config = &self.config.proxy.client_transport;
                Some(ProxyTransport {
                    client: self.client.clone(),
                    profile: ClientProfile {
                        connect_timeout: service
                            .connect_timeout
                            .unwrap_or(transport_config.dial_timeout),
                        tls_skip_verify: service.tls_skip_verify,
                        http2_only: service.http2_only,
                    },
                    service: service.name.clone(),
                    retries: service.retries(),
                    retry_timeout: service.retry_timeout(),
                    request_timeout: service.request_timeout.filter(|t| *t > Duration::ZERO),
                })
            }
            None => None,
        };

        Ok(RouteHandler {
            script_route: serde_json::to_value(&route).unwrap_or(Value::Null),
            script_service: service
                .as_ref()
                .map(|s| serde_json::to_value(s).unwrap_or(Value::Null)),
            script_namespace: serde_json::to_value(&namespace).unwrap_or(Value::Null),
            namespace: namespace.name,
            route,
            service,
            upstreams,
            balancer: RoundRobinStrategy::new(),
            pool,
            transport,
            digests,
        })
    }

    async fn build_snapshot(
        &self,
        previous: &RouterSnapshot,
        created: &mut Vec<Arc<RuntimePool>>,
    ) -> ReloadResult<(RouterSnapshot, Vec<TlsDomain>)> {
        let mut snapshot = RouterSnapshot::default();
        for namespace in self.graph.get_namespaces() {
            let resolved = self
                .graph
                .resolved_routes_by_namespace(&namespace.name)
                .unwrap_or_default();
            let mut router = NamespaceRouter::new();
            for route in resolved {
                let handler = Arc::new(self.build_handler(route, previous, created).await?);
                let route = &handler.route;
                let methods: Vec<&str> = if route.matches_any_method() {
                    vec!["*"]
                } else {
                    route.methods.iter().map(String::as_str).collect()
                };
                for path in &route.paths {
                    let mount = route.strip_path && !path.ends_with('*');
                    for method in &methods {
                        router
                            .insert(method, path, mount, handler.clone())
                            .map_err(|e| route_error(route, e))?;
                    }
                }
                snapshot
                    .handlers
                    .insert(resource_key(&route.name, &handler.namespace), handler.clone());
            }
            snapshot.routers.insert(namespace.name.clone(), router);
            snapshot.namespaces.push(namespace.name);
        }

        let records = self.graph.get_domains_by_priority();
        snapshot.domains = records
            .iter()
            .map(|r| DomainEntry {
                namespace: r.domain.namespace.clone(),
                patterns: r.domain.patterns.clone(),
            })
            .collect();
        snapshot.default_unbound = self.graph.get_namespace(DEFAULT_NAMESPACE).is_some()
            && !self.graph.namespace_has_domains(DEFAULT_NAMESPACE);
        Ok((snapshot, TlsDomain::from_records(&records)))
    }
}

fn request_host(req: &Request<Body>) -> String {
    req.headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
        .unwrap_or_default()
}

#[async_trait]
impl Reloader for ProxyDispatcher {
    async fn reload(&self) -> ReloadResult<()> {
        let _guard = self.reload_lock.lock().await;
        let started = Instant::now();
        let previous = self.snapshot.load_full();
        let mut created = Vec::new();

        let (snapshot, tls_domains) = match self.build_snapshot(&previous, &mut created).await {
            Ok(built) => built,
            Err(e) => {
                for pool in created {
                    pool.close();
                }
                warn!(error = %e, "Reload failed, keeping previous routes");
                return Err(e);
            }
        };

        let stale: Vec<Arc<RuntimePool>> = previous
            .pools()
            .filter(|old| !snapshot.pools().any(|p| Arc::ptr_eq(p, old)))
            .cloned()
            .collect();
        let routes = snapshot.route_count();
        self.certs.update(tls_domains);
        self.snapshot.store(Arc::new(snapshot));
        for pool in stale {
            pool.close();
        }
        info!(
            routes,
            duration_ms = started.elapsed().as_millis() as u64,
            "Proxy routes reloaded"
        );
        Ok(())
    }
}

//! The per-route request pipeline: borrow a runtime, run the modifiers, then either proxy
//! to the service or hand the request to the module's handler.
use std::{
    collections::BTreeMap,
    fmt,
    time::{Duration, Instant},
};

use axum::body::Body;
use bytes::Bytes;
use http::{
    HeaderName, HeaderValue, Method, Request, Response, StatusCode, header, request::Parts,
};
use http_body_util::BodyExt;
use serde_json::Value;
use tracing::{debug, error, warn};

use super::{
    ProxyDispatcher, RouteHandler, client_closed, status_response,
    transport::{Inbound, OutgoingBody, RewriteOptions, parse_upstream, rewrite, strip_hop_by_hop},
};
use crate::{
    adapters::scripting::{
        PooledRuntime, ScriptState,
        context::{
            RequestState, ResponseState, UpstreamState, apply_headers, encode_query,
            headers_to_map, parse_query,
        },
    },
    core::load_balancer::LoadBalancingStrategy,
    ports::{
        http_client::HttpClientError,
        scripting::{EntryPoint, ScriptError, ScriptResult},
    },
};

const X_DGATE_SERVICE: HeaderName = HeaderName::from_static("x-dgate-service");
const X_DGATE_ROUTE: HeaderName = HeaderName::from_static("x-dgate-route");
const X_DGATE_NAMESPACE: HeaderName = HeaderName::from_static("x-dgate-namespace");
const X_DGATE_TAGS: HeaderName = HeaderName::from_static("x-dgate-tags");
const X_UPSTREAM_URL: HeaderName = HeaderName::from_static("x-upstream-url");
const VIA_DGATE: HeaderValue = HeaderValue::from_static("DGate Proxy");

/// Timing of each pipeline stage of one request.
#[derive(Debug, Default)]
pub struct RequestStats {
    stages: Vec<(&'static str, Duration)>,
    pub upstream: Option<Duration>,
}

impl RequestStats {
    pub fn add(&mut self, stage: &'static str, duration: Duration) {
        self.stages.push((stage, duration));
    }

    pub fn stages(&self) -> &[(&'static str, Duration)] {
        &self.stages
    }
}

impl fmt::Display for RequestStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (stage, duration) in &self.stages {
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            write!(f, "{stage}={duration:?}")?;
        }
        Ok(())
    }
}

/// Router match details the pipeline needs.
#[derive(Debug, Default)]
pub struct Matched {
    pub params: BTreeMap<String, String>,
    pub strip_prefix: Option<String>,
}

fn stage_name(entry: EntryPoint) -> &'static str {
    match entry {
        EntryPoint::FetchUpstream => "fetchUpstreamUrl",
        other => other.as_str(),
    }
}

/// One request flowing through a route.
struct Exchange<'a> {
    dispatcher: &'a ProxyDispatcher,
    handler: &'a RouteHandler,
    runtime: Option<PooledRuntime>,
    state: ScriptState,
    inbound: Inbound,
    stats: RequestStats,
}

impl Exchange<'_> {
    fn has(&self, entry: EntryPoint) -> bool {
        self.runtime.as_ref().is_some_and(|rt| rt.has(entry))
    }

    async fn invoke(&mut self, entry: EntryPoint) -> ScriptResult<Value> {
        let Some(runtime) = &self.runtime else {
            return Err(ScriptError::Stopped);
        };
        let started = Instant::now();
        let result = runtime.invoke(entry, &self.state).await;
        self.stats.add(stage_name(entry), started.elapsed());
        let invocation = result?;
        self.state = invocation.state;
        Ok(invocation.value)
    }

    fn route(&self) -> &str {
        &self.handler.route.name
    }
}

pub(super) async fn serve(
    dispatcher: &ProxyDispatcher,
    handler: &RouteHandler,
    req: Request<Body>,
    matched: Matched,
    inbound: Inbound,
) -> (Response<Body>, RequestStats) {
    let mut stats = RequestStats::default();

    let runtime = match &handler.pool {
        Some(pool) => {
            let started = Instant::now();
            let borrowed = pool.borrow().await;
            dispatcher
                .metrics
                .record_module_borrow(&handler.route.name, borrowed.is_ok());
            match borrowed {
                Ok(runtime) => {
                    stats.add("moduleExtract", started.elapsed());
                    Some(runtime)
                }
                Err(e) => {
                    error!(route = %handler.route.name, error = %e, "Failed to borrow script runtime");
                    return (status_response(StatusCode::INTERNAL_SERVER_ERROR), stats);
                }
            }
        }
        None => None,
    };

    let (parts, body) = req.into_parts();
    let buffer = runtime.is_some()
        || handler.transport.as_ref().is_some_and(|t| {
            t.retries > 0 && parts.method != Method::PUT && parts.method != Method::POST
        });
    let (buffered, streaming) = if buffer {
        match body.collect().await {
            Ok(collected) => (Some(collected.to_bytes()), None),
            Err(e) => {
                debug!(error = %e, "Client body ended early");
                return (status_response(client_closed()), stats);
            }
        }
    } else {
        (None, Some(body))
    };

    let state = match &runtime {
        Some(_) => script_state(handler, &parts, buffered.as_ref(), &matched, &inbound),
        None => ScriptState::default(),
    };
    let mut ex = Exchange {
        dispatcher,
        handler,
        runtime,
        state,
        inbound,
        stats,
    };

    let response = if handler.service.is_some() {
        proxy(&mut ex, parts, buffered, streaming, &matched).await
    } else if ex.runtime.is_none() {
        status_response(StatusCode::NOT_IMPLEMENTED)
    } else {
        handle_locally(&mut ex).await
    };
    (response, ex.stats)
}

fn script_state(
    handler: &RouteHandler,
    parts: &Parts,
    body: Option<&Bytes>,
    matched: &Matched,
    inbound: &Inbound,
) -> ScriptState {
    let scheme = if inbound.secure { "https" } else { "http" };
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    ScriptState {
        request: RequestState {
            method: parts.method.to_string(),
            url: format!("{scheme}://{}{path_and_query}", inbound.host),
            path: parts.uri.path().to_string(),
            query: parse_query(parts.uri.query()),
            headers: headers_to_map(&parts.headers),
            body: body
                .filter(|b| !b.is_empty())
                .map(|b| String::from_utf8_lossy(b).into_owned()),
            body_changed: false,
            remote_address: inbound.remote_ip.to_string(),
            params: matched.params.clone(),
        },
        service: handler.script_service.clone(),
        route: handler.script_route.clone(),
        namespace: handler.script_namespace.clone(),
        ..Default::default()
    }
}

/// Request pieces after `requestModifier` had its say.
struct Outgoing {
    method: Method,
    path: String,
    query: Option<String>,
    parts: Parts,
    body: OutgoingBody,
}

async fn run_request_modifier(
    ex: &mut Exchange<'_>,
    mut parts: Parts,
    buffered: Option<Bytes>,
    streaming: Option<Body>,
) -> Result<Outgoing, Response<Body>> {
    let mut out = Outgoing {
        method: parts.method.clone(),
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(str::to_string),
        body: match (buffered, streaming) {
            (Some(bytes), _) => OutgoingBody::Buffered(bytes),
            (None, Some(body)) => OutgoingBody::Streaming(body),
            (None, None) => OutgoingBody::Buffered(Bytes::new()),
        },
        parts: {
            // the uri is rebuilt from `path`/`query` later
            parts.extensions.clear();
            parts
        },
    };
    if !ex.has(EntryPoint::RequestModifier) {
        return Ok(out);
    }

    let before = ex.state.request.clone();
    if let Err(e) = ex.invoke(EntryPoint::RequestModifier).await {
        error!(route = %ex.route(), error = %e, "Error modifying request");
        return Err(status_response(StatusCode::INTERNAL_SERVER_ERROR));
    }
    let after = &ex.state.request;
    if after.method != before.method {
        match Method::from_bytes(after.method.as_bytes()) {
            Ok(method) => out.method = method,
            Err(_) => warn!(route = %ex.route(), method = %after.method, "Script set an invalid method"),
        }
    }
    out.path = after.path.clone();
    if after.query != before.query {
        out.query = encode_query(&after.query);
    }
    if after.headers != before.headers {
        apply_headers(&after.headers, &mut out.parts.headers);
    }
    if after.body_changed {
        out.body = OutgoingBody::Buffered(Bytes::from(after.body.clone().unwrap_or_default()));
        out.parts.headers.remove(header::CONTENT_LENGTH);
    }
    Ok(out)
}

async fn proxy(
    ex: &mut Exchange<'_>,
    parts: Parts,
    buffered: Option<Bytes>,
    streaming: Option<Body>,
    matched: &Matched,
) -> Response<Body> {
    let handler = ex.handler;
    let (Some(service), Some(transport)) = (&handler.service, &handler.transport) else {
        return status_response(StatusCode::INTERNAL_SERVER_ERROR);
    };
    let dispatcher = ex.dispatcher;
    let config = &dispatcher.config;

    let mut out = match run_request_modifier(ex, parts, buffered, streaming).await {
        Ok(out) => out,
        Err(response) => return response,
    };

    let upstream = if ex.has(EntryPoint::FetchUpstream) {
        let value = match ex.invoke(EntryPoint::FetchUpstream).await {
            Ok(value) => value,
            Err(e) => {
                error!(route = %ex.route(), error = %e, "Error fetching upstream");
                return status_response(StatusCode::INTERNAL_SERVER_ERROR);
            }
        };
        let Some(raw) = value.as_str() else {
            error!(route = %ex.route(), value = %value, "fetchUpstream must return a URL string");
            return status_response(StatusCode::INTERNAL_SERVER_ERROR);
        };
        match parse_upstream(raw, ex.inbound.secure) {
            Ok(url) => url,
            Err(e) => {
                error!(route = %ex.route(), url = %raw, error = %e, "Error parsing upstream url");
                return status_response(StatusCode::BAD_GATEWAY);
            }
        }
    } else {
        match handler.balancer.select_target(&handler.upstreams) {
            Some(url) => url,
            None => {
                error!(route = %ex.route(), service = %service.name, "Service has no urls");
                return status_response(StatusCode::INTERNAL_SERVER_ERROR);
            }
        }
    };

    if !service.hide_dgate_headers {
        let headers = &mut out.parts.headers;
        for (name, value) in [
            (X_DGATE_SERVICE, &service.name),
            (X_DGATE_ROUTE, &handler.route.name),
            (X_DGATE_NAMESPACE, &handler.namespace),
        ] {
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.insert(name, value);
            }
        }
        for tag in &config.tags {
            if let Ok(value) = HeaderValue::from_str(tag) {
                headers.append(X_DGATE_TAGS, value);
            }
        }
    }

    let opts = RewriteOptions {
        strip_prefix: matched.strip_prefix.clone(),
        preserve_host: handler.route.preserve_host || service.preserve_host,
        disable_query_params: service.disable_query_params,
        disable_x_forwarded_headers: config.proxy.disable_x_forwarded_headers,
    };
    let uri = match rewrite(
        &upstream,
        &out.path,
        out.query.as_deref(),
        &mut out.parts.headers,
        &ex.inbound,
        &opts,
    ) {
        Ok(uri) => uri,
        Err(e) => {
            error!(route = %ex.route(), upstream = %upstream, error = %e, "Error building upstream request");
            return status_response(StatusCode::BAD_GATEWAY);
        }
    };

    let started = Instant::now();
    let result = transport
        .round_trip(out.method, uri, out.parts.headers, out.body)
        .await;
    let elapsed = started.elapsed();
    ex.stats.upstream = Some(elapsed);
    ex.stats.add("upstream", elapsed);
    dispatcher.metrics.record_upstream(
        &service.name,
        result.as_ref().map_or(0, |r| r.status().as_u16()),
        elapsed,
    );

    let mut response = match result {
        Ok(response) => match modify_response(ex, response, service.hide_dgate_headers).await {
            Ok(response) => response,
            Err(e) => upstream_failure(ex, &e.to_string(), false).await,
        },
        Err(e) => {
            debug!(route = %ex.route(), error = %e, "Error proxying request");
            upstream_failure(ex, &e.to_string(), e.is_canceled()).await
        }
    };

    let headers = response.headers_mut();
    for (name, value) in &config.proxy.global_headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!(header = %name, "Skipping invalid global header"),
        }
    }
    if config.debug
        && let Ok(value) = HeaderValue::from_str(upstream.as_str())
    {
        headers.insert(X_UPSTREAM_URL, value);
    }
    response
}

async fn modify_response(
    ex: &mut Exchange<'_>,
    response: Response<Body>,
    hide_headers: bool,
) -> Result<Response<Body>, HttpClientError> {
    let (mut parts, body) = response.into_parts();
    strip_hop_by_hop(&mut parts.headers);
    if !hide_headers {
        parts.headers.insert(header::VIA, VIA_DGATE);
    }
    if !ex.has(EntryPoint::ResponseModifier) {
        return Ok(Response::from_parts(parts, body));
    }

    let bytes = body
        .collect()
        .await
        .map_err(|e| HttpClientError::Canceled(e.to_string()))?
        .to_bytes();
    ex.state.upstream = Some(UpstreamState {
        status_code: parts.status.as_u16(),
        headers: headers_to_map(&parts.headers),
        body: String::from_utf8_lossy(&bytes).into_owned(),
        body_changed: false,
    });
    ex.invoke(EntryPoint::ResponseModifier)
        .await
        .map_err(|e| HttpClientError::ConnectionError(e.to_string()))?;

    let Some(upstream) = ex.state.upstream.take() else {
        return Ok(Response::from_parts(parts, Body::from(bytes)));
    };
    match StatusCode::from_u16(upstream.status_code) {
        Ok(status) => parts.status = status,
        Err(_) => warn!(route = %ex.route(), status = upstream.status_code, "Script set an invalid status"),
    }
    apply_headers(&upstream.headers, &mut parts.headers);
    let body = if upstream.body_changed {
        parts.headers.remove(header::CONTENT_LENGTH);
        Body::from(upstream.body)
    } else {
        Body::from(bytes)
    };
    Ok(Response::from_parts(parts, body))
}

async fn upstream_failure(ex: &mut Exchange<'_>, reason: &str, canceled: bool) -> Response<Body> {
    let fallback = if canceled {
        client_closed()
    } else {
        StatusCode::BAD_GATEWAY
    };
    if !ex.has(EntryPoint::ErrorHandler) {
        return status_response(fallback);
    }
    ex.state.error = Some(reason.to_string());
    ex.state.upstream = None;
    match ex.invoke(EntryPoint::ErrorHandler).await {
        Ok(_) if ex.state.response.is_written() => response_from_state(&ex.state.response),
        Ok(_) => status_response(fallback),
        Err(e) => {
            error!(route = %ex.route(), error = %e, "Error handling error");
            status_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn handle_locally(ex: &mut Exchange<'_>) -> Response<Body> {
    if ex.has(EntryPoint::RequestModifier)
        && let Err(e) = ex.invoke(EntryPoint::RequestModifier).await
    {
        error!(route = %ex.route(), error = %e, "Error modifying request");
        return status_response(StatusCode::INTERNAL_SERVER_ERROR);
    }
    if !ex.has(EntryPoint::RequestHandler) {
        return status_response(StatusCode::NOT_IMPLEMENTED);
    }
    match ex.invoke(EntryPoint::RequestHandler).await {
        Ok(_) => response_from_state(&ex.state.response),
        Err(e) => {
            error!(route = %ex.route(), error = %e, "Error handling request");
            if !ex.has(EntryPoint::ErrorHandler) {
                return status_response(StatusCode::INTERNAL_SERVER_ERROR);
            }
            ex.state.error = Some(e.to_string());
            match ex.invoke(EntryPoint::ErrorHandler).await {
                Ok(_) => response_from_state(&ex.state.response),
                Err(e) => {
                    error!(route = %ex.route(), error = %e, "Error handling error");
                    status_response(StatusCode::INTERNAL_SERVER_ERROR)
                }
            }
        }
    }
}

/// Build the response a script wrote. Without an explicit status the response is 200 when a
/// body was written and 204 otherwise.
fn response_from_state(state: &ResponseState) -> Response<Body> {
    let body = state.body.clone().unwrap_or_default();
    let status = match state.status.map(StatusCode::from_u16) {
        Some(Ok(status)) => status,
        Some(Err(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        None if body.is_empty() => StatusCode::NO_CONTENT,
        None => StatusCode::OK,
    };
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    apply_headers(&state.headers, response.headers_mut());
    response
}

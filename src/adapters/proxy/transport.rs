//! Upstream request construction and the retrying round trip.
use std::{net::IpAddr, sync::Arc, time::Duration};

use axum::body::Body;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Response, Uri, header};
use tokio::time::{Instant, sleep, timeout};
use tracing::{Instrument, debug};
use url::Url;

use crate::{
    ports::http_client::{ClientProfile, HttpClient, HttpClientError, HttpClientResult},
    tracing_setup::create_upstream_span,
};

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
const X_REAL_IP: HeaderName = HeaderName::from_static("x-real-ip");

/// Connection-scoped headers that must not be forwarded.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Map websocket schemes onto their HTTP counterparts.
pub fn normalize_scheme(url: &mut Url) {
    let scheme = match url.scheme() {
        "ws" => "http",
        "wss" => "https",
        _ => return,
    };
    // only fails for cannot-be-a-base URLs, which never carry a ws scheme
    let _ = url.set_scheme(scheme);
}

/// Parse an upstream returned by a script. Bare `host[:port][/path]` values inherit the
/// scheme of the inbound connection.
pub fn parse_upstream(raw: &str, secure: bool) -> Result<Url, url::ParseError> {
    let mut url = if raw.contains("://") {
        Url::parse(raw)?
    } else {
        let scheme = if secure { "https" } else { "http" };
        Url::parse(&format!("{scheme}://{raw}"))?
    };
    normalize_scheme(&mut url);
    Ok(url)
}

fn join_path(base: &str, tail: &str) -> String {
    let base = base.trim_end_matches('/');
    let tail = tail.trim_start_matches('/');
    match (base.is_empty(), tail.is_empty()) {
        (true, true) => "/".to_string(),
        (false, true) => base.to_string(),
        (true, false) => format!("/{tail}"),
        (false, false) => format!("{base}/{tail}"),
    }
}

/// Per-route rewrite settings.
#[derive(Debug, Clone, Default)]
pub struct RewriteOptions {
    /// Path prefix consumed by the route pattern when `strip_path` is set
    pub strip_prefix: Option<String>,
    pub preserve_host: bool,
    pub disable_query_params: bool,
    pub disable_x_forwarded_headers: bool,
}

/// What the inbound side of the connection looked like.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub host: String,
    pub remote_ip: IpAddr,
    pub secure: bool,
}

/// Point `path`/`query` at `upstream` and fix up the forwarding headers.
pub fn rewrite(
    upstream: &Url,
    path: &str,
    query: Option<&str>,
    headers: &mut HeaderMap,
    inbound: &Inbound,
    opts: &RewriteOptions,
) -> Result<Uri, http::Error> {
    let tail = match &opts.strip_prefix {
        Some(prefix) => path.strip_prefix(prefix.as_str()).unwrap_or(path),
        None => path,
    };
    let full_path = join_path(upstream.path(), tail);

    let query = if opts.disable_query_params {
        None
    } else {
        match (upstream.query().filter(|q| !q.is_empty()), query.filter(|q| !q.is_empty())) {
            (Some(a), Some(b)) => Some(format!("{a}&{b}")),
            (Some(a), None) => Some(a.to_string()),
            (None, Some(b)) => Some(b.to_string()),
            (None, None) => None,
        }
    };

    let mut authority = upstream.host_str().unwrap_or_default().to_string();
    if authority.contains(':') && !authority.starts_with('[') {
        authority = format!("[{authority}]");
    }
    if let Some(port) = upstream.port() {
        authority = format!("{authority}:{port}");
    }

    strip_hop_by_hop(headers);
    if !opts.preserve_host {
        headers.remove(header::HOST);
    } else if !headers.contains_key(header::HOST)
        && let Ok(value) = HeaderValue::from_str(&inbound.host)
    {
        headers.insert(header::HOST, value);
    }

    if opts.disable_x_forwarded_headers {
        for name in [X_FORWARDED_FOR, X_FORWARDED_HOST, X_FORWARDED_PROTO, X_REAL_IP] {
            headers.remove(name);
        }
    } else {
        let ip = HeaderValue::from_str(&inbound.remote_ip.to_string())?;
        headers.append(X_FORWARDED_FOR, ip.clone());
        headers.insert(X_REAL_IP, ip);
        if let Ok(host) = HeaderValue::from_str(&inbound.host) {
            headers.insert(X_FORWARDED_HOST, host);
        }
        headers.insert(
            X_FORWARDED_PROTO,
            HeaderValue::from_static(if inbound.secure { "https" } else { "http" }),
        );
    }

    let path_and_query = match query {
        Some(q) => format!("{full_path}?{q}"),
        None => full_path,
    };
    Uri::builder()
        .scheme(upstream.scheme())
        .authority(authority)
        .path_and_query(path_and_query)
        .build()
}

/// Request body headed upstream.
#[derive(Debug)]
pub enum OutgoingBody {
    /// Kept in memory; the request may be replayed
    Buffered(Bytes),
    Streaming(Body),
}

/// Round trip with the retry policy of a service.
#[derive(Clone)]
pub struct ProxyTransport {
    pub client: Arc<dyn HttpClient>,
    pub profile: ClientProfile,
    pub service: String,
    pub retries: u32,
    pub retry_timeout: Duration,
    /// Deadline of each attempt
    pub request_timeout: Option<Duration>,
}

impl ProxyTransport {
    /// Send the request, retrying failed attempts. PUT and POST are never retried, nor are
    /// streaming bodies or exchanges the client abandoned.
    pub async fn round_trip(
        &self,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: OutgoingBody,
    ) -> HttpClientResult<Response<Body>> {
        let replayable = matches!(body, OutgoingBody::Buffered(_))
            && method != Method::PUT
            && method != Method::POST;
        let attempts = if replayable { self.retries + 1 } else { 1 };

        let mut body = Some(body);
        let mut last_err = None;
        for attempt in 1..=attempts {
            let attempt_body = match body.take() {
                Some(OutgoingBody::Buffered(bytes)) => {
                    body = Some(OutgoingBody::Buffered(bytes.clone()));
                    Body::from(bytes)
                }
                Some(OutgoingBody::Streaming(stream)) => stream,
                None => Body::empty(),
            };
            let mut req = Request::builder()
                .method(method.clone())
                .uri(uri.clone())
                .body(attempt_body)
                .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?;
            *req.headers_mut() = headers.clone();

            let span = create_upstream_span(&self.service, &uri.to_string(), attempt);
            let started = Instant::now();
            let result = match self.request_timeout.filter(|t| !t.is_zero()) {
                Some(limit) => timeout(limit, self.client.send_request(req, self.profile))
                    .instrument(span.clone())
                    .await
                    .unwrap_or(Err(HttpClientError::Timeout(limit))),
                None => {
                    self.client
                        .send_request(req, self.profile)
                        .instrument(span.clone())
                        .await
                }
            };
            span.record("duration_ms", started.elapsed().as_millis() as u64);

            match result {
                Ok(response) => {
                    span.record("http.status_code", response.status().as_u16());
                    return Ok(response);
                }
                Err(e) if e.is_canceled() => return Err(e),
                Err(e) => {
                    debug!(service = %self.service, attempt, error = %e, "Upstream attempt failed");
                    last_err = Some(e);
                    if attempt < attempts && !self.retry_timeout.is_zero() {
                        sleep(self.retry_timeout).await;
                    }
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| HttpClientError::ConnectionError("no attempt was made".into())))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;

    fn inbound() -> Inbound {
        Inbound {
            host: "gw.example.com".into(),
            remote_ip: "10.0.0.7".parse().unwrap(),
            secure: false,
        }
    }

    #[test]
    fn test_rewrite_joins_paths_and_queries() {
        let upstream = Url::parse("http://u:8080/v1?key=1").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("gw.example.com"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        let uri = rewrite(
            &upstream,
            "/a/b",
            Some("x=2"),
            &mut headers,
            &inbound(),
            &RewriteOptions::default(),
        )
        .unwrap();
        assert_eq!(uri.to_string(), "http://u:8080/v1/a/b?key=1&x=2");
        assert!(headers.get(header::HOST).is_none());
        assert!(headers.get(header::CONNECTION).is_none());
        assert_eq!(headers["x-forwarded-for"], "10.0.0.7");
        assert_eq!(headers["x-forwarded-host"], "gw.example.com");
        assert_eq!(headers["x-forwarded-proto"], "http");
    }

    #[test]
    fn test_rewrite_strip_and_preserve() {
        let upstream = Url::parse("http://u/").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("gw.example.com"));
        headers.insert("x-real-ip", HeaderValue::from_static("1.1.1.1"));
        let opts = RewriteOptions {
            strip_prefix: Some("/api".into()),
            preserve_host: true,
            disable_query_params: true,
            disable_x_forwarded_headers: true,
        };
        let uri = rewrite(&upstream, "/api/x", Some("q=1"), &mut headers, &inbound(), &opts).unwrap();
        assert_eq!(uri.to_string(), "http://u/x");
        assert_eq!(headers[header::HOST], "gw.example.com");
        assert!(headers.get("x-real-ip").is_none());

        let uri = rewrite(&upstream, "/api", None, &mut headers, &inbound(), &opts).unwrap();
        assert_eq!(uri.path(), "/");
    }

    #[test]
    fn test_parse_upstream_schemes() {
        assert_eq!(parse_upstream("ws://a/x", false).unwrap().as_str(), "http://a/x");
        assert_eq!(parse_upstream("wss://a", false).unwrap().scheme(), "https");
        assert_eq!(parse_upstream("a:81/p", true).unwrap().as_str(), "https://a:81/p");
        assert!(parse_upstream("http://", false).is_err());
    }

    struct FlakyClient {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl HttpClient for FlakyClient {
        async fn send_request(
            &self,
            _req: Request<Body>,
            _profile: ClientProfile,
        ) -> HttpClientResult<Response<Body>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(HttpClientError::ConnectionError("refused".into()));
            }
            Ok(Response::new(Body::from("ok")))
        }
    }

    fn transport(client: Arc<FlakyClient>, retries: u32) -> ProxyTransport {
        ProxyTransport {
            client,
            profile: ClientProfile::default(),
            service: "s1".into(),
            retries,
            retry_timeout: Duration::ZERO,
            request_timeout: None,
        }
    }

    #[tokio::test]
    async fn test_retries_idempotent_requests() {
        let client = Arc::new(FlakyClient {
            calls: AtomicU32::new(0),
            fail_first: 2,
        });
        let result = transport(client.clone(), 3)
            .round_trip(
                Method::GET,
                Uri::from_static("http://u/"),
                HeaderMap::new(),
                OutgoingBody::Buffered(Bytes::new()),
            )
            .await;
        assert!(result.is_ok());
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_post_is_not_retried() {
        let client = Arc::new(FlakyClient {
            calls: AtomicU32::new(0),
            fail_first: 1,
        });
        let result = transport(client.clone(), 3)
            .round_trip(
                Method::POST,
                Uri::from_static("http://u/"),
                HeaderMap::new(),
                OutgoingBody::Buffered(Bytes::from_static(b"{}")),
            )
            .await;
        assert!(matches!(result, Err(HttpClientError::ConnectionError(_))));
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }
}

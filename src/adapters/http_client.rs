use std::{error::Error as StdError, sync::Arc};

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{Request, Response, Version, header, header::HeaderValue};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustls::{
    DigitallySignedStruct, RootCertStore, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    pki_types::{CertificateDer, ServerName, UnixTime},
};
use rustls_native_certs::load_native_certs;
use tokio::time::timeout;
use tracing::Instrument;

use crate::{
    config::TransportConfig,
    ports::http_client::{ClientProfile, HttpClient, HttpClientError, HttpClientResult},
};

type UpstreamClient = Client<HttpsConnector<HttpConnector>, AxumBody>;

/// HTTP client adapter using Hyper with Rustls (HTTP/1.1 + HTTP/2).
///
/// Upstreams differ in dial timeout, certificate checking and protocol, so one pooled
/// client is kept per [`ClientProfile`] and built on first use.
pub struct HttpClientAdapter {
    clients: scc::HashMap<ClientProfile, UpstreamClient>,
    transport: TransportConfig,
    roots: Arc<RootCertStore>,
}

impl HttpClientAdapter {
    /// Create a new HTTP client adapter.
    pub fn new(transport: TransportConfig) -> Self {
        // Install default crypto provider for rustls if not already set
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut root_cert_store = RootCertStore::empty();
        let native_certs = load_native_certs();
        for cert in native_certs.certs {
            if root_cert_store.add(cert).is_err() {
                tracing::warn!("Failed to add native certificate to rustls RootCertStore");
            }
        }
        if !native_certs.errors.is_empty() {
            tracing::warn!(
                "Some native certificates failed to load: {:?}",
                native_certs.errors
            );
        }
        tracing::debug!(roots = root_cert_store.len(), "Loaded native root certificates");

        Self {
            clients: scc::HashMap::new(),
            transport,
            roots: Arc::new(root_cert_store),
        }
    }

    /// Number of distinct connection pools built so far.
    pub fn pool_count(&self) -> usize {
        self.clients.len()
    }

    fn build_client(&self, profile: ClientProfile) -> UpstreamClient {
        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false); // Allow HTTPS URLs
        http_connector.set_nodelay(true);
        http_connector.set_connect_timeout(Some(profile.connect_timeout));

        let tls_config = if profile.tls_skip_verify {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoCertVerifier))
                .with_no_client_auth()
        } else {
            rustls::ClientConfig::builder()
                .with_root_certificates(self.roots.clone())
                .with_no_client_auth()
        };

        let builder = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http();
        let https_connector = if profile.http2_only {
            builder.enable_http2().wrap_connector(http_connector)
        } else {
            builder
                .enable_http1()
                .enable_http2()
                .wrap_connector(http_connector)
        };

        tracing::debug!(?profile, "Created upstream HTTP client");
        Client::builder(TokioExecutor::new())
            .pool_idle_timeout(self.transport.idle_conn_timeout)
            .pool_max_idle_per_host(self.transport.max_idle_conns_per_host)
            .http2_only(profile.http2_only)
            .build(https_connector)
    }

    async fn client_for(&self, profile: ClientProfile) -> UpstreamClient {
        if let Some(client) = self.clients.read_async(&profile, |_, c| c.clone()).await {
            return client;
        }
        self.clients
            .entry_async(profile)
            .await
            .or_insert_with(|| self.build_client(profile))
            .get()
            .clone()
    }
}

/// Walk the error chain looking for signs that the exchange was cut short rather than
/// refused by the upstream.
fn classify(err: &(dyn StdError + 'static)) -> Option<HttpClientError> {
    let mut source = Some(err);
    while let Some(e) = source {
        if let Some(h) = e.downcast_ref::<hyper::Error>()
            && (h.is_canceled() || h.is_incomplete_message() || h.is_body_write_aborted())
        {
            return Some(HttpClientError::Canceled(err.to_string()));
        }
        if let Some(io) = e.downcast_ref::<std::io::Error>()
            && io.kind() == std::io::ErrorKind::UnexpectedEof
        {
            return Some(HttpClientError::Canceled(err.to_string()));
        }
        source = e.source();
    }
    None
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn send_request(
        &self,
        mut req: Request<AxumBody>,
        profile: ClientProfile,
    ) -> HttpClientResult<Response<AxumBody>> {
        let client = self.client_for(profile).await;

        // Extract upstream information for logging and metrics
        let upstream = format!(
            "{}://{}",
            req.uri().scheme_str().unwrap_or("http"),
            req.uri()
                .authority()
                .map_or_else(|| "unknown".to_string(), |a| a.to_string())
        );

        let span = tracing::debug_span!(
            "upstream_request",
            upstream.url = %upstream,
            http.method = %req.method(),
            http.path = %req.uri().path(),
            http.status_code = tracing::field::Empty,
        );

        // Set Host header if not present
        if !req.headers().contains_key(header::HOST) {
            let Some(authority) = req.uri().authority() else {
                return Err(HttpClientError::InvalidRequest(format!(
                    "outgoing URI has no host: {}",
                    req.uri()
                )));
            };
            let value = HeaderValue::from_str(authority.as_str())
                .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?;
            req.headers_mut().insert(header::HOST, value);
        }

        let (mut parts, body) = req.into_parts();
        parts.version = Version::HTTP_11;
        tracing::debug!(parent: &span, "Outgoing request headers: {:?}", parts.headers);
        let outgoing = Request::from_parts(parts, body);

        let header_timeout = self.transport.response_header_timeout;
        let exchange = async {
            if header_timeout.is_zero() {
                return Ok(client.request(outgoing).await);
            }
            timeout(header_timeout, client.request(outgoing)).await
        }
        .instrument(span.clone());

        match exchange.await {
            Ok(Ok(response)) => {
                span.record("http.status_code", response.status().as_u16());
                let (mut parts, hyper_body) = response.into_parts();
                // The body is re-framed by the downstream server.
                parts.headers.remove(header::TRANSFER_ENCODING);
                Ok(Response::from_parts(parts, AxumBody::new(hyper_body)))
            }
            Ok(Err(e)) => {
                span.record("http.status_code", 599u16);
                tracing::debug!(parent: &span, error = %e, "Upstream request failed");
                Err(classify(&e).unwrap_or_else(|| {
                    HttpClientError::ConnectionError(format!("request to {upstream} failed: {e}"))
                }))
            }
            Err(_) => Err(HttpClientError::Timeout(header_timeout)),
        }
    }
}

/// Certificate verifier for services configured with `tls_skip_verify`.
#[derive(Debug)]
struct NoCertVerifier;

impl ServerCertVerifier for NoCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

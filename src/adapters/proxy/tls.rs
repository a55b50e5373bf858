//! SNI based certificate selection for the TLS listener.
use std::{collections::HashMap, fmt, io::BufReader, path::Path, sync::Arc};

use arc_swap::ArcSwap;
use eyre::{Result, WrapErr, eyre};
use parking_lot::RwLock;
use rustls::{
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
};
use tracing::{debug, warn};

use crate::core::{pattern::match_any, resource_graph::DomainRecord};

/// Domain with TLS material, as captured at the last reload.
#[derive(Debug, Clone)]
pub struct TlsDomain {
    pub namespace: String,
    pub name: String,
    pub patterns: Vec<String>,
    pub created_at_ms: i64,
    pub cert: String,
    pub key: String,
}

impl TlsDomain {
    /// Domains carrying both a certificate and a key, in priority order.
    pub fn from_records(records: &[DomainRecord]) -> Vec<Self> {
        records
            .iter()
            .filter(|r| !r.domain.cert.is_empty() && !r.domain.key.is_empty())
            .map(|r| TlsDomain {
                namespace: r.domain.namespace.clone(),
                name: r.domain.name.clone(),
                patterns: r.domain.patterns.clone(),
                created_at_ms: r.created_at.timestamp_millis(),
                cert: r.domain.cert.clone(),
                key: r.domain.key.clone(),
            })
            .collect()
    }

    fn cache_key(&self) -> CertKey {
        (self.namespace.clone(), self.name.clone(), self.created_at_ms)
    }
}

type CertKey = (String, String, i64);

/// Parse a PEM certificate chain and private key into a signing key.
pub fn certified_key_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<CertifiedKey> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_pem))
        .collect::<Result<Vec<_>, _>>()
        .wrap_err("failed to parse certificate PEM")?;
    if certs.is_empty() {
        return Err(eyre!("no certificate found in PEM"));
    }
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_pem))
        .wrap_err("failed to parse private key PEM")?
        .ok_or_else(|| eyre!("no private key found in PEM"))?;
    let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&key)
        .map_err(|e| eyre!("unsupported private key: {e}"))?;
    Ok(CertifiedKey::new(certs, signing_key))
}

pub fn certified_key_from_files(cert_file: &Path, key_file: &Path) -> Result<CertifiedKey> {
    let cert = std::fs::read(cert_file)
        .wrap_err_with(|| format!("failed to read {}", cert_file.display()))?;
    let key = std::fs::read(key_file)
        .wrap_err_with(|| format!("failed to read {}", key_file.display()))?;
    certified_key_from_pem(&cert, &key)
}

/// Picks the certificate of the highest priority domain matching the SNI name, falling back
/// to the statically configured one.
pub struct DomainCertResolver {
    domains: ArcSwap<Vec<TlsDomain>>,
    certs: RwLock<HashMap<CertKey, Arc<CertifiedKey>>>,
    fallback: Option<Arc<CertifiedKey>>,
}

impl fmt::Debug for DomainCertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainCertResolver")
            .field("domains", &self.domains.load().len())
            .field("cached", &self.certs.read().len())
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl DomainCertResolver {
    pub fn new(fallback: Option<CertifiedKey>) -> Self {
        Self {
            domains: ArcSwap::from_pointee(Vec::new()),
            certs: RwLock::new(HashMap::new()),
            fallback: fallback.map(Arc::new),
        }
    }

    /// Swap in the domains of a reload and drop certificates of replaced domains.
    pub fn update(&self, domains: Vec<TlsDomain>) {
        let live: Vec<CertKey> = domains.iter().map(TlsDomain::cache_key).collect();
        self.certs.write().retain(|k, _| live.contains(k));
        self.domains.store(Arc::new(domains));
    }

    pub fn cached(&self) -> usize {
        self.certs.read().len()
    }

    /// Certificate for `server_name`, if any.
    pub fn select(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
        if let Some(name) = server_name {
            let domains = self.domains.load();
            for domain in domains.iter() {
                match match_any(name, &domain.patterns) {
                    Ok(Some(_)) => {}
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(domain = %domain.name, error = %e, "Invalid domain pattern");
                        continue;
                    }
                }
                let key = domain.cache_key();
                if let Some(cert) = self.certs.read().get(&key) {
                    return Some(cert.clone());
                }
                match certified_key_from_pem(domain.cert.as_bytes(), domain.key.as_bytes()) {
                    Ok(cert) => {
                        let cert = Arc::new(cert);
                        self.certs.write().insert(key, cert.clone());
                        debug!(domain = %domain.name, namespace = %domain.namespace, "Loaded domain certificate");
                        return Some(cert);
                    }
                    Err(e) => {
                        warn!(domain = %domain.name, namespace = %domain.namespace, error = %e, "Bad domain certificate");
                    }
                }
            }
        }
        self.fallback.clone()
    }
}

impl ResolvesServerCert for DomainCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.select(client_hello.server_name())
    }
}

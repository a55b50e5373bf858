//! Configuration data structures for DGate.
//!
//! These types map directly to YAML (also JSON / TOML) configuration files. They are
//! serde-friendly and carry defaults so that minimal configs stay short.
use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Serialize};

use crate::core::resources::{
    Collection, Document, Domain, Module, ModuleType, Namespace, Route, Secret, Service,
};

/// Top-level node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DGateConfig {
    pub version: String,
    pub log_level: String,
    pub log_json: bool,
    /// Identifier reported in logs; defaults to the replication id when unset
    pub node_id: String,
    /// Adds diagnostic details to error responses and headers
    pub debug: bool,
    /// Tags of this node, exposed to upstreams as `X-DGate-Tags`
    pub tags: Vec<String>,
    pub disable_default_namespace: bool,
    pub disable_metrics: bool,
    pub storage: StorageConfig,
    pub proxy: ProxyConfig,
    pub admin: Option<AdminConfig>,
    pub metrics: MetricsConfig,
}

impl Default for DGateConfig {
    fn default() -> Self {
        Self {
            version: "v1".to_string(),
            log_level: "info".to_string(),
            log_json: false,
            node_id: String::new(),
            debug: false,
            tags: Vec::new(),
            disable_default_namespace: false,
            disable_metrics: false,
            storage: StorageConfig::default(),
            proxy: ProxyConfig::default(),
            admin: None,
            metrics: MetricsConfig::default(),
        }
    }
}

impl DGateConfig {
    pub fn replication(&self) -> Option<&ReplicationConfig> {
        self.admin.as_ref().and_then(|a| a.replication.as_ref())
    }

    pub fn watch_only(&self) -> bool {
        self.admin.as_ref().is_some_and(|a| a.watch_only)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    Memory,
    File,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    #[serde(rename = "type")]
    pub kind: StorageKind,
    /// Directory for the file engine
    pub dir: Option<String>,
}

/// Data plane configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    pub tls: Option<ProxyTlsConfig>,
    pub enable_http2: bool,
    /// Forward script `console.*` output to the log
    pub enable_console_logger: bool,
    /// Host patterns whose plaintext requests are redirected to https
    pub redirect_https: Vec<String>,
    /// When non-empty, only hosts matching one of these patterns are served
    pub allowed_domains: Vec<String>,
    /// Headers set on every proxied response
    pub global_headers: BTreeMap<String, String>,
    pub disable_x_forwarded_headers: bool,
    pub client_transport: TransportConfig,
    pub module_pool: ModulePoolConfig,
    pub init_resources: Option<InitResources>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 80,
            tls: None,
            enable_http2: false,
            enable_console_logger: false,
            redirect_https: Vec::new(),
            allowed_domains: Vec::new(),
            global_headers: BTreeMap::new(),
            disable_x_forwarded_headers: false,
            client_transport: TransportConfig::default(),
            module_pool: ModulePoolConfig::default(),
            init_resources: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyTlsConfig {
    pub port: u16,
    /// Fallback certificate used when no domain certificate matches
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
}

impl Default for ProxyTlsConfig {
    fn default() -> Self {
        Self {
            port: 443,
            cert_file: None,
            key_file: None,
        }
    }
}

/// Upstream connection defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    #[serde(with = "crate::utils::duration")]
    pub dial_timeout: Duration,
    #[serde(with = "crate::utils::duration")]
    pub tls_handshake_timeout: Duration,
    #[serde(with = "crate::utils::duration")]
    pub response_header_timeout: Duration,
    pub max_idle_conns_per_host: usize,
    #[serde(with = "crate::utils::duration")]
    pub idle_conn_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(10),
            tls_handshake_timeout: Duration::from_secs(10),
            response_header_timeout: Duration::from_secs(10),
            max_idle_conns_per_host: 32,
            idle_conn_timeout: Duration::from_secs(90),
        }
    }
}

/// Sizing of each route's script runtime pool
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ModulePoolConfig {
    pub min: usize,
    pub max: usize,
    /// Iterations a single script loop may run before it is aborted
    pub loop_iteration_limit: u64,
    pub recursion_limit: usize,
}

impl Default for ModulePoolConfig {
    fn default() -> Self {
        Self {
            min: 1,
            max: 128,
            loop_iteration_limit: 10_000_000,
            recursion_limit: 512,
        }
    }
}

/// Resources created at startup, before any change log is replayed
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InitResources {
    pub skip_validation: bool,
    pub namespaces: Vec<Namespace>,
    pub services: Vec<Service>,
    pub routes: Vec<Route>,
    pub modules: Vec<ModuleSpec>,
    pub domains: Vec<DomainSpec>,
    pub collections: Vec<Collection>,
    pub documents: Vec<Document>,
    pub secrets: Vec<Secret>,
}

/// A module whose source is given inline (plain text) or read from `payload_file`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleSpec {
    pub name: String,
    pub namespace: String,
    pub payload: Option<String>,
    pub payload_file: Option<String>,
    #[serde(rename = "moduleType")]
    pub module_type: ModuleType,
    pub tags: Vec<String>,
}

impl ModuleSpec {
    /// Module record with the given base64 payload.
    pub fn to_module(&self, payload_b64: String) -> Module {
        Module {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            payload: payload_b64,
            module_type: self.module_type,
            tags: self.tags.clone(),
        }
    }
}

/// A domain whose certificate and key may be read from files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainSpec {
    pub name: String,
    pub namespace: String,
    pub patterns: Vec<String>,
    pub priority: i32,
    pub cert: String,
    pub key: String,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    pub tags: Vec<String>,
}

impl DomainSpec {
    pub fn to_domain(&self, cert: String, key: String) -> Domain {
        Domain {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            patterns: self.patterns.clone(),
            priority: self.priority,
            cert,
            key,
            tags: self.tags.clone(),
        }
    }
}

/// Admin API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub host: String,
    pub port: u16,
    /// IPs or CIDR ranges allowed to reach the admin API; empty allows everyone
    pub allow_list: Vec<String>,
    /// Join the cluster as a non-voter and refuse local writes
    pub watch_only: bool,
    pub replication: Option<ReplicationConfig>,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9080,
            allow_list: Vec::new(),
            watch_only: false,
            replication: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Raft server id of this node
    pub id: String,
    /// Required in `X-DGate-Shared-Key` on `/raftadmin` calls when set
    pub shared_key: Option<String>,
    pub bootstrap_cluster: bool,
    /// DNS name resolving to the admin APIs of existing members
    pub discovery_domain: Option<String>,
    /// Admin addresses (`host:port`) of existing members
    pub cluster_address: Vec<String>,
    /// Address other members use to reach this node's admin API
    pub advert_address: Option<String>,
    pub advert_scheme: String,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            shared_key: None,
            bootstrap_cluster: false,
            discovery_domain: None,
            cluster_address: Vec::new(),
            advert_address: None,
            advert_scheme: "http".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// OTLP gRPC endpoint, e.g. `http://localhost:4317`
    pub otlp_endpoint: Option<String>,
    pub export_interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            otlp_endpoint: None,
            export_interval_secs: 60,
        }
    }
}

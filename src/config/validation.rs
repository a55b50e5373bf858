#![allow(clippy::collapsible_if)]

use std::{
    collections::HashSet,
    net::{IpAddr, SocketAddr},
};

use crate::{
    config::models::{
        AdminConfig, DGateConfig, InitResources, ProxyConfig, ReplicationConfig, StorageKind,
    },
    core::{
        pattern::validate_pattern,
        resource_graph::validate_methods,
        resources::{CollectionType, DEFAULT_NAMESPACE},
    },
    utils::IpList,
};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Invalid TLS configuration: {message}")]
    InvalidTls { message: String },

    #[error("Invalid init resources: {message}")]
    InvalidInitResources { message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Node configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the entire node configuration
    pub fn validate(config: &DGateConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if config.storage.kind == StorageKind::File
            && config.storage.dir.as_deref().is_none_or(str::is_empty)
        {
            errors.push(ValidationError::MissingField {
                field: "storage.dir".to_string(),
            });
        }

        if let Err(mut proxy_errors) = Self::validate_proxy(&config.proxy) {
            errors.append(&mut proxy_errors);
        }

        if let Some(admin) = &config.admin {
            if let Err(mut admin_errors) = Self::validate_admin(admin) {
                errors.append(&mut admin_errors);
            }
        }

        if let Some(init) = &config.proxy.init_resources {
            if !init.skip_validation {
                if let Err(e) = Self::validate_init_resources(init, !config.disable_default_namespace)
                {
                    errors.push(e);
                }
            }
        }

        if let Some(endpoint) = &config.metrics.otlp_endpoint {
            if let Err(e) = Self::validate_url(endpoint, "metrics.otlp_endpoint") {
                errors.push(e);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    fn validate_proxy(proxy: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&proxy.host, proxy.port, "proxy") {
            errors.push(e);
        }

        if let Some(tls) = &proxy.tls {
            if tls.port == 0 {
                errors.push(ValidationError::InvalidTls {
                    message: "proxy.tls.port must be non-zero".to_string(),
                });
            }
            if tls.cert_file.is_some() != tls.key_file.is_some() {
                errors.push(ValidationError::InvalidTls {
                    message: "cert_file and key_file must both be set, or neither".to_string(),
                });
            }
        }

        for (field, patterns) in [
            ("proxy.allowed_domains", &proxy.allowed_domains),
            ("proxy.redirect_https", &proxy.redirect_https),
        ] {
            for pattern in patterns {
                if let Err(e) = validate_pattern(pattern) {
                    errors.push(ValidationError::InvalidField {
                        field: field.to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }

        for name in proxy.global_headers.keys() {
            if http::HeaderName::from_bytes(name.as_bytes()).is_err() {
                errors.push(ValidationError::InvalidField {
                    field: "proxy.global_headers".to_string(),
                    message: format!("invalid header name '{name}'"),
                });
            }
        }

        if proxy.module_pool.min > proxy.module_pool.max || proxy.module_pool.max == 0 {
            errors.push(ValidationError::InvalidField {
                field: "proxy.module_pool".to_string(),
                message: format!(
                    "min ({}) must not exceed max ({}) and max must be non-zero",
                    proxy.module_pool.min, proxy.module_pool.max
                ),
            });
        }
        if proxy.module_pool.loop_iteration_limit == 0 || proxy.module_pool.recursion_limit == 0 {
            errors.push(ValidationError::InvalidField {
                field: "proxy.module_pool".to_string(),
                message: "script loop and recursion limits must be non-zero".to_string(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_admin(admin: &AdminConfig) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&admin.host, admin.port, "admin") {
            errors.push(e);
        }

        for entry in &admin.allow_list {
            if IpList::default().add(entry).is_err() {
                errors.push(ValidationError::InvalidField {
                    field: "admin.allow_list".to_string(),
                    message: format!("'{entry}' is not an IP address or CIDR range"),
                });
            }
        }

        if let Some(replication) = &admin.replication {
            if let Err(mut replication_errors) = Self::validate_replication(replication) {
                errors.append(&mut replication_errors);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_replication(replication: &ReplicationConfig) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if replication.id.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "admin.replication.id".to_string(),
            });
        }

        if !matches!(replication.advert_scheme.as_str(), "http" | "https") {
            errors.push(ValidationError::InvalidField {
                field: "admin.replication.advert_scheme".to_string(),
                message: format!(
                    "must be 'http' or 'https', got '{}'",
                    replication.advert_scheme
                ),
            });
        }

        if !replication.bootstrap_cluster
            && replication.discovery_domain.is_none()
            && replication.cluster_address.is_empty()
        {
            errors.push(ValidationError::InvalidField {
                field: "admin.replication".to_string(),
                message: "bootstrap_cluster, discovery_domain or cluster_address is required"
                    .to_string(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Structural checks on `init_resources`. Stops at the first problem, like the
    /// admin API would for a single resource.
    pub fn validate_init_resources(
        init: &InitResources,
        default_namespace: bool,
    ) -> ValidationResult<()> {
        let invalid = |message: String| ValidationError::InvalidInitResources { message };

        let mut namespaces = HashSet::new();
        if default_namespace {
            namespaces.insert(DEFAULT_NAMESPACE.to_string());
        }
        for ns in &init.namespaces {
            if ns.name.is_empty() {
                return Err(invalid("namespace name must be specified".into()));
            }
            if !namespaces.insert(ns.name.clone()) && ns.name != DEFAULT_NAMESPACE {
                return Err(invalid(format!("duplicate namespace: {}", ns.name)));
            }
        }
        let check_ns = |kind: &str, name: &str, ns: &str| -> ValidationResult<()> {
            if ns.is_empty() {
                return Err(invalid(format!("{kind} ({name}) must specify namespace")));
            }
            if !namespaces.contains(ns) {
                return Err(invalid(format!(
                    "{kind} ({name}) references non-existent namespace ({ns})"
                )));
            }
            Ok(())
        };

        let mut modules = HashSet::new();
        for module in &init.modules {
            if module.name.is_empty() {
                return Err(invalid("module name must be specified".into()));
            }
            if !modules.insert((module.name.as_str(), module.namespace.as_str())) {
                return Err(invalid(format!("duplicate module: {}", module.name)));
            }
            check_ns("module", &module.name, &module.namespace)?;
            match (&module.payload, &module.payload_file) {
                (None, None) => {
                    return Err(invalid(
                        "module payload or payload file must be specified".into(),
                    ));
                }
                (Some(_), Some(_)) => {
                    return Err(invalid(
                        "module payload and payload file cannot both be specified".into(),
                    ));
                }
                _ => {}
            }
        }

        let mut services = HashSet::new();
        for service in &init.services {
            if service.name.is_empty() {
                return Err(invalid("service name must be specified".into()));
            }
            if !services.insert((service.name.as_str(), service.namespace.as_str())) {
                return Err(invalid(format!("duplicate service: {}", service.name)));
            }
            check_ns("service", &service.name, &service.namespace)?;
            for (i, url) in service.urls.iter().enumerate() {
                Self::validate_url(url, &format!("service '{}' url {}", service.name, i + 1))?;
            }
        }

        let mut routes = HashSet::new();
        for route in &init.routes {
            if route.name.is_empty() {
                return Err(invalid("route name must be specified".into()));
            }
            if !routes.insert((route.name.as_str(), route.namespace.as_str())) {
                return Err(invalid(format!("duplicate route: {}", route.name)));
            }
            check_ns("route", &route.name, &route.namespace)?;
            if let Some(service) = route.service_name() {
                if !services.contains(&(service, route.namespace.as_str())) {
                    return Err(invalid(format!(
                        "route ({}) references non-existent service ({service})",
                        route.name
                    )));
                }
            }
            for module in &route.modules {
                if !modules.contains(&(module.as_str(), route.namespace.as_str())) {
                    return Err(invalid(format!(
                        "route ({}) references non-existent module ({module})",
                        route.name
                    )));
                }
            }
            if route.paths.is_empty() {
                return Err(invalid(format!("route ({}) must specify paths", route.name)));
            }
            validate_methods(&route.methods)
                .map_err(|e| invalid(format!("route ({}): {e}", route.name)))?;
        }

        let mut domains = HashSet::new();
        for domain in &init.domains {
            if domain.name.is_empty() {
                return Err(invalid("domain name must be specified".into()));
            }
            if !domains.insert((domain.name.as_str(), domain.namespace.as_str())) {
                return Err(invalid(format!("duplicate domain: {}", domain.name)));
            }
            check_ns("domain", &domain.name, &domain.namespace)?;
            if !domain.cert.is_empty() && domain.cert_file.is_some() {
                return Err(invalid(
                    "domain cert and cert file cannot both be specified".into(),
                ));
            }
            if !domain.key.is_empty() && domain.key_file.is_some() {
                return Err(invalid(
                    "domain key and key file cannot both be specified".into(),
                ));
            }
            let has_cert = !domain.cert.is_empty() || domain.cert_file.is_some();
            let has_key = !domain.key.is_empty() || domain.key_file.is_some();
            if has_cert != has_key {
                return Err(invalid(
                    "domain cert (file) and key (file) must both be specified, or neither".into(),
                ));
            }
            for pattern in &domain.patterns {
                validate_pattern(pattern)
                    .map_err(|e| invalid(format!("domain ({}): {e}", domain.name)))?;
            }
        }

        let mut collections = HashSet::new();
        for collection in &init.collections {
            if collection.name.is_empty() {
                return Err(invalid("collection name must be specified".into()));
            }
            if !collections.insert((collection.name.as_str(), collection.namespace.as_str())) {
                return Err(invalid(format!("duplicate collection: {}", collection.name)));
            }
            check_ns("collection", &collection.name, &collection.namespace)?;
            if collection.schema.is_none() {
                return Err(invalid(format!(
                    "collection ({}) must specify schema",
                    collection.name
                )));
            }
        }

        let mut documents = HashSet::new();
        for document in &init.documents {
            if document.id.is_empty() {
                return Err(invalid("document ID must be specified".into()));
            }
            if !documents.insert((
                document.id.as_str(),
                document.collection.as_str(),
                document.namespace.as_str(),
            )) {
                return Err(invalid(format!("duplicate document: {}", document.id)));
            }
            check_ns("document", &document.id, &document.namespace)?;
            let collection = init.collections.iter().find(|c| {
                c.name == document.collection && c.namespace == document.namespace
            });
            match collection {
                None => {
                    return Err(invalid(format!(
                        "document ({}) references non-existent collection ({})",
                        document.id, document.collection
                    )));
                }
                Some(c) if c.kind != CollectionType::Document => {
                    return Err(invalid(format!(
                        "document ({}) references fetcher collection ({})",
                        document.id, document.collection
                    )));
                }
                Some(_) => {}
            }
        }

        let mut secrets = HashSet::new();
        for secret in &init.secrets {
            if secret.name.is_empty() {
                return Err(invalid("secret name must be specified".into()));
            }
            if !secrets.insert((secret.name.as_str(), secret.namespace.as_str())) {
                return Err(invalid(format!("duplicate secret: {}", secret.name)));
            }
            check_ns("secret", &secret.name, &secret.namespace)?;
        }

        Ok(())
    }

    fn validate_listen_address(host: &str, port: u16, context: &str) -> ValidationResult<()> {
        let address = format!("{host}:{port}");
        if port == 0 {
            return Err(ValidationError::InvalidListenAddress {
                address,
                reason: format!("{context} port must be non-zero"),
            });
        }
        if host.is_empty() {
            return Err(ValidationError::InvalidListenAddress {
                address,
                reason: format!("{context} host must not be empty"),
            });
        }
        if host.parse::<IpAddr>().is_err() && address.parse::<SocketAddr>().is_err() {
            // Hostnames like `localhost` are resolved at bind time.
            if !host
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
            {
                return Err(ValidationError::InvalidListenAddress {
                    address,
                    reason: "not an IP address or hostname".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Validate URL format
    fn validate_url(url_str: &str, context: &str) -> ValidationResult<()> {
        match url::Url::parse(url_str) {
            Ok(url) => {
                if !matches!(url.scheme(), "http" | "https" | "ws" | "wss") {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: format!(
                            "URL scheme must be 'http', 'https', 'ws' or 'wss', got '{}'",
                            url.scheme()
                        ),
                    });
                }

                if url.host().is_none() {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: "URL must have a valid host".to_string(),
                    });
                }

                Ok(())
            }
            Err(e) => Err(ValidationError::InvalidField {
                field: context.to_string(),
                message: format!("Invalid URL format: {e}"),
            }),
        }
    }

    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.is_empty() {
            return "No errors".to_string();
        }

        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}

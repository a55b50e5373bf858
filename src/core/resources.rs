//! Entity records managed by the resource graph.
//!
//! These are the wire shapes used in change-log items, the admin API and `init_resources`.
//! Field names follow the gateway's JSON conventions (camelCase).
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_NAMESPACE: &str = "default";

/// Methods a route may list besides the `"*"` wildcard.
pub const HTTP_METHODS: [&str; 9] = [
    "GET", "HEAD", "POST", "PUT", "PATCH", "DELETE", "CONNECT", "OPTIONS", "TRACE",
];

pub const DEFAULT_RETRIES: u32 = 3;

/// Access to the `(name, namespace)` key shared by every namespaced entity.
pub trait NamespacedResource {
    fn name(&self) -> &str;
    fn namespace(&self) -> &str;
    fn set_namespace(&mut self, namespace: &str);

    /// Graph key, `"{name}/{namespace}"`.
    fn key(&self) -> String {
        resource_key(self.name(), self.namespace())
    }
}

pub fn resource_key(name: &str, namespace: &str) -> String {
    format!("{name}/{namespace}")
}

macro_rules! namespaced {
    ($($ty:ty => $name:ident),+ $(,)?) => {$(
        impl NamespacedResource for $ty {
            fn name(&self) -> &str {
                &self.$name
            }

            fn namespace(&self) -> &str {
                &self.namespace
            }

            fn set_namespace(&mut self, namespace: &str) {
                self.namespace = namespace.to_string();
            }
        }
    )+};
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl Namespace {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tags: Vec::new(),
        }
    }

    pub fn default_namespace() -> Self {
        Self {
            name: DEFAULT_NAMESPACE.to_string(),
            tags: vec![DEFAULT_NAMESPACE.to_string()],
        }
    }
}

/// Upstream pool with retry policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub name: String,
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    #[serde(
        default,
        with = "crate::utils::duration::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub retry_timeout: Option<Duration>,
    #[serde(
        default,
        with = "crate::utils::duration::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub connect_timeout: Option<Duration>,
    #[serde(
        default,
        with = "crate::utils::duration::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub request_timeout: Option<Duration>,
    #[serde(default)]
    pub tls_skip_verify: bool,
    #[serde(default)]
    pub http2_only: bool,
    #[serde(default, rename = "hideDGateHeaders")]
    pub hide_dgate_headers: bool,
    #[serde(default)]
    pub disable_query_params: bool,
    #[serde(default)]
    pub preserve_host: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl Service {
    pub fn retries(&self) -> u32 {
        self.retries.unwrap_or(DEFAULT_RETRIES)
    }

    pub fn retry_timeout(&self) -> Duration {
        self.retry_timeout.unwrap_or(Duration::ZERO)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub name: String,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub preserve_host: bool,
    #[serde(default)]
    pub strip_path: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modules: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl Route {
    /// The referenced service, treating an empty name as absent.
    pub fn service_name(&self) -> Option<&str> {
        self.service.as_deref().filter(|s| !s.is_empty())
    }

    pub fn matches_any_method(&self) -> bool {
        self.methods.len() == 1 && self.methods[0] == "*"
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleType {
    #[default]
    Javascript,
    Typescript,
}

/// Scripting source attached to routes. `payload` is base64 encoded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Module {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub module_type: ModuleType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// Hostname patterns bound to a namespace, optionally carrying PEM encoded TLS material.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Domain {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cert: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionType {
    #[default]
    Document,
    Fetcher,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionVisibility {
    Public,
    #[default]
    Private,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    #[serde(default, rename = "type")]
    pub kind: CollectionType,
    #[serde(default)]
    pub visibility: CollectionVisibility,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modules: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub collection: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

namespaced! {
    Service => name,
    Route => name,
    Module => name,
    Domain => name,
    Collection => name,
    Document => id,
    Secret => name,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_defaults_and_field_names() {
        let svc: Service = serde_json::from_value(serde_json::json!({
            "name": "s1",
            "urls": ["http://u/"],
            "retryTimeout": "250ms",
            "hideDGateHeaders": true,
        }))
        .unwrap();
        assert_eq!(svc.retries(), DEFAULT_RETRIES);
        assert_eq!(svc.retry_timeout(), Duration::from_millis(250));
        assert!(svc.hide_dgate_headers);
        assert!(svc.namespace.is_empty());

        let json = serde_json::to_value(&svc).unwrap();
        assert_eq!(json["hideDGateHeaders"], true);
        assert!(json.get("retries").is_none());
    }

    #[test]
    fn test_route_service_name_ignores_empty() {
        let mut route = Route {
            name: "r".into(),
            service: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(route.service_name(), None);
        route.service = Some("svc".into());
        assert_eq!(route.service_name(), Some("svc"));
        assert_eq!(route.key(), "r/");
        route.set_namespace("ns");
        assert_eq!(route.key(), "r/ns");
    }

    #[test]
    fn test_collection_type_field() {
        let col: Collection =
            serde_json::from_str(r#"{"name":"c","type":"fetcher","visibility":"public"}"#)
                .unwrap();
        assert_eq!(col.kind, CollectionType::Fetcher);
        assert_eq!(col.visibility, CollectionVisibility::Public);
    }
}

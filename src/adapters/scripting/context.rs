//! State exchanged with a script invocation.
//!
//! The host serializes a [`ScriptState`] to JSON, the prelude wraps it in the `ctx` object the
//! entry point receives, and the (possibly mutated) state comes back alongside the entry
//! point's return value.
use std::collections::BTreeMap;

use http::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use url::form_urlencoded;

/// Header or query values keyed by lowercase name.
pub type MultiMap = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestState {
    pub method: String,
    pub url: String,
    pub path: String,
    #[serde(default)]
    pub query: MultiMap,
    #[serde(default)]
    pub headers: MultiMap,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub body_changed: bool,
    #[serde(default)]
    pub remote_address: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

/// What a script wrote through `ctx.response()`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseState {
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub headers: MultiMap,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub written: bool,
}

impl ResponseState {
    pub fn is_written(&self) -> bool {
        self.written || self.status.is_some()
    }
}

/// Upstream response as seen by `responseModifier`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamState {
    pub status_code: u16,
    #[serde(default)]
    pub headers: MultiMap,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub body_changed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptState {
    pub request: RequestState,
    #[serde(default)]
    pub response: ResponseState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<UpstreamState>,
    #[serde(default)]
    pub service: Option<Value>,
    #[serde(default)]
    pub route: Value,
    #[serde(default)]
    pub namespace: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of a settled entry point.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub value: Value,
    pub state: ScriptState,
}

/// Raw settlement record produced by the prelude.
#[derive(Debug, Deserialize)]
pub(crate) struct Outcome {
    pub ok: bool,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub state: Option<ScriptState>,
    #[serde(default)]
    pub error: Option<String>,
}

pub fn headers_to_map(headers: &HeaderMap) -> MultiMap {
    let mut map = MultiMap::new();
    for (name, value) in headers {
        map.entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    map
}

/// Replace `headers` with the contents of `map`, skipping entries that are not valid HTTP.
pub fn apply_headers(map: &MultiMap, headers: &mut HeaderMap) {
    headers.clear();
    for (name, values) in map {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            warn!(header = %name, "Script set an invalid header name");
            continue;
        };
        for value in values {
            match HeaderValue::from_str(value) {
                Ok(value) => {
                    headers.append(name.clone(), value);
                }
                Err(_) => warn!(header = %name, "Script set an invalid header value"),
            }
        }
    }
}

pub fn parse_query(query: Option<&str>) -> MultiMap {
    let mut map = MultiMap::new();
    if let Some(query) = query {
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            map.entry(key.into_owned())
                .or_default()
                .push(value.into_owned());
        }
    }
    map
}

pub fn encode_query(map: &MultiMap) -> Option<String> {
    if map.is_empty() {
        return None;
    }
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (key, values) in map {
        for value in values {
            serializer.append_pair(key, value);
        }
    }
    Some(serializer.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_uses_camel_case() {
        let state = ScriptState {
            request: RequestState {
                method: "GET".into(),
                remote_address: "127.0.0.1".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["request"]["remoteAddress"], "127.0.0.1");
        assert_eq!(json["request"]["bodyChanged"], false);
        assert!(json.get("upstream").is_none());
    }

    #[test]
    fn test_header_round_trip_skips_invalid() {
        let mut headers = HeaderMap::new();
        headers.append("x-a", HeaderValue::from_static("1"));
        headers.append("x-a", HeaderValue::from_static("2"));
        let mut map = headers_to_map(&headers);
        assert_eq!(map["x-a"], vec!["1", "2"]);

        map.insert("bad header".into(), vec!["x".into()]);
        map.insert("x-b".into(), vec!["ok".into()]);
        apply_headers(&map, &mut headers);
        assert_eq!(headers.get_all("x-a").iter().count(), 2);
        assert_eq!(headers["x-b"], "ok");
        assert_eq!(headers.len(), 3);
    }

    #[test]
    fn test_query_helpers() {
        let map = parse_query(Some("a=1&a=2&b=x%20y"));
        assert_eq!(map["a"], vec!["1", "2"]);
        assert_eq!(map["b"], vec!["x y"]);
        assert_eq!(encode_query(&map).as_deref(), Some("a=1&a=2&b=x+y"));
        assert_eq!(encode_query(&MultiMap::new()), None);
    }
}

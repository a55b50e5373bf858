//! Per-namespace request router.
//!
//! Route paths are matched segment by segment. A segment is either literal text, a
//! `{name}` parameter (optionally `{name:regex}`), or a final `*` which captures the rest of
//! the path. Routes registered with `mount = true` also match every path below them; this is
//! how `strip_path` routes forward sub-paths to their upstream.
//!
//! When several patterns match, exact matches beat prefix matches, then the pattern with the
//! most literal segments wins, then the one registered first.
use std::collections::BTreeMap;

use http::Method;
use regex::Regex;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RouterError {
    #[error("invalid path pattern {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("invalid method: {0}")]
    InvalidMethod(String),
}

pub type RouterResult<T> = Result<T, RouterError>;

#[derive(Debug, Clone)]
enum Segment {
    Static(String),
    Param { name: String, filter: Option<Regex> },
    CatchAll,
}

/// A compiled route path.
#[derive(Debug, Clone)]
pub struct PathPattern {
    raw: String,
    segments: Vec<Segment>,
    mount: bool,
}

impl PathPattern {
    pub fn parse(raw: &str, mount: bool) -> RouterResult<Self> {
        let invalid = |reason: &str| RouterError::InvalidPattern {
            pattern: raw.to_string(),
            reason: reason.to_string(),
        };
        if !raw.starts_with('/') {
            return Err(invalid("must start with '/'"));
        }
        let parts: Vec<&str> = raw.split('/').filter(|s| !s.is_empty()).collect();
        let mut segments = Vec::with_capacity(parts.len());
        for (i, part) in parts.iter().enumerate() {
            if *part == "*" {
                if i + 1 != parts.len() {
                    return Err(invalid("'*' is only allowed as the last segment"));
                }
                segments.push(Segment::CatchAll);
            } else if let Some(inner) = part.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
                let (name, filter) = match inner.split_once(':') {
                    Some((name, expr)) => {
                        let re = Regex::new(&format!("^(?:{expr})$"))
                            .map_err(|e| invalid(&e.to_string()))?;
                        (name, Some(re))
                    }
                    None => (inner, None),
                };
                if name.is_empty() {
                    return Err(invalid("empty parameter name"));
                }
                segments.push(Segment::Param {
                    name: name.to_string(),
                    filter,
                });
            } else if part.contains('{') || part.contains('}') || part.contains('*') {
                return Err(invalid("wildcards and parameters must span a whole segment"));
            } else {
                segments.push(Segment::Static((*part).to_string()));
            }
        }
        Ok(Self {
            raw: raw.to_string(),
            segments,
            mount,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    fn literal_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Static(_)))
            .count()
    }

    /// Match `path`, returning captured params and the unmatched remainder (with its leading
    /// slash) when the pattern ends in `*` or is mounted.
    fn matches(&self, path: &str) -> Option<(BTreeMap<String, String>, Option<String>)> {
        let parts = split_with_offsets(path);
        let mut params = BTreeMap::new();
        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::CatchAll => {
                    let rest = remainder(path, &parts, i);
                    params.insert("*".to_string(), rest.trim_start_matches('/').to_string());
                    return Some((params, Some(rest)));
                }
                Segment::Static(text) => {
                    let (part, _) = parts.get(i)?;
                    if part != text {
                        return None;
                    }
                }
                Segment::Param { name, filter } => {
                    let (part, _) = parts.get(i)?;
                    let value = urlencoding::decode(part)
                        .map(|v| v.into_owned())
                        .unwrap_or_else(|_| (*part).to_string());
                    if filter.as_ref().is_some_and(|re| !re.is_match(&value)) {
                        return None;
                    }
                    params.insert(name.clone(), value);
                }
            }
        }
        if parts.len() == self.segments.len() {
            return Some((params, None));
        }
        if self.mount {
            return Some((params, Some(remainder(path, &parts, self.segments.len()))));
        }
        None
    }
}

fn split_with_offsets(path: &str) -> Vec<(&str, usize)> {
    let mut parts = Vec::new();
    let mut offset = 0;
    for piece in path.split('/') {
        if !piece.is_empty() {
            parts.push((piece, offset));
        }
        offset += piece.len() + 1;
    }
    parts
}

fn remainder(path: &str, parts: &[(&str, usize)], from: usize) -> String {
    match parts.get(from) {
        // offsets point at the segment, the slash before it belongs to the remainder
        Some((_, start)) => path[start.saturating_sub(1)..].to_string(),
        None if path.len() > 1 && path.ends_with('/') => "/".to_string(),
        None => String::new(),
    }
}

/// Result of a successful lookup.
#[derive(Debug, Clone)]
pub struct RouteMatch<'a, T> {
    pub value: &'a T,
    pub pattern: &'a str,
    pub params: BTreeMap<String, String>,
    /// Path below the matched pattern, for `*` and mounted routes.
    pub remainder: Option<String>,
}

#[derive(Debug)]
pub enum Lookup<'a, T> {
    Found(RouteMatch<'a, T>),
    MethodNotAllowed,
    NotFound,
}

#[derive(Debug)]
struct Entry<T> {
    pattern: PathPattern,
    // None matches every method
    method: Option<Method>,
    value: T,
}

/// Router for a single namespace, rebuilt wholesale on every reload.
#[derive(Debug)]
pub struct NamespaceRouter<T> {
    entries: Vec<Entry<T>>,
}

impl<T> Default for NamespaceRouter<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T> NamespaceRouter<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Register `value` for `method` (`"*"` for any) on `path`.
    pub fn insert(&mut self, method: &str, path: &str, mount: bool, value: T) -> RouterResult<()> {
        let method = if method == "*" {
            None
        } else {
            Some(
                Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                    .map_err(|_| RouterError::InvalidMethod(method.to_string()))?,
            )
        };
        self.entries.push(Entry {
            pattern: PathPattern::parse(path, mount)?,
            method,
            value,
        });
        Ok(())
    }

    /// Whether a `(method, path)` pair is registered verbatim.
    pub fn contains(&self, method: &str, path: &str) -> bool {
        self.entries.iter().any(|e| {
            e.pattern.as_str() == path
                && match &e.method {
                    None => method == "*",
                    Some(m) => m.as_str().eq_ignore_ascii_case(method),
                }
        })
    }

    pub fn lookup(&self, method: &Method, path: &str) -> Lookup<'_, T> {
        let mut best: Option<((bool, usize), RouteMatch<'_, T>)> = None;
        let mut path_matched = false;
        for entry in &self.entries {
            let Some((params, remainder)) = entry.pattern.matches(path) else {
                continue;
            };
            path_matched = true;
            if entry.method.as_ref().is_some_and(|m| m != method) {
                continue;
            }
            let rank = (remainder.is_none(), entry.pattern.literal_count());
            if best.as_ref().is_some_and(|(r, _)| *r >= rank) {
                continue;
            }
            best = Some((
                rank,
                RouteMatch {
                    value: &entry.value,
                    pattern: entry.pattern.as_str(),
                    params,
                    remainder,
                },
            ));
        }
        match best {
            Some((_, found)) => Lookup::Found(found),
            None if path_matched => Lookup::MethodNotAllowed,
            None => Lookup::NotFound,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> NamespaceRouter<&'static str> {
        let mut r = NamespaceRouter::new();
        r.insert("GET", "/a", false, "a").unwrap();
        r.insert("GET", "/users/{id}", false, "user").unwrap();
        r.insert("GET", "/users/me", false, "me").unwrap();
        r.insert("*", "/files/*", false, "files").unwrap();
        r.insert("POST", "/api", true, "api").unwrap();
        r.insert("GET", "/num/{n:[0-9]+}", false, "num").unwrap();
        r
    }

    fn found<'a>(r: &'a NamespaceRouter<&'static str>, m: Method, p: &str) -> RouteMatch<'a, &'static str> {
        match r.lookup(&m, p) {
            Lookup::Found(found) => found,
            other => panic!("expected a match for {m} {p}, got {other:?}"),
        }
    }

    #[test]
    fn test_static_and_params() {
        let r = router();
        assert_eq!(*found(&r, Method::GET, "/a").value, "a");
        let user = found(&r, Method::GET, "/users/42");
        assert_eq!(*user.value, "user");
        assert_eq!(user.params["id"], "42");
        assert_eq!(*found(&r, Method::GET, "/users/me").value, "me");
        assert!(matches!(r.lookup(&Method::GET, "/num/x"), Lookup::NotFound));
        assert_eq!(found(&r, Method::GET, "/num/7").params["n"], "7");
    }

    #[test]
    fn test_method_not_allowed_vs_not_found() {
        let r = router();
        assert!(matches!(r.lookup(&Method::POST, "/a"), Lookup::MethodNotAllowed));
        assert!(matches!(r.lookup(&Method::GET, "/nope"), Lookup::NotFound));
        assert!(matches!(r.lookup(&Method::GET, "/a/b"), Lookup::NotFound));
    }

    #[test]
    fn test_catch_all_and_mount_remainders() {
        let r = router();
        let files = found(&r, Method::DELETE, "/files/x/y.txt");
        assert_eq!(files.remainder.as_deref(), Some("/x/y.txt"));
        assert_eq!(files.params["*"], "x/y.txt");

        let api = found(&r, Method::POST, "/api/x");
        assert_eq!(api.remainder.as_deref(), Some("/x"));
        let exact = found(&r, Method::POST, "/api");
        assert_eq!(exact.remainder, None);
    }

    #[test]
    fn test_contains_and_invalid_patterns() {
        let r = router();
        assert!(r.contains("GET", "/a"));
        assert!(r.contains("*", "/files/*"));
        assert!(!r.contains("PUT", "/a"));

        let mut bad = NamespaceRouter::new();
        assert!(bad.insert("GET", "/a/*/b", false, ()).is_err());
        assert!(bad.insert("GET", "no-slash", false, ()).is_err());
        assert!(bad.insert("GET", "/x{y}", false, ()).is_err());
        assert!(bad.insert("GE T", "/x", false, ()).is_err());
    }
}

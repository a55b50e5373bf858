//! Hostname pattern matching shared by domains, `allowed_domains` and `redirect_https`.
//!
//! Supported forms:
//! - `*` matches everything
//! - `*.example.com` suffix match, `api.*` prefix match, `*internal*` substring match
//! - `/regex/` an unanchored regular expression
//! - anything else is an exact match
//!
//! Runs of asterisks collapse to a single one, so `**test**` behaves like `*test*`.
use std::collections::HashMap;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PatternError {
    #[error("empty pattern")]
    Empty,

    #[error("invalid regex pattern {pattern}: {reason}")]
    InvalidRegex { pattern: String, reason: String },
}

static REGEX_CACHE: Lazy<RwLock<HashMap<String, Regex>>> = Lazy::new(Default::default);

fn collapse_asterisks(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    for ch in pattern.chars() {
        if ch == '*' && out.ends_with('*') {
            continue;
        }
        out.push(ch);
    }
    out
}

fn regex_match(expr: &str, value: &str) -> Result<bool, PatternError> {
    if let Some(re) = REGEX_CACHE.read().get(expr) {
        return Ok(re.is_match(value));
    }
    let re = Regex::new(expr).map_err(|e| PatternError::InvalidRegex {
        pattern: expr.to_string(),
        reason: e.to_string(),
    })?;
    let matched = re.is_match(value);
    REGEX_CACHE.write().insert(expr.to_string(), re);
    Ok(matched)
}

/// Match `value` against a single pattern.
pub fn pattern_match(value: &str, pattern: &str) -> Result<bool, PatternError> {
    if pattern.is_empty() {
        return Err(PatternError::Empty);
    }
    let pattern = collapse_asterisks(pattern);
    if pattern == "*" {
        return Ok(true);
    }

    let prefix = pattern.starts_with('*');
    let suffix = pattern.ends_with('*');
    if prefix && suffix {
        Ok(value.contains(&pattern[1..pattern.len() - 1]))
    } else if prefix {
        Ok(value.ends_with(&pattern[1..]))
    } else if suffix {
        Ok(value.starts_with(&pattern[..pattern.len() - 1]))
    } else if pattern.len() >= 2 && pattern.starts_with('/') && pattern.ends_with('/') {
        regex_match(&pattern[1..pattern.len() - 1], value)
    } else {
        Ok(pattern == value)
    }
}

/// First pattern that matches `value`, if any.
pub fn match_any<'p>(value: &str, patterns: &'p [String]) -> Result<Option<&'p str>, PatternError> {
    for pattern in patterns {
        if pattern_match(value, pattern)? {
            return Ok(Some(pattern));
        }
    }
    Ok(None)
}

/// Check that a pattern is well formed without matching anything.
pub fn validate_pattern(pattern: &str) -> Result<(), PatternError> {
    pattern_match("", pattern).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcards() {
        assert!(pattern_match("anything", "*").unwrap());
        assert!(pattern_match("", "***").unwrap());
        assert!(pattern_match("api.example.com", "*.example.com").unwrap());
        assert!(!pattern_match("example.org", "*.example.com").unwrap());
        assert!(pattern_match("api.example.com", "api.*").unwrap());
        assert!(pattern_match("xtestx", "**test**").unwrap());
        assert!(!pattern_match("xtesx", "*test*").unwrap());
    }

    #[test]
    fn test_regex_and_exact() {
        assert!(pattern_match("a123b", "/a.+b/").unwrap());
        assert!(pattern_match("zza1bzz", "/a.+b/").unwrap(), "regex is unanchored");
        assert!(!pattern_match("ab", "/a.+b/").unwrap());
        assert!(pattern_match("example.com", "example.com").unwrap());
        assert!(!pattern_match("www.example.com", "example.com").unwrap());
        assert!(pattern_match("/", "/").unwrap());
    }

    #[test]
    fn test_invalid_patterns() {
        assert_eq!(pattern_match("x", ""), Err(PatternError::Empty));
        assert!(matches!(
            validate_pattern("/a(b/"),
            Err(PatternError::InvalidRegex { .. })
        ));
    }

    #[test]
    fn test_match_any_returns_first_hit() {
        let patterns = vec!["*.dev".to_string(), "*.example.com".to_string(), "*".to_string()];
        assert_eq!(
            match_any("api.example.com", &patterns).unwrap(),
            Some("*.example.com")
        );
        assert_eq!(match_any("x", &patterns[..2]).unwrap(), None);
    }
}

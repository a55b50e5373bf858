//! Serde helpers for durations written either as humantime strings (`"1500ms"`, `"5s"`)
//! or as a bare integer number of milliseconds.
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer, de};

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Millis(u64),
    Text(String),
}

fn parse_raw<E: de::Error>(raw: RawDuration) -> Result<Duration, E> {
    match raw {
        RawDuration::Millis(ms) => Ok(Duration::from_millis(ms)),
        RawDuration::Text(text) => parse_duration(&text).map_err(E::custom),
    }
}

/// Parse a duration from a humantime string or an integer millisecond count.
pub fn parse_duration(text: &str) -> Result<Duration, String> {
    let text = text.trim();
    if !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit()) {
        return text
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|e| e.to_string());
    }
    humantime::parse_duration(text).map_err(|e| format!("invalid duration {text:?}: {e}"))
}

pub fn format_duration(duration: &Duration) -> String {
    humantime::format_duration(*duration).to_string()
}

pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_duration(value))
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    parse_raw(RawDuration::deserialize(deserializer)?)
}

/// Same encoding for `Option<Duration>` fields.
pub mod option {
    use super::*;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_str(&format_duration(d)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<RawDuration>::deserialize(deserializer)?
            .map(parse_raw)
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Holder {
        #[serde(default, with = "super::option")]
        timeout: Option<Duration>,
    }

    #[test]
    fn test_accepts_strings_and_millis() {
        let h: Holder = serde_json::from_str(r#"{"timeout":"5s"}"#).unwrap();
        assert_eq!(h.timeout, Some(Duration::from_secs(5)));
        let h: Holder = serde_json::from_str(r#"{"timeout":250}"#).unwrap();
        assert_eq!(h.timeout, Some(Duration::from_millis(250)));
        let h: Holder = serde_json::from_str(r#"{}"#).unwrap();
        assert_eq!(h.timeout, None);
        assert!(serde_json::from_str::<Holder>(r#"{"timeout":"soon"}"#).is_err());
    }

    #[test]
    fn test_serializes_as_humantime() {
        let h = Holder {
            timeout: Some(Duration::from_millis(1500)),
        };
        assert_eq!(serde_json::to_string(&h).unwrap(), r#"{"timeout":"1s 500ms"}"#);
    }
}

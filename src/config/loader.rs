use std::path::Path;

use config::{Config, File, FileFormat};
use eyre::{Context, Result};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::config::models::DGateConfig;

static ENV_VAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{(?P<name>[A-Za-z0-9_]+)(?P<fallback>:-(?P<default>[^}]*))?\}")
        .expect("valid regex")
});

/// Load configuration from a file using the config crate
/// Supports YAML, JSON and TOML; `${VAR}` and `${VAR:-default}` are expanded first.
pub async fn load_config(config_path: &str) -> Result<DGateConfig> {
    load_config_sync(config_path)
}

/// Load configuration synchronously
pub fn load_config_sync(config_path: &str) -> Result<DGateConfig> {
    let path = Path::new(config_path);
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    parse_config(&raw, format_for(path))
        .with_context(|| format!("Failed to load config from {}", path.display()))
}

/// Parse configuration text of a known format.
pub fn parse_config(raw: &str, format: FileFormat) -> Result<DGateConfig> {
    let expanded = expand_env(raw, |name| std::env::var(name).ok())?;
    let settings = Config::builder()
        .add_source(File::from_str(&expanded, format))
        .build()
        .context("Failed to build config")?;
    settings
        .try_deserialize()
        .context("Failed to deserialize config")
}

fn format_for(path: &Path) -> FileFormat {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("toml") => FileFormat::Toml,
        _ => FileFormat::Yaml, // Default to YAML
    }
}

/// Replace `${VAR}` / `${VAR:-default}` references. Unset or empty variables without a
/// default are collected and reported together.
pub fn expand_env<F>(raw: &str, lookup: F) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut missing = Vec::new();
    let expanded = ENV_VAR.replace_all(raw, |caps: &Captures<'_>| {
        let name = &caps["name"];
        match lookup(name).filter(|v| !v.is_empty()) {
            Some(value) => value,
            None if caps.name("fallback").is_some() => caps
                .name("default")
                .map(|m| m.as_str().to_string())
                .unwrap_or_default(),
            None => {
                missing.push(name.to_string());
                String::new()
            }
        }
    });
    if !missing.is_empty() {
        eyre::bail!("required env vars not set: {}", missing.join(", "));
    }
    Ok(expanded.into_owned())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;
    use crate::config::models::StorageKind;

    #[tokio::test]
    async fn test_load_yaml_config() {
        let yaml_content = r#"
log_level: debug
storage:
  type: file
  dir: /tmp/dgate
proxy:
  port: 8080
  client_transport:
    dial_timeout: 5s
    idle_conn_timeout: 30000
  init_resources:
    namespaces:
      - name: n1
    services:
      - name: s1
        namespace: n1
        urls: ["http://localhost:9000"]
admin:
  port: 9081
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        write!(temp_file, "{}", yaml_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.storage.kind, StorageKind::File);
        assert_eq!(config.proxy.port, 8080);
        assert_eq!(
            config.proxy.client_transport.dial_timeout,
            std::time::Duration::from_secs(5)
        );
        assert_eq!(
            config.proxy.client_transport.idle_conn_timeout,
            std::time::Duration::from_secs(30)
        );
        let init = config.proxy.init_resources.unwrap();
        assert_eq!(init.services[0].urls, vec!["http://localhost:9000"]);
        assert_eq!(config.admin.unwrap().port, 9081);
    }

    #[tokio::test]
    async fn test_load_json_config() {
        let json_content = r#"
{
  "proxy": { "host": "127.0.0.1", "port": 3000 },
  "disable_default_namespace": true
}
"#;

        let mut temp_file = NamedTempFile::with_suffix(".json").unwrap();
        write!(temp_file, "{}", json_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.proxy.host, "127.0.0.1");
        assert_eq!(config.proxy.port, 3000);
        assert!(config.disable_default_namespace);
        assert!(config.admin.is_none());
    }

    #[test]
    fn test_env_expansion() {
        let lookup = |name: &str| match name {
            "PORT" => Some("8081".to_string()),
            "EMPTY" => Some(String::new()),
            _ => None,
        };
        let out = expand_env("port: ${PORT}\nhost: ${HOST:-0.0.0.0}\nx: ${EMPTY:-y}", lookup)
            .unwrap();
        assert_eq!(out, "port: 8081\nhost: 0.0.0.0\nx: y");

        let err = expand_env("a: ${A}\nb: ${B}", lookup).unwrap_err();
        assert!(err.to_string().contains("A, B"));
    }

    #[test]
    fn test_defaults_from_empty_document() {
        let config = parse_config("{}", FileFormat::Json).unwrap();
        assert_eq!(config.proxy.port, 80);
        assert_eq!(config.proxy.module_pool.max, 128);
        assert_eq!(config.storage.kind, StorageKind::Memory);
    }
}

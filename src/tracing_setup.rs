use eyre::{Result, WrapErr};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize logging for the gateway.
///
/// `RUST_LOG` takes precedence over `level`. With `json_format` every event is emitted as one
/// JSON object including the active span list; otherwise a pretty console layout is used.
pub fn init_tracing(level: &str, json_format: bool) -> Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level).wrap_err_with(|| format!("Invalid log level: {level}"))?,
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let result = if json_format {
        Registry::default()
            .with(env_filter)
            .with(
                fmt_layer
                    .json()
                    .with_current_span(false)
                    .with_span_list(true),
            )
            .try_init()
    } else {
        Registry::default()
            .with(env_filter)
            .with(fmt_layer.pretty().with_ansi(true))
            .try_init()
    };
    result.wrap_err("Failed to install tracing subscriber")?;

    tracing::debug!(level, json = json_format, "DGate logging initialized");
    Ok(())
}

/// Span covering one proxied request. `namespace`, `route`, `status` and `duration_ms`
/// are recorded as the pipeline learns them.
pub fn create_request_span(method: &str, path: &str, host: &str) -> tracing::Span {
    tracing::info_span!(
        "proxy_request",
        http.method = method,
        http.path = path,
        http.host = host,
        namespace = tracing::field::Empty,
        route = tracing::field::Empty,
        http.status_code = tracing::field::Empty,
        duration_ms = tracing::field::Empty,
    )
}

/// Span covering one upstream attempt.
pub fn create_upstream_span(service: &str, upstream_url: &str, attempt: u32) -> tracing::Span {
    tracing::info_span!(
        "upstream_request",
        service = service,
        upstream.url = upstream_url,
        attempt = attempt,
        http.status_code = tracing::field::Empty,
        duration_ms = tracing::field::Empty,
    )
}

/// Span covering the application of one change log.
pub fn create_change_span(change_id: &str, cmd: &str) -> tracing::Span {
    tracing::debug_span!("change_log", change_id = change_id, cmd = cmd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_request_span() {
        let span = create_request_span("GET", "/api/test", "example.com");
        if let Some(meta) = span.metadata() {
            assert_eq!(meta.name(), "proxy_request");
        }
    }

    #[test]
    fn test_create_upstream_span() {
        let span = create_upstream_span("s1", "http://backend", 1);
        if let Some(meta) = span.metadata() {
            assert_eq!(meta.name(), "upstream_request");
        }
    }
}

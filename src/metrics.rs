//! Metrics for the gateway.
//!
//! The data plane and the change-log engine report through the [`MetricsSink`] trait so they
//! never depend on a concrete exporter. [`OtelMetrics`] records into OpenTelemetry
//! instruments obtained from the global meter; [`init_metrics`] optionally installs an OTLP
//! (gRPC) periodic exporter as the global meter provider.
//!
//! Provided instruments:
//! * `dgate_requests_total` (counter) / `dgate_request_duration_seconds` (histogram)
//! * `dgate_upstream_requests_total` (counter) / `dgate_upstream_duration_seconds` (histogram)
//! * `dgate_change_logs_total` (counter, labels: cmd, ok)
//! * `dgate_module_borrows_total` (counter, labels: route, ok)
//! * `dgate_stage_duration_seconds` (histogram, labels: stage, route)
use std::time::Duration;

use eyre::{Result, WrapErr};
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram},
};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    Resource,
    metrics::{PeriodicReader, SdkMeterProvider},
};
use opentelemetry_semantic_conventions::attribute as semconv;

use crate::config::MetricsConfig;

pub const DGATE_REQUESTS_TOTAL: &str = "dgate_requests_total";
pub const DGATE_REQUEST_DURATION_SECONDS: &str = "dgate_request_duration_seconds";
pub const DGATE_UPSTREAM_REQUESTS_TOTAL: &str = "dgate_upstream_requests_total";
pub const DGATE_UPSTREAM_DURATION_SECONDS: &str = "dgate_upstream_duration_seconds";
pub const DGATE_CHANGE_LOGS_TOTAL: &str = "dgate_change_logs_total";
pub const DGATE_MODULE_BORROWS_TOTAL: &str = "dgate_module_borrows_total";
pub const DGATE_STAGE_DURATION_SECONDS: &str = "dgate_stage_duration_seconds";

/// Sink for the numbers the gateway produces.
pub trait MetricsSink: Send + Sync + 'static {
    fn record_request(
        &self,
        namespace: &str,
        route: &str,
        method: &str,
        status: u16,
        duration: Duration,
    );

    fn record_upstream(&self, service: &str, status: u16, duration: Duration);

    fn record_change_log(&self, cmd: &str, ok: bool);

    fn record_module_borrow(&self, route: &str, ok: bool);

    /// Duration of a single request pipeline stage (`requestModifier`, `upstream`, ...).
    fn record_stage(&self, stage: &str, route: &str, duration: Duration);
}

/// Discards everything; used when metrics are disabled and in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_request(&self, _: &str, _: &str, _: &str, _: u16, _: Duration) {}
    fn record_upstream(&self, _: &str, _: u16, _: Duration) {}
    fn record_change_log(&self, _: &str, _: bool) {}
    fn record_module_borrow(&self, _: &str, _: bool) {}
    fn record_stage(&self, _: &str, _: &str, _: Duration) {}
}

/// OpenTelemetry backed sink.
#[derive(Clone)]
pub struct OtelMetrics {
    requests: Counter<u64>,
    request_duration: Histogram<f64>,
    upstream_requests: Counter<u64>,
    upstream_duration: Histogram<f64>,
    change_logs: Counter<u64>,
    module_borrows: Counter<u64>,
    stage_duration: Histogram<f64>,
}

impl OtelMetrics {
    pub fn new() -> Self {
        let meter = global::meter("dgate");
        Self {
            requests: meter
                .u64_counter(DGATE_REQUESTS_TOTAL)
                .with_description("Total number of HTTP requests processed by the proxy.")
                .build(),
            request_duration: meter
                .f64_histogram(DGATE_REQUEST_DURATION_SECONDS)
                .with_description("Latency of HTTP requests processed by the proxy.")
                .with_unit("s")
                .build(),
            upstream_requests: meter
                .u64_counter(DGATE_UPSTREAM_REQUESTS_TOTAL)
                .with_description("Total number of requests forwarded to upstream services.")
                .build(),
            upstream_duration: meter
                .f64_histogram(DGATE_UPSTREAM_DURATION_SECONDS)
                .with_description("Latency of requests forwarded to upstream services.")
                .with_unit("s")
                .build(),
            change_logs: meter
                .u64_counter(DGATE_CHANGE_LOGS_TOTAL)
                .with_description("Change logs applied, by command and outcome.")
                .build(),
            module_borrows: meter
                .u64_counter(DGATE_MODULE_BORROWS_TOTAL)
                .with_description("Script runtime borrows, by route and outcome.")
                .build(),
            stage_duration: meter
                .f64_histogram(DGATE_STAGE_DURATION_SECONDS)
                .with_description("Time spent in each request pipeline stage.")
                .with_unit("s")
                .build(),
        }
    }
}

impl Default for OtelMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSink for OtelMetrics {
    fn record_request(
        &self,
        namespace: &str,
        route: &str,
        method: &str,
        status: u16,
        duration: Duration,
    ) {
        let attrs = [
            KeyValue::new("namespace", namespace.to_string()),
            KeyValue::new("route", route.to_string()),
            KeyValue::new(semconv::HTTP_REQUEST_METHOD, method.to_string()),
            KeyValue::new(semconv::HTTP_RESPONSE_STATUS_CODE, i64::from(status)),
        ];
        self.requests.add(1, &attrs);
        self.request_duration.record(duration.as_secs_f64(), &attrs);
    }

    fn record_upstream(&self, service: &str, status: u16, duration: Duration) {
        let attrs = [
            KeyValue::new("service", service.to_string()),
            KeyValue::new(semconv::HTTP_RESPONSE_STATUS_CODE, i64::from(status)),
        ];
        self.upstream_requests.add(1, &attrs);
        self.upstream_duration.record(duration.as_secs_f64(), &attrs);
    }

    fn record_change_log(&self, cmd: &str, ok: bool) {
        self.change_logs.add(
            1,
            &[
                KeyValue::new("cmd", cmd.to_string()),
                KeyValue::new("ok", ok),
            ],
        );
    }

    fn record_module_borrow(&self, route: &str, ok: bool) {
        self.module_borrows.add(
            1,
            &[
                KeyValue::new("route", route.to_string()),
                KeyValue::new("ok", ok),
            ],
        );
    }

    fn record_stage(&self, stage: &str, route: &str, duration: Duration) {
        self.stage_duration.record(
            duration.as_secs_f64(),
            &[
                KeyValue::new("stage", stage.to_string()),
                KeyValue::new("route", route.to_string()),
            ],
        );
    }
}

/// Installed metrics pipeline; keep it alive for the lifetime of the process.
pub struct MetricsHandle {
    pub sink: std::sync::Arc<dyn MetricsSink>,
    provider: Option<SdkMeterProvider>,
}

impl MetricsHandle {
    pub fn noop() -> Self {
        Self {
            sink: std::sync::Arc::new(NoopMetrics),
            provider: None,
        }
    }

    /// Flush and stop the exporter, if one was installed.
    pub fn shutdown(&self) {
        if let Some(provider) = &self.provider {
            if let Err(e) = provider.shutdown() {
                tracing::warn!(error = %e, "metrics provider shutdown failed");
            }
        }
    }
}

/// Build the metrics sink. When `otlp_endpoint` is set an OTLP exporter is installed as the
/// global meter provider; otherwise instruments record into the global no-op provider.
pub fn init_metrics(config: &MetricsConfig, disabled: bool) -> Result<MetricsHandle> {
    if disabled {
        tracing::info!("metrics disabled");
        return Ok(MetricsHandle::noop());
    }

    let provider = match config.otlp_endpoint.as_deref().filter(|e| !e.is_empty()) {
        Some(endpoint) => {
            let exporter = opentelemetry_otlp::MetricExporter::builder()
                .with_tonic()
                .with_endpoint(endpoint)
                .build()
                .wrap_err_with(|| format!("Failed to build OTLP metric exporter for {endpoint}"))?;
            let reader = PeriodicReader::builder(exporter)
                .with_interval(Duration::from_secs(config.export_interval_secs.max(1)))
                .build();
            let provider = SdkMeterProvider::builder()
                .with_reader(reader)
                .with_resource(Resource::builder().with_service_name("dgate").build())
                .build();
            global::set_meter_provider(provider.clone());
            tracing::info!(endpoint, "OTLP metrics exporter installed");
            Some(provider)
        }
        None => None,
    };

    Ok(MetricsHandle {
        sink: std::sync::Arc::new(OtelMetrics::new()),
        provider,
    })
}

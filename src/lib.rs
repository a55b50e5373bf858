//! DGate - a programmable, replicated API gateway.
//!
//! DGate routes HTTP traffic by namespace, domain and path to upstream services or to
//! JavaScript handlers. Every change to its configuration (namespaces, services, routes,
//! modules, domains, collections, documents, secrets) is a **change log** applied to an
//! in-memory resource graph, persisted locally or replicated to the other nodes of a cluster.
//! This library exposes the building blocks the `dgate` binary is assembled from.
//!
//! # Features
//! - Namespaced routing with host patterns, domain priorities and path parameters
//! - Round-robin upstream selection with per-service retries and timeouts
//! - Request pipeline scripting (`fetchUpstream`, `requestModifier`, `responseModifier`,
//!   `errorHandler`, `requestHandler`) on pooled JavaScript runtimes
//! - SNI certificate selection from domain resources
//! - Change-log persistence with compaction and restart-from-log
//! - Leader-based log replication over the admin API
//! - Document collections with JSON-schema validation
//! - Structured tracing via `tracing` and OpenTelemetry metrics
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use dgate::{DGateServer, config::loader::load_config, metrics::NoopMetrics};
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let config = load_config("config.yaml").await?;
//! let server = DGateServer::build(config, Arc::new(NoopMetrics))?;
//! server.start().await?;
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! **Ports** (traits in [`ports`]) separate the core from storage, the HTTP client, the
//! script runtime and replication. **Adapters** implement them, and [`core`] holds the
//! resource graph and the change-log engine. [`server`] wires one node together.
//!
//! # Error Handling
//! Library layers return typed `thiserror` errors; startup and the binary use `eyre::Result`
//! with context attached through `WrapErr`.
//!
//! # Concurrency & Data Structures
//! Routing snapshots are swapped atomically with `arc_swap`; request handling never takes a
//! lock held by a reload.
pub mod config;
pub mod metrics;
pub mod ports;
pub mod server;
pub mod tracing_setup;
pub mod utils;

// These modules are implementation details and should not be directly used by users
pub mod adapters;
pub mod core;

// Re-export the specific types needed by the binary crate
pub use crate::{
    adapters::{HttpClientAdapter, HttpHandler},
    ports::http_client::HttpClient,
    server::DGateServer,
    utils::GracefulShutdown,
};

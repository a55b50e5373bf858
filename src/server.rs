//! Node assembly: storage, change-log engine, data plane, replication and the listeners.
use std::{net::SocketAddr, path::Path, sync::Arc};

use axum::{
    Router,
    serve::Listener,
};
use eyre::{Result, WrapErr, eyre};
use futures_util::StreamExt;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    task::JoinSet,
};

use crate::{
    adapters::{
        HttpClientAdapter, HttpHandler,
        admin::{AdminState, admin_bind_address, admin_router},
        proxy::{ProxyDispatcher, tls::DomainCertResolver, tls::certified_key_from_files},
        raft::{HttpRaftNode, RaftAdminClient, form_cluster},
        storage::storage_from_config,
    },
    config::{DGateConfig, seed::seed_change_logs},
    core::{
        engine::ChangeLogEngine,
        replication::{AdminFsm, ReplicationCoordinator},
        resource_graph::ResourceGraph,
        status::{GatewayStatus, ProxyStatus},
    },
    metrics::MetricsSink,
    ports::{raft::RaftNode, storage::Storage},
    utils::{GracefulShutdown, ShutdownReason},
};

/// Adapts a stream of accepted connections (such as a [`tls_listener::TlsListener`]) to
/// axum's [`Listener`].
struct StreamListener<S> {
    stream: S,
    local_addr: SocketAddr,
}

impl<S, I, E> Listener for StreamListener<S>
where
    S: futures_util::Stream<Item = std::result::Result<(I, SocketAddr), E>> + Unpin + Send + 'static,
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    type Io = I;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match self.stream.next().await {
                Some(Ok((io, addr))) => return (io, addr),
                Some(Err(e)) => tracing::debug!(error = %e, "TLS accept error"),
                None => std::future::pending().await,
            }
        }
    }

    fn local_addr(&self) -> std::io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}

/// A fully wired gateway node.
pub struct DGateServer {
    config: Arc<DGateConfig>,
    status: Arc<GatewayStatus>,
    storage: Arc<dyn Storage>,
    engine: Arc<ChangeLogEngine>,
    coordinator: Arc<ReplicationCoordinator>,
    dispatcher: Arc<ProxyDispatcher>,
    raft: Option<(Arc<HttpRaftNode>, RaftAdminClient)>,
}

impl DGateServer {
    /// Wire every component from `config`. Nothing is started yet.
    pub fn build(config: DGateConfig, metrics: Arc<dyn MetricsSink>) -> Result<Self> {
        let config = Arc::new(config);
        let status = Arc::new(GatewayStatus::new());
        let storage = storage_from_config(&config.storage).wrap_err("Failed to create storage")?;
        storage.connect().wrap_err("Failed to connect storage")?;

        let graph = Arc::new(ResourceGraph::new());
        let client = Arc::new(HttpClientAdapter::new(
            config.proxy.client_transport.clone(),
        ));

        let fallback = match &config.proxy.tls {
            Some(tls) => match (&tls.cert_file, &tls.key_file) {
                (Some(cert), Some(key)) => Some(
                    certified_key_from_files(Path::new(cert), Path::new(key))
                        .wrap_err("Failed to load proxy TLS certificate")?,
                ),
                _ => None,
            },
            None => None,
        };
        let certs = Arc::new(DomainCertResolver::new(fallback));
        let dispatcher = Arc::new(ProxyDispatcher::new(
            config.clone(),
            graph.clone(),
            client,
            metrics.clone(),
            certs,
        ));

        let seed = seed_change_logs(&config).wrap_err("Invalid init resources")?;
        let engine = Arc::new(ChangeLogEngine::new(
            graph,
            storage.clone(),
            dispatcher.clone(),
            metrics,
            status.clone(),
            seed,
            true,
        ));

        let raft = match config.replication() {
            Some(replication) => {
                let admin = config
                    .admin
                    .as_ref()
                    .ok_or_else(|| eyre!("replication requires an admin block"))?;
                let address = replication
                    .advert_address
                    .clone()
                    .filter(|a| !a.is_empty())
                    .unwrap_or_else(|| format!("{}:{}", admin.host, admin.port));
                let client = RaftAdminClient::new(
                    &replication.advert_scheme,
                    replication.shared_key.clone(),
                )?;
                let fsm = Arc::new(AdminFsm::new(engine.clone(), status.clone()));
                let node = HttpRaftNode::new(
                    replication.id.clone(),
                    address,
                    storage.clone(),
                    fsm,
                    client.clone(),
                )?;
                Some((node, client))
            }
            None => None,
        };

        let coordinator = Arc::new(ReplicationCoordinator::new(
            engine.clone(),
            raft.as_ref()
                .map(|(node, _)| node.clone() as Arc<dyn RaftNode>),
            status.clone(),
        ));

        Ok(Self {
            config,
            status,
            storage,
            engine,
            coordinator,
            dispatcher,
            raft,
        })
    }

    pub fn config(&self) -> &Arc<DGateConfig> {
        &self.config
    }

    pub fn status(&self) -> &Arc<GatewayStatus> {
        &self.status
    }

    pub fn engine(&self) -> &Arc<ChangeLogEngine> {
        &self.engine
    }

    pub fn dispatcher(&self) -> &Arc<ProxyDispatcher> {
        &self.dispatcher
    }

    pub fn admin_state(&self) -> AdminState {
        AdminState::new(
            self.config.clone(),
            self.coordinator.clone(),
            self.raft.as_ref().map(|(node, _)| node.clone()),
        )
    }

    /// Catch-all proxy router; `secure` marks the TLS listener.
    pub fn proxy_router(&self, secure: bool) -> Router {
        HttpHandler::new(self.dispatcher.clone(), secure).router()
    }

    /// Seed the graph, then restore local state or join the replicated log.
    pub async fn start(&self) -> Result<()> {
        self.status.transition(ProxyStatus::Initializing);
        self.engine.seed().await.wrap_err("Failed to apply init resources")?;

        let Some((node, client)) = &self.raft else {
            self.status.transition(ProxyStatus::Replaying);
            let restored = self
                .engine
                .restore()
                .await
                .wrap_err("Failed to restore change logs")?;
            self.status.transition(ProxyStatus::Ready);
            self.status.set_ready(true);
            tracing::info!(restored, change_hash = self.engine.change_hash(), "Proxy ready");
            return Ok(());
        };

        self.status.transition(ProxyStatus::Replaying);
        self.engine
            .reload()
            .await
            .wrap_err("Failed to build initial routes")?;
        node.start().await.wrap_err("Failed to start raft node")?;

        let replication = self
            .config
            .replication()
            .cloned()
            .ok_or_else(|| eyre!("replication config missing"))?;
        let admin_port = self.config.admin.as_ref().map(|a| a.port).unwrap_or(9080);
        let watch_only = self.config.watch_only();
        let node = node.clone();
        let client = client.clone();
        // Joining waits on the leader; the admin API must be up meanwhile.
        tokio::spawn(async move {
            if let Err(e) = form_cluster(node, client, replication, admin_port, watch_only).await {
                tracing::error!(error = %e, "Failed to form raft cluster");
            }
        });
        Ok(())
    }

    /// Serve the proxy (plain and TLS) and admin listeners until shutdown.
    pub async fn serve(&self, shutdown: Arc<GracefulShutdown>) -> Result<ShutdownReason> {
        let mut listeners = JoinSet::new();

        let proxy_addr: SocketAddr = format!("{}:{}", self.config.proxy.host, self.config.proxy.port)
            .parse()
            .wrap_err("Invalid proxy listen address")?;
        let listener = TcpListener::bind(proxy_addr)
            .await
            .wrap_err_with(|| format!("Failed to bind proxy listener on {proxy_addr}"))?;
        tracing::info!(address = %proxy_addr, "Proxy listening");
        let app = self.proxy_router(false);
        let token = shutdown.shutdown_token();
        listeners.spawn(async move {
            axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                .with_graceful_shutdown(async move {
                    token.wait_for_shutdown().await;
                })
                .await
                .wrap_err("Proxy server error")
        });

        if let Some(tls) = &self.config.proxy.tls {
            let tls_addr: SocketAddr = format!("{}:{}", self.config.proxy.host, tls.port)
                .parse()
                .wrap_err("Invalid TLS listen address")?;
            let listener = TcpListener::bind(tls_addr)
                .await
                .wrap_err_with(|| format!("Failed to bind TLS listener on {tls_addr}"))?;
            let mut server_config = rustls::ServerConfig::builder()
                .with_no_client_auth()
                .with_cert_resolver(self.dispatcher.cert_resolver());
            server_config.alpn_protocols = if self.config.proxy.enable_http2 {
                vec![b"h2".to_vec(), b"http/1.1".to_vec()]
            } else {
                vec![b"http/1.1".to_vec()]
            };
            let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));
            let local_addr = listener.local_addr()?;
            let stream = tls_listener::TlsListener::new(acceptor, listener);
            let tls_listener = StreamListener { stream, local_addr };
            tracing::info!(address = %tls_addr, "Proxy TLS listening");

            let app = self.proxy_router(true);
            let token = shutdown.shutdown_token();
            listeners.spawn(async move {
                // axum only implements `Connected` for its own listeners, so attach the
                // peer address the same way `into_make_service_with_connect_info` does.
                let make_service = tower::service_fn(
                    move |incoming: axum::serve::IncomingStream<'_, StreamListener<_>>| {
                        let connect_info = axum::extract::ConnectInfo(*incoming.remote_addr());
                        std::future::ready(Ok::<_, std::convert::Infallible>(
                            app.clone().layer(axum::Extension(connect_info)),
                        ))
                    },
                );
                axum::serve(tls_listener, make_service)
                .with_graceful_shutdown(async move {
                    token.wait_for_shutdown().await;
                })
                .await
                .wrap_err("Proxy TLS server error")
            });
        }

        if let Some(admin_addr) = admin_bind_address(&self.config) {
            let listener = TcpListener::bind(admin_addr)
                .await
                .wrap_err_with(|| format!("Failed to bind admin listener on {admin_addr}"))?;
            tracing::info!(address = %admin_addr, "Admin API listening");
            let app = admin_router(self.admin_state()).wrap_err("Invalid admin allow list")?;
            let token = shutdown.shutdown_token();
            listeners.spawn(async move {
                axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                    .with_graceful_shutdown(async move {
                        token.wait_for_shutdown().await;
                    })
                    .await
                    .wrap_err("Admin server error")
            });
        } else if self.config.admin.is_some() {
            return Err(eyre!("Invalid admin listen address"));
        }

        let fatal = self.engine.fatal_token();
        let reason = tokio::select! {
            _ = fatal.cancelled() => {
                tracing::error!("State could not be rebuilt, shutting down");
                shutdown.trigger_shutdown(ShutdownReason::Fatal);
                ShutdownReason::Fatal
            }
            reason = shutdown.shutdown_token().wait_for_shutdown() => reason,
            Some(result) = listeners.join_next() => {
                let err = match result {
                    Ok(Ok(())) => eyre!("listener exited unexpectedly"),
                    Ok(Err(e)) => e,
                    Err(e) => eyre!("listener task failed: {e}"),
                };
                shutdown.trigger_shutdown(ShutdownReason::Force);
                self.close().await;
                return Err(err);
            }
        };

        if tokio::time::timeout(shutdown.shutdown_timeout(), async {
            while listeners.join_next().await.is_some() {}
        })
        .await
        .is_err()
        {
            tracing::warn!("Listeners did not drain before the shutdown timeout");
            listeners.abort_all();
        }
        self.close().await;
        Ok(reason)
    }

    /// Stop replication, retire runtime pools and close storage.
    pub async fn close(&self) {
        self.status.transition(ProxyStatus::Stopped);
        if let Some((node, _)) = &self.raft
            && let Err(e) = node.shutdown().await
        {
            tracing::warn!(error = %e, "Raft shutdown failed");
        }
        self.dispatcher.close();
        if let Err(e) = self.storage.close() {
            tracing::warn!(error = %e, "Storage close failed");
        }
        tracing::info!("DGate stopped");
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::{
        config::{StorageConfig, StorageKind},
        core::{
            change_log::{ChangeLog, Command, Resource},
            engine::ApplyOptions,
            resources::Namespace,
        },
        metrics::NoopMetrics,
    };

    fn file_config(dir: &TempDir) -> DGateConfig {
        DGateConfig {
            storage: StorageConfig {
                kind: StorageKind::File,
                dir: Some(dir.path().display().to_string()),
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_start_marks_ready_and_seeds_default_namespace() {
        let dir = TempDir::new().unwrap();
        let server = DGateServer::build(file_config(&dir), Arc::new(NoopMetrics)).unwrap();
        assert!(!server.status().is_ready());
        server.start().await.unwrap();
        assert!(server.status().is_ready());
        assert_eq!(server.status().get(), ProxyStatus::Ready);
        assert!(server.engine().graph().get_namespace("default").is_some());
        server.close().await;
    }

    #[tokio::test]
    async fn test_restart_restores_persisted_changes() {
        let dir = TempDir::new().unwrap();
        {
            let server = DGateServer::build(file_config(&dir), Arc::new(NoopMetrics)).unwrap();
            server.start().await.unwrap();
            let ns = Namespace::new("n1");
            let log = ChangeLog::new(Command::add(Resource::Namespaces), "n1", "n1", &ns).unwrap();
            server.engine().process(&log, ApplyOptions::LOCAL).await.unwrap();
            server.close().await;
        }

        let server = DGateServer::build(file_config(&dir), Arc::new(NoopMetrics)).unwrap();
        server.start().await.unwrap();
        assert!(server.engine().graph().get_namespace("n1").is_some());
        assert_ne!(server.engine().change_hash(), 0);
        server.close().await;
    }
}

//! Change-log engine: turns a stream of commands into resource graph mutations.
//!
//! All application is serialized by a single async mutex. A successful change is folded into
//! the change hash and, outside replication, persisted under `changelog/{id}`. Changes that
//! affect routing mark a reload as pending; the data plane is rebuilt when the caller asks
//! for it, so a batch of changes costs a single reload.
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::{
    change_hash::ChangeHash,
    change_log::{Action, ChangeLog, Command, Resource},
    compaction::compaction_remove_list,
    documents::DocumentStore,
    error::{ChangeLogError, ChangeLogResult, ResourceError},
    resource_graph::ResourceGraph,
    resources::{
        Collection, CollectionType, Document, Domain, Module, Namespace, NamespacedResource, Route,
        Secret, Service,
    },
    status::{GatewayStatus, ProxyStatus},
};
use crate::{
    metrics::MetricsSink,
    ports::{
        reload::{ReloadError, Reloader},
        storage::{Storage, StorageError, with_txn},
    },
    tracing_setup::create_change_span,
};

pub const CHANGELOG_PREFIX: &str = "changelog/";
pub const RELOAD_TIMEOUT: Duration = Duration::from_secs(15);
const STORE_RETRIES: usize = 30;
const STORE_RETRY_DELAY: Duration = Duration::from_micros(100);

pub fn change_log_key(id: &str) -> String {
    format!("{CHANGELOG_PREFIX}{id}")
}

/// How a single change should be processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyOptions {
    /// Rebuild the data plane afterwards if a routing change is pending
    pub reload: bool,
    /// Write the change log to storage
    pub persist: bool,
}

impl ApplyOptions {
    pub const LOCAL: ApplyOptions = ApplyOptions {
        reload: true,
        persist: true,
    };
    pub const REPLAY: ApplyOptions = ApplyOptions {
        reload: false,
        persist: false,
    };
}

#[derive(Debug, Default)]
struct EngineState {
    last_id: Option<String>,
}

pub struct ChangeLogEngine {
    graph: Arc<ResourceGraph>,
    storage: Arc<dyn Storage>,
    documents: DocumentStore,
    reloader: Arc<dyn Reloader>,
    metrics: Arc<dyn MetricsSink>,
    status: Arc<GatewayStatus>,
    seed: Vec<ChangeLog>,
    hash: ChangeHash,
    pending: AtomicBool,
    restart_on_failure: bool,
    fatal: CancellationToken,
    state: Mutex<EngineState>,
}

impl ChangeLogEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        graph: Arc<ResourceGraph>,
        storage: Arc<dyn Storage>,
        reloader: Arc<dyn Reloader>,
        metrics: Arc<dyn MetricsSink>,
        status: Arc<GatewayStatus>,
        seed: Vec<ChangeLog>,
        restart_on_failure: bool,
    ) -> Self {
        Self {
            documents: DocumentStore::new(storage.clone()),
            graph,
            storage,
            reloader,
            metrics,
            status,
            seed,
            hash: ChangeHash::new(),
            pending: AtomicBool::new(false),
            restart_on_failure,
            fatal: CancellationToken::new(),
            state: Mutex::new(EngineState::default()),
        }
    }

    pub fn graph(&self) -> &Arc<ResourceGraph> {
        &self.graph
    }

    pub fn documents(&self) -> &DocumentStore {
        &self.documents
    }

    pub fn change_hash(&self) -> u32 {
        self.hash.get()
    }

    pub fn has_pending_reload(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Cancelled when state could not be rebuilt after a failed apply.
    pub fn fatal_token(&self) -> CancellationToken {
        self.fatal.clone()
    }

    /// Apply one change log.
    pub async fn process(&self, log: &ChangeLog, opts: ApplyOptions) -> ChangeLogResult<()> {
        let mut state = self.state.lock().await;
        let result = self
            .process_locked(&mut state, log, opts)
            .instrument(create_change_span(&log.id, &log.cmd.to_string()))
            .await;
        self.metrics
            .record_change_log(&log.cmd.to_string(), result.is_ok());
        let err = match result {
            Ok(()) => return Ok(()),
            Err(err @ ChangeLogError::DuplicateId(_)) => return Err(err),
            Err(err) => err,
        };
        tracing::warn!(change_id = %log.id, cmd = %log.cmd, error = %err, "change log rejected");
        if self.restart_on_failure {
            if let Err(restart_err) = self.restart_locked(&mut state).await {
                tracing::error!(error = %restart_err, "state restart failed, stopping");
                self.status.transition(ProxyStatus::Stopped);
                self.fatal.cancel();
                return Err(restart_err);
            }
        }
        Err(err)
    }

    /// Rebuild the data plane now if any routing change is pending.
    pub async fn reload_if_pending(&self) -> ChangeLogResult<bool> {
        let _state = self.state.lock().await;
        if !self.has_pending_reload() {
            return Ok(false);
        }
        self.reload_locked().await?;
        Ok(true)
    }

    /// Rebuild the data plane unconditionally.
    pub async fn reload(&self) -> ChangeLogResult<()> {
        let _state = self.state.lock().await;
        self.reload_locked().await
    }

    async fn process_locked(
        &self,
        state: &mut EngineState,
        log: &ChangeLog,
        opts: ApplyOptions,
    ) -> ChangeLogResult<()> {
        if log.id.is_empty() {
            return Err(ChangeLogError::MissingId);
        }
        if state.last_id.as_deref() == Some(log.id.as_str()) {
            return Err(ChangeLogError::DuplicateId(log.id.clone()));
        }

        self.apply_to_graph(log)?;
        if log.is_route_related() {
            self.pending.store(true, Ordering::Release);
        }
        if opts.reload && self.has_pending_reload() {
            self.reload_locked().await?;
        }
        if opts.persist {
            self.persist(log).await?;
        }

        state.last_id = Some(log.id.clone());
        self.hash.roll(&log.id);
        tracing::debug!(change_id = %log.id, cmd = %log.cmd, name = %log.name, namespace = %log.namespace, "change log applied");
        Ok(())
    }

    async fn reload_locked(&self) -> ChangeLogResult<()> {
        match tokio::time::timeout(RELOAD_TIMEOUT, self.reloader.reload()).await {
            Ok(Ok(())) => {
                self.pending.store(false, Ordering::Release);
                Ok(())
            }
            Ok(Err(e)) => Err(ChangeLogError::Reload(e.to_string())),
            Err(_) => Err(ChangeLogError::Reload(ReloadError::Timeout.to_string())),
        }
    }

    async fn persist(&self, log: &ChangeLog) -> ChangeLogResult<()> {
        let key = change_log_key(&log.id);
        let bytes = log.to_bytes()?;
        let mut attempt = 0;
        loop {
            match self.storage.set(&key, &bytes) {
                Ok(()) => return Ok(()),
                Err(e) if attempt < STORE_RETRIES => {
                    attempt += 1;
                    tracing::debug!(change_id = %log.id, attempt, error = %e, "retrying change log write");
                    tokio::time::sleep(STORE_RETRY_DELAY).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Apply the configured seed (default namespace and `init_resources`) to the graph.
    /// Seed changes are neither persisted nor part of the change hash.
    pub async fn seed(&self) -> ChangeLogResult<()> {
        let _state = self.state.lock().await;
        self.seed_locked()
    }

    fn seed_locked(&self) -> ChangeLogResult<()> {
        for log in &self.seed {
            self.apply_to_graph(log)?;
        }
        self.pending.store(true, Ordering::Release);
        Ok(())
    }

    /// Persisted change logs in id order.
    pub fn load_persisted(&self) -> ChangeLogResult<Vec<ChangeLog>> {
        self.storage
            .get_prefix(CHANGELOG_PREFIX, 0, 0)?
            .into_iter()
            .map(|(_, bytes)| ChangeLog::from_bytes(&bytes))
            .collect()
    }

    /// Replay persisted change logs, compact them, then rebuild the data plane.
    /// Returns the number of logs replayed.
    pub async fn restore(&self) -> ChangeLogResult<usize> {
        let mut state = self.state.lock().await;
        let logs = self.load_persisted()?;
        for log in &logs {
            self.process_locked(&mut state, log, ApplyOptions::REPLAY).await?;
        }
        if logs.len() > 1 {
            let removable = compaction_remove_list(&logs);
            if !removable.is_empty() {
                with_txn(self.storage.as_ref(), |txn| {
                    for log in &removable {
                        txn.delete(change_log_key(&log.id));
                    }
                    Ok::<_, StorageError>(())
                })?;
                tracing::info!(
                    total = logs.len(),
                    removed = removable.len(),
                    "compacted change logs"
                );
            }
        }
        self.reload_locked().await?;
        tracing::info!(count = logs.len(), "restored change logs");
        Ok(logs.len())
    }

    async fn restart_locked(&self, state: &mut EngineState) -> ChangeLogResult<()> {
        let previous = self.status.transition(ProxyStatus::Restarting);
        tracing::warn!("restarting state from configuration and persisted change logs");
        self.graph.clear();
        self.hash.reset();
        state.last_id = None;

        let rebuild = async {
            self.seed_locked()?;
            for log in self.load_persisted()? {
                self.process_locked(state, &log, ApplyOptions::REPLAY).await?;
            }
            self.reload_locked().await
        };
        match rebuild.await {
            Ok(()) => {
                let next = if previous == ProxyStatus::Restarting {
                    ProxyStatus::Ready
                } else {
                    previous
                };
                self.status.transition(next);
                Ok(())
            }
            Err(e) => Err(ChangeLogError::Fatal(e.to_string())),
        }
    }

    fn apply_to_graph(&self, log: &ChangeLog) -> ChangeLogResult<()> {
        let (action, resource) = match log.cmd {
            Command::Noop => return Ok(()),
            Command::Apply(action, resource) => (action, resource),
        };
        let graph = &self.graph;
        match (resource, action) {
            (Resource::Namespaces, Action::Add) => {
                graph.add_namespace(log.decode_item::<Namespace>()?)?
            }
            (Resource::Namespaces, Action::Delete) => {
                let name = if log.item.is_null() {
                    log.name.clone()
                } else {
                    log.decode_item::<Namespace>()?.name
                };
                graph.remove_namespace(&name)?
            }
            (Resource::Services, Action::Add) => graph.add_service(entity::<Service>(log)?)?,
            (Resource::Services, Action::Delete) => {
                let (name, ns) = target::<Service>(log)?;
                graph.remove_service(&name, &ns)?
            }
            (Resource::Routes, Action::Add) => graph.add_route(entity::<Route>(log)?)?,
            (Resource::Routes, Action::Delete) => {
                let (name, ns) = target::<Route>(log)?;
                graph.remove_route(&name, &ns)?
            }
            (Resource::Modules, Action::Add) => graph.add_module(entity::<Module>(log)?)?,
            (Resource::Modules, Action::Delete) => {
                let (name, ns) = target::<Module>(log)?;
                graph.remove_module(&name, &ns)?
            }
            (Resource::Domains, Action::Add) => graph.add_domain(entity::<Domain>(log)?)?,
            (Resource::Domains, Action::Delete) => {
                let (name, ns) = target::<Domain>(log)?;
                graph.remove_domain(&name, &ns)?
            }
            (Resource::Collections, Action::Add) => {
                let collection = entity::<Collection>(log)?;
                if let Some(existing) =
                    graph.get_collection(&collection.name, &collection.namespace)
                {
                    if existing.kind == CollectionType::Document
                        && collection.kind == CollectionType::Fetcher
                        && self
                            .documents
                            .has_documents(&collection.namespace, &collection.name)?
                    {
                        return Err(ResourceError::Validation(format!(
                            "cannot convert collection {} to fetcher: documents still linked",
                            collection.name
                        ))
                        .into());
                    }
                }
                graph.add_collection(collection)?
            }
            (Resource::Collections, Action::Delete) => {
                let (name, ns) = target::<Collection>(log)?;
                if graph.get_collection(&name, &ns).is_none() {
                    return Err(ResourceError::CollectionNotFound(name).into());
                }
                if self.documents.has_documents(&ns, &name)? {
                    return Err(ResourceError::cannot_delete(
                        "collection",
                        &name,
                        "documents still linked",
                    )
                    .into());
                }
                graph.remove_collection(&name, &ns)?
            }
            (Resource::Documents, Action::Add) => {
                let document = entity::<Document>(log)?;
                if document.id.is_empty() {
                    return Err(ResourceError::Validation("document id is required".into()).into());
                }
                let collection = graph
                    .get_collection(&document.collection, &document.namespace)
                    .ok_or_else(|| ResourceError::CollectionNotFound(document.collection.clone()))?;
                if collection.kind != CollectionType::Document {
                    return Err(ResourceError::Validation(format!(
                        "collection {} does not store documents",
                        collection.name
                    ))
                    .into());
                }
                self.documents.store(&document)?;
            }
            (Resource::Documents, Action::Delete) => {
                let document = entity::<Document>(log)?;
                if !self
                    .documents
                    .delete(&document.namespace, &document.collection, &document.id)?
                {
                    return Err(ResourceError::DocumentNotFound(document.id).into());
                }
            }
            (Resource::Secrets, Action::Add) => graph.add_secret(entity::<Secret>(log)?)?,
            (Resource::Secrets, Action::Delete) => {
                let (name, ns) = target::<Secret>(log)?;
                graph.remove_secret(&name, &ns)?
            }
        }
        Ok(())
    }
}

/// Decode a namespaced entity, inheriting the log's namespace when the item has none.
fn entity<T: DeserializeOwned + NamespacedResource>(log: &ChangeLog) -> ChangeLogResult<T> {
    let mut item: T = log.decode_item()?;
    if item.namespace().is_empty() {
        item.set_namespace(&log.namespace);
    }
    Ok(item)
}

/// `(name, namespace)` addressed by a delete command.
fn target<T: DeserializeOwned + NamespacedResource>(
    log: &ChangeLog,
) -> ChangeLogResult<(String, String)> {
    if log.item.is_null() {
        return Ok((log.name.clone(), log.namespace.clone()));
    }
    let item: T = entity(log)?;
    Ok((item.name().to_string(), item.namespace().to_string()))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::{
        adapters::storage::MemoryStorage,
        metrics::NoopMetrics,
        ports::reload::ReloadResult,
    };

    #[derive(Default)]
    struct CountingReloader {
        count: AtomicUsize,
    }

    #[async_trait]
    impl Reloader for CountingReloader {
        async fn reload(&self) -> ReloadResult<()> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Harness {
        engine: ChangeLogEngine,
        storage: Arc<MemoryStorage>,
        reloader: Arc<CountingReloader>,
    }

    fn harness(seed: Vec<ChangeLog>, storage: Arc<MemoryStorage>) -> Harness {
        let reloader = Arc::new(CountingReloader::default());
        let engine = ChangeLogEngine::new(
            Arc::new(ResourceGraph::new()),
            storage.clone(),
            reloader.clone(),
            Arc::new(NoopMetrics),
            Arc::new(GatewayStatus::new()),
            seed,
            true,
        );
        Harness {
            engine,
            storage,
            reloader,
        }
    }

    fn add(resource: Resource, ns: &str, name: &str, item: serde_json::Value) -> ChangeLog {
        ChangeLog::new(Command::add(resource), ns, name, &item).unwrap()
    }

    fn delete(resource: Resource, ns: &str, name: &str) -> ChangeLog {
        ChangeLog::new(
            Command::delete(resource),
            ns,
            name,
            &json!({ "name": name, "namespace": ns }),
        )
        .unwrap()
    }

    fn default_seed() -> Vec<ChangeLog> {
        vec![
            ChangeLog::new(
                Command::add(Resource::Namespaces),
                "default",
                "default",
                &Namespace::default_namespace(),
            )
            .unwrap(),
        ]
    }

    #[tokio::test]
    async fn test_local_apply_persists_and_reloads() {
        let h = harness(default_seed(), Arc::new(MemoryStorage::new()));
        h.engine.seed().await.unwrap();

        let svc = add(Resource::Services, "default", "s1", json!({"name": "s1", "urls": ["http://u/"]}));
        h.engine.process(&svc, ApplyOptions::LOCAL).await.unwrap();

        assert!(h.engine.graph().get_service("s1", "default").is_some());
        assert!(h.storage.get(&change_log_key(&svc.id)).unwrap().is_some());
        assert_eq!(h.reloader.count.load(Ordering::SeqCst), 1);
        assert_ne!(h.engine.change_hash(), 0);
    }

    #[tokio::test]
    async fn test_non_route_changes_stay_pending() {
        let h = harness(default_seed(), Arc::new(MemoryStorage::new()));
        h.engine.seed().await.unwrap();
        h.engine.reload().await.unwrap();
        assert_eq!(h.reloader.count.load(Ordering::SeqCst), 1);

        let secret = add(Resource::Secrets, "default", "k", json!({"name": "k", "data": "v"}));
        h.engine.process(&secret, ApplyOptions::LOCAL).await.unwrap();
        assert_eq!(h.reloader.count.load(Ordering::SeqCst), 1);
        assert!(!h.engine.has_pending_reload());

        let svc = add(Resource::Services, "default", "s", json!({"name": "s"}));
        h.engine.process(&svc, ApplyOptions::REPLAY).await.unwrap();
        assert!(h.engine.has_pending_reload());
        assert!(h.engine.reload_if_pending().await.unwrap());
        assert!(!h.engine.reload_if_pending().await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let h = harness(default_seed(), Arc::new(MemoryStorage::new()));
        h.engine.seed().await.unwrap();
        let ns = add(Resource::Namespaces, "n1", "n1", json!({"name": "n1"}));
        h.engine.process(&ns, ApplyOptions::LOCAL).await.unwrap();
        let hash = h.engine.change_hash();
        assert!(matches!(
            h.engine.process(&ns, ApplyOptions::LOCAL).await,
            Err(ChangeLogError::DuplicateId(_))
        ));
        assert_eq!(h.engine.change_hash(), hash);
    }

    #[tokio::test]
    async fn test_failed_apply_restarts_from_storage() {
        let h = harness(default_seed(), Arc::new(MemoryStorage::new()));
        h.engine.seed().await.unwrap();
        let svc = add(Resource::Services, "default", "s1", json!({"name": "s1"}));
        h.engine.process(&svc, ApplyOptions::LOCAL).await.unwrap();
        let hash = h.engine.change_hash();

        let bad_route = add(
            Resource::Routes,
            "default",
            "r1",
            json!({"name": "r1", "paths": ["/"], "methods": ["GET"], "service": "missing"}),
        );
        let err = h.engine.process(&bad_route, ApplyOptions::LOCAL).await.unwrap_err();
        assert!(matches!(
            err,
            ChangeLogError::Resource(ResourceError::ServiceNotFound(_))
        ));
        assert_eq!(err.http_status(), http::StatusCode::BAD_REQUEST);

        assert!(h.engine.graph().get_service("s1", "default").is_some());
        assert!(h.engine.graph().get_route("r1", "default").is_none());
        assert_eq!(h.engine.change_hash(), hash, "restart replays to the same hash");
        assert!(!h.engine.fatal_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_namespace_inherited_from_log() {
        let h = harness(default_seed(), Arc::new(MemoryStorage::new()));
        h.engine.seed().await.unwrap();
        let ns = add(Resource::Namespaces, "n2", "n2", json!({"name": "n2"}));
        h.engine.process(&ns, ApplyOptions::LOCAL).await.unwrap();
        let svc = add(Resource::Services, "n2", "s", json!({"name": "s"}));
        h.engine.process(&svc, ApplyOptions::LOCAL).await.unwrap();
        assert!(h.engine.graph().get_service("s", "n2").is_some());

        h.engine
            .process(&delete(Resource::Services, "n2", "s"), ApplyOptions::LOCAL)
            .await
            .unwrap();
        assert!(h.engine.graph().get_service("s", "n2").is_none());
    }

    #[tokio::test]
    async fn test_documents_require_document_collection() {
        let h = harness(default_seed(), Arc::new(MemoryStorage::new()));
        h.engine.seed().await.unwrap();
        let doc = add(
            Resource::Documents,
            "default",
            "d1",
            json!({"id": "d1", "collection": "users", "data": {"a": 1}}),
        );
        assert!(h.engine.process(&doc, ApplyOptions::LOCAL).await.is_err());

        let col = add(Resource::Collections, "default", "users", json!({"name": "users", "type": "document"}));
        h.engine.process(&col, ApplyOptions::LOCAL).await.unwrap();
        let doc = add(
            Resource::Documents,
            "default",
            "d1",
            json!({"id": "d1", "collection": "users", "data": {"a": 1}}),
        );
        h.engine.process(&doc, ApplyOptions::LOCAL).await.unwrap();

        let err = h
            .engine
            .process(&delete(Resource::Collections, "default", "users"), ApplyOptions::LOCAL)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("documents still linked"));

        let to_fetcher = add(Resource::Collections, "default", "users", json!({"name": "users", "type": "fetcher"}));
        assert!(h.engine.process(&to_fetcher, ApplyOptions::LOCAL).await.is_err());
        assert_eq!(
            h.engine.documents().fetch_page("default", "users", 0, 0).unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_restore_compacts_without_changing_state() {
        let storage = Arc::new(MemoryStorage::new());
        let logs = vec![
            add(Resource::Namespaces, "A", "A", json!({"name": "A"})),
            add(Resource::Services, "A", "B", json!({"name": "B"})),
            delete(Resource::Services, "A", "B"),
            delete(Resource::Namespaces, "A", "A"),
            ChangeLog::noop(),
        ];
        {
            let h = harness(Vec::new(), storage.clone());
            for log in &logs {
                h.engine.process(log, ApplyOptions::LOCAL).await.unwrap();
            }
            assert!(h.engine.graph().is_empty());
        }

        let h = harness(Vec::new(), storage.clone());
        assert_eq!(h.engine.restore().await.unwrap(), 5);
        assert!(h.engine.graph().is_empty());

        assert!(h.engine.load_persisted().unwrap().is_empty());

        let h = harness(Vec::new(), storage);
        h.engine.restore().await.unwrap();
        assert!(h.engine.graph().is_empty());
    }

    fn snapshot(graph: &ResourceGraph) -> Vec<String> {
        let mut entries: Vec<String> = graph
            .get_namespaces()
            .iter()
            .map(|e| serde_json::to_string(e).unwrap())
            .chain(graph.get_services().iter().map(|e| serde_json::to_string(e).unwrap()))
            .chain(graph.get_routes().iter().map(|e| serde_json::to_string(e).unwrap()))
            .collect();
        entries.sort();
        entries
    }

    #[tokio::test]
    async fn test_restore_keeps_state_for_interleaved_sequences() {
        let ns = |name: &str| add(Resource::Namespaces, name, name, json!({"name": name}));
        let svc = |name: &str, url: &str| {
            add(Resource::Services, "n1", name, json!({"name": name, "urls": [url]}))
        };
        let route = |name: &str, service: &str| {
            add(
                Resource::Routes,
                "n1",
                name,
                json!({"name": name, "paths": ["/"], "methods": ["GET"], "service": service}),
            )
        };
        let cases = vec![
            vec![
                ns("n1"),
                svc("S", "http://one/"),
                ns("X"),
                delete(Resource::Namespaces, "X", "X"),
                svc("S", "http://two/"),
                delete(Resource::Services, "n1", "S"),
            ],
            vec![
                ns("n1"),
                svc("S", "http://one/"),
                route("r", "S"),
                delete(Resource::Routes, "n1", "r"),
                svc("S", "http://two/"),
            ],
            vec![
                ns("n1"),
                svc("A", "http://a/"),
                svc("B", "http://b/"),
                delete(Resource::Services, "n1", "B"),
                delete(Resource::Services, "n1", "A"),
                svc("A", "http://a2/"),
            ],
            vec![
                ns("n1"),
                ChangeLog::noop(),
                svc("S", "http://one/"),
                ChangeLog::noop(),
                delete(Resource::Services, "n1", "S"),
                ns("n2"),
            ],
        ];

        for (case, logs) in cases.into_iter().enumerate() {
            let storage = Arc::new(MemoryStorage::new());
            let expected = {
                let h = harness(Vec::new(), storage.clone());
                for log in &logs {
                    h.engine.process(log, ApplyOptions::LOCAL).await.unwrap();
                }
                snapshot(h.engine.graph())
            };

            let h = harness(Vec::new(), storage.clone());
            h.engine.restore().await.unwrap();
            assert_eq!(snapshot(h.engine.graph()), expected, "case {case}: first restore");
            assert!(h.engine.load_persisted().unwrap().len() < logs.len());

            let h = harness(Vec::new(), storage);
            h.engine.restore().await.unwrap();
            assert_eq!(snapshot(h.engine.graph()), expected, "case {case}: compacted restore");
        }
    }
}

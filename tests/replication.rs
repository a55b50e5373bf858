// Change-log persistence, follower redirects, the readiness latch and writes through raft
use std::{collections::BTreeMap, net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::{
    body::{Body, to_bytes},
    extract::{ConnectInfo, Request},
    http::{StatusCode, header},
};
use dgate::{
    adapters::{
        admin::{AdminState, admin_router},
        raft::{HttpRaftNode, RaftAdminClient},
        storage::{FileStorage, MemoryStorage},
    },
    config::{AdminConfig, DGateConfig, ReplicationConfig},
    core::{
        change_log::{ChangeLog, Command, Resource},
        engine::{ApplyOptions, ChangeLogEngine},
        replication::{AdminFsm, ReplicationCoordinator},
        resource_graph::ResourceGraph,
        resources::{Namespace, Service},
        status::GatewayStatus,
    },
    metrics::NoopMetrics,
    ports::{
        raft::{
            EntryKind, RaftEntry, RaftIndexes, RaftNode, RaftResult, RaftServer, RaftState,
            StateMachine, Suffrage,
        },
        reload::NoopReloader,
        storage::Storage,
    },
};
use openraft::{Vote, raft::VoteRequest};
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;

/// Raft member with a fixed role and leader.
struct StaticNode {
    state: RaftState,
    leader: Option<(String, String)>,
}

#[async_trait]
impl RaftNode for StaticNode {
    fn id(&self) -> &str {
        "test"
    }

    fn state(&self) -> RaftState {
        self.state
    }

    fn leader_with_id(&self) -> Option<(String, String)> {
        self.leader.clone()
    }

    async fn apply(&self, _data: Vec<u8>, _timeout: Duration) -> RaftResult<u64> {
        Ok(1)
    }

    async fn barrier(&self, _timeout: Duration) -> RaftResult<()> {
        Ok(())
    }

    async fn bootstrap(&self, _servers: Vec<RaftServer>) -> RaftResult<()> {
        Ok(())
    }

    async fn add_voter(&self, _id: &str, _address: &str, _timeout: Duration) -> RaftResult<u64> {
        Ok(1)
    }

    async fn add_nonvoter(&self, _id: &str, _address: &str, _timeout: Duration) -> RaftResult<u64> {
        Ok(1)
    }

    async fn verify_leader(&self) -> RaftResult<()> {
        Ok(())
    }

    fn configuration(&self) -> Vec<RaftServer> {
        Vec::new()
    }

    fn last_index(&self) -> u64 {
        0
    }

    fn applied_index(&self) -> u64 {
        0
    }

    fn stats(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    async fn shutdown(&self) -> RaftResult<()> {
        Ok(())
    }
}

fn engine(storage: Arc<dyn Storage>, status: Arc<GatewayStatus>) -> Arc<ChangeLogEngine> {
    let graph = Arc::new(ResourceGraph::new());
    let seed = vec![
        ChangeLog::new(
            Command::add(Resource::Namespaces),
            "default",
            "default",
            &Namespace::default_namespace(),
        )
        .unwrap(),
    ];
    Arc::new(ChangeLogEngine::new(
        graph,
        storage,
        Arc::new(NoopReloader),
        Arc::new(NoopMetrics),
        status,
        seed,
        false,
    ))
}

fn replicated_config() -> DGateConfig {
    DGateConfig {
        admin: Some(AdminConfig {
            replication: Some(ReplicationConfig {
                id: "follower".into(),
                advert_scheme: "http".into(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn admin_request(method: &str, uri: &str, body: Value) -> Request {
    let mut req = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    req.extensions_mut()
        .insert(ConnectInfo("127.0.0.1:40000".parse::<SocketAddr>().unwrap()));
    req
}

fn add(resource: Resource, ns: &str, name: &str, item: &impl serde::Serialize) -> ChangeLog {
    ChangeLog::new(Command::add(resource), ns, name, item).unwrap()
}

fn delete(resource: Resource, ns: &str, name: &str, item: &impl serde::Serialize) -> ChangeLog {
    ChangeLog::new(Command::delete(resource), ns, name, item).unwrap()
}

#[tokio::test]
async fn test_compaction_on_restart() {
    let dir = TempDir::new().unwrap();
    let ns = Namespace::new("A");
    let svc = Service {
        name: "B".into(),
        namespace: "A".into(),
        urls: vec!["http://127.0.0.1:1".into()],
        ..Default::default()
    };
    {
        let storage: Arc<dyn Storage> = Arc::new(FileStorage::new(dir.path()));
        storage.connect().unwrap();
        let engine = engine(storage.clone(), Arc::new(GatewayStatus::new()));
        engine.seed().await.unwrap();
        for log in [
            add(Resource::Namespaces, "A", "A", &ns),
            add(Resource::Services, "A", "B", &svc),
            delete(Resource::Services, "A", "B", &svc),
            delete(Resource::Namespaces, "A", "A", &ns),
        ] {
            engine.process(&log, ApplyOptions::LOCAL).await.unwrap();
        }
        assert!(engine.graph().get_namespace("A").is_none());
        assert_eq!(engine.load_persisted().unwrap().len(), 4);
        storage.close().unwrap();
    }

    let storage: Arc<dyn Storage> = Arc::new(FileStorage::new(dir.path()));
    storage.connect().unwrap();
    let engine = engine(storage, Arc::new(GatewayStatus::new()));
    engine.seed().await.unwrap();
    assert_eq!(engine.restore().await.unwrap(), 4);

    assert!(engine.load_persisted().unwrap().is_empty());
    assert!(engine.graph().get_namespace("A").is_none());
    assert!(engine.graph().get_service("B", "A").is_none());
}

#[tokio::test]
async fn test_follower_redirects_writes_to_leader() {
    let status = Arc::new(GatewayStatus::new());
    status.set_ready(true);
    let node: Arc<dyn RaftNode> = Arc::new(StaticNode {
        state: RaftState::Follower,
        leader: Some(("leader".into(), "10.0.0.1:9080".into())),
    });
    let engine = engine(Arc::new(MemoryStorage::new()), status.clone());
    engine.seed().await.unwrap();
    let coordinator = Arc::new(ReplicationCoordinator::new(engine, Some(node), status));
    let app = admin_router(AdminState::new(
        Arc::new(replicated_config()),
        coordinator,
        None,
    ))
    .unwrap();

    let res = app
        .clone()
        .oneshot(admin_request(
            "PUT",
            "/api/v1/route?namespace=default",
            json!({"name": "r1", "paths": ["/"], "methods": ["GET"]}),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(
        res.headers()[header::LOCATION],
        "http://10.0.0.1:9080/api/v1/route?namespace=default"
    );

    // Reads stay local
    let res = app
        .oneshot(admin_request("GET", "/api/v1/route", Value::Null))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_follower_without_leader_is_unavailable() {
    let status = Arc::new(GatewayStatus::new());
    let coordinator = Arc::new(ReplicationCoordinator::new(
        engine(Arc::new(MemoryStorage::new()), status.clone()),
        Some(Arc::new(StaticNode {
            state: RaftState::Candidate,
            leader: None,
        })),
        status,
    ));
    let app = admin_router(AdminState::new(
        Arc::new(replicated_config()),
        coordinator,
        None,
    ))
    .unwrap();

    let res = app
        .oneshot(admin_request(
            "DELETE",
            "/api/v1/service",
            json!({"name": "s1"}),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["error"], "raft: no leader");
}

#[tokio::test]
async fn test_readiness_waits_for_catch_up() {
    let status = Arc::new(GatewayStatus::new());
    let engine = engine(Arc::new(MemoryStorage::new()), status.clone());
    engine.seed().await.unwrap();
    let fsm = AdminFsm::new(engine.clone(), status.clone());
    let coordinator = Arc::new(ReplicationCoordinator::new(
        engine,
        Some(Arc::new(StaticNode {
            state: RaftState::Leader,
            leader: Some(("test".into(), "127.0.0.1:9080".into())),
        })),
        status,
    ));
    let app = admin_router(AdminState::new(
        Arc::new(replicated_config()),
        coordinator,
        None,
    ))
    .unwrap();

    let entries: Vec<RaftEntry> = (1..=5)
        .map(|i| RaftEntry {
            index: i,
            kind: EntryKind::Command,
            data: add(
                Resource::Namespaces,
                &format!("ns{i}"),
                &format!("ns{i}"),
                &Namespace::new(format!("ns{i}")),
            )
            .to_bytes()
            .unwrap(),
        })
        .collect();
    let indexes = RaftIndexes {
        applied_index: 5,
        last_index: 5,
        commit_index: 5,
    };

    let res = app
        .clone()
        .oneshot(admin_request("GET", "/readyz", Value::Null))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);

    let results = fsm.apply_batch(&entries[..2], indexes).await;
    assert!(results.iter().all(Result::is_ok));
    let res = app
        .clone()
        .oneshot(admin_request("GET", "/readyz", Value::Null))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);

    let results = fsm.apply_batch(&entries[2..], indexes).await;
    assert!(results.iter().all(Result::is_ok));
    let res = app
        .oneshot(admin_request("GET", "/readyz", Value::Null))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()["X-Raft-Leader"], "test");
}

#[tokio::test]
async fn test_single_member_cluster_applies_writes_through_raft() {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    storage.connect().unwrap();
    let status = Arc::new(GatewayStatus::new());
    let engine = engine(storage.clone(), status.clone());
    engine.seed().await.unwrap();
    let fsm = Arc::new(AdminFsm::new(engine.clone(), status.clone()));
    let node = HttpRaftNode::new(
        "follower",
        "127.0.0.1:1",
        storage,
        fsm,
        RaftAdminClient::new("http", None).unwrap(),
    )
    .unwrap();
    let coordinator = Arc::new(ReplicationCoordinator::new(
        engine.clone(),
        Some(node.clone() as Arc<dyn RaftNode>),
        status,
    ));
    let app = admin_router(AdminState::new(
        Arc::new(replicated_config()),
        coordinator,
        Some(node.clone()),
    ))
    .unwrap();

    let vote = serde_json::to_value(VoteRequest::<u64>::new(Vote::new(1, 2), None)).unwrap();
    let res = app
        .clone()
        .oneshot(admin_request("POST", "/raft/vote", vote))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);

    node.start().await.unwrap();
    node.bootstrap(vec![RaftServer {
        id: "follower".into(),
        address: "127.0.0.1:1".into(),
        suffrage: Suffrage::Voter,
    }])
    .await
    .unwrap();
    node.wait_for_leader(Duration::from_secs(10)).await.unwrap();

    let res = app
        .clone()
        .oneshot(admin_request("PUT", "/api/v1/namespace", json!({"name": "ns1"})))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    assert!(engine.graph().get_namespace("ns1").is_some());

    let res = app
        .oneshot(admin_request("GET", "/raftadmin/Leader", Value::Null))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["id"], "follower");
    node.shutdown().await.unwrap();
}

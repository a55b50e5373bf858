//! `/api/v1/{kind}` endpoints for namespaces and the namespaced resource kinds.
use axum::{
    Router,
    body::Bytes,
    extract::{OriginalUri, Path, Query, State},
    http::StatusCode,
    response::Response,
    routing::get,
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use super::{AdminState, ApiError, json_data, parse_body};
use crate::core::{
    change_log::{ChangeLog, Command, Resource},
    error::ResourceResult,
    resource_graph::ResourceGraph,
    resources::{Collection, Domain, Module, Namespace, NamespacedResource, Route, Secret, Service},
};

pub const REDACTED: &str = "**redacted**";

#[derive(Debug, Default, Deserialize)]
pub(crate) struct NamespaceQuery {
    #[serde(default)]
    pub namespace: String,
}

/// A namespaced kind served by the generic handlers.
pub(crate) trait AdminResource:
    Serialize + DeserializeOwned + NamespacedResource + Send + Sync + 'static
{
    const KIND: Resource;

    fn list(graph: &ResourceGraph, namespace: &str) -> ResourceResult<Vec<Self>>;

    fn fetch(graph: &ResourceGraph, name: &str, namespace: &str) -> Option<Self>;

    /// Normalize an incoming item before it becomes a change log.
    fn prepare(&mut self) -> Result<(), ApiError> {
        Ok(())
    }

    /// Strip material that must not leave the node.
    fn redact(self) -> Self {
        self
    }
}

macro_rules! admin_resource {
    ($ty:ty, $kind:expr, $list:ident, $get:ident) => {
        impl AdminResource for $ty {
            const KIND: Resource = $kind;

            fn list(graph: &ResourceGraph, namespace: &str) -> ResourceResult<Vec<Self>> {
                graph.$list(namespace)
            }

            fn fetch(graph: &ResourceGraph, name: &str, namespace: &str) -> Option<Self> {
                graph.$get(name, namespace)
            }
        }
    };
}

admin_resource!(Service, Resource::Services, get_services_by_namespace, get_service);
admin_resource!(Route, Resource::Routes, get_routes_by_namespace, get_route);
admin_resource!(Domain, Resource::Domains, get_domains_by_namespace, get_domain);
admin_resource!(Collection, Resource::Collections, get_collections_by_namespace, get_collection);

impl AdminResource for Module {
    const KIND: Resource = Resource::Modules;

    fn list(graph: &ResourceGraph, namespace: &str) -> ResourceResult<Vec<Self>> {
        graph.get_modules_by_namespace(namespace)
    }

    fn fetch(graph: &ResourceGraph, name: &str, namespace: &str) -> Option<Self> {
        graph.get_module(name, namespace)
    }

    fn prepare(&mut self) -> Result<(), ApiError> {
        if self.payload.is_empty() {
            return Err(ApiError::bad_request("payload is required"));
        }
        Ok(())
    }
}

impl AdminResource for Secret {
    const KIND: Resource = Resource::Secrets;

    fn list(graph: &ResourceGraph, namespace: &str) -> ResourceResult<Vec<Self>> {
        graph.get_secrets_by_namespace(namespace)
    }

    fn fetch(graph: &ResourceGraph, name: &str, namespace: &str) -> Option<Self> {
        graph.get_secret(name, namespace)
    }

    fn prepare(&mut self) -> Result<(), ApiError> {
        if self.data.is_empty() {
            return Err(ApiError::bad_request("data is required"));
        }
        self.data = STANDARD.encode(&self.data);
        Ok(())
    }

    fn redact(mut self) -> Self {
        self.data = REDACTED.to_string();
        self
    }
}

fn read_error(e: crate::core::error::ResourceError) -> ApiError {
    ApiError::new(e.read_status(), e.to_string())
}

async fn list_resources<R: AdminResource>(
    State(state): State<AdminState>,
    Query(query): Query<NamespaceQuery>,
) -> Result<Response, ApiError> {
    let namespace = state.namespace_or_default(&query.namespace)?;
    let items = R::list(state.engine().graph(), &namespace).map_err(read_error)?;
    let items: Vec<R> = items.into_iter().map(R::redact).collect();
    Ok(json_data(StatusCode::OK, items))
}

async fn get_resource<R: AdminResource>(
    State(state): State<AdminState>,
    Path(name): Path<String>,
    Query(query): Query<NamespaceQuery>,
) -> Result<Response, ApiError> {
    let namespace = state.namespace_or_default(&query.namespace)?;
    let graph = state.engine().graph();
    if graph.get_namespace(&namespace).is_none() {
        return Err(ApiError::not_found(format!("namespace not found: {namespace}")));
    }
    match R::fetch(graph, &name, &namespace) {
        Some(item) => Ok(json_data(StatusCode::OK, item.redact())),
        None => Err(ApiError::not_found(format!(
            "{} not found: {name}",
            R::KIND.singular()
        ))),
    }
}

async fn put_resource<R: AdminResource>(
    State(state): State<AdminState>,
    OriginalUri(uri): OriginalUri,
    body: Bytes,
) -> Result<Response, ApiError> {
    let mut item: R = parse_body(&body)?;
    if item.name().is_empty() {
        return Err(ApiError::bad_request("name is required"));
    }
    let namespace = state.namespace_or_default(item.namespace())?;
    item.set_namespace(&namespace);
    item.prepare()?;

    let log = ChangeLog::new(Command::add(R::KIND), namespace.clone(), item.name(), &item)?;
    state.apply(&log, &uri).await?;

    let items = R::list(state.engine().graph(), &namespace).map_err(read_error)?;
    let items: Vec<R> = items.into_iter().map(R::redact).collect();
    Ok(json_data(StatusCode::CREATED, items))
}

async fn delete_resource<R: AdminResource>(
    State(state): State<AdminState>,
    OriginalUri(uri): OriginalUri,
    body: Bytes,
) -> Result<Response, ApiError> {
    let mut item: R = parse_body(&body)?;
    if item.name().is_empty() {
        return Err(ApiError::bad_request("name is required"));
    }
    let namespace = state.namespace_or_default(item.namespace())?;
    item.set_namespace(&namespace);

    let log = ChangeLog::new(Command::delete(R::KIND), namespace, item.name(), &item)?;
    state.apply(&log, &uri).await?;
    Ok(json_data(StatusCode::ACCEPTED, serde_json::Value::Null))
}

async fn list_namespaces(State(state): State<AdminState>) -> Response {
    json_data(StatusCode::OK, state.engine().graph().get_namespaces())
}

async fn get_namespace(
    State(state): State<AdminState>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    state
        .engine()
        .graph()
        .get_namespace(&name)
        .map(|ns| json_data(StatusCode::OK, ns))
        .ok_or_else(|| ApiError::not_found(format!("namespace not found: {name}")))
}

async fn put_namespace(
    State(state): State<AdminState>,
    OriginalUri(uri): OriginalUri,
    body: Bytes,
) -> Result<Response, ApiError> {
    let namespace: Namespace = parse_body(&body)?;
    if namespace.name.is_empty() {
        return Err(ApiError::bad_request("name is required"));
    }
    let log = ChangeLog::new(
        Command::add(Resource::Namespaces),
        namespace.name.clone(),
        namespace.name.clone(),
        &namespace,
    )?;
    state.apply(&log, &uri).await?;
    Ok(json_data(
        StatusCode::CREATED,
        state.engine().graph().get_namespaces(),
    ))
}

async fn delete_namespace(
    State(state): State<AdminState>,
    OriginalUri(uri): OriginalUri,
    body: Bytes,
) -> Result<Response, ApiError> {
    let namespace: Namespace = parse_body(&body)?;
    if namespace.name.is_empty() {
        return Err(ApiError::bad_request("name is required"));
    }
    let log = ChangeLog::new(
        Command::delete(Resource::Namespaces),
        namespace.name.clone(),
        namespace.name.clone(),
        &namespace,
    )?;
    state.apply(&log, &uri).await?;
    Ok(json_data(StatusCode::ACCEPTED, serde_json::Value::Null))
}

fn kind_routes<R: AdminResource>(router: Router<AdminState>) -> Router<AdminState> {
    let base = format!("/api/v1/{}", R::KIND.singular());
    let item = format!("{base}/{{name}}");
    router
        .route(
            &base,
            get(list_resources::<R>)
                .put(put_resource::<R>)
                .delete(delete_resource::<R>),
        )
        .route(&item, get(get_resource::<R>))
}

pub(crate) fn routes() -> Router<AdminState> {
    let router = Router::new()
        .route(
            "/api/v1/namespace",
            get(list_namespaces)
                .put(put_namespace)
                .delete(delete_namespace),
        )
        .route("/api/v1/namespace/{name}", get(get_namespace));
    let router = kind_routes::<Service>(router);
    let router = kind_routes::<Route>(router);
    let router = kind_routes::<Module>(router);
    let router = kind_routes::<Domain>(router);
    let router = kind_routes::<Collection>(router);
    kind_routes::<Secret>(router)
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::super::{admin_router, test_support::*};
    use super::*;

    #[tokio::test]
    async fn test_put_list_get_delete_service() {
        let app = admin_router(state(config()).await).unwrap();

        let res = app
            .clone()
            .oneshot(request(
                "PUT",
                "/api/v1/service",
                json!({"name": "s1", "urls": ["http://127.0.0.1:1"]}),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);
        let body = body_json(res).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["data"][0]["namespace"], "default");

        let res = app
            .clone()
            .oneshot(request("GET", "/api/v1/service/s1?namespace=default", Value::Null))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(body_json(res).await["data"]["name"], "s1");

        let res = app
            .clone()
            .oneshot(request("DELETE", "/api/v1/service", json!({"name": "s1"})))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::ACCEPTED);

        let res = app
            .oneshot(request("GET", "/api/v1/service/s1", Value::Null))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(res).await["error"], "service not found: s1");
    }

    #[tokio::test]
    async fn test_write_errors() {
        let app = admin_router(state(config()).await).unwrap();

        let res = app
            .clone()
            .oneshot(request("PUT", "/api/v1/route", json!({"paths": ["/"]})))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(res).await["error"], "name is required");

        let res = app
            .clone()
            .oneshot(request("PUT", "/api/v1/route", json!("not an object")))
            .await
            .unwrap();
        assert_eq!(body_json(res).await["error"], "error unmarshalling body");

        // Unknown namespace is a referential error on write
        let res = app
            .clone()
            .oneshot(request(
                "PUT",
                "/api/v1/service",
                json!({"name": "s1", "namespace": "nope", "urls": ["http://a"]}),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(res).await["error"], "namespace not found: nope");

        let res = app
            .oneshot(request("GET", "/api/v1/service?namespace=nope", Value::Null))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_namespace_required_without_default() {
        let mut config = config();
        config.disable_default_namespace = true;
        let app = admin_router(state(config).await).unwrap();
        let res = app
            .oneshot(request("PUT", "/api/v1/service", json!({"name": "s1"})))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(res).await["error"], "namespace is required");
    }

    #[tokio::test]
    async fn test_secrets_are_encoded_and_redacted() {
        let state = state(config()).await;
        let app = admin_router(state.clone()).unwrap();
        let res = app
            .clone()
            .oneshot(request("PUT", "/api/v1/secret", json!({"name": "k", "data": "hunter2"})))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);
        assert_eq!(body_json(res).await["data"][0]["data"], REDACTED);

        let stored = state.engine().graph().get_secret("k", "default").unwrap();
        assert_eq!(stored.data, STANDARD.encode("hunter2"));

        let res = app
            .oneshot(request("PUT", "/api/v1/secret", json!({"name": "k"})))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_namespace_crud() {
        let app = admin_router(state(config()).await).unwrap();
        let res = app
            .clone()
            .oneshot(request("PUT", "/api/v1/namespace", json!({"name": "n1"})))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);
        assert_eq!(body_json(res).await["count"], 2);

        let res = app
            .clone()
            .oneshot(request("GET", "/api/v1/namespace/n1", Value::Null))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let res = app
            .clone()
            .oneshot(request("DELETE", "/api/v1/namespace", json!({"name": "n1"})))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::ACCEPTED);

        let res = app
            .oneshot(request("GET", "/api/v1/namespace/n1", Value::Null))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }
}

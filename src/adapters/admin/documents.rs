//! `/api/v1/document` endpoints. Documents are validated against their collection's
//! schema here, before the change log is submitted.
use axum::{
    Router,
    body::Bytes,
    extract::{OriginalUri, Path, Query, State},
    http::{StatusCode, Uri},
    response::Response,
    routing::get,
};
use serde::Deserialize;
use serde_json::Value;

use super::{AdminState, ApiError, json_data, parse_body};
use crate::core::{
    change_log::{ChangeLog, Command, Resource},
    documents::DocumentError,
    resources::{Collection, CollectionType, Document},
    schema,
};

const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Debug, Default, Deserialize)]
struct DocumentQuery {
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    collection: String,
    limit: Option<usize>,
    #[serde(default)]
    offset: usize,
}

fn storage_error(e: DocumentError) -> ApiError {
    ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

/// Resolve namespace and collection, requiring both to exist.
fn collection(
    state: &AdminState,
    namespace: &str,
    collection: &str,
) -> Result<(String, Collection), ApiError> {
    let namespace = state.namespace_or_default(namespace)?;
    if collection.is_empty() {
        return Err(ApiError::bad_request("collection is required"));
    }
    let graph = state.engine().graph();
    if graph.get_namespace(&namespace).is_none() {
        return Err(ApiError::not_found(format!("namespace not found: {namespace}")));
    }
    let found = graph
        .get_collection(collection, &namespace)
        .ok_or_else(|| ApiError::not_found(format!("collection not found: {collection}")))?;
    Ok((namespace, found))
}

async fn list_documents(
    State(state): State<AdminState>,
    Query(query): Query<DocumentQuery>,
) -> Result<Response, ApiError> {
    let (namespace, col) = collection(&state, &query.namespace, &query.collection)?;
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE);
    let docs = state
        .engine()
        .documents()
        .fetch_page(&namespace, &col.name, query.offset, limit)
        .map_err(storage_error)?;
    Ok(json_data(StatusCode::OK, docs))
}

async fn get_document(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Query(query): Query<DocumentQuery>,
) -> Result<Response, ApiError> {
    let (namespace, col) = collection(&state, &query.namespace, &query.collection)?;
    match state
        .engine()
        .documents()
        .fetch_by_id(&namespace, &col.name, &id)
        .map_err(storage_error)?
    {
        Some(doc) => Ok(json_data(StatusCode::OK, doc)),
        None => Err(ApiError::not_found(format!("document not found: {id}"))),
    }
}

async fn store_document(
    state: &AdminState,
    uri: &Uri,
    mut doc: Document,
) -> Result<Response, ApiError> {
    if doc.id.is_empty() {
        return Err(ApiError::bad_request("document id is required"));
    }
    let (namespace, col) = collection(state, &doc.namespace, &doc.collection)?;
    if col.kind != CollectionType::Document {
        return Err(ApiError::bad_request(format!(
            "collection {} does not store documents",
            col.name
        )));
    }
    if let Some(schema) = &col.schema {
        let errors = schema::validate(schema, &doc.data);
        if !errors.is_empty() {
            return Err(ApiError::validation(errors));
        }
    }
    doc.namespace = namespace.clone();
    doc.collection = col.name.clone();

    let log = ChangeLog::new(Command::add(Resource::Documents), namespace.clone(), doc.id.clone(), &doc)?;
    state.apply(&log, uri).await?;

    let stored = state
        .engine()
        .documents()
        .fetch_by_id(&namespace, &col.name, &doc.id)
        .map_err(storage_error)?
        .unwrap_or(doc);
    Ok(json_data(StatusCode::CREATED, stored))
}

async fn remove_document(
    state: &AdminState,
    uri: &Uri,
    mut doc: Document,
) -> Result<Response, ApiError> {
    if doc.id.is_empty() {
        return Err(ApiError::bad_request("document id is required"));
    }
    let (namespace, col) = collection(state, &doc.namespace, &doc.collection)?;
    doc.namespace = namespace.clone();
    doc.collection = col.name;
    let log = ChangeLog::new(Command::delete(Resource::Documents), namespace, doc.id.clone(), &doc)?;
    state.apply(&log, uri).await?;
    Ok(json_data(StatusCode::ACCEPTED, Value::Null))
}

/// `PUT /api/v1/document` with a full document body.
async fn put_document(
    State(state): State<AdminState>,
    OriginalUri(uri): OriginalUri,
    body: Bytes,
) -> Result<Response, ApiError> {
    let doc: Document = parse_body(&body)?;
    store_document(&state, &uri, doc).await
}

/// `PUT /api/v1/document/{id}?namespace=&collection=` with the document data as body.
async fn put_document_by_id(
    State(state): State<AdminState>,
    OriginalUri(uri): OriginalUri,
    Path(id): Path<String>,
    Query(query): Query<DocumentQuery>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let data: Value = parse_body(&body)?;
    let doc = Document {
        id,
        namespace: query.namespace,
        collection: query.collection,
        data,
        ..Default::default()
    };
    store_document(&state, &uri, doc).await
}

async fn delete_document(
    State(state): State<AdminState>,
    OriginalUri(uri): OriginalUri,
    body: Bytes,
) -> Result<Response, ApiError> {
    let doc: Document = parse_body(&body)?;
    remove_document(&state, &uri, doc).await
}

async fn delete_document_by_id(
    State(state): State<AdminState>,
    OriginalUri(uri): OriginalUri,
    Path(id): Path<String>,
    Query(query): Query<DocumentQuery>,
) -> Result<Response, ApiError> {
    let doc = Document {
        id,
        namespace: query.namespace,
        collection: query.collection,
        ..Default::default()
    };
    remove_document(&state, &uri, doc).await
}

pub(crate) fn routes() -> Router<AdminState> {
    Router::new()
        .route(
            "/api/v1/document",
            get(list_documents).put(put_document).delete(delete_document),
        )
        .route(
            "/api/v1/document/{document_id}",
            get(get_document)
                .put(put_document_by_id)
                .delete(delete_document_by_id),
        )
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tower::ServiceExt;

    use super::super::{admin_router, test_support::*};
    use super::*;

    async fn app_with_users() -> Router {
        let app = admin_router(state(config()).await).unwrap();
        let res = app
            .clone()
            .oneshot(request(
                "PUT",
                "/api/v1/collection",
                json!({
                    "name": "users",
                    "type": "document",
                    "schema": {
                        "type": "object",
                        "required": ["email"],
                        "properties": {"email": {"type": "string"}}
                    }
                }),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);
        app
    }

    #[tokio::test]
    async fn test_document_lifecycle() {
        let app = app_with_users().await;

        let res = app
            .clone()
            .oneshot(request(
                "PUT",
                "/api/v1/document",
                json!({"id": "u1", "collection": "users", "data": {"email": "a@b.c"}}),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);
        assert_eq!(body_json(res).await["data"]["namespace"], "default");

        let res = app
            .clone()
            .oneshot(request(
                "PUT",
                "/api/v1/document/u2?collection=users",
                json!({"email": "d@e.f"}),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);

        let res = app
            .clone()
            .oneshot(request(
                "GET",
                "/api/v1/document?collection=users&limit=1",
                Value::Null,
            ))
            .await
            .unwrap();
        let body = body_json(res).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["data"][0]["id"], "u1");

        let res = app
            .clone()
            .oneshot(request(
                "DELETE",
                "/api/v1/document/u1?collection=users",
                Value::Null,
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::ACCEPTED);

        let res = app
            .oneshot(request("GET", "/api/v1/document/u1?collection=users", Value::Null))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_schema_violation_is_rejected() {
        let app = app_with_users().await;
        let res = app
            .clone()
            .oneshot(request(
                "PUT",
                "/api/v1/document/u1?collection=users",
                json!({"email": 42}),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let body = body_json(res).await;
        assert_eq!(body["errors"][0], "/email: expected string, got number");

        let res = app
            .oneshot(request("GET", "/api/v1/document?collection=users", Value::Null))
            .await
            .unwrap();
        assert_eq!(body_json(res).await["count"], 0);
    }

    #[tokio::test]
    async fn test_missing_collection() {
        let app = admin_router(state(config()).await).unwrap();
        let res = app
            .clone()
            .oneshot(request("GET", "/api/v1/document", Value::Null))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let res = app
            .oneshot(request("GET", "/api/v1/document?collection=ghost", Value::Null))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }
}

use http::StatusCode;
use thiserror::Error;

use super::documents::DocumentError;
use crate::ports::{raft::RaftError, storage::StorageError};

/// Failures of resource graph and document operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ResourceError {
    #[error("namespace not found: {0}")]
    NamespaceNotFound(String),

    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("module not found: {0}")]
    ModuleNotFound(String),

    #[error("route not found: {0}")]
    RouteNotFound(String),

    #[error("domain not found: {0}")]
    DomainNotFound(String),

    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    #[error("document not found: {0}")]
    DocumentNotFound(String),

    #[error("secret not found: {0}")]
    SecretNotFound(String),

    /// Deletion blocked by a referencing entity
    #[error("cannot delete {kind}: {name}: {reason}")]
    CannotDelete {
        kind: &'static str,
        name: String,
        reason: String,
    },

    #[error("{0}")]
    Validation(String),
}

impl ResourceError {
    pub fn cannot_delete(kind: &'static str, name: &str, reason: impl Into<String>) -> Self {
        Self::CannotDelete {
            kind,
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NamespaceNotFound(_)
                | Self::ServiceNotFound(_)
                | Self::ModuleNotFound(_)
                | Self::RouteNotFound(_)
                | Self::DomainNotFound(_)
                | Self::CollectionNotFound(_)
                | Self::DocumentNotFound(_)
                | Self::SecretNotFound(_)
        )
    }

    /// Status for a read that failed with this error. Writes always map to 400.
    pub fn read_status(&self) -> StatusCode {
        if self.is_not_found() {
            StatusCode::NOT_FOUND
        } else {
            StatusCode::BAD_REQUEST
        }
    }
}

pub type ResourceResult<T> = Result<T, ResourceError>;

/// Failures while applying or submitting a change log
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ChangeLogError {
    #[error("change log id is required")]
    MissingId,

    #[error("duplicate change log id: {0}")]
    DuplicateId(String),

    #[error("error decoding {cmd} item: {source}")]
    Decode {
        cmd: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error(transparent)]
    Raft(#[from] RaftError),

    #[error("reload failed: {0}")]
    Reload(String),

    /// State could not be rebuilt after a failed apply
    #[error("fatal: {0}")]
    Fatal(String),
}

impl ChangeLogError {
    /// Status code for the admin boundary when a mutation fails.
    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::MissingId | Self::DuplicateId(_) | Self::Decode { .. } | Self::Resource(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::Raft(RaftError::NotLeader { .. }) => StatusCode::TEMPORARY_REDIRECT,
            Self::Raft(RaftError::NoLeader | RaftError::NotStarted) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Raft(RaftError::Apply(_)) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type ChangeLogResult<T> = Result<T, ChangeLogError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_and_status() {
        let err = ResourceError::cannot_delete("namespace", "n1", "routes still linked");
        assert_eq!(
            err.to_string(),
            "cannot delete namespace: n1: routes still linked"
        );
        assert_eq!(err.read_status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ResourceError::ServiceNotFound("s".into()).read_status(),
            StatusCode::NOT_FOUND
        );

        let write_err = ChangeLogError::from(ResourceError::NamespaceNotFound("x".into()));
        assert_eq!(write_err.http_status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ChangeLogError::from(RaftError::NoLeader).http_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ChangeLogError::from(StorageError::NotConnected).http_status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}

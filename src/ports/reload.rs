use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ReloadError {
    /// A module failed to transpile or compile
    #[error("error compiling module {module}/{namespace}: {reason}")]
    Module {
        module: String,
        namespace: String,
        reason: String,
    },

    /// A route could not be registered
    #[error("error setting up route {route}/{namespace}: {reason}")]
    Route {
        route: String,
        namespace: String,
        reason: String,
    },

    #[error("reload timed out")]
    Timeout,
}

pub type ReloadResult<T> = Result<T, ReloadError>;

/// Reloader defines the port through which the change-log engine asks the data plane to
/// rebuild its routers from the current resource graph.
#[async_trait]
pub trait Reloader: Send + Sync + 'static {
    async fn reload(&self) -> ReloadResult<()>;
}

/// Reloader that does nothing; used where no data plane is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReloader;

#[async_trait]
impl Reloader for NoopReloader {
    async fn reload(&self) -> ReloadResult<()> {
        Ok(())
    }
}

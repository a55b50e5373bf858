use std::fmt;

use thiserror::Error;

/// Named entry points a module may provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryPoint {
    FetchUpstream,
    RequestModifier,
    ResponseModifier,
    RequestHandler,
    ErrorHandler,
}

impl EntryPoint {
    pub const ALL: [EntryPoint; 5] = [
        EntryPoint::FetchUpstream,
        EntryPoint::RequestModifier,
        EntryPoint::ResponseModifier,
        EntryPoint::RequestHandler,
        EntryPoint::ErrorHandler,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntryPoint::FetchUpstream => "fetchUpstream",
            EntryPoint::RequestModifier => "requestModifier",
            EntryPoint::ResponseModifier => "responseModifier",
            EntryPoint::RequestHandler => "requestHandler",
            EntryPoint::ErrorHandler => "errorHandler",
        }
    }
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ScriptError {
    /// Source could not be transpiled to plain JavaScript
    #[error("transpile error: {0}")]
    Transpile(String),

    #[error("unsupported import: {0}")]
    UnsupportedImport(String),

    /// Evaluation of the module body failed
    #[error("compile error: {0}")]
    Compile(String),

    /// An entry point threw or its promise rejected
    #[error("{entry} failed: {message}")]
    Runtime { entry: EntryPoint, message: String },

    /// Loop iteration or recursion limit hit; the runtime is not reused
    #[error("{entry} exceeded a runtime limit: {message}")]
    LimitExceeded { entry: EntryPoint, message: String },

    #[error("{entry} did not settle within {secs}s")]
    Timeout { entry: EntryPoint, secs: u64 },

    #[error("{entry} returned an invalid value: {message}")]
    InvalidReturn { entry: EntryPoint, message: String },

    /// The runtime thread is gone
    #[error("script runtime stopped")]
    Stopped,

    #[error("runtime pool exhausted")]
    Exhausted,

    #[error("runtime pool closed")]
    Closed,
}

pub type ScriptResult<T> = Result<T, ScriptError>;

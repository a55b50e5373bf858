pub mod admin;
pub mod http_client;
pub mod http_handler;
pub mod middleware;
pub mod proxy;
pub mod raft;
pub mod scripting;
pub mod storage;

/// Re-export commonly used types from adapters
pub use http_client::HttpClientAdapter;
pub use http_handler::HttpHandler;
pub use middleware::*;

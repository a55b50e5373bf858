//! Domain logic: the resource graph, change logs and their engine, replication glue and the
//! routing primitives the data plane is built from.
pub mod change_hash;
pub mod change_log;
pub mod compaction;
pub mod documents;
pub mod engine;
pub mod error;
pub mod load_balancer;
pub mod pattern;
pub mod replication;
pub mod resource_graph;
pub mod resources;
pub mod router;
pub mod schema;
pub mod status;

pub use change_log::{ChangeLog, Command, Resource};
pub use engine::ChangeLogEngine;
pub use error::{ChangeLogError, ResourceError};
pub use resource_graph::ResourceGraph;
pub use status::{GatewayStatus, ProxyStatus};

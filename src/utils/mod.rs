pub mod duration;
pub mod graceful_shutdown;
pub mod ip_list;

pub use graceful_shutdown::{GracefulShutdown, ShutdownReason, ShutdownToken};
pub use ip_list::IpList;

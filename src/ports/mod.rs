pub mod http_client;
pub mod raft;
pub mod reload;
pub mod scripting;
pub mod storage;

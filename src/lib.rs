pub mod api;
pub mod cluster;
pub mod config;
pub mod error;
pub mod locking;
pub mod master;
pub mod opcodes;
pub mod processor;
pub mod rpc;
pub mod scheduler;
pub mod shutdown;
pub mod storage;
pub mod worker;

pub mod broadcast;
pub mod config;
pub mod error;
pub mod http;
pub mod node;
pub mod scheduler;
pub mod shutdown;
pub mod storage;

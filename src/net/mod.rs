//! Networking layer: the pooled, handshaken TCP connections (component D)
//! and the async fan-out RPC client built on top of them (component E).

pub mod client;
pub mod pool;

pub use client::{ConnectionState, RpcClient, TaskHandle};
pub use pool::ConnectionPool;

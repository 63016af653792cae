//! Server metrics.

use metriken::{Counter, Gauge, metric};

/// Proxies currently connected.
#[metric(name = "server_connections")]
pub static CONNECTIONS: Gauge = Gauge::new();

/// RPC requests received.
#[metric(name = "server_rpc_requests")]
pub static RPC_REQUESTS: Counter = Counter::new();

/// Data chunks served to proxies.
#[metric(name = "server_chunks_served")]
pub static CHUNKS_SERVED: Counter = Counter::new();

/// Data chunks stored from uploads.
#[metric(name = "server_chunks_stored")]
pub static CHUNKS_STORED: Counter = Counter::new();

/// Files deleted.
#[metric(name = "server_files_deleted")]
pub static FILES_DELETED: Counter = Counter::new();

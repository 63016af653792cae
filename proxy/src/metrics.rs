//! Proxy metrics.

use metriken::{Counter, Gauge, metric};

/// Clients currently connected.
#[metric(name = "proxy_client_connections")]
pub static CLIENT_CONNECTIONS: Gauge = Gauge::new();

/// File operations received from clients.
#[metric(name = "proxy_syscall_ops")]
pub static SYSCALL_OPS: Counter = Counter::new();

/// Opens resolved from the local cache without a transfer.
#[metric(name = "proxy_cache_hits")]
pub static CACHE_HITS: Counter = Counter::new();

/// Opens that had to download the file.
#[metric(name = "proxy_cache_misses")]
pub static CACHE_MISSES: Counter = Counter::new();

/// Entries evicted to make room.
#[metric(name = "proxy_cache_evictions")]
pub static CACHE_EVICTIONS: Counter = Counter::new();

/// RPC calls issued to the file server.
#[metric(name = "proxy_rpc_calls")]
pub static RPC_CALLS: Counter = Counter::new();

/// Payload bytes fetched from the file server.
#[metric(name = "proxy_bytes_downloaded")]
pub static BYTES_DOWNLOADED: Counter = Counter::new();

/// Payload bytes pushed to the file server.
#[metric(name = "proxy_bytes_uploaded")]
pub static BYTES_UPLOADED: Counter = Counter::new();

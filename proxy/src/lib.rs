//! Ferry proxy - client-side caching file proxy.
//!
//! Sits between unmodified file-system clients and a remote file server.
//! Clients issue POSIX-style operations; the proxy materializes remote
//! files in a bounded, versioned on-disk cache, serves later accesses
//! locally, and pushes modifications back at close with open-close
//! (AFS-style) session semantics.

pub mod cache;
pub mod config;
pub mod front;
pub mod metrics;
pub mod path;
pub mod rpc;
pub mod session;

pub mod logging;
pub mod signal;

pub use cache::{CacheEntry, CacheStore};
pub use config::Config;
pub use front::run;
pub use path::CachePaths;
pub use session::SessionManager;

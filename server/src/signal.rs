//! Shutdown flag for the accept loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Install the Ctrl-C handler. The returned flag goes true once, stays
/// true, and is polled by the accept loop.
pub fn install_signal_handler() -> Arc<AtomicBool> {
    let shutdown_flag = Arc::new(AtomicBool::new(false));

    ctrlc::set_handler({
        let shutdown_flag = Arc::clone(&shutdown_flag);
        move || shutdown_flag.store(true, Ordering::SeqCst)
    })
    .expect("failed to install signal handler");

    shutdown_flag
}

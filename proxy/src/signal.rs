//! Shutdown signal wiring.
//!
//! Ctrl-C flips a shared flag; the accept loop polls it between accepts
//! and stops handing out new client threads. In-flight sessions finish
//! their current operation and exit when their connections drop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

/// Install the Ctrl-C handler and return the flag the front polls.
pub fn install_signal_handler() -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&flag);

    ctrlc::set_handler(move || {
        info!("shutdown signal received");
        handler_flag.store(true, Ordering::SeqCst);
    })
    .expect("failed to install signal handler");

    flag
}

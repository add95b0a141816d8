//! Process-wide shutdown state.
//!
//! Two states:
//! - `LOOP_RUNNING`: an orchestrator event loop is listening for shutdown
//! - `SHUTDOWN`: Ctrl+C has been received

use std::sync::LazyLock;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;

/// An event loop has subscribed to the shutdown signal
static LOOP_RUNNING: AtomicBool = AtomicBool::new(false);

/// Shutdown has been requested (Ctrl+C received)
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// Broadcast flag observed by running event loops
static SHUTDOWN_SIGNAL: LazyLock<watch::Sender<bool>> = LazyLock::new(|| watch::channel(false).0);

/// Setup the global Ctrl+C handler. Call once at program start.
///
/// - No event loop running: exit immediately
/// - Event loop running: flip the shutdown signal so it can kill children
/// - Second Ctrl+C: exit immediately
pub fn setup_shutdown_handler() -> anyhow::Result<()> {
    ctrlc::set_handler(|| {
        if SHUTDOWN.swap(true, Ordering::SeqCst) || !LOOP_RUNNING.load(Ordering::SeqCst) {
            std::process::exit(130);
        }
        crate::log!("hot"; "shutting down...");
        SHUTDOWN_SIGNAL.send_replace(true);
    })
    .map_err(|e| anyhow::anyhow!("failed to set Ctrl+C handler: {}", e))
}

/// Subscribe to the shutdown signal, marking an event loop as running.
pub fn shutdown_signal() -> watch::Receiver<bool> {
    LOOP_RUNNING.store(true, Ordering::SeqCst);
    SHUTDOWN_SIGNAL.subscribe()
}

/// Check if shutdown has been requested
pub fn is_shutdown() -> bool {
    SHUTDOWN.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_signal_starts_false() {
        let rx = shutdown_signal();
        assert!(!*rx.borrow());
        assert!(LOOP_RUNNING.load(Ordering::SeqCst));
    }
}

//! FileSystem watcher
//!
//! Watches source directories, manifests and the configuration file, and
//! sends debounced [`ChangeBatch`]es to the coordinator.
//!
//! Architecture:
//! ```text
//! notify → (thread bridge) → Debouncer (timing, dedup) → ChangeBatch → Coordinator
//! ```

use std::time::Duration;

use notify::RecommendedWatcher;
use tokio::sync::mpsc;

// Pure timing and deduplication.
mod debouncer;
// Shared fs event types.
mod types;
// Watch root attach/re-attach lifecycle.
mod watch_roots;

#[cfg(test)]
mod tests;

pub use debouncer::DEFAULT_DEBOUNCE_MS;
pub use types::{ChangeBatch, ChangeKind, FileChange};
pub use watch_roots::WatchRoot;

use debouncer::Debouncer;
use watch_roots::WatchRoots;

/// Watches the given roots until the batch receiver is dropped.
pub struct FsWatcher {
    /// Channel to receive notify events (sync -> async bridge)
    notify_rx: std::sync::mpsc::Receiver<notify::Result<notify::Event>>,
    /// Watcher handle (must be kept alive)
    watcher: RecommendedWatcher,
    watch_roots: WatchRoots,
    batch_tx: mpsc::UnboundedSender<ChangeBatch>,
    debouncer: Debouncer,
}

impl FsWatcher {
    /// Start watching immediately, so events during the first build are kept.
    pub fn new(
        roots: Vec<WatchRoot>,
        interval: Duration,
        batch_tx: mpsc::UnboundedSender<ChangeBatch>,
    ) -> notify::Result<Self> {
        let (notify_tx, notify_rx) = std::sync::mpsc::channel();

        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = notify_tx.send(res);
        })?;

        let mut watch_roots = WatchRoots::new(roots);
        watch_roots.attach_existing(&mut watcher)?;

        Ok(Self {
            notify_rx,
            watcher,
            watch_roots,
            batch_tx,
            debouncer: Debouncer::new(interval),
        })
    }

    /// Run the watch loop
    pub async fn run(self) {
        let Self {
            notify_rx,
            mut watcher,
            mut watch_roots,
            batch_tx,
            mut debouncer,
        } = self;

        let (async_tx, mut async_rx) = mpsc::channel::<notify::Event>(64);

        std::thread::spawn(move || {
            while let Ok(result) = notify_rx.recv() {
                match result {
                    Ok(event) => {
                        if async_tx.blocking_send(event).is_err() {
                            break; // Receiver dropped
                        }
                    }
                    Err(e) => crate::log!("watch"; "notify error: {}", e),
                }
            }
        });

        loop {
            tokio::select! {
                biased;
                Some(event) = async_rx.recv() => debouncer.add_event(&event),
                _ = tokio::time::sleep(debouncer.sleep_duration()) => {
                    watch_roots.maintain(&mut watcher);
                    let Some(batch) = debouncer.take_if_ready() else {
                        continue;
                    };
                    log_batch(&batch);
                    if batch_tx.send(batch).is_err() {
                        break;
                    }
                }
                _ = batch_tx.closed() => break,
            }
        }
    }
}

fn log_batch(batch: &ChangeBatch) {
    for change in &batch.changes {
        crate::debug!("watch"; "{}: {}", change.kind.label(), change.path.display());
    }
}

//! Coordinator - the single owner of all build state
//!
//! Every input is an event on one loop, handled to completion before the
//! next one is looked at:
//!
//! ```text
//! FsWatcher ──[ChangeBatch]──┐
//! WsServer ───[HubEvent]─────┼──► Orchestrator ──► ProcessPool ──[JobDone]──┐
//! Ctrl+C ─────[shutdown]─────┘        ▲                                      │
//!                                     └──────────────────────────────────────┘
//! ```
//!
//! - `dispatch` - state and per-event handlers
//! - `display` - terminal status lines
//! - `watch_paths` - what the watcher has to cover

mod dispatch;
mod display;
mod watch_paths;

#[cfg(test)]
mod tests;

use std::future::Future;

use tokio::sync::{mpsc, watch};

use self::dispatch::Dispatch;
use super::fs::ChangeBatch;
use super::ws::HubEvent;
use crate::config::Config;
use crate::core::{CompilationMode, RunMode};
use crate::persist::Persisted;
use crate::process::JobDone;

pub use watch_paths::collect_watch_roots;

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// `make` finished; `true` when every enabled target succeeded.
    Finished(bool),
    /// The config file changed.
    Restart,
    Shutdown,
}

/// Everything one run is built from.
pub struct Setup<'a> {
    pub config: &'a Config,
    pub run_mode: RunMode,
    /// Port browsers connect to, baked into injected code.
    pub ws_port: u16,
    /// Mode for targets without a persisted one.
    pub default_mode: CompilationMode,
    pub persisted: Option<Persisted>,
}

/// Event sources for [`Orchestrator::run`]; `None` sources never fire.
pub struct Inbox {
    pub batches: Option<mpsc::UnboundedReceiver<ChangeBatch>>,
    pub hub: Option<mpsc::UnboundedReceiver<HubEvent>>,
    pub shutdown: watch::Receiver<bool>,
}

pub struct Orchestrator {
    dispatch: Dispatch,
    jobs_rx: mpsc::UnboundedReceiver<JobDone>,
}

impl Orchestrator {
    pub fn new(setup: Setup<'_>) -> Self {
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        Self {
            dispatch: Dispatch::new(setup, jobs_tx),
            jobs_rx,
        }
    }

    /// `true` whenever nothing is running and every tab has settled.
    pub fn idle(&self) -> watch::Receiver<bool> {
        self.dispatch.idle()
    }

    /// Build every enabled target, then keep reacting until an [`Exit`].
    pub async fn run(self, inbox: Inbox) -> Exit {
        let Self {
            mut dispatch,
            mut jobs_rx,
        } = self;
        let Inbox {
            mut batches,
            mut hub,
            mut shutdown,
        } = inbox;

        crate::debug!("coordinator"; "start ({} targets)", dispatch.targets.len());
        dispatch.start_all();

        let exit = loop {
            dispatch.update_idle();
            if *shutdown.borrow() {
                break Exit::Shutdown;
            }
            if dispatch.env.run_mode == RunMode::Make && dispatch.is_quiescent() {
                break Exit::Finished(dispatch.all_succeeded());
            }

            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break Exit::Shutdown;
                    }
                }
                Some(done) = jobs_rx.recv() => dispatch.on_job_done(done).await,
                Some(batch) = recv(&mut batches) => {
                    if let Some(exit) = dispatch.on_batch(&batch) {
                        break exit;
                    }
                }
                Some(event) = recv(&mut hub) => dispatch.on_hub_event(event),
                else => break Exit::Shutdown,
            }
        };

        dispatch.shutdown();
        crate::debug!("coordinator"; "stopped: {:?}", exit);
        exit
    }
}

/// Receive from an optional channel; a missing one stays pending forever.
fn recv<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> impl Future<Output = Option<T>> + '_ {
    async move {
        match rx {
            Some(rx) => rx.recv().await,
            None => std::future::pending().await,
        }
    }
}

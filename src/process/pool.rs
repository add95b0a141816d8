//! Bounded job pool with per-class FIFO admission.
//!
//! ```text
//! submit ──► queue (FIFO per class) ──► running (≤ limit) ──► JobDone ──► finish()
//!              │                           │
//!            cancel: dropped,            cancel: slot freed now,
//!            Interrupted sent            kill runs in background
//! ```
//!
//! The pool never interprets outcomes. Completions arrive on the channel
//! handed to [`ProcessPool::new`] and must be passed back through
//! [`ProcessPool::finish`], which resolves the caller's tag and rewrites
//! cancelled jobs to [`ProcessOutcome::Interrupted`].

use std::collections::VecDeque;
use std::fmt;

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{mpsc, oneshot};

use super::cmd::{Cmd, ProcessOutcome, ProcessOutput};

/// Independent admission lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceClass {
    Compiler,
    Postprocess,
}

impl ResourceClass {
    const fn index(self) -> usize {
        match self {
            Self::Compiler => 0,
            Self::Postprocess => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u64);

#[cfg(test)]
impl JobId {
    pub(crate) const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Closure run on the blocking thread pool, reporting like a process would.
pub type InProcessFn = Box<dyn FnOnce() -> ProcessOutput + Send + 'static>;

/// Work the pool can run.
pub enum Job {
    Process(Cmd),
    InProcess(InProcessFn),
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Process(cmd) => write!(f, "Process({cmd})"),
            Self::InProcess(_) => f.write_str("InProcess"),
        }
    }
}

/// Raw completion sent by a job task.
#[derive(Debug)]
pub struct JobDone {
    pub id: JobId,
    pub outcome: ProcessOutcome,
}

/// Completion resolved against the pool's bookkeeping.
#[derive(Debug)]
pub struct Completion<T> {
    pub id: JobId,
    pub tag: T,
    pub outcome: ProcessOutcome,
}

struct Queued {
    id: JobId,
    job: Job,
}

struct Lane {
    limit: usize,
    running: FxHashMap<JobId, oneshot::Sender<()>>,
    queue: VecDeque<Queued>,
}

impl Lane {
    fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            running: FxHashMap::default(),
            queue: VecDeque::new(),
        }
    }
}

pub struct ProcessPool<T> {
    lanes: [Lane; 2],
    tags: FxHashMap<JobId, (ResourceClass, T)>,
    /// Cancelled jobs whose completion has not been finished yet
    cancelled: FxHashSet<JobId>,
    next_id: u64,
    done_tx: mpsc::UnboundedSender<JobDone>,
}

impl<T> ProcessPool<T> {
    pub fn new(
        compiler_limit: usize,
        postprocess_limit: usize,
        done_tx: mpsc::UnboundedSender<JobDone>,
    ) -> Self {
        Self {
            lanes: [Lane::new(compiler_limit), Lane::new(postprocess_limit)],
            tags: FxHashMap::default(),
            cancelled: FxHashSet::default(),
            next_id: 0,
            done_tx,
        }
    }

    /// Queue a job; it starts immediately when its class has a free slot.
    pub fn submit(&mut self, class: ResourceClass, job: Job, tag: T) -> JobId {
        self.next_id += 1;
        let id = JobId(self.next_id);
        self.tags.insert(id, (class, tag));

        let lane = &mut self.lanes[class.index()];
        if lane.running.len() < lane.limit {
            self.start(class, id, job);
        } else {
            crate::debug!("pool"; "queued {:?} job {} ({} waiting)", class, id, lane.queue.len() + 1);
            lane.queue.push_back(Queued { id, job });
        }
        id
    }

    /// Cancel a queued or running job. Idempotent.
    ///
    /// Returns `false` if the job is unknown, already finished or already
    /// cancelled. Exactly one `Interrupted` completion follows a `true`.
    pub fn cancel(&mut self, id: JobId) -> bool {
        let Some(&(class, _)) = self.tags.get(&id) else {
            return false;
        };
        if !self.cancelled.insert(id) {
            return false;
        }

        let lane = &mut self.lanes[class.index()];
        if let Some(pos) = lane.queue.iter().position(|q| q.id == id) {
            lane.queue.remove(pos);
            crate::debug!("pool"; "dropped queued job {}", id);
            self.done_tx
                .send(JobDone {
                    id,
                    outcome: ProcessOutcome::Interrupted,
                })
                .ok();
            return true;
        }

        if let Some(kill) = lane.running.remove(&id) {
            crate::debug!("pool"; "cancelling running job {}", id);
            kill.send(()).ok();
            self.admit(class);
        }
        true
    }

    /// Resolve a raw completion. Returns `None` for ids the pool does not know.
    pub fn finish(&mut self, done: JobDone) -> Option<Completion<T>> {
        let (class, tag) = self.tags.remove(&done.id)?;

        let outcome = if self.cancelled.remove(&done.id) {
            ProcessOutcome::Interrupted
        } else {
            self.lanes[class.index()].running.remove(&done.id);
            self.admit(class);
            done.outcome
        };

        Some(Completion {
            id: done.id,
            tag,
            outcome,
        })
    }

    /// No job is queued or running, and no completion is pending.
    pub fn is_idle(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn running(&self, class: ResourceClass) -> usize {
        self.lanes[class.index()].running.len()
    }

    pub fn queued(&self, class: ResourceClass) -> usize {
        self.lanes[class.index()].queue.len()
    }

    /// Cancel everything (shutdown).
    pub fn cancel_all(&mut self) {
        let ids: Vec<_> = self.tags.keys().copied().collect();
        for id in ids {
            self.cancel(id);
        }
    }

    fn admit(&mut self, class: ResourceClass) {
        loop {
            let lane = &mut self.lanes[class.index()];
            if lane.running.len() >= lane.limit {
                return;
            }
            let Some(next) = lane.queue.pop_front() else {
                return;
            };
            self.start(class, next.id, next.job);
        }
    }

    fn start(&mut self, class: ResourceClass, id: JobId, job: Job) {
        let (kill_tx, kill_rx) = oneshot::channel();
        self.lanes[class.index()].running.insert(id, kill_tx);
        crate::debug!("pool"; "start {:?} job {}: {:?}", class, id, job);

        let done_tx = self.done_tx.clone();
        tokio::spawn(async move {
            let outcome = match job {
                Job::Process(cmd) => cmd.run(kill_rx).await,
                Job::InProcess(task) => run_in_process(task, kill_rx).await,
            };
            done_tx.send(JobDone { id, outcome }).ok();
        });
    }
}

async fn run_in_process(task: InProcessFn, kill: oneshot::Receiver<()>) -> ProcessOutcome {
    let handle = tokio::task::spawn_blocking(task);
    tokio::select! {
        result = handle => match result {
            Ok(output) => ProcessOutcome::Exited(output),
            Err(e) => ProcessOutcome::SpawnFailed {
                program: "in-process module".to_string(),
                not_found: false,
                error: e.to_string(),
            },
        },
        // The blocking task cannot be stopped; its result is discarded.
        _ = kill => ProcessOutcome::Interrupted,
    }
}

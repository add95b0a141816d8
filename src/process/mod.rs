//! External process execution.
//!
//! - `cmd` - one invocation (`Cmd`) and its captured outcome
//! - `pool` - bounded per-class admission with cancellation

mod cmd;
mod pool;

pub use cmd::{Cmd, ProcessOutcome, ProcessOutput};
pub use pool::{Completion, Job, JobDone, JobId, ProcessPool, ResourceClass};

//! Core types - pure abstractions shared across the codebase.

mod mode;
mod state;
mod status;
mod target;

pub use mode::{Codegen, CompilationMode, RunMode};
pub use state::{is_shutdown, setup_shutdown_handler, shutdown_signal};
pub use status::OutputStatus;
pub use target::{MANIFEST_NAME, OutputDest, ProjectRoot, Target};

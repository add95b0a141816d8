//! The `elm` binary: command construction and output classification.
//!
//! - `report` - JSON error report decoding
//! - `install` - per-root dependency installation

pub mod install;
mod report;

pub use report::Report;

use std::path::{Path, PathBuf};

use crate::core::{Codegen, CompilationMode, OutputDest, ProjectRoot};
use crate::process::{Cmd, ProcessOutcome, ProcessOutput};

/// Located compiler binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElmCompiler {
    program: PathBuf,
}

impl ElmCompiler {
    /// Resolve `name` on `PATH`, falling back to the bare name so a missing
    /// binary surfaces as a spawn failure at compile time.
    pub fn locate(name: &str) -> Self {
        let program = which::which(name).unwrap_or_else(|_| PathBuf::from(name));
        Self { program }
    }

    /// `elm make` for one compile group.
    ///
    /// `artifact` is where generated code goes; `None` typechecks only.
    pub fn make(
        &self,
        root: &ProjectRoot,
        inputs: &[PathBuf],
        mode: CompilationMode,
        artifact: Option<&Path>,
    ) -> Cmd {
        let codegen = if artifact.is_some() {
            Codegen::Full
        } else {
            Codegen::TypecheckOnly
        };
        let output = match artifact {
            Some(path) => format!("--output={}", path.display()),
            None => format!("--output={}", OutputDest::DISCARD_SENTINEL),
        };
        Cmd::new(&self.program)
            .args(["make", "--report=json"])
            .arg(mode_flag(mode, codegen).unwrap_or_default())
            .arg(output)
            .args(inputs)
            .cwd(&root.dir)
    }

    /// `elm make` on a throwaway module, which downloads missing packages.
    pub fn install(&self, root: &ProjectRoot, dummy: &Path) -> Cmd {
        Cmd::new(&self.program)
            .args(["make", "--report=json"])
            .arg(format!("--output={}", OutputDest::DISCARD_SENTINEL))
            .arg(dummy)
            .cwd(&root.dir)
    }
}

/// Typecheck-only runs keep `--optimize` (it adds checks) but drop `--debug`.
fn mode_flag(mode: CompilationMode, codegen: Codegen) -> Option<&'static str> {
    match (mode, codegen) {
        (CompilationMode::Debug, Codegen::TypecheckOnly) => None,
        _ => mode.flag(),
    }
}

// ============================================================================
// Result classification
// ============================================================================

/// Interpretation of one `elm make` run.
#[derive(Debug, Clone)]
pub enum MakeResult {
    Success,
    CompileError(Report),
    /// Output in a shape the compiler should never produce.
    Unexpected(String),
    SpawnFailed {
        not_found: bool,
        message: String,
    },
    Interrupted,
}

pub fn classify_make(outcome: &ProcessOutcome) -> MakeResult {
    match outcome {
        ProcessOutcome::Interrupted => MakeResult::Interrupted,
        ProcessOutcome::SpawnFailed {
            program,
            not_found,
            error,
        } => MakeResult::SpawnFailed {
            not_found: *not_found,
            message: if *not_found {
                format!("could not find the `{program}` compiler; is it installed and on PATH?")
            } else {
                format!("failed to run `{program}`: {error}")
            },
        },
        ProcessOutcome::Exited(output) => {
            if output.success() && output.stderr.trim().is_empty() {
                MakeResult::Success
            } else if output.code == Some(1)
                && let Some(report) = Report::parse(&output.stderr)
            {
                MakeResult::CompileError(report)
            } else {
                MakeResult::Unexpected(unexpected_output("compiler", output))
            }
        }
    }
}

/// Describe process output that did not match any expected shape.
pub fn unexpected_output(what: &str, output: &ProcessOutput) -> String {
    let section = |text: &str| {
        if text.trim().is_empty() {
            "(no output)".to_string()
        } else {
            text.trim_end().to_string()
        }
    };
    format!(
        "unexpected {what} output ({})\n\nstdout:\n{}\n\nstderr:\n{}",
        output.describe_exit(),
        section(&output.stdout),
        section(&output.stderr)
    )
}

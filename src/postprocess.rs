//! Postprocess step run after a successful compile.
//!
//! Two providers share one result contract:
//!
//! ```text
//! External(["node", "pp.js"])  →  node pp.js <output> <mode>   (cwd = project root)
//! InProcess(module)            →  module.run(<output>, <mode>) on a blocking thread
//! ```
//!
//! An external command that exits 0 with empty stdout has rewritten the
//! output in place. Non-empty stdout must be a [`PostprocessResult`] as JSON,
//! which is also what in-process modules report.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::CompilationMode;
use crate::process::{Cmd, Job, ProcessOutcome, ProcessOutput};

/// Built-in module names accepted by `postprocess = { module = "..." }`.
pub const BUILTIN_MODULES: &[&str] = &["esm"];

/// A postprocess implementation living inside this process.
pub trait PostprocessModule: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Rewrite the compiled script at `output_path`. Runs on a blocking thread.
    fn run(&self, output_path: &Path, mode: CompilationMode) -> PostprocessResult;
}

#[derive(Debug, Clone)]
pub enum PostprocessProvider {
    External(Vec<String>),
    InProcess(Arc<dyn PostprocessModule>),
}

impl PostprocessProvider {
    /// Look up a built-in module by name.
    pub fn builtin(name: &str) -> Option<Self> {
        match name {
            "esm" => Some(Self::InProcess(Arc::new(EsmModule))),
            _ => None,
        }
    }

    /// Short description for logs.
    pub fn describe(&self) -> String {
        match self {
            Self::External(command) => command.join(" "),
            Self::InProcess(module) => format!("module {}", module.name()),
        }
    }

    /// Build the pool job postprocessing `output` in `root_dir`.
    pub fn job(&self, output: &Path, mode: CompilationMode, root_dir: &Path) -> Job {
        match self {
            Self::External(command) => Job::Process(
                Cmd::from_slice(command)
                    .arg(output)
                    .arg(mode.as_str())
                    .cwd(root_dir),
            ),
            Self::InProcess(module) => {
                let module = Arc::clone(module);
                let output = output.to_path_buf();
                Job::InProcess(Box::new(move || {
                    report_as_process(&module.run(&output, mode))
                }))
            }
        }
    }
}

/// Encode a structured result the way an external command would print it.
fn report_as_process(result: &PostprocessResult) -> ProcessOutput {
    match serde_json::to_string(result) {
        Ok(stdout) => ProcessOutput {
            code: Some(0),
            stdout,
            stderr: String::new(),
        },
        Err(e) => ProcessOutput {
            code: Some(1),
            stdout: String::new(),
            stderr: format!("failed to encode postprocess result: {e}"),
        },
    }
}

// ============================================================================
// Result contract
// ============================================================================

/// Structured result printed on stdout (or returned by a module).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PostprocessResult {
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    /// Where the final script is, if not at the output path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
}

/// Why a postprocess step failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostprocessFailure {
    /// Nonzero exit, or a structured result with a nonzero `exitCode`.
    Process {
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },
    /// Stdout was JSON but not a valid result.
    InvalidResult { error: String, stdout: String },
    /// Stdout was neither empty nor JSON.
    MalformedStdout { stdout: String, stderr: String },
    Spawn { program: String, error: String },
}

impl fmt::Display for PostprocessFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Process {
                code,
                stdout,
                stderr,
            } => {
                let exit = match code {
                    Some(code) => format!("exit code {code}"),
                    None => "killed by a signal".to_string(),
                };
                write!(
                    f,
                    "postprocess failed ({exit})\n\nstdout:\n{}\n\nstderr:\n{}",
                    or_no_output(stdout),
                    or_no_output(stderr)
                )
            }
            Self::InvalidResult { error, stdout } => write!(
                f,
                "postprocess printed an invalid result: {error}\n\nstdout:\n{}",
                or_no_output(stdout)
            ),
            Self::MalformedStdout { stdout, stderr } => write!(
                f,
                "unexpected postprocess output (expected nothing or a JSON result)\n\nstdout:\n{}\n\nstderr:\n{}",
                or_no_output(stdout),
                or_no_output(stderr)
            ),
            Self::Spawn { program, error } => {
                write!(f, "failed to run postprocess `{program}`: {error}")
            }
        }
    }
}

fn or_no_output(text: &str) -> &str {
    let trimmed = text.trim_end();
    if trimmed.trim().is_empty() {
        "(no output)"
    } else {
        trimmed
    }
}

/// Successful postprocess: where the final script lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostprocessSuccess {
    /// `None` when the output was rewritten in place.
    pub output_path: Option<PathBuf>,
}

/// Apply the result contract to a finished job. `None` if it was interrupted.
pub fn interpret(
    outcome: &ProcessOutcome,
    root_dir: &Path,
) -> Option<Result<PostprocessSuccess, PostprocessFailure>> {
    let output = match outcome {
        ProcessOutcome::Interrupted => return None,
        ProcessOutcome::SpawnFailed { program, error, .. } => {
            return Some(Err(PostprocessFailure::Spawn {
                program: program.clone(),
                error: error.clone(),
            }));
        }
        ProcessOutcome::Exited(output) => output,
    };

    if !output.success() {
        return Some(Err(PostprocessFailure::Process {
            code: output.code,
            stdout: output.stdout.clone(),
            stderr: output.stderr.clone(),
        }));
    }
    if output.stdout.trim().is_empty() {
        return Some(Ok(PostprocessSuccess { output_path: None }));
    }

    let value: serde_json::Value = match serde_json::from_str(output.stdout.trim()) {
        Ok(value) => value,
        Err(_) => {
            return Some(Err(PostprocessFailure::MalformedStdout {
                stdout: output.stdout.clone(),
                stderr: output.stderr.clone(),
            }));
        }
    };
    let result: PostprocessResult = match serde_json::from_value(value) {
        Ok(result) => result,
        Err(e) => {
            return Some(Err(PostprocessFailure::InvalidResult {
                error: e.to_string(),
                stdout: output.stdout.clone(),
            }));
        }
    };

    if result.exit_code != 0 {
        return Some(Err(PostprocessFailure::Process {
            code: Some(result.exit_code),
            stdout: result.stdout.unwrap_or_default(),
            stderr: result.stderr.unwrap_or_default(),
        }));
    }
    Some(Ok(PostprocessSuccess {
        output_path: result.output_path.map(|p| root_dir.join(p)),
    }))
}

/// `code` without trailing ES `export` statements, so a postprocessed
/// module can still run as a hot swap (`new Function`).
pub fn swappable(code: &str) -> &str {
    let mut body = code.trim_end();
    while let Some(at) = body.rfind('\n') {
        if !body[at + 1..].trim_start().starts_with("export ") {
            break;
        }
        body = body[..at].trim_end();
    }
    body
}

// ============================================================================
// Built-in modules
// ============================================================================

/// Turn the compiled IIFE into an ES module exporting `Elm`.
#[derive(Debug)]
struct EsmModule;

const IIFE_TAIL: &str = "}(this));";
const ESM_EXPORT: &str = "export const Elm = globalThis.Elm;";

impl EsmModule {
    fn transform(code: &str) -> Option<String> {
        if code.trim_end().ends_with(ESM_EXPORT) {
            return Some(code.to_string());
        }
        let at = code.rfind(IIFE_TAIL)?;
        Some(format!(
            "{}}}(globalThis));\n{ESM_EXPORT}\n",
            &code[..at]
        ))
    }
}

impl PostprocessModule for EsmModule {
    fn name(&self) -> &'static str {
        "esm"
    }

    fn run(&self, output_path: &Path, _mode: CompilationMode) -> PostprocessResult {
        let failed = |stderr: String| PostprocessResult {
            exit_code: 1,
            stderr: Some(stderr),
            ..Default::default()
        };
        let code = match std::fs::read_to_string(output_path) {
            Ok(code) => code,
            Err(e) => return failed(format!("cannot read {}: {e}", output_path.display())),
        };
        let Some(module) = Self::transform(&code) else {
            return failed(format!(
                "{} does not end with the compiler's `{IIFE_TAIL}`",
                output_path.display()
            ));
        };
        match std::fs::write(output_path, module) {
            Ok(()) => PostprocessResult::default(),
            Err(e) => failed(format!("cannot write {}: {e}", output_path.display())),
        }
    }
}

//! Per-target build lifecycle.
//!
//! ```text
//! restart ──► Compiling ──► ElmMakeSucceeded ──► (inject + runtime) ──► write
//!    ▲            │                                                      │
//!    │            └─► CompileError / ClientError            postprocess? ┤
//!    │                                                                   ▼
//!    └──────────────── any terminal status ◄──── Success / PostprocessError
//! ```
//!
//! Every run carries a generation. Results computed for an older generation
//! are dropped, so a superseded run can never overwrite a newer status.
//! The state machine never talks to the pool or the hub itself: the
//! coordinator submits the jobs it hands back and feeds completions in.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::compiler::MakeResult;
use crate::compiler::install::InstallError;
use crate::core::{Codegen, CompilationMode, OutputDest, OutputStatus, RunMode, Target};
use crate::embed::client::{CLIENT_JS, ClientVars};
use crate::inject;
use crate::postprocess::{self, PostprocessFailure};
use crate::process::{Job, JobId, ProcessOutcome};


/// Settings shared by every target of one run.
#[derive(Debug, Clone, Copy)]
pub struct BuildEnv {
    pub run_mode: RunMode,
    pub ws_port: u16,
    pub version: &'static str,
}

/// Last successfully written build, as seen by browsers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    pub timestamp: u64,
    pub mode: CompilationMode,
    /// Script for a hot swap; `None` when nothing was injected.
    pub code: Option<Arc<str>>,
}

/// In-flight work owned by the coordinator on this target's behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    WaitingForInstall,
    Compiling { group: JobId },
    Postprocessing { job: JobId },
}

/// Work that a restart made obsolete.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Superseded {
    pub generation: u64,
    /// Compile group the target should detach from.
    pub compile_group: Option<JobId>,
    pub postprocess_job: Option<JobId>,
}

/// What the coordinator has to do after a compile completion.
#[derive(Debug)]
pub enum Step {
    /// The result belongs to an older generation.
    Stale,
    /// A terminal status was reached.
    Done,
    Postprocess(Job),
}

/// A build written to disk but not yet final.
#[derive(Debug, Clone)]
struct Pending {
    timestamp: u64,
    code: Option<Arc<str>>,
}

pub struct OutputState {
    target: Target,
    mode: CompilationMode,
    generation: u64,
    phase: Phase,
    status: OutputStatus,
    /// Codegen of the latest run.
    codegen: Option<Codegen>,
    pending: Option<Pending>,
    delivered: Option<Delivered>,
    /// The previous run ended in an error; the next success forces a reload.
    recovering: bool,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
}

impl OutputState {
    pub fn new(target: Target, mode: CompilationMode) -> Self {
        Self {
            target,
            mode,
            generation: 0,
            phase: Phase::Idle,
            status: OutputStatus::NotStarted,
            codegen: None,
            pending: None,
            delivered: None,
            recovering: false,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn name(&self) -> &str {
        &self.target.name
    }

    pub fn mode(&self) -> CompilationMode {
        self.mode
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn status(&self) -> &OutputStatus {
        &self.status
    }

    pub fn codegen(&self) -> Option<Codegen> {
        self.codegen
    }

    pub fn delivered(&self) -> Option<&Delivered> {
        self.delivered.as_ref()
    }

    pub fn is_busy(&self) -> bool {
        self.phase != Phase::Idle
    }

    /// Restarted, but no compile group joined yet.
    pub fn is_waiting_for_install(&self) -> bool {
        self.phase == Phase::WaitingForInstall
    }

    /// How long the current (or last) run has taken so far.
    pub fn elapsed_ms(&self) -> u128 {
        let Some(started_at) = self.started_at else {
            return 0;
        };
        let end = self.finished_at.unwrap_or_else(Instant::now);
        end.saturating_duration_since(started_at).as_millis()
    }

    /// Changing the mode takes effect on the next restart.
    pub fn set_mode(&mut self, mode: CompilationMode) {
        self.mode = mode;
    }

    /// Codegen for the next run.
    ///
    /// Watch mode only generates code once somebody can use it: a connected
    /// tab, an output left over from an earlier run, or code already served.
    pub fn codegen_for(&self, run_mode: RunMode, has_sessions: bool) -> Codegen {
        let OutputDest::File(output) = &self.target.output else {
            return Codegen::TypecheckOnly;
        };
        if run_mode == RunMode::Make
            || has_sessions
            || self.delivered.is_some()
            || output.exists()
        {
            Codegen::Full
        } else {
            Codegen::TypecheckOnly
        }
    }

    /// A tab bound to a target that has only been typechecked.
    pub fn wants_codegen_upgrade(&self) -> bool {
        !self.is_busy()
            && self.codegen == Some(Codegen::TypecheckOnly)
            && matches!(self.target.output, OutputDest::File(_))
            && self.status.is_success()
    }

    /// Start a new generation, returning the work it replaces.
    pub fn restart(&mut self, codegen: Codegen) -> Superseded {
        let mut superseded = Superseded::default();
        match self.phase {
            Phase::Compiling { group } => superseded.compile_group = Some(group),
            Phase::Postprocessing { job } => superseded.postprocess_job = Some(job),
            Phase::Idle | Phase::WaitingForInstall => {}
        }

        self.recovering |= self.status.is_error();
        self.generation += 1;
        superseded.generation = self.generation;
        self.phase = Phase::WaitingForInstall;
        self.codegen = Some(codegen);
        self.pending = None;
        let started_at = Instant::now();
        self.started_at = Some(started_at);
        self.finished_at = None;
        self.status = OutputStatus::Compiling {
            mode: self.mode,
            started_at,
        };
        crate::debug!("output"; "{} generation {} ({:?}, {})", self.target.name, self.generation, codegen, self.mode);
        superseded
    }

    /// The target joined a compile group.
    pub fn compile_started(&mut self, group: JobId) {
        self.phase = Phase::Compiling { group };
    }

    /// The root's dependency installation failed; nothing was compiled.
    pub fn install_failed(&mut self, error: &InstallError) {
        self.phase = Phase::Idle;
        self.finished_at = Some(Instant::now());
        self.status = if error.is_compile_error() {
            OutputStatus::CompileError {
                details: error.to_string(),
            }
        } else {
            OutputStatus::ClientError {
                details: error.to_string(),
            }
        };
    }

    /// Apply a compile result for `generation`.
    ///
    /// `artifact` is the shared group output (`None` for typecheck-only).
    pub async fn on_compiled(
        &mut self,
        generation: u64,
        result: &MakeResult,
        artifact: Option<&Path>,
        env: &BuildEnv,
    ) -> Step {
        if generation != self.generation || !matches!(self.phase, Phase::Compiling { .. }) {
            return Step::Stale;
        }

        match result {
            MakeResult::Interrupted => return Step::Stale,
            MakeResult::CompileError(report) => {
                return self.finish_error(OutputStatus::CompileError {
                    details: report.render(),
                });
            }
            MakeResult::Unexpected(details) => {
                return self.finish_error(OutputStatus::ClientError {
                    details: details.clone(),
                });
            }
            MakeResult::SpawnFailed { message, .. } => {
                return self.finish_error(OutputStatus::ClientError {
                    details: message.clone(),
                });
            }
            MakeResult::Success => {}
        }

        self.status = OutputStatus::ElmMakeSucceeded;
        // A typecheck-only member may have joined a full-codegen group.
        self.codegen = Some(if artifact.is_some() {
            Codegen::Full
        } else {
            Codegen::TypecheckOnly
        });
        let timestamp = now_ms();

        let (Some(output), Some(artifact)) = (self.target.output.path().map(Path::to_path_buf), artifact)
        else {
            // Typecheck-only or discarded output: nothing to write.
            return self.finish_success(Pending {
                timestamp,
                code: None,
            });
        };

        let code = match tokio::fs::read_to_string(artifact).await {
            Ok(code) => code,
            Err(e) => {
                return self.finish_error(OutputStatus::ClientError {
                    details: format!("failed to read {}: {e}", artifact.display()),
                });
            }
        };
        let script = match env.run_mode {
            RunMode::Make => code,
            RunMode::Hot => match self.hot_script(&code, timestamp, env).await {
                Ok(script) => script,
                Err(status) => return self.finish_error(status),
            },
        };

        if let Err(e) = write_output(&output, &script).await {
            return self.finish_error(OutputStatus::ClientError {
                details: format!("failed to write {}: {e}", output.display()),
            });
        }
        let code = (env.run_mode == RunMode::Hot).then(|| Arc::<str>::from(script));

        let Some(provider) = self.target.postprocess.clone() else {
            return self.finish_success(Pending { timestamp, code });
        };

        self.pending = Some(Pending { timestamp, code });
        self.status = OutputStatus::Postprocessing;
        Step::Postprocess(provider.job(&output, self.mode, &self.target.root.dir))
    }

    /// The postprocess job for the current generation was submitted.
    pub fn postprocess_started(&mut self, job: JobId) {
        self.phase = Phase::Postprocessing { job };
    }

    /// Apply a postprocess result. Returns `false` if it was stale.
    pub async fn on_postprocessed(
        &mut self,
        generation: u64,
        outcome: &ProcessOutcome,
        env: &BuildEnv,
    ) -> bool {
        if generation != self.generation || !matches!(self.phase, Phase::Postprocessing { .. }) {
            return false;
        }
        let Some(result) = postprocess::interpret(outcome, &self.target.root.dir) else {
            return false;
        };
        let Some(pending) = self.pending.take() else {
            return false;
        };

        let success = match result {
            Ok(success) => success,
            Err(details) => {
                self.finish_postprocess_error(details);
                return true;
            }
        };

        let code = match env.run_mode {
            RunMode::Make => None,
            RunMode::Hot => {
                let final_path = success
                    .output_path
                    .or_else(|| self.target.output.path().map(Path::to_path_buf));
                match final_path {
                    Some(path) => self.read_final(&path).await,
                    None => pending.code,
                }
            }
        };
        self.finish_success(Pending {
            timestamp: pending.timestamp,
            code,
        });
        true
    }

    /// Consume the forced-reload flag set by a recovery.
    pub fn take_recovered(&mut self) -> bool {
        std::mem::take(&mut self.recovering)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Inject hooks and prepend the client runtime.
    async fn hot_script(
        &self,
        code: &str,
        timestamp: u64,
        env: &BuildEnv,
    ) -> Result<String, OutputStatus> {
        let injected = match inject::inject(code, self.mode) {
            Ok(injected) => injected,
            Err(e) => {
                let path = self.diagnostic_path();
                let written = write_output(&path, &e.diagnostic(code)).await;
                let details = match written {
                    Ok(()) => format!("{e}\n\nFull details written to {}", path.display()),
                    Err(io) => format!("{e}\n\n(failed to write {}: {io})", path.display()),
                };
                return Err(OutputStatus::ClientError { details });
            }
        };
        let runtime = CLIENT_JS.render(&ClientVars {
            version: env.version,
            target_name: self.target.name.clone(),
            compiled_timestamp: timestamp,
            mode: self.mode,
            ws_port: env.ws_port,
        });
        Ok(format!("{runtime}\n{injected}"))
    }

    fn diagnostic_path(&self) -> PathBuf {
        let name: String = self
            .target
            .name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        self.target
            .root
            .stuff_dir()
            .join(format!("injection-error-{name}.txt"))
    }

    /// Hot swap code from the postprocessed output.
    async fn read_final(&self, path: &Path) -> Option<Arc<str>> {
        match tokio::fs::read_to_string(path).await {
            Ok(code) => Some(Arc::from(postprocess::swappable(&code))),
            Err(e) => {
                crate::log!("output"; "{}: cannot read {}: {}", self.target.name, path.display(), e);
                None
            }
        }
    }

    fn finish_success(&mut self, pending: Pending) -> Step {
        self.phase = Phase::Idle;
        self.finished_at = Some(Instant::now());
        self.status = OutputStatus::Success {
            compiled_timestamp: pending.timestamp,
        };
        if self.codegen == Some(Codegen::Full) && self.target.output.path().is_some() {
            self.delivered = Some(Delivered {
                timestamp: pending.timestamp,
                mode: self.mode,
                code: pending.code,
            });
        }
        Step::Done
    }

    fn finish_error(&mut self, status: OutputStatus) -> Step {
        self.phase = Phase::Idle;
        self.finished_at = Some(Instant::now());
        self.pending = None;
        self.status = status;
        Step::Done
    }

    fn finish_postprocess_error(&mut self, details: PostprocessFailure) {
        self.phase = Phase::Idle;
        self.finished_at = Some(Instant::now());
        self.status = OutputStatus::PostprocessError { details };
    }
}

async fn write_output(path: &Path, content: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, content).await
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

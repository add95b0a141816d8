//! Per-root dependency installation.
//!
//! Installing is done by compiling a throwaway module, which makes the
//! compiler download every package listed in `elm.json`. All targets on a
//! root wait on the same installation:
//!
//! ```text
//! NotInstalled ──ensure──► Installing(job) ──finish──► Installed | Failed
//!       ▲                        │ ensure: attach waiter
//!       └────────── invalidate (elm.json changed) ───────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use super::{ElmCompiler, Report, unexpected_output};
use crate::core::ProjectRoot;
use crate::process::{Cmd, JobId, ProcessOutcome};

pub const DUMMY_MODULE: &str = "ElmWatchDummy.elm";

const DUMMY_SOURCE: &str = "module ElmWatchDummy exposing (dummy)\n\n\ndummy : ()\ndummy =\n    ()\n";

/// Lines the compiler prints while downloading packages.
const PROGRESS_LINES: &[&str] = &[
    "Starting downloads...",
    "Dependencies ready!",
    "Dependencies loaded from local cache.",
    "Verifying dependencies...",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InstallError {
    #[error("could not find the `{program}` compiler; is it installed and on PATH?")]
    CompilerNotFound { program: String },

    #[error("failed to run `{program}`: {error}")]
    Spawn { program: String, error: String },

    /// The compiler rejected the project (rendered report).
    #[error("{0}")]
    Elm(String),

    #[error("{0}")]
    Unexpected(String),

    #[error("failed to write {}: {error}", path.display())]
    Io { path: PathBuf, error: String },
}

impl InstallError {
    /// Compiler errors are the user's to fix; everything else is ours.
    pub const fn is_compile_error(&self) -> bool {
        matches!(self, Self::Elm(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallState {
    NotInstalled,
    Installing(JobId),
    Installed,
    Failed(InstallError),
}

/// Answer to [`DependencyInstaller::ensure_installed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ensure {
    Ready,
    /// The waiter is handed back by `finish` once the install ends.
    Pending,
    Failed(InstallError),
}

/// One per project root; `W` identifies whoever is waiting.
pub struct DependencyInstaller<W> {
    root: Arc<ProjectRoot>,
    state: InstallState,
    waiters: Vec<W>,
}

impl<W> DependencyInstaller<W> {
    pub fn new(root: Arc<ProjectRoot>) -> Self {
        Self {
            root,
            state: InstallState::NotInstalled,
            waiters: Vec::new(),
        }
    }

    pub fn state(&self) -> &InstallState {
        &self.state
    }

    pub fn root(&self) -> &Arc<ProjectRoot> {
        &self.root
    }

    /// Make sure packages are installed before `waiter` compiles.
    ///
    /// While an install is running, callers attach to it; `submit` is only
    /// called when a new install has to start.
    pub fn ensure_installed(
        &mut self,
        waiter: W,
        compiler: &ElmCompiler,
        submit: impl FnOnce(Cmd) -> JobId,
    ) -> Ensure {
        match &self.state {
            InstallState::Installed => Ensure::Ready,
            InstallState::Failed(e) => Ensure::Failed(e.clone()),
            InstallState::Installing(_) => {
                self.waiters.push(waiter);
                Ensure::Pending
            }
            InstallState::NotInstalled => {
                let dummy = match self.write_dummy() {
                    Ok(path) => path,
                    Err(e) => {
                        self.state = InstallState::Failed(e.clone());
                        return Ensure::Failed(e);
                    }
                };
                let job = submit(compiler.install(&self.root, &dummy));
                crate::debug!("install"; "installing packages for {} (job {})", self.root.dir.display(), job);
                self.state = InstallState::Installing(job);
                self.waiters.push(waiter);
                Ensure::Pending
            }
        }
    }

    /// Apply the install job's outcome. `None` if `job` is not the current install.
    pub fn finish(
        &mut self,
        job: JobId,
        outcome: &ProcessOutcome,
    ) -> Option<(Result<(), InstallError>, Vec<W>)> {
        if self.state != InstallState::Installing(job) {
            return None;
        }
        let result = classify_install(outcome);
        self.state = match &result {
            Ok(()) => InstallState::Installed,
            Err(e) => InstallState::Failed(e.clone()),
        };
        Some((result, std::mem::take(&mut self.waiters)))
    }

    /// Forget the installation (elm.json changed), cancelling a running one.
    ///
    /// Waiters are dropped; their targets are restarted by the same change.
    pub fn invalidate(&mut self, cancel: impl FnOnce(JobId)) {
        if let InstallState::Installing(job) = self.state {
            cancel(job);
        }
        self.state = InstallState::NotInstalled;
        self.waiters.clear();
    }

    /// Let the next trigger retry a failed installation.
    pub fn reset_failure(&mut self) {
        if matches!(self.state, InstallState::Failed(_)) {
            self.state = InstallState::NotInstalled;
        }
    }

    fn write_dummy(&self) -> Result<PathBuf, InstallError> {
        let dir = self.root.stuff_dir();
        let path = dir.join(DUMMY_MODULE);
        std::fs::create_dir_all(&dir)
            .and_then(|()| std::fs::write(&path, DUMMY_SOURCE))
            .map_err(|e| InstallError::Io {
                path: path.clone(),
                error: e.to_string(),
            })?;
        Ok(path)
    }
}

/// Validate the shape of the installer's output.
pub fn classify_install(outcome: &ProcessOutcome) -> Result<(), InstallError> {
    match outcome {
        ProcessOutcome::Exited(output) => {
            if output.success()
                && output.stderr.trim().is_empty()
                && output.stdout.lines().all(is_progress_line)
            {
                Ok(())
            } else if !output.success()
                && let Some(report) = Report::parse(&output.stderr)
            {
                Err(InstallError::Elm(report.render()))
            } else {
                Err(InstallError::Unexpected(unexpected_output(
                    "installer",
                    output,
                )))
            }
        }
        ProcessOutcome::SpawnFailed {
            program,
            not_found: true,
            ..
        } => Err(InstallError::CompilerNotFound {
            program: program.clone(),
        }),
        ProcessOutcome::SpawnFailed { program, error, .. } => Err(InstallError::Spawn {
            program: program.clone(),
            error: error.clone(),
        }),
        ProcessOutcome::Interrupted => Err(InstallError::Unexpected(
            "installation was interrupted".to_string(),
        )),
    }
}

fn is_progress_line(line: &str) -> bool {
    let line = line.trim();
    line.is_empty() || PROGRESS_LINES.contains(&line) || line.starts_with('●')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{Job, JobDone, ProcessOutput, ProcessPool, ResourceClass};
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    fn exited(code: i32, stdout: &str, stderr: &str) -> ProcessOutcome {
        ProcessOutcome::Exited(ProcessOutput {
            code: Some(code),
            stdout: stdout.into(),
            stderr: stderr.into(),
        })
    }

    fn installer(temp: &TempDir) -> DependencyInstaller<&'static str> {
        DependencyInstaller::new(Arc::new(ProjectRoot {
            dir: temp.path().to_path_buf(),
            manifest: temp.path().join("elm.json"),
            source_directories: vec![temp.path().join("src")],
        }))
    }

    fn compiler() -> ElmCompiler {
        ElmCompiler::locate("elm")
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_install() {
        let temp = TempDir::new().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel::<JobDone>();
        let mut pool: ProcessPool<()> = ProcessPool::new(4, 4, tx);
        let mut installer = installer(&temp);
        let mut submitted = 0;

        for waiter in ["Main", "Admin", "Worker"] {
            let ensure = installer.ensure_installed(waiter, &compiler(), |cmd| {
                submitted += 1;
                // An in-process job stands in for the real `elm make`.
                drop(cmd);
                pool.submit(ResourceClass::Compiler, Job::InProcess(Box::new(ProcessOutput::default)), ())
            });
            assert_eq!(ensure, Ensure::Pending);
        }
        assert_eq!(submitted, 1);
        assert!(temp.path().join("elm-stuff/elm-watch").join(DUMMY_MODULE).is_file());

        let InstallState::Installing(job) = installer.state().clone() else {
            panic!("expected installing");
        };
        let (result, waiters) = installer.finish(job, &exited(0, "", "")).unwrap();
        assert!(result.is_ok());
        assert_eq!(waiters, ["Main", "Admin", "Worker"]);
        assert_eq!(installer.state(), &InstallState::Installed);

        // Memoized: no new submit.
        let ensure = installer.ensure_installed("Main", &compiler(), |_| panic!("no reinstall"));
        assert_eq!(ensure, Ensure::Ready);
    }

    #[tokio::test]
    async fn test_invalidate_cancels_and_ignores_stale_finish() {
        let temp = TempDir::new().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel::<JobDone>();
        let mut pool: ProcessPool<()> = ProcessPool::new(1, 1, tx);
        let mut installer = installer(&temp);
        let mut submit = |_cmd: Cmd| {
            pool.submit(ResourceClass::Compiler, Job::InProcess(Box::new(ProcessOutput::default)), ())
        };

        installer.ensure_installed("Main", &compiler(), &mut submit);
        let InstallState::Installing(first) = installer.state().clone() else {
            panic!("expected installing");
        };

        let mut cancelled = None;
        installer.invalidate(|job| cancelled = Some(job));
        assert_eq!(cancelled, Some(first));
        assert_eq!(installer.state(), &InstallState::NotInstalled);

        // The cancelled job's completion no longer applies.
        assert!(installer.finish(first, &ProcessOutcome::Interrupted).is_none());
    }

    #[test]
    fn test_failure_is_shared_until_reset() {
        let temp = TempDir::new().unwrap();
        let mut installer = installer(&temp);
        installer.state = InstallState::Failed(InstallError::CompilerNotFound {
            program: "elm".into(),
        });
        assert!(matches!(
            installer.ensure_installed("Main", &compiler(), |_| panic!("no install")),
            Ensure::Failed(InstallError::CompilerNotFound { .. })
        ));
        installer.reset_failure();
        assert_eq!(installer.state(), &InstallState::NotInstalled);
    }

    #[test]
    fn test_classify_clean_and_progress_output() {
        assert!(classify_install(&exited(0, "", "")).is_ok());
        let progress = "Starting downloads...\n\n  ● elm/json 1.1.3\n  ● elm/core 1.0.5\n\nDependencies ready!\n";
        assert!(classify_install(&exited(0, progress, "")).is_ok());
    }

    #[test]
    fn test_classify_report_error() {
        let stderr = r#"{"type": "error", "path": "elm.json", "title": "PROBLEM LOADING PACKAGE LIST", "message": ["offline"]}"#;
        let err = classify_install(&exited(1, "", stderr)).unwrap_err();
        assert!(err.is_compile_error());
        assert!(err.to_string().contains("PROBLEM LOADING PACKAGE LIST"));
    }

    #[test]
    fn test_classify_stray_output_is_unexpected() {
        let err = classify_install(&exited(0, "Compiling ...", "")).unwrap_err();
        assert!(matches!(err, InstallError::Unexpected(_)));
        let err = classify_install(&exited(1, "", "not json")).unwrap_err();
        assert!(matches!(err, InstallError::Unexpected(_)));
    }

    #[test]
    fn test_classify_missing_compiler() {
        let err = classify_install(&ProcessOutcome::SpawnFailed {
            program: "elm".into(),
            not_found: true,
            error: "not found".into(),
        })
        .unwrap_err();
        assert_eq!(
            err,
            InstallError::CompilerNotFound {
                program: "elm".into()
            }
        );
    }
}

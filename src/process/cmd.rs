//! External command execution for the process pool.
//!
//! Builder API describing one invocation, plus the async runner that
//! captures stdout/stderr in full and races the child against a kill
//! signal.
//!
//! # Examples
//!
//! ```ignore
//! let cmd = Cmd::new("elm")
//!     .args(["make", "--report=json", "--output=/dev/null", "src/Main.elm"])
//!     .cwd(root);
//! let outcome = cmd.run(kill_rx).await;
//! ```

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::oneshot;

// ============================================================================
// Builder API
// ============================================================================

/// Command builder for external process execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cmd {
    program: OsString,
    args: Vec<OsString>,
    cwd: Option<PathBuf>,
}

impl Cmd {
    /// Create a new command builder.
    pub fn new<S: AsRef<OsStr>>(program: S) -> Self {
        Self {
            program: program.as_ref().to_owned(),
            ..Default::default()
        }
    }

    /// Create from a command array (e.g., `["node", "postprocess.js"]`).
    pub fn from_slice<S: AsRef<OsStr>>(cmd: &[S]) -> Self {
        let mut iter = cmd.iter();
        let program = iter
            .next()
            .map(|s| s.as_ref().to_owned())
            .unwrap_or_default();
        let args: Vec<_> = iter.map(|s| s.as_ref().to_owned()).collect();
        Self {
            program,
            args,
            ..Default::default()
        }
    }

    /// Add a single argument.
    pub fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        let arg = arg.as_ref();
        if !arg.is_empty() {
            self.args.push(arg.to_owned());
        }
        self
    }

    /// Add multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            let arg = arg.as_ref();
            if !arg.is_empty() {
                self.args.push(arg.to_owned());
            }
        }
        self
    }

    /// Set working directory.
    pub fn cwd<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.cwd = Some(dir.as_ref().to_owned());
        self
    }

    /// Get the program name for error messages.
    pub fn program_name(&self) -> String {
        self.program.to_string_lossy().to_string()
    }

    pub fn arg_list(&self) -> &[OsString] {
        &self.args
    }

    /// Run to completion, or until `kill` fires.
    ///
    /// Output is captured in full; the caller decides how to interpret it.
    pub async fn run(self, mut kill: oneshot::Receiver<()>) -> ProcessOutcome {
        let name = self.program_name();
        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&self.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        if let Some(dir) = &self.cwd {
            command.current_dir(dir);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return ProcessOutcome::SpawnFailed {
                    program: name,
                    not_found: e.kind() == std::io::ErrorKind::NotFound,
                    error: e.to_string(),
                };
            }
        };

        let stdout = tokio::spawn(read_all(child.stdout.take()));
        let stderr = tokio::spawn(read_all(child.stderr.take()));

        let status = tokio::select! {
            status = child.wait() => status,
            _ = &mut kill => {
                crate::debug!("pool"; "killing `{}`", name);
                child.kill().await.ok();
                stdout.abort();
                stderr.abort();
                return ProcessOutcome::Interrupted;
            }
        };

        let stdout = stdout.await.unwrap_or_default();
        let stderr = stderr.await.unwrap_or_default();

        match status {
            Ok(status) => ProcessOutcome::Exited(ProcessOutput {
                code: status.code(),
                stdout,
                stderr,
            }),
            Err(e) => ProcessOutcome::SpawnFailed {
                program: name,
                not_found: false,
                error: e.to_string(),
            },
        }
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

async fn read_all<R: AsyncRead + Unpin>(pipe: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await.ok();
    }
    String::from_utf8_lossy(&buf).into_owned()
}

// ============================================================================
// Outcomes
// ============================================================================

/// Captured result of a process that ran to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// `None` when terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// "exit code 2" / "killed by a signal".
    pub fn describe_exit(&self) -> String {
        match self.code {
            Some(code) => format!("exit code {code}"),
            None => "killed by a signal".to_string(),
        }
    }
}

/// How a pool job ended. Every job produces exactly one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Exited(ProcessOutput),
    /// Cancelled through the pool; never conflated with a nonzero exit.
    Interrupted,
    SpawnFailed {
        program: String,
        not_found: bool,
        error: String,
    },
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmd_builder() {
        let cmd = Cmd::new("elm")
            .arg("make")
            .args(["--report=json", "src/Main.elm"])
            .cwd("/tmp");

        assert_eq!(cmd.program, OsString::from("elm"));
        assert_eq!(cmd.args.len(), 3);
        assert_eq!(cmd.cwd, Some(PathBuf::from("/tmp")));
        assert_eq!(cmd.to_string(), "elm make --report=json src/Main.elm");
    }

    #[test]
    fn test_empty_args_filtered() {
        let cmd = Cmd::new("echo").arg("").args(["a", "", "b"]);
        assert_eq!(cmd.args.len(), 2);
    }

    #[test]
    fn test_from_slice() {
        let cmd = Cmd::from_slice(&["node", "postprocess.js"]);
        assert_eq!(cmd.program_name(), "node");
        assert_eq!(cmd.arg_list(), &[OsString::from("postprocess.js")]);
    }

    #[test]
    fn test_describe_exit() {
        let output = ProcessOutput {
            code: Some(2),
            ..Default::default()
        };
        assert_eq!(output.describe_exit(), "exit code 2");
        assert!(!output.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_simple_command() {
        let (_tx, rx) = oneshot::channel();
        let outcome = Cmd::new("echo").arg("hello").run(rx).await;
        let ProcessOutcome::Exited(output) = outcome else {
            panic!("expected exit, got {outcome:?}");
        };
        assert!(output.success());
        assert_eq!(output.stdout, "hello\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdin_is_closed() {
        let (_tx, rx) = oneshot::channel();
        let outcome = Cmd::new("cat").run(rx).await;
        assert_eq!(
            outcome,
            ProcessOutcome::Exited(ProcessOutput {
                code: Some(0),
                stdout: String::new(),
                stderr: String::new(),
            })
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stderr_and_exit_code_captured() {
        let (_tx, rx) = oneshot::channel();
        let outcome = Cmd::new("sh")
            .args(["-c", "echo oops >&2; exit 3"])
            .run(rx)
            .await;
        let ProcessOutcome::Exited(output) = outcome else {
            panic!("expected exit, got {outcome:?}");
        };
        assert_eq!(output.code, Some(3));
        assert_eq!(output.stderr, "oops\n");
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_failure() {
        let (_tx, rx) = oneshot::channel();
        let outcome = Cmd::new("definitely-not-a-real-binary-3f9a").run(rx).await;
        assert!(matches!(
            outcome,
            ProcessOutcome::SpawnFailed {
                not_found: true,
                ..
            }
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_interrupts() {
        let (tx, rx) = oneshot::channel();
        let run = tokio::spawn(Cmd::new("sleep").arg("30").run(rx));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        tx.send(()).unwrap();
        let outcome = tokio::time::timeout(std::time::Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, ProcessOutcome::Interrupted);
    }
}

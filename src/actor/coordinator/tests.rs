//! Coordinator scenarios against a scripted stand-in for the compiler.
//!
//! The fake `elm` logs its arguments, fails on inputs containing `BROKEN`,
//! hangs on inputs containing `SLOW` and otherwise copies a compiled
//! program to `--output`.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use super::dispatch::Dispatch;
use super::*;
use crate::actor::fs::{ChangeKind, FileChange};
use crate::actor::ws::{PROTOCOL_VERSION, SessionId};
use crate::core::OutputStatus;
use crate::inject::tests::ELEMENT_PROGRAM;

const COMPILE_ERROR: &str =
    r#"{"type": "error", "path": null, "title": "BROKEN MODULE", "message": ["fix it"]}"#;

struct Project {
    _temp: TempDir,
    dir: PathBuf,
    log: PathBuf,
}

impl Project {
    /// `targets` is the TOML for the `[targets.*]` sections.
    fn new(targets: &str) -> Self {
        Self::with_build("", targets)
    }

    /// `build` holds extra `[build]` keys.
    fn with_build(build: &str, targets: &str) -> Self {
        let temp = TempDir::new().unwrap();
        let dir = std::fs::canonicalize(temp.path()).unwrap();
        std::fs::create_dir_all(dir.join("src")).unwrap();
        std::fs::create_dir_all(dir.join("bin")).unwrap();
        std::fs::write(
            dir.join("elm.json"),
            r#"{"type": "application", "source-directories": ["src"]}"#,
        )
        .unwrap();
        std::fs::write(dir.join("src/Main.elm"), "module Main exposing (main)\n").unwrap();
        std::fs::write(dir.join("bin/program.js"), ELEMENT_PROGRAM).unwrap();
        std::fs::write(dir.join("bin/error.json"), COMPILE_ERROR).unwrap();

        let log = dir.join("bin/calls.log");
        let script = format!(
            r#"#!/bin/sh
echo "$@" >> "{log}"
out=""
for arg in "$@"; do
  case "$arg" in
    --output=*) out="${{arg#--output=}}" ;;
  esac
done
for arg in "$@"; do
  case "$arg" in
    *.elm)
      if grep -q BROKEN "$arg"; then cat "{error}" >&2; exit 1; fi
      if grep -q SLOW "$arg"; then exec sleep 5; fi
      ;;
  esac
done
if [ -n "$out" ] && [ "$out" != "/dev/null" ]; then cat "{program}" > "$out"; fi
"#,
            log = log.display(),
            error = dir.join("bin/error.json").display(),
            program = dir.join("bin/program.js").display(),
        );
        let elm = dir.join("bin/elm");
        std::fs::write(&elm, script).unwrap();
        std::fs::set_permissions(&elm, std::fs::Permissions::from_mode(0o755)).unwrap();

        std::fs::write(
            dir.join("elm-watch.toml"),
            format!(
                "[build]\ncompiler = \"{}\"\n{build}\n\n{targets}",
                elm.display()
            ),
        )
        .unwrap();

        Self {
            _temp: temp,
            dir,
            log,
        }
    }

    fn config(&self) -> Config {
        Config::load(&self.dir.join("elm-watch.toml")).unwrap()
    }

    fn calls(&self) -> Vec<String> {
        std::fs::read_to_string(&self.log)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn compiles(&self) -> usize {
        self.calls().iter().filter(|c| c.contains("Main.elm")).count()
    }

    fn compiles_with(&self, flag: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.contains("Main.elm") && c.contains(flag))
            .count()
    }

    fn installs(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.contains("ElmWatchDummy.elm"))
            .count()
    }
}

const MAIN: &str = r#"
[targets.Main]
inputs = ["src/Main.elm"]
output = "build/main.js"
"#;

fn dispatch(
    config: &Config,
    run_mode: RunMode,
    persisted: Option<Persisted>,
) -> (Dispatch, mpsc::UnboundedReceiver<JobDone>) {
    let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
    let setup = Setup {
        config,
        run_mode,
        ws_port: 41234,
        default_mode: CompilationMode::Standard,
        persisted,
    };
    (Dispatch::new(setup, jobs_tx), jobs_rx)
}

async fn next_job(dispatch: &mut Dispatch, jobs_rx: &mut mpsc::UnboundedReceiver<JobDone>) {
    let done = timeout(Duration::from_secs(10), jobs_rx.recv())
        .await
        .expect("job did not finish in time")
        .unwrap();
    dispatch.on_job_done(done).await;
}

async fn settle(dispatch: &mut Dispatch, jobs_rx: &mut mpsc::UnboundedReceiver<JobDone>) {
    while !dispatch.is_quiescent() {
        next_job(dispatch, jobs_rx).await;
    }
}

fn changed(path: &Path) -> ChangeBatch {
    ChangeBatch {
        changes: vec![FileChange {
            path: path.to_path_buf(),
            kind: ChangeKind::Changed,
        }],
    }
}

fn connect(
    dispatch: &mut Dispatch,
    version: &str,
    timestamp: u64,
) -> mpsc::UnboundedReceiver<String> {
    connect_to(dispatch, "Main", version, timestamp).1
}

fn connect_to(
    dispatch: &mut Dispatch,
    target: &str,
    version: &str,
    timestamp: u64,
) -> (SessionId, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let id = SessionId::next();
    dispatch.on_hub_event(HubEvent::Connected {
        id,
        uri: handshake_uri(target, version, timestamp),
        tx,
    });
    (id, rx)
}

fn handshake_uri(target: &str, version: &str, timestamp: u64) -> String {
    format!("/elm-watch?elmWatchVersion={version}&targetName={target}&elmCompiledTimestamp={timestamp}")
}

fn client_says(id: SessionId, text: &str) -> HubEvent {
    HubEvent::Message {
        id,
        text: text.to_string(),
    }
}

const TO_DEBUG: &str = r#"{"tag": "ChangedCompilationMode", "compilationMode": "debug"}"#;
const TO_STANDARD: &str = r#"{"tag": "ChangedCompilationMode", "compilationMode": "standard"}"#;
const IDLE: &str = r#"{"tag": "ReachedIdleState", "reason": "test"}"#;

fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<serde_json::Value> {
    let mut messages = Vec::new();
    while let Ok(text) = rx.try_recv() {
        messages.push(serde_json::from_str(&text).unwrap());
    }
    messages
}

fn is_busy(message: &serde_json::Value) -> bool {
    message["tag"] == "StatusChanged" && message["status"]["tag"] == "Busy"
}

// ============================================================================
// Make
// ============================================================================

#[tokio::test]
async fn test_make_installs_then_compiles() {
    let project = Project::new(MAIN);
    let config = project.config();
    let (mut dispatch, mut jobs_rx) = dispatch(&config, RunMode::Make, None);

    dispatch.start_all();
    settle(&mut dispatch, &mut jobs_rx).await;

    assert!(dispatch.targets[0].status().is_success());
    assert!(dispatch.all_succeeded());
    assert_eq!(project.installs(), 1);
    assert_eq!(project.compiles(), 1);

    let output = std::fs::read_to_string(project.dir.join("build/main.js")).unwrap();
    assert_eq!(output, ELEMENT_PROGRAM);
}

#[tokio::test]
async fn test_identical_targets_share_one_compile() {
    let project = Project::new(
        r#"
[targets.Copy]
inputs = ["src/Main.elm"]
output = "build/copy.js"

[targets.Main]
inputs = ["src/Main.elm"]
output = "build/main.js"
"#,
    );
    let config = project.config();
    let (mut dispatch, mut jobs_rx) = dispatch(&config, RunMode::Make, None);

    dispatch.start_all();
    settle(&mut dispatch, &mut jobs_rx).await;

    assert!(dispatch.all_succeeded());
    assert_eq!(project.compiles(), 1);
    assert!(project.dir.join("build/copy.js").is_file());
    assert!(project.dir.join("build/main.js").is_file());
}

const MAIN_AND_COPY: &str = r#"
[targets.Copy]
inputs = ["src/Main.elm"]
output = "build/copy.js"

[targets.Main]
inputs = ["src/Main.elm"]
output = "build/main.js"
"#;

#[tokio::test]
async fn test_later_trigger_joins_running_compile() {
    let project = Project::with_build("max_compilers = 4", MAIN_AND_COPY);
    let main = project.dir.join("src/Main.elm");
    std::fs::write(&main, "module Main SLOW\n").unwrap();
    let config = project.config();
    let (mut dispatch, mut jobs_rx) = dispatch(&config, RunMode::Hot, None);
    let (main_tab, _main_rx) = connect_to(&mut dispatch, "Main", PROTOCOL_VERSION, 0);
    let (copy_tab, _copy_rx) = connect_to(&mut dispatch, "Copy", PROTOCOL_VERSION, 0);

    dispatch.start_all();
    next_job(&mut dispatch, &mut jobs_rx).await;

    // Two separate events move both targets to the same mode.
    dispatch.on_hub_event(client_says(main_tab, TO_DEBUG));
    dispatch.on_hub_event(client_says(copy_tab, TO_DEBUG));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(project.compiles_with("--debug"), 1);

    std::fs::write(&main, "module Main exposing (main)\n").unwrap();
    dispatch.on_batch(&changed(&main));
    settle(&mut dispatch, &mut jobs_rx).await;

    assert!(dispatch.all_succeeded());
    assert_eq!(project.compiles_with("--debug"), 2);
    assert!(project.dir.join("build/copy.js").is_file());
    assert!(project.dir.join("build/main.js").is_file());
}

#[tokio::test]
async fn test_typecheck_group_is_replaced_when_code_is_needed() {
    let project = Project::with_build("max_compilers = 4", MAIN_AND_COPY);
    let main = project.dir.join("src/Main.elm");
    std::fs::write(&main, "module Main SLOW\n").unwrap();
    let config = project.config();
    let (mut dispatch, mut jobs_rx) = dispatch(&config, RunMode::Hot, None);

    // No tab yet: both targets only typecheck.
    dispatch.start_all();
    next_job(&mut dispatch, &mut jobs_rx).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(project.compiles_with("--output=/dev/null"), 1);

    let (copy_tab, _copy_rx) = connect_to(&mut dispatch, "Copy", PROTOCOL_VERSION, 0);
    dispatch.on_hub_event(client_says(copy_tab, TO_STANDARD));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(project.compiles(), 2);
    assert_eq!(project.compiles_with("elm-stuff/elm-watch/"), 1);

    std::fs::write(&main, "module Main exposing (main)\n").unwrap();
    dispatch.on_batch(&changed(&main));
    settle(&mut dispatch, &mut jobs_rx).await;

    assert!(dispatch.all_succeeded());
    assert_eq!(project.compiles(), 3);
    assert!(project.dir.join("build/copy.js").is_file());
}

#[tokio::test]
async fn test_compile_error_fails_the_run() {
    let project = Project::new(MAIN);
    std::fs::write(project.dir.join("src/Main.elm"), "module Main BROKEN\n").unwrap();
    let config = project.config();

    let (_shutdown_tx, shutdown) = watch::channel(false);
    let orchestrator = Orchestrator::new(Setup {
        config: &config,
        run_mode: RunMode::Make,
        ws_port: 0,
        default_mode: CompilationMode::Standard,
        persisted: None,
    });
    let inbox = Inbox {
        batches: None,
        hub: None,
        shutdown,
    };
    let exit = timeout(Duration::from_secs(10), orchestrator.run(inbox))
        .await
        .unwrap();

    assert_eq!(exit, Exit::Finished(false));
    assert!(!project.dir.join("build/main.js").exists());
}

#[tokio::test]
async fn test_compile_error_status_carries_report() {
    let project = Project::new(MAIN);
    std::fs::write(project.dir.join("src/Main.elm"), "module Main BROKEN\n").unwrap();
    let config = project.config();
    let (mut dispatch, mut jobs_rx) = dispatch(&config, RunMode::Make, None);

    dispatch.start_all();
    settle(&mut dispatch, &mut jobs_rx).await;

    let OutputStatus::CompileError { details } = dispatch.targets[0].status() else {
        panic!("expected a compile error");
    };
    assert!(details.contains("BROKEN MODULE"));
}

#[tokio::test]
async fn test_failing_postprocess_is_reported() {
    let project = Project::new(
        r#"
[targets.Main]
inputs = ["src/Main.elm"]
output = "build/main.js"
postprocess = ["sh", "-c", "exit 2"]
"#,
    );
    let config = project.config();
    let (mut dispatch, mut jobs_rx) = dispatch(&config, RunMode::Make, None);

    dispatch.start_all();
    settle(&mut dispatch, &mut jobs_rx).await;

    let status = dispatch.targets[0].status();
    assert!(matches!(status, OutputStatus::PostprocessError { .. }));
    assert!(status.detail().contains("exit code 2"));
}

#[tokio::test]
async fn test_shutdown_ends_the_run() {
    let project = Project::new(MAIN);
    std::fs::write(project.dir.join("src/Main.elm"), "module Main SLOW\n").unwrap();
    let config = project.config();

    let (shutdown_tx, shutdown) = watch::channel(false);
    let orchestrator = Orchestrator::new(Setup {
        config: &config,
        run_mode: RunMode::Hot,
        ws_port: 0,
        default_mode: CompilationMode::Standard,
        persisted: None,
    });
    let run = orchestrator.run(Inbox {
        batches: None,
        hub: None,
        shutdown,
    });
    let stop = async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown_tx.send_replace(true);
    };

    let (exit, ()) = timeout(Duration::from_secs(5), async { tokio::join!(run, stop) })
        .await
        .unwrap();
    assert_eq!(exit, Exit::Shutdown);
}

// ============================================================================
// Watch
// ============================================================================

#[tokio::test]
async fn test_change_during_compile_restarts_once() {
    let project = Project::new(MAIN);
    let main = project.dir.join("src/Main.elm");
    std::fs::write(&main, "module Main SLOW\n").unwrap();
    let config = project.config();
    let (mut dispatch, mut jobs_rx) = dispatch(&config, RunMode::Hot, None);
    let mut tab = connect(&mut dispatch, PROTOCOL_VERSION, 0);

    dispatch.start_all();
    // The install finishes; the compile hangs.
    next_job(&mut dispatch, &mut jobs_rx).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    std::fs::write(&main, "module Main exposing (main)\n").unwrap();
    assert_eq!(dispatch.on_batch(&changed(&main)), None);
    settle(&mut dispatch, &mut jobs_rx).await;

    let state = &dispatch.targets[0];
    assert_eq!(state.generation(), 2);
    assert!(state.status().is_success());

    let settled: Vec<_> = drain(&mut tab).into_iter().filter(|m| !is_busy(m)).collect();
    assert_eq!(settled.len(), 1);
}

#[tokio::test]
async fn test_config_change_requests_restart() {
    let project = Project::new(MAIN);
    let config = project.config();
    let (mut dispatch, _jobs_rx) = dispatch(&config, RunMode::Hot, None);

    let exit = dispatch.on_batch(&changed(&project.dir.join("elm-watch.toml")));
    assert_eq!(exit, Some(Exit::Restart));
}

#[tokio::test]
async fn test_manifest_change_reinstalls() {
    let project = Project::new(MAIN);
    let config = project.config();
    let (mut dispatch, mut jobs_rx) = dispatch(&config, RunMode::Hot, None);

    dispatch.start_all();
    settle(&mut dispatch, &mut jobs_rx).await;
    assert_eq!(project.installs(), 1);

    // Unrelated files are ignored.
    std::fs::write(project.dir.join("README.md"), "hi").unwrap();
    assert_eq!(dispatch.on_batch(&changed(&project.dir.join("README.md"))), None);
    assert!(dispatch.is_quiescent());

    dispatch.on_batch(&changed(&project.dir.join("elm.json")));
    settle(&mut dispatch, &mut jobs_rx).await;
    assert_eq!(project.installs(), 2);
    assert_eq!(dispatch.targets[0].generation(), 2);
}

// ============================================================================
// Sessions
// ============================================================================

#[tokio::test]
async fn test_handshake_compares_compiled_timestamp() {
    let project = Project::new(MAIN);
    let config = project.config();
    let (mut dispatch, mut jobs_rx) = dispatch(&config, RunMode::Hot, None);
    // A tab is open before the first build, so code is generated.
    let _first = connect(&mut dispatch, PROTOCOL_VERSION, 0);

    dispatch.start_all();
    settle(&mut dispatch, &mut jobs_rx).await;

    let delivered = dispatch.targets[0].delivered().unwrap().timestamp;
    let output = std::fs::read_to_string(project.dir.join("build/main.js")).unwrap();
    assert!(output.contains(&delivered.to_string()));

    let mut current = connect(&mut dispatch, PROTOCOL_VERSION, delivered);
    let messages = drain(&mut current);
    assert_eq!(messages[0]["status"]["tag"], "AlreadyUpToDate");

    let mut stale = connect(&mut dispatch, PROTOCOL_VERSION, delivered - 1);
    assert_eq!(drain(&mut stale)[0]["tag"], "ReloadPage");
}

#[tokio::test]
async fn test_tab_reconnecting_during_rebuild_gets_hot_swap() {
    let project = Project::new(MAIN);
    let main = project.dir.join("src/Main.elm");
    let config = project.config();
    let (mut dispatch, mut jobs_rx) = dispatch(&config, RunMode::Hot, None);
    let _first = connect(&mut dispatch, PROTOCOL_VERSION, 0);

    dispatch.start_all();
    settle(&mut dispatch, &mut jobs_rx).await;
    let delivered = dispatch.targets[0].delivered().unwrap().timestamp;

    tokio::time::sleep(Duration::from_millis(5)).await;
    dispatch.on_batch(&changed(&main));
    assert!(dispatch.targets[0].is_busy());

    // The tab reconnects with the build it is running.
    let mut tab = connect(&mut dispatch, PROTOCOL_VERSION, delivered);
    settle(&mut dispatch, &mut jobs_rx).await;

    let tags: Vec<_> = drain(&mut tab)
        .into_iter()
        .filter(|m| !is_busy(m))
        .map(|m| m["tag"].clone())
        .collect();
    assert_eq!(tags, ["SuccessfullyCompiled"]);
}

#[tokio::test]
async fn test_version_mismatch_is_a_client_error() {
    let project = Project::new(MAIN);
    let config = project.config();
    let (mut dispatch, _jobs_rx) = dispatch(&config, RunMode::Hot, None);

    let mut tab = connect(&mut dispatch, "0.0.0-old", 0);
    let messages = drain(&mut tab);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["status"]["tag"], "ClientError");
    assert!(!dispatch.hub.has_sessions("Main"));
}

#[tokio::test]
async fn test_typecheck_only_target_upgrades_when_a_tab_connects() {
    let project = Project::new(MAIN);
    let config = project.config();
    let (mut dispatch, mut jobs_rx) = dispatch(&config, RunMode::Hot, None);

    dispatch.start_all();
    settle(&mut dispatch, &mut jobs_rx).await;
    assert!(!project.dir.join("build/main.js").exists());
    assert!(dispatch.targets[0].wants_codegen_upgrade());

    let mut tab = connect(&mut dispatch, PROTOCOL_VERSION, 0);
    assert!(is_busy(&drain(&mut tab)[0]));
    settle(&mut dispatch, &mut jobs_rx).await;

    assert!(project.dir.join("build/main.js").is_file());
    assert_eq!(dispatch.targets[0].generation(), 2);
}

#[tokio::test]
async fn test_mode_change_is_persisted_and_rebuilds() {
    let project = Project::new(MAIN);
    let config = project.config();
    let persisted = Persisted::load(&config.stuff_dir());
    let (mut dispatch, mut jobs_rx) = dispatch(&config, RunMode::Hot, Some(persisted));
    let id = SessionId::next();
    let (tx, _rx) = mpsc::unbounded_channel();
    dispatch.on_hub_event(HubEvent::Connected {
        id,
        uri: handshake_uri("Main", PROTOCOL_VERSION, 0),
        tx,
    });

    dispatch.start_all();
    settle(&mut dispatch, &mut jobs_rx).await;

    dispatch.on_hub_event(client_says(id, TO_DEBUG));
    settle(&mut dispatch, &mut jobs_rx).await;

    assert_eq!(dispatch.targets[0].mode(), CompilationMode::Debug);
    assert_eq!(dispatch.targets[0].generation(), 2);
    let reloaded = Persisted::load(&config.stuff_dir());
    assert_eq!(reloaded.mode("Main"), Some(CompilationMode::Debug));
    assert!(project.calls().iter().any(|c| c.contains("--debug")));
}

// ============================================================================
// Idle signal
// ============================================================================

async fn next_settled(rx: &mut mpsc::UnboundedReceiver<String>) -> serde_json::Value {
    loop {
        let text = timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("no message in time")
            .unwrap();
        let message: serde_json::Value = serde_json::from_str(&text).unwrap();
        if !is_busy(&message) {
            return message;
        }
    }
}

async fn becomes(idle: &mut watch::Receiver<bool>, value: bool) {
    timeout(Duration::from_secs(10), idle.wait_for(|&v| v == value))
        .await
        .expect("idle signal did not change in time")
        .unwrap();
}

#[tokio::test]
async fn test_idle_waits_for_jobs_and_tabs() {
    let project = Project::new(MAIN);
    let config = project.config();
    let (shutdown_tx, shutdown) = watch::channel(false);
    let (hub_tx, hub_rx) = mpsc::unbounded_channel();
    let orchestrator = Orchestrator::new(Setup {
        config: &config,
        run_mode: RunMode::Hot,
        ws_port: 0,
        default_mode: CompilationMode::Standard,
        persisted: None,
    });
    let mut idle = orchestrator.idle();
    let run = orchestrator.run(Inbox {
        batches: None,
        hub: Some(hub_rx),
        shutdown,
    });

    let drive = async {
        let id = SessionId::next();
        let (tx, mut tab) = mpsc::unbounded_channel();
        hub_tx
            .send(HubEvent::Connected {
                id,
                uri: handshake_uri("Main", PROTOCOL_VERSION, 0),
                tx,
            })
            .unwrap();

        // Built and delivered, but the tab has not settled yet.
        next_settled(&mut tab).await;
        assert!(!*idle.borrow());

        hub_tx.send(client_says(id, IDLE)).unwrap();
        becomes(&mut idle, true).await;

        // A rebuild sends Busy, which wakes the tab up again.
        hub_tx.send(client_says(id, TO_DEBUG)).unwrap();
        becomes(&mut idle, false).await;

        next_settled(&mut tab).await;
        assert!(!*idle.borrow());
        hub_tx.send(client_says(id, IDLE)).unwrap();
        becomes(&mut idle, true).await;

        shutdown_tx.send_replace(true);
    };

    let (exit, ()) = timeout(Duration::from_secs(30), async { tokio::join!(run, drive) })
        .await
        .unwrap();
    assert_eq!(exit, Exit::Shutdown);
}

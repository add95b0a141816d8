//! Coordinator state and the handler for every event kind.
//!
//! Handlers never block: process work goes through the pool and comes back
//! as a [`JobDone`], browser traffic arrives as [`HubEvent`]s.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{mpsc, watch};

use super::{Exit, Setup, display};
use crate::actor::fs::ChangeBatch;
use crate::actor::ws::{
    Delivery, Handshake, HubEvent, ServerMessage, SessionId, SessionUpdate, SocketHub, WireStatus,
};
use crate::compiler::install::{DependencyInstaller, Ensure};
use crate::compiler::{ElmCompiler, MakeResult, classify_make};
use crate::config::CONFIG_FILE;
use crate::core::{Codegen, CompilationMode, MANIFEST_NAME, OutputStatus, ProjectRoot, RunMode};
use crate::output::{BuildEnv, OutputState, Step, Superseded};
use crate::persist::Persisted;
use crate::process::{Job, JobDone, JobId, ProcessOutcome, ProcessPool, ResourceClass};

/// What a pool job was started for.
#[derive(Debug, Clone)]
pub(super) enum JobTag {
    Install { manifest: PathBuf },
    Compile,
    Postprocess { target: usize, generation: u64 },
}

/// Targets sharing one `elm make` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
struct GroupKey {
    manifest: PathBuf,
    inputs: Vec<PathBuf>,
    mode: CompilationMode,
}

impl GroupKey {
    fn of(state: &OutputState) -> Self {
        let target = state.target();
        Self {
            manifest: target.root.manifest.clone(),
            inputs: target.inputs.clone(),
            mode: state.mode(),
        }
    }

    /// Artifact name for the `seq`-th invocation. A killed run that is still
    /// exiting never writes the file a newer run is read from.
    fn artifact_name(&self, seq: u64) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.manifest.as_os_str().as_encoded_bytes());
        for input in &self.inputs {
            hasher.update(b"\0");
            hasher.update(input.as_os_str().as_encoded_bytes());
        }
        hasher.update(b"\0");
        hasher.update(self.mode.as_str().as_bytes());
        let hash = hex::encode(&hasher.finalize().as_bytes()[..8]);
        format!("{hash}-{seq}.js")
    }
}

/// One running `elm make` and the target generations waiting on it.
///
/// At most one group per key is running at any time.
#[derive(Debug)]
struct CompileGroup {
    key: GroupKey,
    members: Vec<(usize, u64)>,
    artifact: Option<PathBuf>,
}

pub(super) struct Dispatch {
    pub(super) env: BuildEnv,
    config_path: PathBuf,
    compiler: ElmCompiler,
    pub(super) targets: Vec<OutputState>,
    installers: FxHashMap<PathBuf, DependencyInstaller<usize>>,
    groups: FxHashMap<JobId, CompileGroup>,
    compile_seq: u64,
    pool: ProcessPool<JobTag>,
    pub(super) hub: SocketHub,
    persisted: Option<Persisted>,
    idle_tx: watch::Sender<bool>,
    /// Roots whose setup failure was already logged
    reported_roots: FxHashSet<PathBuf>,
}

impl Dispatch {
    pub(super) fn new(setup: Setup<'_>, done_tx: mpsc::UnboundedSender<JobDone>) -> Self {
        let Setup {
            config,
            run_mode,
            ws_port,
            default_mode,
            persisted,
        } = setup;

        let targets = config
            .targets
            .iter()
            .map(|target| {
                let mode = persisted
                    .as_ref()
                    .and_then(|p| p.mode(&target.name))
                    .unwrap_or(default_mode);
                OutputState::new(target.clone(), mode)
            })
            .collect();
        let installers = config
            .roots()
            .into_iter()
            .map(|root| (root.manifest.clone(), DependencyInstaller::new(root)))
            .collect();
        let hub = SocketHub::new(config.targets.iter().map(|t| (t.name.clone(), t.enabled)));

        Self {
            env: BuildEnv {
                run_mode,
                ws_port,
                version: env!("CARGO_PKG_VERSION"),
            },
            config_path: config.path.clone(),
            compiler: ElmCompiler::locate(&config.build.compiler),
            targets,
            installers,
            groups: FxHashMap::default(),
            compile_seq: 0,
            pool: ProcessPool::new(config.compiler_limit(), config.postprocess_limit(), done_tx),
            hub,
            persisted,
            idle_tx: watch::channel(false).0,
            reported_roots: FxHashSet::default(),
        }
    }

    pub(super) fn idle(&self) -> watch::Receiver<bool> {
        self.idle_tx.subscribe()
    }

    pub(super) fn index_of(&self, name: &str) -> Option<usize> {
        self.targets.iter().position(|s| s.name() == name)
    }

    // ========================================================================
    // Starting runs
    // ========================================================================

    pub(super) fn start_all(&mut self) {
        self.start((0..self.targets.len()).collect());
    }

    /// Restart `indices` (disabled targets are skipped).
    pub(super) fn start(&mut self, mut indices: Vec<usize>) {
        indices.sort_unstable();
        indices.dedup();
        indices.retain(|&i| self.targets[i].target().enabled);
        if indices.is_empty() {
            return;
        }

        for &i in &indices {
            let has_sessions = self.hub.has_sessions(self.targets[i].name());
            let codegen = self.targets[i].codegen_for(self.env.run_mode, has_sessions);
            let superseded = self.targets[i].restart(codegen);
            self.release(i, superseded);
            let busy = ServerMessage::status(WireStatus::Busy {
                compilation_mode: self.targets[i].mode(),
            });
            self.hub.publish(self.targets[i].name(), &busy);
        }

        // A failed install is retried once per trigger, not once per target.
        for &i in &indices {
            let manifest = &self.targets[i].target().root.manifest;
            if let Some(installer) = self.installers.get_mut(manifest) {
                installer.reset_failure();
            }
        }

        let mut ready = Vec::new();
        for &i in &indices {
            let manifest = self.targets[i].target().root.manifest.clone();
            let Some(installer) = self.installers.get_mut(&manifest) else {
                continue;
            };
            let pool = &mut self.pool;
            let ensure = installer.ensure_installed(i, &self.compiler, |cmd| {
                pool.submit(
                    ResourceClass::Compiler,
                    Job::Process(cmd),
                    JobTag::Install { manifest: manifest.clone() },
                )
            });
            match ensure {
                Ensure::Ready => ready.push(i),
                Ensure::Pending => {}
                Ensure::Failed(e) => {
                    self.targets[i].install_failed(&e);
                    self.report(i);
                }
            }
        }

        self.start_compiles(ready);
        self.redraw();
    }

    /// Submit one `elm make` per group of targets with identical inputs.
    ///
    /// Targets join a running group with the same key when it generates
    /// enough code. A typecheck-only group that a target needs code from is
    /// cancelled and its members move into the new invocation.
    fn start_compiles(&mut self, ready: Vec<usize>) {
        let mut batches: Vec<(GroupKey, Vec<(usize, u64)>)> = Vec::new();
        for i in ready {
            if !self.targets[i].is_waiting_for_install() {
                continue;
            }
            let key = GroupKey::of(&self.targets[i]);
            let member = (i, self.targets[i].generation());
            match batches.iter_mut().find(|(k, _)| *k == key) {
                Some((_, members)) => members.push(member),
                None => batches.push((key, vec![member])),
            }
        }

        for (key, mut members) in batches {
            let full = members
                .iter()
                .any(|&(i, _)| self.targets[i].codegen() == Some(Codegen::Full));

            let running = self
                .groups
                .iter()
                .find(|(_, group)| group.key == key)
                .map(|(&id, group)| (id, group.artifact.is_some()));
            match running {
                Some((id, has_code)) if has_code || !full => {
                    for &(i, _) in &members {
                        self.targets[i].compile_started(id);
                    }
                    crate::debug!("compile"; "{} target(s) joined job {}", members.len(), id);
                    if let Some(group) = self.groups.get_mut(&id) {
                        group.members.extend(members);
                    }
                    continue;
                }
                Some((id, _)) => {
                    if let Some(group) = self.groups.remove(&id) {
                        members.extend(group.members);
                    }
                    self.pool.cancel(id);
                }
                None => {}
            }

            let root: Arc<ProjectRoot> = Arc::clone(&self.targets[members[0].0].target().root);
            self.compile_seq += 1;
            let artifact =
                full.then(|| root.stuff_dir().join(key.artifact_name(self.compile_seq)));

            let cmd = self
                .compiler
                .make(&root, &key.inputs, key.mode, artifact.as_deref());
            let id = self
                .pool
                .submit(ResourceClass::Compiler, Job::Process(cmd), JobTag::Compile);

            for &(i, _) in &members {
                self.targets[i].compile_started(id);
            }
            crate::debug!("compile"; "job {} for {} target(s)", id, members.len());
            self.groups.insert(
                id,
                CompileGroup {
                    key,
                    members,
                    artifact,
                },
            );
        }
    }

    /// Drop work a restart made obsolete.
    fn release(&mut self, index: usize, superseded: Superseded) {
        if let Some(group_id) = superseded.compile_group
            && let Some(group) = self.groups.get_mut(&group_id)
        {
            group.members.retain(|&(i, _)| i != index);
            if group.members.is_empty() {
                self.groups.remove(&group_id);
                self.pool.cancel(group_id);
            }
        }
        if let Some(job) = superseded.postprocess_job {
            self.pool.cancel(job);
        }
    }

    // ========================================================================
    // Job completions
    // ========================================================================

    pub(super) async fn on_job_done(&mut self, done: JobDone) {
        let Some(completion) = self.pool.finish(done) else {
            return;
        };
        match completion.tag {
            JobTag::Install { manifest } => {
                self.on_installed(&manifest, completion.id, &completion.outcome);
            }
            JobTag::Compile => self.on_compiled(completion.id, &completion.outcome).await,
            JobTag::Postprocess { target, generation } => {
                let env = self.env;
                if self.targets[target]
                    .on_postprocessed(generation, &completion.outcome, &env)
                    .await
                {
                    self.report(target);
                }
            }
        }
        self.redraw();
    }

    fn on_installed(&mut self, manifest: &Path, id: JobId, outcome: &ProcessOutcome) {
        let Some(installer) = self.installers.get_mut(manifest) else {
            return;
        };
        let Some((result, mut waiters)) = installer.finish(id, outcome) else {
            return;
        };
        waiters.sort_unstable();
        waiters.dedup();
        waiters.retain(|&i| self.targets[i].is_waiting_for_install());

        match result {
            Ok(()) => {
                crate::debug!("install"; "packages ready for {}", manifest.display());
                self.start_compiles(waiters);
            }
            Err(e) => {
                if !e.is_compile_error() {
                    self.report_once(manifest, &e.to_string());
                }
                for i in waiters {
                    self.targets[i].install_failed(&e);
                    self.report(i);
                }
            }
        }
    }

    async fn on_compiled(&mut self, id: JobId, outcome: &ProcessOutcome) {
        let Some(group) = self.groups.remove(&id) else {
            return;
        };
        let result = classify_make(outcome);
        if let MakeResult::SpawnFailed {
            not_found: true,
            message,
        } = &result
            && let Some(&(first, _)) = group.members.first()
        {
            let manifest = self.targets[first].target().root.manifest.clone();
            self.report_once(&manifest, message);
        }

        let env = self.env;
        for (i, generation) in group.members {
            let step = self.targets[i]
                .on_compiled(generation, &result, group.artifact.as_deref(), &env)
                .await;
            match step {
                Step::Stale => {}
                Step::Done => self.report(i),
                Step::Postprocess(job) => {
                    let job = self.pool.submit(
                        ResourceClass::Postprocess,
                        job,
                        JobTag::Postprocess {
                            target: i,
                            generation,
                        },
                    );
                    self.targets[i].postprocess_started(job);
                }
            }
        }
        // Every member has copied the code to its own output by now.
        if let Some(artifact) = &group.artifact {
            tokio::fs::remove_file(artifact).await.ok();
        }
    }

    /// Log a root-level problem the first time it happens.
    fn report_once(&mut self, manifest: &Path, message: &str) {
        if self.reported_roots.insert(manifest.to_path_buf()) {
            crate::log!("error"; "{}", message);
        }
    }

    // ========================================================================
    // Reporting
    // ========================================================================

    /// Tell sessions (and the terminal) about a target that just settled.
    fn report(&mut self, index: usize) {
        if self.env.run_mode == RunMode::Make {
            display::print_result(&self.targets[index]);
        }

        let state = &mut self.targets[index];
        let name = state.name().to_string();
        if let Some(message) = error_message(state.status(), state.mode()) {
            self.hub.publish(&name, &message);
            return;
        }
        if !state.status().is_success() {
            return;
        }

        if state.wants_codegen_upgrade() && self.hub.has_sessions(&name) {
            crate::debug!("compile"; "{}: generating code for connected tabs", name);
            self.start(vec![index]);
            return;
        }
        if let Some(delivered) = state.delivered().cloned() {
            let delivery = Delivery {
                timestamp: delivered.timestamp,
                mode: delivered.mode,
                code: delivered.code.as_deref(),
                recovered: state.take_recovered(),
            };
            self.hub.deliver(&name, &delivery);
        }
    }

    fn redraw(&self) {
        if self.env.run_mode != RunMode::Hot {
            return;
        }
        let lines: Vec<_> = self
            .targets
            .iter()
            .filter(|s| s.target().enabled)
            .map(display::status_line)
            .collect();
        crate::logger::status_block(&lines);
    }

    // ========================================================================
    // File changes
    // ========================================================================

    /// Restart whatever `batch` affects. `Some` ends this run.
    pub(super) fn on_batch(&mut self, batch: &ChangeBatch) -> Option<Exit> {
        let paths: Vec<PathBuf> = batch.paths().map(canonical).collect();
        if paths.contains(&self.config_path) {
            crate::log!("watch"; "{} changed, reloading", CONFIG_FILE);
            return Some(Exit::Restart);
        }

        let mut affected = Vec::new();
        for path in &paths {
            if path.file_name() == Some(OsStr::new(MANIFEST_NAME))
                && let Some(installer) = self.installers.get_mut(path)
            {
                let pool = &mut self.pool;
                installer.invalidate(|job| {
                    pool.cancel(job);
                });
                affected.extend(
                    self.targets
                        .iter()
                        .enumerate()
                        .filter(|(_, s)| s.target().root.manifest == *path)
                        .map(|(i, _)| i),
                );
                continue;
            }
            affected.extend(
                self.targets
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| s.target().is_affected_by(path))
                    .map(|(i, _)| i),
            );
        }

        if !affected.is_empty() {
            if let Some(change) = batch.changes.first() {
                crate::debug!("watch"; "{} {} ({} paths)", change.kind.label(), change.path.display(), batch.changes.len());
            }
            self.start(affected);
        }
        None
    }

    // ========================================================================
    // Browser sessions
    // ========================================================================

    pub(super) fn on_hub_event(&mut self, event: HubEvent) {
        match event {
            HubEvent::Connected { id, uri, tx } => {
                if let Ok(handshake) = self.hub.connect(id, &uri, tx) {
                    self.on_handshake(id, &handshake);
                }
            }
            HubEvent::Message { id, text } => {
                if let Some(update) = self.hub.receive(id, &text) {
                    self.on_session_update(update);
                }
            }
            HubEvent::Disconnected { id } => {
                self.hub.disconnect(id);
            }
        }
    }

    fn on_handshake(&mut self, id: SessionId, handshake: &Handshake) {
        let Some(i) = self.index_of(&handshake.target_name) else {
            return;
        };
        if self.targets[i].wants_codegen_upgrade() {
            // `start` publishes Busy to this session too.
            self.start(vec![i]);
            return;
        }

        let state = &self.targets[i];
        let mode = state.mode();
        // A tab running the delivered build can take the next one as a hot
        // swap, whatever the target is doing right now.
        if let Some(delivered) = state.delivered()
            && delivered.timestamp == handshake.compiled_timestamp
        {
            self.hub.set_session_mode(id, delivered.mode);
        }
        let message = match (state.status(), state.delivered()) {
            (status, _) if status.is_busy() => busy(mode),
            (OutputStatus::NotStarted, _) => busy(mode),
            (OutputStatus::Success { .. }, Some(delivered))
                if delivered.timestamp == handshake.compiled_timestamp =>
            {
                ServerMessage::status(WireStatus::AlreadyUpToDate {
                    compilation_mode: delivered.mode,
                })
            }
            (OutputStatus::Success { .. }, Some(_)) => {
                ServerMessage::reload("the page runs an older build")
            }
            (OutputStatus::Success { .. }, None) => {
                ServerMessage::status(WireStatus::AlreadyUpToDate {
                    compilation_mode: mode,
                })
            }
            (status, _) => error_message(status, mode).unwrap_or_else(|| busy(mode)),
        };
        self.hub.send_to(id, &message);
    }

    fn on_session_update(&mut self, update: SessionUpdate) {
        match update {
            SessionUpdate::ChangedMode { target, mode } => {
                let Some(i) = self.index_of(&target) else {
                    return;
                };
                crate::log!("hot"; "{}: switching to {} mode", target, mode);
                self.targets[i].set_mode(mode);
                if let Some(persisted) = &mut self.persisted {
                    persisted.set_mode(&target, mode);
                    persisted.save_or_warn();
                }
                self.start(vec![i]);
            }
            SessionUpdate::Focused { target } => {
                crate::debug!("ws"; "focused tab for {}", target);
            }
            SessionUpdate::Idle | SessionUpdate::Errored => {}
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// No job in flight and no target mid-run.
    pub(super) fn is_quiescent(&self) -> bool {
        self.pool.is_idle() && !self.targets.iter().any(OutputState::is_busy)
    }

    pub(super) fn all_succeeded(&self) -> bool {
        self.targets
            .iter()
            .filter(|s| s.target().enabled)
            .all(|s| s.status().is_success())
    }

    pub(super) fn update_idle(&self) {
        self.idle_tx
            .send_replace(self.is_quiescent() && self.hub.all_idle());
    }

    pub(super) fn shutdown(&mut self) {
        self.pool.cancel_all();
        self.groups.clear();
        self.hub.clear();
    }
}

fn busy(mode: CompilationMode) -> ServerMessage {
    ServerMessage::status(WireStatus::Busy {
        compilation_mode: mode,
    })
}

/// The wire form of an error status.
fn error_message(status: &OutputStatus, mode: CompilationMode) -> Option<ServerMessage> {
    let status = match status {
        OutputStatus::CompileError { details } => WireStatus::CompileError {
            compilation_mode: mode,
            details: details.clone(),
        },
        OutputStatus::PostprocessError { details } => WireStatus::PostprocessError {
            details: details.to_string(),
        },
        OutputStatus::ClientError { details } => WireStatus::ElmWatchError {
            details: details.clone(),
        },
        _ => return None,
    };
    Some(ServerMessage::status(status))
}

/// Canonical form of a changed path; removed files keep a canonical parent.
fn canonical(path: &Path) -> PathBuf {
    if let Ok(path) = std::fs::canonicalize(path) {
        return path;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => std::fs::canonicalize(parent)
            .map(|p| p.join(name))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => path.to_path_buf(),
    }
}

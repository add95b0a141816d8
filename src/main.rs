//! elmwatch - watch-mode build orchestrator for Elm with hot reload.

#![allow(dead_code)]

mod actor;
mod cli;
mod compiler;
mod config;
mod core;
mod embed;
mod inject;
mod logger;
mod output;
mod persist;
mod postprocess;
mod process;

use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;

use actor::coordinator::{Exit, Inbox, Orchestrator, Setup, collect_watch_roots};
use actor::fs::{FsWatcher, WatchRoot};
use actor::ws::WsServer;
use anyhow::{Context, Result};
use clap::{ColorChoice, Parser};
use cli::Cli;
use config::{Config, ConfigError};
use core::{CompilationMode, RunMode};
use persist::Persisted;
use tokio::sync::{mpsc, watch};

fn main() -> Result<ExitCode> {
    // Setup global Ctrl+C handler (before any blocking operations)
    core::setup_shutdown_handler()?;

    let cli = Cli::parse();

    // Set global color override based on CLI option
    match cli.color {
        ColorChoice::Always => owo_colors::set_override(true),
        ColorChoice::Never => owo_colors::set_override(false),
        ColorChoice::Auto => {} // owo-colors auto-detects TTY
    }
    logger::set_verbose(cli.verbose);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;
    let cwd = std::env::current_dir()?;

    runtime.block_on(async {
        match cli.run_mode() {
            RunMode::Make => make(&cli, &cwd).await,
            RunMode::Hot => hot(&cli, &cwd).await,
        }
    })
}

fn load_config(cli: &Cli, cwd: &Path) -> Result<Config, ConfigError> {
    let mut config = Config::discover(cli.config.as_deref(), cwd)?;
    config.select_targets(cli.targets())?;
    Ok(config)
}

// =============================================================================
// Make Command
// =============================================================================

async fn make(cli: &Cli, cwd: &Path) -> Result<ExitCode> {
    let config = load_config(cli, cwd)?;
    let orchestrator = Orchestrator::new(Setup {
        config: &config,
        run_mode: RunMode::Make,
        ws_port: 0,
        default_mode: cli.make_mode(),
        persisted: None,
    });
    let inbox = Inbox {
        batches: None,
        hub: None,
        shutdown: core::shutdown_signal(),
    };

    match orchestrator.run(inbox).await {
        Exit::Finished(true) => Ok(ExitCode::SUCCESS),
        _ => Ok(ExitCode::FAILURE),
    }
}

// =============================================================================
// Hot Command
// =============================================================================

async fn hot(cli: &Cli, cwd: &Path) -> Result<ExitCode> {
    let mut shutdown = core::shutdown_signal();
    let mut config = load_config(cli, cwd)?;

    // The port survives restarts so open tabs can reconnect.
    let mut persisted = Persisted::load(&config.stuff_dir());
    let port = match config.serve.port {
        0 => persisted.port().unwrap_or(0),
        port => port,
    };
    let server = WsServer::bind(port)?;
    persisted.set_port(server.port());
    persisted.retain_targets(config.targets.iter().map(|t| t.name.as_str()));
    persisted.save_or_warn();
    log!("hot"; "listening on ws://localhost:{}", server.port());

    loop {
        match watch_once(&config, &server, shutdown.clone()).await? {
            Exit::Restart => {}
            Exit::Finished(_) | Exit::Shutdown => return Ok(ExitCode::SUCCESS),
        }

        let config_path = config.path.clone();
        config = loop {
            match load_config(cli, cwd) {
                Ok(config) => break config,
                Err(e) => {
                    log!("error"; "{}", e);
                    log!("hot"; "waiting for {} to change", config_path.display());
                    let debounce = Duration::from_millis(config.build.debounce_ms);
                    if !wait_for_change(&config_path, debounce, &mut shutdown).await? {
                        return Ok(ExitCode::SUCCESS);
                    }
                }
            }
        };
        log!("hot"; "configuration reloaded ({} targets)", config.targets.len());
    }
}

/// One orchestrator run with its own watcher and accept loop.
async fn watch_once(
    config: &Config,
    server: &WsServer,
    shutdown: watch::Receiver<bool>,
) -> Result<Exit> {
    let (batch_tx, batch_rx) = mpsc::unbounded_channel();
    let watcher = FsWatcher::new(
        collect_watch_roots(config),
        Duration::from_millis(config.build.debounce_ms),
        batch_tx,
    )
    .context("failed to start file watcher")?;

    let (hub_tx, hub_rx) = mpsc::unbounded_channel();
    let accept = server.spawn(hub_tx)?;

    let orchestrator = Orchestrator::new(Setup {
        config,
        run_mode: RunMode::Hot,
        ws_port: server.port(),
        default_mode: CompilationMode::Standard,
        persisted: Some(Persisted::load(&config.stuff_dir())),
    });
    let inbox = Inbox {
        batches: Some(batch_rx),
        hub: Some(hub_rx),
        shutdown,
    };

    // The watcher stops once the orchestrator drops its receiver.
    let (exit, ()) = tokio::join!(orchestrator.run(inbox), watcher.run());
    accept.abort();
    Ok(exit)
}

/// Wait until `path` changes. `false` on shutdown.
async fn wait_for_change(
    path: &Path,
    debounce: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<bool> {
    let dir = path.parent().unwrap_or(Path::new("."));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let watcher = FsWatcher::new(vec![WatchRoot::shallow(dir.to_path_buf())], debounce, tx)
        .context("failed to watch the configuration file")?;

    let changed = async {
        loop {
            tokio::select! {
                Some(batch) = rx.recv() => {
                    if batch.touches(path) {
                        return true;
                    }
                }
                _ = shutdown.changed() => return false,
            }
        }
    };

    tokio::select! {
        changed = changed => Ok(changed),
        () = watcher.run() => Ok(false),
    }
}

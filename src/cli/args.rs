//! Command-line interface definitions.

use clap::{ColorChoice, Parser, Subcommand};
use std::path::PathBuf;

use crate::core::{CompilationMode, RunMode};

/// Watch-mode build orchestrator for Elm
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None, arg_required_else_help = true)]
pub struct Cli {
    /// Control colored output (auto, always, never)
    #[arg(long, global = true, default_value = "auto")]
    pub color: ColorChoice,

    /// Config file path (default: elm-watch.toml, searched upward)
    #[arg(short = 'C', long, global = true, value_hint = clap::ValueHint::FilePath)]
    pub config: Option<PathBuf>,

    /// Enable verbose output for debugging
    #[arg(short = 'V', long, global = true)]
    pub verbose: bool,

    /// subcommands
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Build the selected targets once and exit
    #[command(visible_alias = "m")]
    Make {
        /// Compile with the time-travelling debugger
        #[arg(long, conflicts_with = "optimize")]
        debug: bool,

        /// Compile with optimizations
        #[arg(long)]
        optimize: bool,

        /// Substrings selecting targets (default: all)
        #[arg(value_name = "TARGET")]
        targets: Vec<String>,
    },

    /// Watch, rebuild on change and hot reload connected browsers
    #[command(visible_alias = "h")]
    Hot {
        /// Substrings selecting targets (default: all)
        #[arg(value_name = "TARGET")]
        targets: Vec<String>,
    },
}

impl Cli {
    pub const fn run_mode(&self) -> RunMode {
        match self.command {
            Commands::Make { .. } => RunMode::Make,
            Commands::Hot { .. } => RunMode::Hot,
        }
    }

    /// Target selection patterns.
    pub fn targets(&self) -> &[String] {
        match &self.command {
            Commands::Make { targets, .. } | Commands::Hot { targets } => targets,
        }
    }

    /// Compilation mode for `make`; watch mode switches modes per target.
    pub const fn make_mode(&self) -> CompilationMode {
        match self.command {
            Commands::Make { debug: true, .. } => CompilationMode::Debug,
            Commands::Make { optimize: true, .. } => CompilationMode::Optimize,
            _ => CompilationMode::Standard,
        }
    }
}

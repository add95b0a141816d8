//! Logging utilities with colored output and a watch-mode status block.
//!
//! This module provides:
//! - `log!` macro for formatted terminal output with colored prefixes
//! - `debug!` macro, only shown with `--verbose`
//! - `WatchStatus` for the per-target status block redrawn in watch mode
//!
//! # Example
//!
//! ```ignore
//! log!("make"; "compiling {} targets", count);
//! debug!("pool"; "admitted job {}", id);
//! ```

use crossterm::{
    cursor, execute,
    terminal::{Clear, ClearType},
};
use owo_colors::OwoColorize;
use parking_lot::Mutex;
use std::{
    io::{Write, stdout},
    sync::LazyLock,
    sync::atomic::{AtomicBool, Ordering},
};

/// Global verbose flag (set by --verbose CLI argument)
static VERBOSE: AtomicBool = AtomicBool::new(false);

/// Set verbose mode globally
pub fn set_verbose(v: bool) {
    VERBOSE.store(v, Ordering::SeqCst);
}

/// Check if verbose mode is enabled
pub fn is_verbose() -> bool {
    VERBOSE.load(Ordering::SeqCst)
}

// ============================================================================
// Log Macro
// ============================================================================

/// Log a message with a colored module prefix
///
/// # Usage
/// ```ignore
/// log!("module"; "message with {} formatting", args);
/// ```
#[macro_export]
macro_rules! log {
    ($module:expr; $($arg:tt)*) => {{
        $crate::logger::log($module, &format!($($arg)*))
    }};
}

/// Log a debug message (only shown when --verbose is enabled)
///
/// # Usage
/// ```ignore
/// debug!("module"; "debug info: {}", value);
/// ```
#[macro_export]
macro_rules! debug {
    ($module:expr; $($arg:tt)*) => {{
        if $crate::logger::is_verbose() {
            $crate::logger::log($module, &format!($($arg)*))
        }
    }};
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Log a message with a colored module prefix.
///
/// Any status block drawn by `WatchStatus` is forgotten, so the next
/// status redraw starts below this line instead of overwriting it.
#[inline]
pub fn log(module: &str, message: &str) {
    let module_lower = module.to_ascii_lowercase();
    let prefix = colorize_prefix(module, &module_lower);

    let mut status = WATCH_STATUS.lock();
    let mut stdout = stdout().lock();
    execute!(stdout, Clear(ClearType::UntilNewLine)).ok();
    writeln!(stdout, "{prefix} {message}").ok();
    stdout.flush().ok();
    status.last_lines = 0;
}

/// Apply color to a module prefix based on module type
#[inline]
fn colorize_prefix(module: &str, module_lower: &str) -> String {
    let prefix = format!("[{module}]");
    match module_lower {
        "hot" | "ws" => prefix.bright_blue().bold().to_string(),
        "watch" => prefix.bright_green().bold().to_string(),
        "error" => prefix.bright_red().bold().to_string(),
        "warning" => prefix.bright_magenta().bold().to_string(),
        _ => prefix.bright_yellow().bold().to_string(),
    }
}

// ============================================================================
// Watch Status (status block with overwrite)
// ============================================================================

/// Get current wall-clock time (UTC) formatted as HH:MM:SS
fn now() -> String {
    use std::time::SystemTime;
    let secs = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let hours = (secs / 3600) % 24;
    let minutes = (secs / 60) % 60;
    let seconds = secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

/// Outcome shown for one target in the status block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Busy,
    Success,
    Error,
}

/// One line of the status block.
#[derive(Debug, Clone)]
pub struct StatusLine {
    pub kind: StatusKind,
    pub target: String,
    pub summary: String,
    /// Multi-line detail printed under the summary (errors only)
    pub detail: String,
}

/// Status block display for watch mode.
///
/// Every redraw replaces the previous block, so the terminal always shows
/// exactly one line per target plus the details of failing targets.
pub struct WatchStatus {
    /// Lines of previous output to clear
    last_lines: usize,
}

static WATCH_STATUS: LazyLock<Mutex<WatchStatus>> =
    LazyLock::new(|| Mutex::new(WatchStatus::new()));

impl WatchStatus {
    pub const fn new() -> Self {
        Self { last_lines: 0 }
    }

    /// Render the block into a string without touching the terminal.
    fn render(lines: &[StatusLine]) -> String {
        let timestamp = format!("[{}]", now()).dimmed().to_string();
        let mut out = String::new();
        for line in lines {
            let symbol = match line.kind {
                StatusKind::Busy => "⏳".to_string(),
                StatusKind::Success => "✓".green().to_string(),
                StatusKind::Error => "✗".red().to_string(),
            };
            out.push_str(&format!(
                "{timestamp} {symbol} {} {}\n",
                line.target.bold(),
                line.summary.dimmed()
            ));
            if !line.detail.is_empty() {
                out.push_str(&line.detail);
                if !line.detail.ends_with('\n') {
                    out.push('\n');
                }
            }
        }
        out
    }

    fn display(&mut self, lines: &[StatusLine]) {
        let mut stdout = stdout().lock();

        if self.last_lines > 0 {
            #[allow(clippy::cast_possible_truncation)]
            let lines = self.last_lines.min(u16::MAX as usize) as u16;
            execute!(stdout, cursor::MoveUp(lines)).ok();
            execute!(stdout, Clear(ClearType::FromCursorDown)).ok();
        }

        let block = Self::render(lines);
        write!(stdout, "{block}").ok();
        stdout.flush().ok();

        self.last_lines = block.matches('\n').count();
    }
}

/// Redraw the global status block.
pub fn status_block(lines: &[StatusLine]) {
    WATCH_STATUS.lock().display(lines);
}

// ============================================================================
// Tests
// ============================================================================

//! Terminal rendering of target status.

use owo_colors::OwoColorize;

use crate::logger::{StatusKind, StatusLine};
use crate::output::OutputState;

pub(super) fn status_line(state: &OutputState) -> StatusLine {
    let status = state.status();
    let kind = if status.is_success() {
        StatusKind::Success
    } else if status.is_error() {
        StatusKind::Error
    } else {
        StatusKind::Busy
    };
    let summary = if status.is_busy() {
        format!("{} ({})", status.label(), state.mode())
    } else {
        format!("{} ({}, {} ms)", status.label(), state.mode(), state.elapsed_ms())
    };
    StatusLine {
        kind,
        target: state.name().to_string(),
        summary,
        detail: status.detail(),
    }
}

/// One-shot report for `make`, printed when a target settles.
pub(super) fn print_result(state: &OutputState) {
    let line = status_line(state);
    match line.kind {
        StatusKind::Busy => {}
        StatusKind::Success => println!(
            "{} {} {}",
            "✓".green(),
            line.target.bold(),
            line.summary.dimmed()
        ),
        StatusKind::Error => {
            eprintln!(
                "{} {} {}",
                "✗".red(),
                line.target.bold(),
                line.summary.dimmed()
            );
            if !line.detail.is_empty() {
                eprintln!("{}", line.detail.trim_end());
            }
        }
    }
}

//! Hot reload hook injection into compiler output.
//!
//! A pure text transform driven by the marker table in [`markers`]:
//!
//! ```text
//! for each marker applicable to the mode:
//!     probe miss   → skip (or fail if required)
//!     pattern miss → fail: the compiler's output shape changed
//!     otherwise    → replace first match with the template
//! ```
//!
//! Injected text starts with [`INJECTED_HEADER`]; such text is returned
//! unchanged, so injecting twice is the same as injecting once.

mod markers;

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use crate::core::CompilationMode;
use markers::{MARKERS, Marker};

/// First line of every injected script.
pub const INJECTED_HEADER: &str = "// elm-watch: hot reload hooks injected";

struct CompiledMarker {
    marker: &'static Marker,
    probe: Regex,
    pattern: Regex,
}

// Patterns are constants; `test_all_markers_compile` covers them.
static COMPILED: LazyLock<Vec<CompiledMarker>> = LazyLock::new(|| {
    MARKERS
        .iter()
        .map(|marker| CompiledMarker {
            marker,
            probe: Regex::new(marker.probe).unwrap(),
            pattern: Regex::new(marker.pattern).unwrap(),
        })
        .collect()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectFailure {
    /// A required construct is absent.
    MissingProbe,
    /// The construct exists but not in the expected shape.
    PatternMismatch,
}

/// Structured injection failure, carrying everything needed to debug it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", self.summary())]
pub struct InjectError {
    pub marker: &'static str,
    pub failure: InjectFailure,
    pub probe: &'static str,
    pub pattern: &'static str,
    pub template: &'static str,
}

impl InjectError {
    fn new(marker: &'static Marker, failure: InjectFailure) -> Self {
        Self {
            marker: marker.name,
            failure,
            probe: marker.probe,
            pattern: marker.pattern,
            template: marker.template,
        }
    }

    fn summary(&self) -> String {
        match self.failure {
            InjectFailure::MissingProbe => format!(
                "could not inject hot reload hooks: `{}` was not found in the compiler output",
                self.marker
            ),
            InjectFailure::PatternMismatch => format!(
                "could not inject hot reload hooks: `{}` has an unexpected shape",
                self.marker
            ),
        }
    }

    /// Content of the diagnostic file: patterns first, then the full input.
    pub fn diagnostic(&self, code: &str) -> String {
        format!(
            "{}\n\nmarker: {}\nprobe: {}\npattern: {}\ntemplate:\n{}\n\n\
             ---- compiler output ----\n{}",
            self.summary(),
            self.marker,
            self.probe,
            self.pattern,
            self.template,
            code
        )
    }
}

/// Has `code` already been through [`inject`]?
pub fn is_injected(code: &str) -> bool {
    code.starts_with(INJECTED_HEADER)
}

/// Add hot reload hooks to compiler output.
pub fn inject(code: &str, mode: CompilationMode) -> Result<String, InjectError> {
    if is_injected(code) {
        return Ok(code.to_string());
    }

    let mut text = code.to_string();
    for compiled in COMPILED.iter() {
        let marker = compiled.marker;
        if !marker.modes.contains(&mode) {
            continue;
        }
        if !compiled.probe.is_match(&text) {
            if marker.required {
                return Err(InjectError::new(marker, InjectFailure::MissingProbe));
            }
            continue;
        }
        if !compiled.pattern.is_match(&text) {
            return Err(InjectError::new(marker, InjectFailure::PatternMismatch));
        }
        text = compiled
            .pattern
            .replacen(&text, 1, marker.template)
            .into_owned();
    }

    Ok(format!("{INJECTED_HEADER}\n{text}"))
}

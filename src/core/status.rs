//! Per-target build status.

use std::time::Instant;

use super::mode::CompilationMode;
use crate::postprocess::PostprocessFailure;

/// Authoritative status of one target. Exactly one value per target.
#[derive(Debug, Clone)]
pub enum OutputStatus {
    NotStarted,
    Compiling {
        mode: CompilationMode,
        started_at: Instant,
    },
    ElmMakeSucceeded,
    Postprocessing,
    Success {
        compiled_timestamp: u64,
    },
    /// The compiler reported errors (rendered report).
    CompileError {
        details: String,
    },
    PostprocessError {
        details: PostprocessFailure,
    },
    /// Anything that is not the user's Elm code being wrong.
    ClientError {
        details: String,
    },
}

impl OutputStatus {
    /// A run is in progress.
    pub const fn is_busy(&self) -> bool {
        matches!(
            self,
            Self::Compiling { .. } | Self::ElmMakeSucceeded | Self::Postprocessing
        )
    }

    pub const fn is_error(&self) -> bool {
        matches!(
            self,
            Self::CompileError { .. } | Self::PostprocessError { .. } | Self::ClientError { .. }
        )
    }

    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Short label for terminal output.
    pub fn label(&self) -> &'static str {
        match self {
            Self::NotStarted => "not started",
            Self::Compiling { .. } => "compiling",
            Self::ElmMakeSucceeded => "compiled",
            Self::Postprocessing => "postprocessing",
            Self::Success { .. } => "success",
            Self::CompileError { .. } => "compile error",
            Self::PostprocessError { .. } => "postprocess error",
            Self::ClientError { .. } => "error",
        }
    }

    /// Multi-line detail for errors, empty otherwise.
    pub fn detail(&self) -> String {
        match self {
            Self::CompileError { details } | Self::ClientError { details } => details.clone(),
            Self::PostprocessError { details } => details.to_string(),
            _ => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        let compiling = OutputStatus::Compiling {
            mode: CompilationMode::Standard,
            started_at: Instant::now(),
        };
        assert!(compiling.is_busy());
        assert!(!compiling.is_error());

        let error = OutputStatus::CompileError {
            details: "TYPE MISMATCH".into(),
        };
        assert!(error.is_error());
        assert_eq!(error.detail(), "TYPE MISMATCH");

        let success = OutputStatus::Success {
            compiled_timestamp: 1,
        };
        assert!(success.is_success());
        assert!(success.detail().is_empty());
        assert!(!OutputStatus::NotStarted.is_busy());
    }
}

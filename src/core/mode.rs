//! Compilation and run modes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How the compiler is asked to generate code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompilationMode {
    Debug,
    #[default]
    Standard,
    Optimize,
}

impl CompilationMode {
    pub const ALL: [Self; 3] = [Self::Debug, Self::Standard, Self::Optimize];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Standard => "standard",
            Self::Optimize => "optimize",
        }
    }

    /// Compiler flag selecting this mode (`standard` has none).
    pub const fn flag(self) -> Option<&'static str> {
        match self {
            Self::Debug => Some("--debug"),
            Self::Standard => None,
            Self::Optimize => Some("--optimize"),
        }
    }
}

impl fmt::Display for CompilationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompilationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| format!("unknown compilation mode `{s}`"))
    }
}

/// Top-level run mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Build every enabled target once and exit.
    Make,
    /// Watch files, serve sessions, rebuild on change.
    Hot,
}

/// Whether a compiler run generates JavaScript or only typechecks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codegen {
    TypecheckOnly,
    Full,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_round_trips_through_str() {
        for mode in CompilationMode::ALL {
            assert_eq!(mode.as_str().parse::<CompilationMode>(), Ok(mode));
        }
        assert!("fast".parse::<CompilationMode>().is_err());
    }

    #[test]
    fn test_mode_flags() {
        assert_eq!(CompilationMode::Debug.flag(), Some("--debug"));
        assert_eq!(CompilationMode::Standard.flag(), None);
        assert_eq!(CompilationMode::Optimize.flag(), Some("--optimize"));
    }

    #[test]
    fn test_mode_serde_lowercase() {
        let json = serde_json::to_string(&CompilationMode::Optimize).unwrap();
        assert_eq!(json, "\"optimize\"");
        let mode: CompilationMode = serde_json::from_str("\"debug\"").unwrap();
        assert_eq!(mode, CompilationMode::Debug);
    }
}

//! Build targets and the Elm project roots they compile in.

use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::postprocess::PostprocessProvider;

/// Name of the dependency manifest identifying a project root.
pub const MANIFEST_NAME: &str = "elm.json";

/// Where a target's compiled script goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputDest {
    File(PathBuf),
    /// Typecheck only; nothing is written.
    Discard,
}

impl OutputDest {
    pub const DISCARD_SENTINEL: &'static str = "/dev/null";

    /// Interpret a configured output, resolving relative paths against `base`.
    pub fn from_config(raw: &str, base: &Path) -> Self {
        if raw == Self::DISCARD_SENTINEL {
            Self::Discard
        } else {
            Self::File(base.join(raw))
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::File(path) => Some(path),
            Self::Discard => None,
        }
    }
}

impl fmt::Display for OutputDest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Discard => f.write_str(Self::DISCARD_SENTINEL),
        }
    }
}

// ============================================================================
// ProjectRoot
// ============================================================================

/// A directory containing `elm.json`, identified by the manifest's canonical path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectRoot {
    pub dir: PathBuf,
    pub manifest: PathBuf,
    /// Absolute `source-directories` from the manifest.
    pub source_directories: Vec<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ElmJson {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    source_directories: Vec<PathBuf>,
}

impl ProjectRoot {
    /// Walk upward from `start` to the nearest directory holding `elm.json`.
    pub fn find_manifest(start: &Path) -> Option<PathBuf> {
        let mut current = if start.is_dir() {
            start
        } else {
            start.parent()?
        };
        loop {
            let candidate = current.join(MANIFEST_NAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            current = current.parent()?;
        }
    }

    /// Read a manifest and resolve its source directories.
    ///
    /// Packages have no `source-directories` and always compile from `src`.
    pub fn load(manifest: &Path) -> Result<Self, String> {
        let manifest = std::fs::canonicalize(manifest)
            .map_err(|e| format!("cannot resolve {}: {e}", manifest.display()))?;
        let dir = manifest
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| format!("{} has no parent directory", manifest.display()))?;
        let content = std::fs::read_to_string(&manifest)
            .map_err(|e| format!("cannot read {}: {e}", manifest.display()))?;
        let parsed: ElmJson = serde_json::from_str(&content)
            .map_err(|e| format!("invalid {}: {e}", manifest.display()))?;

        let dirs = if parsed.kind == "package" {
            vec![PathBuf::from("src")]
        } else {
            parsed.source_directories
        };
        let source_directories = dirs
            .into_iter()
            .map(|d| std::fs::canonicalize(dir.join(&d)).unwrap_or_else(|_| dir.join(d)))
            .collect();

        Ok(Self {
            dir,
            manifest,
            source_directories,
        })
    }

    /// Scratch directory for artifacts and diagnostics.
    pub fn stuff_dir(&self) -> PathBuf {
        self.dir.join("elm-stuff").join("elm-watch")
    }

    /// Is `path` an Elm module living in one of the source directories?
    pub fn owns_source(&self, path: &Path) -> bool {
        path.extension().is_some_and(|ext| ext == "elm")
            && self
                .source_directories
                .iter()
                .any(|dir| path.starts_with(dir))
    }
}

// ============================================================================
// Target
// ============================================================================

/// One named build output.
#[derive(Debug, Clone)]
pub struct Target {
    pub name: String,
    pub output: OutputDest,
    /// Canonical input paths, deduplicated, in configured order.
    pub inputs: Vec<PathBuf>,
    pub postprocess: Option<PostprocessProvider>,
    pub root: Arc<ProjectRoot>,
    pub enabled: bool,
}

impl Target {
    /// Does a change at `path` require rebuilding this target?
    ///
    /// Changes to the manifest are handled by the caller since they also
    /// invalidate the root's dependency installation.
    pub fn is_affected_by(&self, path: &Path) -> bool {
        self.inputs.iter().any(|input| input == path) || self.root.owns_source(path)
    }
}

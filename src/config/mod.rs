//! Project configuration in `elm-watch.toml`.
//!
//! # Module Structure
//!
//! ```text
//! config/
//! ├── error.rs   # ConfigError, ConfigDiagnostics
//! ├── util.rs    # config discovery, path resolution
//! └── mod.rs     # Config (this file)
//! ```
//!
//! # Sections
//!
//! | Section            | Purpose                                         |
//! |--------------------|-------------------------------------------------|
//! | `[serve]`          | WebSocket port                                  |
//! | `[build]`          | compiler binary, slot limits, debounce interval |
//! | `[targets.<name>]` | inputs, output, optional postprocess            |

mod error;
mod util;

pub use error::{ConfigDiagnostic, ConfigDiagnostics, ConfigError};
pub use util::find_config_file;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use serde::Deserialize;

use crate::actor::fs::DEFAULT_DEBOUNCE_MS;
use crate::core::{OutputDest, ProjectRoot, Target};
use crate::postprocess::{BUILTIN_MODULES, PostprocessProvider};

pub const CONFIG_FILE: &str = "elm-watch.toml";

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServeConfig {
    /// 0 = reuse the persisted port, else pick a free one
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Compiler binary, resolved on `PATH`
    pub compiler: String,
    pub max_compilers: Option<usize>,
    pub max_postprocess: Option<usize>,
    pub debounce_ms: u64,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            compiler: "elm".into(),
            max_compilers: None,
            max_postprocess: None,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    serve: ServeConfig,
    #[serde(default)]
    build: BuildConfig,
    #[serde(default)]
    targets: BTreeMap<String, RawTarget>,
}

#[derive(Debug, Deserialize)]
struct RawTarget {
    inputs: Vec<String>,
    output: String,
    #[serde(default)]
    postprocess: Option<RawPostprocess>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawPostprocess {
    Command(Vec<String>),
    Module { module: String },
}

// ============================================================================
// Config
// ============================================================================

/// Loaded and validated configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Canonical path of the config file
    pub path: PathBuf,
    pub serve: ServeConfig,
    pub build: BuildConfig,
    /// Sorted by name
    pub targets: Vec<Target>,
}

impl Config {
    /// Locate the config file from `start` (or take `explicit`) and load it.
    pub fn discover(explicit: Option<&Path>, start: &Path) -> Result<Self, ConfigError> {
        let name = explicit.unwrap_or(Path::new(CONFIG_FILE));
        let path = find_config_file(name, start).ok_or_else(|| ConfigError::NotFound {
            name: name.to_path_buf(),
            start: start.to_path_buf(),
        })?;
        Self::load(&path)
    }

    /// Read, parse and validate a config file; unknown keys are warned about.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let path = std::fs::canonicalize(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let content =
            std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(path.clone(), e))?;

        let (config, ignored) = Self::parse(&content, &path)?;
        if !ignored.is_empty() {
            error::print_unknown_fields_warning(&ignored);
        }
        Ok(config)
    }

    /// Parse TOML content, collecting any unknown fields.
    pub fn parse(content: &str, path: &Path) -> Result<(Self, Vec<String>), ConfigError> {
        let mut ignored = Vec::new();
        let deserializer = toml::Deserializer::new(content);
        let raw: RawConfig = serde_ignored::deserialize(deserializer, |field: serde_ignored::Path| {
            ignored.push(field.to_string());
        })
        .map_err(|e| ConfigError::Toml(path.to_path_buf(), e))?;

        let config = Self::resolve(raw, path)?;
        Ok((config, ignored))
    }

    pub fn dir(&self) -> &Path {
        self.path.parent().unwrap_or(Path::new("."))
    }

    /// Scratch directory for persisted state.
    pub fn stuff_dir(&self) -> PathBuf {
        self.dir().join("elm-stuff").join("elm-watch")
    }

    pub fn compiler_limit(&self) -> usize {
        self.build.max_compilers.unwrap_or_else(available_parallelism)
    }

    pub fn postprocess_limit(&self) -> usize {
        self.build.max_postprocess.unwrap_or_else(available_parallelism)
    }

    /// Distinct project roots, in target order.
    pub fn roots(&self) -> Vec<Arc<ProjectRoot>> {
        let mut seen = FxHashSet::default();
        self.targets
            .iter()
            .filter(|t| seen.insert(t.root.manifest.clone()))
            .map(|t| Arc::clone(&t.root))
            .collect()
    }

    /// Enable only targets whose name contains one of `patterns`.
    ///
    /// No patterns enables everything; a pattern matching nothing is an error.
    pub fn select_targets(&mut self, patterns: &[String]) -> Result<(), ConfigError> {
        if patterns.is_empty() {
            return Ok(());
        }
        let unmatched: Vec<&String> = patterns
            .iter()
            .filter(|p| !self.targets.iter().any(|t| t.name.contains(p.as_str())))
            .collect();
        if !unmatched.is_empty() {
            let known: Vec<&str> = self.targets.iter().map(|t| t.name.as_str()).collect();
            let unmatched: Vec<&str> = unmatched.iter().map(|p| p.as_str()).collect();
            return Err(ConfigError::Selection(format!(
                "no target matches {}; known targets: {}",
                unmatched.join(", "),
                known.join(", ")
            )));
        }
        for target in &mut self.targets {
            target.enabled = patterns.iter().any(|p| target.name.contains(p.as_str()));
        }
        Ok(())
    }

    // ========================================================================
    // Validation
    // ========================================================================

    fn resolve(raw: RawConfig, path: &Path) -> Result<Self, ConfigError> {
        let dir = path.parent().unwrap_or(Path::new("."));
        let mut diag = ConfigDiagnostics::new();
        let mut roots: FxHashMap<PathBuf, Arc<ProjectRoot>> = FxHashMap::default();

        if raw.targets.is_empty() {
            diag.error_with_hint(
                "targets",
                "at least one target is required",
                "add a [targets.Main] section with `inputs` and `output`",
            );
        }

        let mut targets = Vec::new();
        for (name, target) in raw.targets {
            if let Some(target) = resolve_target(&name, target, dir, &mut roots, &mut diag) {
                targets.push(target);
            }
        }

        diag.into_result()?;
        Ok(Self {
            path: path.to_path_buf(),
            serve: raw.serve,
            build: raw.build,
            targets,
        })
    }
}

fn resolve_target(
    name: &str,
    raw: RawTarget,
    dir: &Path,
    roots: &mut FxHashMap<PathBuf, Arc<ProjectRoot>>,
    diag: &mut ConfigDiagnostics,
) -> Option<Target> {
    let field = |key: &str| format!("targets.{name}.{key}");
    let errors_before = diag.errors().len();

    // Inputs: existing `.elm` files, deduplicated by canonical path.
    if raw.inputs.is_empty() {
        diag.error(field("inputs"), "at least one input is required");
    }
    let mut inputs: Vec<PathBuf> = Vec::new();
    for input in &raw.inputs {
        if !input.ends_with(".elm") {
            diag.error(field("inputs"), format!("`{input}` is not an .elm file"));
            continue;
        }
        let resolved = util::resolve(dir, input);
        if !resolved.is_file() {
            diag.error(field("inputs"), format!("`{input}` does not exist"));
            continue;
        }
        if !inputs.contains(&resolved) {
            inputs.push(resolved);
        }
    }

    // All inputs must live in one elm.json root.
    let mut manifests: Vec<PathBuf> = Vec::new();
    for input in &inputs {
        match ProjectRoot::find_manifest(input) {
            Some(manifest) => {
                let manifest = std::fs::canonicalize(&manifest).unwrap_or(manifest);
                if !manifests.contains(&manifest) {
                    manifests.push(manifest);
                }
            }
            None => diag.error(
                field("inputs"),
                format!("no elm.json found above `{}`", input.display()),
            ),
        }
    }
    if manifests.len() > 1 {
        let listed: Vec<String> = manifests.iter().map(|m| m.display().to_string()).collect();
        diag.error_with_hint(
            field("inputs"),
            "inputs belong to different elm.json files",
            format!("split the target; found {}", listed.join(", ")),
        );
    }

    let output = if raw.output == OutputDest::DISCARD_SENTINEL || raw.output.ends_with(".js") {
        Some(OutputDest::from_config(&raw.output, dir))
    } else {
        diag.error_with_hint(
            field("output"),
            format!("`{}` must end with .js", raw.output),
            format!("use `{}` to only typecheck", OutputDest::DISCARD_SENTINEL),
        );
        None
    };

    let postprocess = match raw.postprocess {
        None => None,
        Some(RawPostprocess::Command(command)) => {
            if command.is_empty() || command[0].trim().is_empty() {
                diag.error(field("postprocess"), "postprocess command must not be empty");
                None
            } else {
                Some(PostprocessProvider::External(command))
            }
        }
        Some(RawPostprocess::Module { module }) => match PostprocessProvider::builtin(&module) {
            Some(provider) => Some(provider),
            None => {
                diag.error_with_hint(
                    field("postprocess"),
                    format!("unknown postprocess module `{module}`"),
                    format!("known modules: {}", BUILTIN_MODULES.join(", ")),
                );
                None
            }
        },
    };

    if diag.errors().len() > errors_before {
        return None;
    }
    let manifest = manifests.into_iter().next()?;
    let root = match roots.get(&manifest) {
        Some(root) => Arc::clone(root),
        None => match ProjectRoot::load(&manifest) {
            Ok(root) => {
                let root = Arc::new(root);
                roots.insert(manifest, Arc::clone(&root));
                root
            }
            Err(e) => {
                diag.error(field("inputs"), e);
                return None;
            }
        },
    };

    Some(Target {
        name: name.to_string(),
        output: output?,
        inputs,
        postprocess,
        root,
        enabled: true,
    })
}

fn available_parallelism() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

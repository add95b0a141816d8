//! Watch-mode state that survives restarts.
//!
//! Stored as `elm-stuff/elm-watch/stuff.json` next to the config file:
//!
//! ```json
//! {"port": 41234, "targets": {"Main": {"compilationMode": "debug"}}}
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::CompilationMode;

pub const STUFF_FILE: &str = "stuff.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetState {
    pub compilation_mode: CompilationMode,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct StuffJson {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    port: Option<u16>,
    #[serde(default)]
    targets: BTreeMap<String, TargetState>,
}

/// Persisted port and per-target compilation modes.
#[derive(Debug, Clone)]
pub struct Persisted {
    path: PathBuf,
    data: StuffJson,
}

impl Persisted {
    /// Read the state file in `stuff_dir`. Missing or corrupt files start empty.
    pub fn load(stuff_dir: &Path) -> Self {
        let path = stuff_dir.join(STUFF_FILE);
        let data = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                crate::log!("warning"; "ignoring corrupt {}: {}", path.display(), e);
                StuffJson::default()
            }),
            Err(_) => StuffJson::default(),
        };
        Self { path, data }
    }

    pub fn port(&self) -> Option<u16> {
        self.data.port
    }

    pub fn set_port(&mut self, port: u16) {
        self.data.port = Some(port);
    }

    pub fn mode(&self, target: &str) -> Option<CompilationMode> {
        self.data.targets.get(target).map(|t| t.compilation_mode)
    }

    pub fn set_mode(&mut self, target: &str, mode: CompilationMode) {
        self.data.targets.insert(
            target.to_string(),
            TargetState {
                compilation_mode: mode,
            },
        );
    }

    /// Forget targets that no longer exist in the configuration.
    pub fn retain_targets<'a>(&mut self, names: impl IntoIterator<Item = &'a str>) {
        let names: Vec<&str> = names.into_iter().collect();
        self.data.targets.retain(|name, _| names.contains(&name.as_str()));
    }

    pub fn save(&self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.data).map_err(std::io::Error::other)?;
        std::fs::write(&self.path, json)
    }

    /// Save, logging instead of failing.
    pub fn save_or_warn(&self) {
        if let Err(e) = self.save() {
            crate::log!("warning"; "failed to write {}: {}", self.path.display(), e);
        }
    }
}

use std::path::PathBuf;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use rustc_hash::FxHashSet;

/// A path to watch and how deep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchRoot {
    pub path: PathBuf,
    pub recursive: bool,
}

impl WatchRoot {
    pub fn recursive(path: PathBuf) -> Self {
        Self {
            path,
            recursive: true,
        }
    }

    /// Only the directory's direct entries (e.g. `elm.json` next to sources).
    pub fn shallow(path: PathBuf) -> Self {
        Self {
            path,
            recursive: false,
        }
    }

    fn mode(&self) -> RecursiveMode {
        if self.recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        }
    }
}

/// Watch-root consistency manager.
///
/// Source directories may not exist yet, or may be deleted and recreated
/// while watching; missing roots are attached once they appear.
pub(super) struct WatchRoots {
    desired: Vec<WatchRoot>,
    attached: FxHashSet<PathBuf>,
}

impl WatchRoots {
    /// Deduplicate roots; a recursive root covers anything below it.
    pub(super) fn new(mut roots: Vec<WatchRoot>) -> Self {
        roots.sort_by(|a, b| a.path.cmp(&b.path).then(b.recursive.cmp(&a.recursive)));
        let mut desired: Vec<WatchRoot> = Vec::new();
        for root in roots {
            let covered = desired.iter().any(|d| {
                d.path == root.path || (d.recursive && root.path.starts_with(&d.path))
            });
            if !covered {
                desired.push(root);
            }
        }
        Self {
            desired,
            attached: FxHashSet::default(),
        }
    }

    pub(super) fn attach_existing(
        &mut self,
        watcher: &mut RecommendedWatcher,
    ) -> notify::Result<()> {
        for root in &self.desired {
            if !root.path.exists() {
                continue;
            }
            watcher.watch(&root.path, root.mode())?;
            self.attached.insert(root.path.clone());
        }

        Ok(())
    }

    pub(super) fn maintain(&mut self, watcher: &mut RecommendedWatcher) {
        // Drop stale handles for roots that no longer exist.
        self.attached.retain(|path| path.exists());

        for root in &self.desired {
            if self.attached.contains(&root.path) || !root.path.exists() {
                continue;
            }

            if watcher.watch(&root.path, root.mode()).is_ok() {
                self.attached.insert(root.path.clone());
                crate::debug!("watch"; "re-attached watch: {}", root.path.display());
            }
        }
    }

    #[cfg(test)]
    pub(super) fn desired(&self) -> &[WatchRoot] {
        &self.desired
    }
}

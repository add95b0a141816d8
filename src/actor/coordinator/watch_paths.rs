use std::path::PathBuf;

use crate::actor::fs::WatchRoot;
use crate::config::Config;

/// Directories a watcher needs for `config`.
///
/// - config dir (shallow): `elm-watch.toml` itself
/// - each root dir (shallow): `elm.json`
/// - source directories (recursive): `.elm` modules
/// - input parents (shallow): inputs outside every source directory
pub fn collect_watch_roots(config: &Config) -> Vec<WatchRoot> {
    let mut roots = vec![WatchRoot::shallow(config.dir().to_path_buf())];

    for root in config.roots() {
        roots.push(WatchRoot::shallow(root.dir.clone()));
        for source in &root.source_directories {
            if source.exists() {
                roots.push(WatchRoot::recursive(source.clone()));
            }
        }
    }

    for target in config.targets.iter().filter(|t| t.enabled) {
        let parents = target.inputs.iter().filter_map(|i| i.parent());
        for parent in parents {
            if !target.root.owns_source(&parent.join("_.elm")) {
                roots.push(WatchRoot::shallow(PathBuf::from(parent)));
            }
        }
    }

    roots
}

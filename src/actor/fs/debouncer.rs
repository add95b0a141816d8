use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;

use super::types::{ChangeBatch, ChangeKind, FileChange};

pub const DEFAULT_DEBOUNCE_MS: u64 = 25;

/// Pure debouncer: only handles timing and event deduplication.
///
/// Events for the same path inside one window collapse to the latest kind,
/// and batches are emitted at most once per interval.
pub(super) struct Debouncer {
    interval: Duration,
    pub(super) changes: FxHashMap<PathBuf, ChangeKind>,
    pub(super) last_event: Option<Instant>,
    pub(super) last_batch: Option<Instant>,
}

impl Debouncer {
    pub(super) fn new(interval: Duration) -> Self {
        Self {
            interval,
            changes: FxHashMap::default(),
            last_event: None,
            last_batch: None,
        }
    }

    /// Record a notify event; the latest kind for a path wins.
    pub(super) fn add_event(&mut self, event: &notify::Event) {
        use notify::EventKind;

        let kind = match event.kind {
            EventKind::Create(_) => ChangeKind::Added,
            EventKind::Remove(_) => ChangeKind::Removed,
            // A rename reports the old name as gone and the new one as there.
            EventKind::Modify(notify::event::ModifyKind::Name(mode)) => match mode {
                notify::event::RenameMode::From => ChangeKind::Removed,
                notify::event::RenameMode::To => ChangeKind::Added,
                _ => ChangeKind::Changed,
            },
            // Metadata-only changes (mtime/atime/chmod) are noise
            EventKind::Modify(notify::event::ModifyKind::Metadata(_)) => return,
            EventKind::Modify(_) => ChangeKind::Changed,
            _ => return,
        };

        crate::debug!("watch"; "raw notify: {:?} {:?}", event.kind, event.paths);

        for path in &event.paths {
            if is_temp_file(path) {
                continue;
            }
            if let Some(previous) = self.changes.insert(path.clone(), kind)
                && previous != kind
            {
                crate::debug!("watch"; "{} -> {}: {}", previous.label(), kind.label(), path.display());
            }
            self.last_event = Some(Instant::now());
        }
    }

    /// Take the pending batch if the window has closed.
    pub(super) fn take_if_ready(&mut self) -> Option<ChangeBatch> {
        if !self.is_ready() {
            return None;
        }

        let mut changes: Vec<_> = std::mem::take(&mut self.changes)
            .into_iter()
            .map(|(path, kind)| FileChange { path, kind })
            .collect();
        changes.sort_by(|a, b| a.path.cmp(&b.path));
        self.last_event = None;
        self.last_batch = Some(Instant::now());
        Some(ChangeBatch { changes })
    }

    pub(super) fn is_ready(&self) -> bool {
        let Some(last_event) = self.last_event else {
            return false;
        };

        if last_event.elapsed() < self.interval {
            return false;
        }

        if let Some(last_batch) = self.last_batch
            && last_batch.elapsed() < self.interval
        {
            return false;
        }

        !self.changes.is_empty()
    }

    /// Precise sleep duration until next possible ready time.
    pub(super) fn sleep_duration(&self) -> Duration {
        let Some(last_event) = self.last_event else {
            return Duration::from_secs(86400);
        };

        let debounce_remaining = self.interval.saturating_sub(last_event.elapsed());
        let batch_remaining = self
            .last_batch
            .map(|t| self.interval.saturating_sub(t.elapsed()))
            .unwrap_or(Duration::ZERO);

        debounce_remaining
            .max(batch_remaining)
            .max(Duration::from_millis(1))
    }
}

/// Check if path is a temp/backup file (editor artifacts).
pub(super) fn is_temp_file(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

    matches!(ext, "bck" | "bak" | "backup" | "swp" | "swo" | "swx" | "tmp")
        || name.ends_with('~')
        || name.starts_with(".#")
        || (name.starts_with('#') && name.ends_with('#'))
        || name == "4913"
}

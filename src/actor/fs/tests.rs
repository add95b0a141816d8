use std::path::PathBuf;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tokio::sync::mpsc;

use super::debouncer::{Debouncer, is_temp_file};
use super::watch_roots::WatchRoots;
use super::{ChangeKind, FsWatcher, WatchRoot};

const INTERVAL: Duration = Duration::from_millis(25);

fn make_event(paths: Vec<&str>, kind: notify::EventKind) -> notify::Event {
    notify::Event {
        kind,
        paths: paths.into_iter().map(PathBuf::from).collect(),
        attrs: Default::default(),
    }
}

fn modify_kind() -> notify::EventKind {
    notify::EventKind::Modify(notify::event::ModifyKind::Data(
        notify::event::DataChange::Any,
    ))
}

fn create_kind() -> notify::EventKind {
    notify::EventKind::Create(notify::event::CreateKind::File)
}

fn remove_kind() -> notify::EventKind {
    notify::EventKind::Remove(notify::event::RemoveKind::File)
}

fn rename_kind(mode: notify::event::RenameMode) -> notify::EventKind {
    notify::EventKind::Modify(notify::event::ModifyKind::Name(mode))
}

#[test]
fn test_debouncer_empty() {
    let mut debouncer = Debouncer::new(INTERVAL);
    assert!(!debouncer.is_ready());
    assert!(debouncer.take_if_ready().is_none());
}

#[test]
fn test_event_routing_by_kind() {
    let mut debouncer = Debouncer::new(INTERVAL);

    debouncer.add_event(&make_event(vec!["/src/A.elm"], create_kind()));
    debouncer.add_event(&make_event(vec!["/src/B.elm"], modify_kind()));
    debouncer.add_event(&make_event(vec!["/src/C.elm"], remove_kind()));

    assert_eq!(debouncer.changes.len(), 3);
    assert_eq!(debouncer.changes[&PathBuf::from("/src/A.elm")], ChangeKind::Added);
    assert_eq!(debouncer.changes[&PathBuf::from("/src/B.elm")], ChangeKind::Changed);
    assert_eq!(debouncer.changes[&PathBuf::from("/src/C.elm")], ChangeKind::Removed);
}

#[test]
fn test_latest_kind_wins() {
    let mut debouncer = Debouncer::new(INTERVAL);

    debouncer.add_event(&make_event(vec!["/src/A.elm"], create_kind()));
    debouncer.add_event(&make_event(vec!["/src/A.elm"], remove_kind()));
    assert_eq!(debouncer.changes.len(), 1);
    assert_eq!(debouncer.changes[&PathBuf::from("/src/A.elm")], ChangeKind::Removed);

    debouncer.add_event(&make_event(vec!["/src/A.elm"], create_kind()));
    assert_eq!(debouncer.changes[&PathBuf::from("/src/A.elm")], ChangeKind::Added);
}

#[test]
fn test_rename_maps_to_remove_and_add() {
    use notify::event::RenameMode;

    let mut debouncer = Debouncer::new(INTERVAL);
    debouncer.add_event(&make_event(vec!["/src/Old.elm"], rename_kind(RenameMode::From)));
    debouncer.add_event(&make_event(vec!["/src/New.elm"], rename_kind(RenameMode::To)));

    assert_eq!(debouncer.changes[&PathBuf::from("/src/Old.elm")], ChangeKind::Removed);
    assert_eq!(debouncer.changes[&PathBuf::from("/src/New.elm")], ChangeKind::Added);
}

#[test]
fn test_metadata_only_ignored() {
    let mut debouncer = Debouncer::new(INTERVAL);
    debouncer.add_event(&make_event(
        vec!["/src/A.elm"],
        notify::EventKind::Modify(notify::event::ModifyKind::Metadata(
            notify::event::MetadataKind::WriteTime,
        )),
    ));
    assert!(debouncer.changes.is_empty());
    assert!(debouncer.last_event.is_none());
}

#[test]
fn test_temp_file_ignored() {
    let mut debouncer = Debouncer::new(INTERVAL);

    debouncer.add_event(&make_event(vec!["/src/Main.elm"], modify_kind()));
    let first_time = debouncer.last_event.unwrap();

    std::thread::sleep(Duration::from_millis(5));

    debouncer.add_event(&make_event(vec!["/src/.Main.elm.swp"], modify_kind()));
    assert_eq!(debouncer.last_event.unwrap(), first_time);
    assert_eq!(debouncer.changes.len(), 1);
}

#[test]
fn test_is_temp_file() {
    assert!(is_temp_file(&PathBuf::from("/src/Main.elm~")));
    assert!(is_temp_file(&PathBuf::from("/src/.#Main.elm")));
    assert!(is_temp_file(&PathBuf::from("/src/#Main.elm#")));
    assert!(is_temp_file(&PathBuf::from("/src/4913")));
    assert!(!is_temp_file(&PathBuf::from("/src/Main.elm")));
    assert!(!is_temp_file(&PathBuf::from("/elm.json")));
}

#[test]
fn test_batch_sorted_and_window_respected() {
    let mut debouncer = Debouncer::new(INTERVAL);
    debouncer.add_event(&make_event(vec!["/src/B.elm", "/src/A.elm"], modify_kind()));

    // Window still open.
    assert!(debouncer.take_if_ready().is_none());

    debouncer.last_event = Some(Instant::now() - INTERVAL * 2);
    let batch = debouncer.take_if_ready().unwrap();
    let paths: Vec<_> = batch.paths().map(|p| p.to_path_buf()).collect();
    assert_eq!(
        paths,
        vec![PathBuf::from("/src/A.elm"), PathBuf::from("/src/B.elm")]
    );
    assert!(debouncer.changes.is_empty());
    assert!(debouncer.last_event.is_none());
}

#[test]
fn test_one_batch_per_interval() {
    let mut debouncer = Debouncer::new(INTERVAL);
    debouncer.add_event(&make_event(vec!["/src/A.elm"], modify_kind()));
    debouncer.last_event = Some(Instant::now() - INTERVAL * 2);
    debouncer.last_batch = Some(Instant::now());
    assert!(!debouncer.is_ready());

    debouncer.last_batch = Some(Instant::now() - INTERVAL * 2);
    assert!(debouncer.is_ready());
}

#[test]
fn test_sleep_duration_no_events() {
    let debouncer = Debouncer::new(INTERVAL);
    assert!(debouncer.sleep_duration() >= Duration::from_secs(3600));
}

#[test]
fn test_sleep_duration_after_event() {
    let mut debouncer = Debouncer::new(INTERVAL);
    debouncer.last_event = Some(Instant::now());

    let dur = debouncer.sleep_duration();
    assert!(dur >= Duration::from_millis(1));
    assert!(dur <= INTERVAL);
}

#[test]
fn test_watch_roots_dedup() {
    let roots = WatchRoots::new(vec![
        WatchRoot::recursive(PathBuf::from("/p/src")),
        WatchRoot::recursive(PathBuf::from("/p/src/Pages")),
        WatchRoot::shallow(PathBuf::from("/p")),
        WatchRoot::shallow(PathBuf::from("/p/src")),
    ]);
    assert_eq!(
        roots.desired(),
        &[
            WatchRoot::shallow(PathBuf::from("/p")),
            WatchRoot::recursive(PathBuf::from("/p/src")),
        ]
    );
}

#[tokio::test]
async fn test_watcher_emits_batch() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    std::fs::create_dir_all(&src).unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let watcher = FsWatcher::new(vec![WatchRoot::recursive(src.clone())], INTERVAL, tx).unwrap();
    let handle = tokio::spawn(watcher.run());

    let file = src.join("Main.elm");
    std::fs::write(&file, "module Main exposing (main)\n").unwrap();

    let batch = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("watcher timed out")
        .expect("channel closed");
    assert!(batch.paths().any(|p| p.file_name() == file.file_name()));

    drop(rx);
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}

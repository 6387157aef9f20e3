//! End-to-end watch tests: mutate the filesystem and wait for the
//! dispatcher to fold the change into the tree.

use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};
use ztree::{FileTreeSync, TreeConfig, TreeEvent, VcsMode};

fn config() -> TreeConfig {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    TreeConfig {
        vcs: VcsMode::Disabled,
        ..TreeConfig::default()
    }
}

fn wait_for<F: Fn() -> bool>(cond: F, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    panic!("timed out waiting for {what}");
}

fn has_name(sync: &FileTreeSync, name: &str) -> bool {
    sync.flatten_rows().iter().any(|r| r.name == name)
}

#[test]
fn created_file_appears_without_manual_update() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let sync = FileTreeSync::open_path(dir.path(), config()).expect("open");
    let events = sync.subscribe();

    fs::write(dir.path().join("fresh.txt"), "").expect("write");

    wait_for(|| has_name(&sync, "fresh.txt"), "created file to appear");
    let event = events
        .recv_timeout(Duration::from_secs(5))
        .expect("change event");
    assert!(matches!(event, TreeEvent::DirChanged { .. }));
}

#[test]
fn deleted_file_disappears() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = dir.path().join("doomed.txt");
    fs::write(&path, "").expect("write");

    let sync = FileTreeSync::open_path(dir.path(), config()).expect("open");
    assert!(has_name(&sync, "doomed.txt"));
    sync.open_buf(&path).expect("open buf");

    fs::remove_file(&path).expect("rm");
    wait_for(|| !has_name(&sync, "doomed.txt"), "deleted file to vanish");
    // the node took its buffer with it
    assert_eq!(sync.buffer_text(&path), None);
}

#[test]
fn changes_in_open_subdir_are_tracked() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let sub = dir.path().join("sub");
    fs::create_dir(&sub).expect("mkdir");

    let sync = FileTreeSync::open_path(dir.path(), config()).expect("open");
    sync.set_dir_open(&sub).expect("open dir");

    fs::write(sub.join("inner.txt"), "").expect("write");
    wait_for(|| has_name(&sync, "inner.txt"), "file in open subdir");
}

#[test]
fn closed_subdir_is_not_watched() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let sub = dir.path().join("sub");
    fs::create_dir(&sub).expect("mkdir");

    let sync = FileTreeSync::open_path(dir.path(), config()).expect("open");
    fs::write(sub.join("unseen.txt"), "").expect("write");
    std::thread::sleep(Duration::from_millis(500));

    // the closed directory's contents were never loaded
    assert!(!has_name(&sync, "unseen.txt"));

    // opening it loads the file created while closed
    sync.set_dir_open(&sub).expect("open dir");
    assert!(has_name(&sync, "unseen.txt"));
}

#[test]
fn burst_of_changes_settles() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let sync = FileTreeSync::open_path(dir.path(), config()).expect("open");

    for n in 0..3 {
        fs::write(dir.path().join(format!("burst{n}.txt")), "").expect("write");
    }
    // past the coalescing window, a fresh change triggers a full re-read
    std::thread::sleep(Duration::from_millis(300));
    fs::write(dir.path().join("last.txt"), "").expect("write");

    wait_for(
        || {
            has_name(&sync, "burst0.txt")
                && has_name(&sync, "burst1.txt")
                && has_name(&sync, "burst2.txt")
                && has_name(&sync, "last.txt")
        },
        "burst to settle",
    );
}

#[test]
fn rapid_changes_coalesce_into_one_pass() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let sync = FileTreeSync::open_path(dir.path(), config()).expect("open");
    let events = sync.subscribe();

    for n in 0..5 {
        fs::write(dir.path().join(format!("c{n}.txt")), "").expect("write");
    }

    // the first event triggers one re-read; the rest of the burst lands
    // inside the coalescing window and is skipped
    let first = events
        .recv_timeout(Duration::from_secs(5))
        .expect("first pass");
    assert!(matches!(first, TreeEvent::DirChanged { .. }));
    if let Ok(event) = events.recv_timeout(Duration::from_millis(80)) {
        panic!("second pass inside the window: {event:?}");
    }
}

#[test]
fn rename_moves_node() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let old = dir.path().join("old.txt");
    fs::write(&old, "").expect("write");

    let sync = FileTreeSync::open_path(dir.path(), config()).expect("open");
    assert!(has_name(&sync, "old.txt"));

    fs::rename(&old, dir.path().join("new.txt")).expect("rename");
    wait_for(
        || has_name(&sync, "new.txt") && !has_name(&sync, "old.txt"),
        "rename to land",
    );
    assert!(sync.find_file(Path::new("new.txt")).is_some());
}

//! Git status overlay scenarios against a real repository. Every test
//! bails out quietly when git is not installed.

use std::fs;
use std::path::Path;
use std::process::Command;
use ztree::{FileTreeSync, TreeConfig, VcsStatus};

fn git(root: &Path, args: &[&str]) -> bool {
    Command::new("git")
        .args(args)
        .current_dir(root)
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

/// Init a repo with identity configured so commits work.
fn init_repo(root: &Path) -> bool {
    git(root, &["init", "-q"])
        && git(root, &["config", "user.email", "tests@example.com"])
        && git(root, &["config", "user.name", "tests"])
}

#[test]
fn untracked_add_commit_lifecycle() {
    let dir = tempfile::tempdir().expect("create tempdir");
    if !init_repo(dir.path()) {
        return;
    }
    let file = dir.path().join("a.txt");
    fs::write(&file, "one\n").expect("write");

    let sync = FileTreeSync::open_path(dir.path(), TreeConfig::default()).expect("open");
    assert_eq!(sync.node_vcs_status(&file), Some(VcsStatus::Untracked));

    sync.add_to_vcs(&file).expect("add");
    assert_eq!(sync.node_vcs_status(&file), Some(VcsStatus::Added));

    sync.commit_to_vcs(&file, "add a.txt").expect("commit");
    assert_eq!(sync.node_vcs_status(&file), Some(VcsStatus::Stored));

    sync.update_all().expect("update");
    assert_eq!(sync.node_vcs_status(&file), Some(VcsStatus::Stored));
}

#[test]
fn disk_modification_shows_after_refresh() {
    let dir = tempfile::tempdir().expect("create tempdir");
    if !init_repo(dir.path()) {
        return;
    }
    let file = dir.path().join("a.txt");
    fs::write(&file, "one\n").expect("write");
    git(dir.path(), &["add", "a.txt"]);
    git(dir.path(), &["commit", "-q", "-m", "init"]);

    let sync = FileTreeSync::open_path(dir.path(), TreeConfig::default()).expect("open");
    assert_eq!(sync.node_vcs_status(&file), Some(VcsStatus::Stored));

    fs::write(&file, "one\ntwo\n").expect("rewrite");
    sync.update_all().expect("update");
    assert_eq!(sync.node_vcs_status(&file), Some(VcsStatus::Modified));

    sync.revert_vcs(&file).expect("revert");
    assert_eq!(sync.node_vcs_status(&file), Some(VcsStatus::Stored));
    assert_eq!(fs::read_to_string(&file).expect("read"), "one\n");
}

#[test]
fn first_edit_flips_status_optimistically() {
    let dir = tempfile::tempdir().expect("create tempdir");
    if !init_repo(dir.path()) {
        return;
    }
    let file = dir.path().join("a.txt");
    fs::write(&file, "one\n").expect("write");
    git(dir.path(), &["add", "a.txt"]);
    git(dir.path(), &["commit", "-q", "-m", "init"]);

    let sync = FileTreeSync::open_path(dir.path(), TreeConfig::default()).expect("open");
    sync.open_buf(&file).expect("open buf");

    // no backend query between these two assertions
    assert_eq!(sync.node_vcs_status(&file), Some(VcsStatus::Stored));
    sync.edit_buf_insert(&file, 4, "two\n").expect("edit");
    assert_eq!(sync.node_vcs_status(&file), Some(VcsStatus::Modified));

    // the flip survives a refresh while the buffer is dirty
    sync.update_all().expect("update");
    assert_eq!(sync.node_vcs_status(&file), Some(VcsStatus::Modified));

    sync.save_buf(&file).expect("save");
    sync.update_all().expect("update");
    assert_eq!(sync.node_vcs_status(&file), Some(VcsStatus::Modified));
}

#[test]
fn revert_leaves_added_files_added() {
    let dir = tempfile::tempdir().expect("create tempdir");
    if !init_repo(dir.path()) {
        return;
    }
    let file = dir.path().join("new.txt");
    fs::write(&file, "new\n").expect("write");

    let sync = FileTreeSync::open_path(dir.path(), TreeConfig::default()).expect("open");
    sync.add_to_vcs(&file).expect("add");

    sync.revert_vcs(&file).expect("revert");
    assert_eq!(sync.node_vcs_status(&file), Some(VcsStatus::Added));
    assert!(file.exists());
}

#[test]
fn delete_of_tracked_file_is_staged() {
    let dir = tempfile::tempdir().expect("create tempdir");
    if !init_repo(dir.path()) {
        return;
    }
    let file = dir.path().join("a.txt");
    fs::write(&file, "one\n").expect("write");
    git(dir.path(), &["add", "a.txt"]);
    git(dir.path(), &["commit", "-q", "-m", "init"]);

    let sync = FileTreeSync::open_path(dir.path(), TreeConfig::default()).expect("open");
    sync.delete_file(&file).expect("delete");

    assert!(!file.exists());
    assert!(sync.node_vcs_status(&file).is_none());

    // the removal went through the repository, so it is staged
    let out = Command::new("git")
        .args(["status", "--porcelain"])
        .current_dir(dir.path())
        .output()
        .expect("git status");
    let status = String::from_utf8_lossy(&out.stdout);
    assert!(status.contains("D  a.txt"), "unexpected status: {status}");
}

#[test]
fn rename_of_tracked_file_preserves_history() {
    let dir = tempfile::tempdir().expect("create tempdir");
    if !init_repo(dir.path()) {
        return;
    }
    let file = dir.path().join("a.txt");
    fs::write(&file, "one\n").expect("write");
    git(dir.path(), &["add", "a.txt"]);
    git(dir.path(), &["commit", "-q", "-m", "init"]);

    let sync = FileTreeSync::open_path(dir.path(), TreeConfig::default()).expect("open");
    let renamed = dir.path().join("b.txt");
    sync.rename_file(&file, &renamed).expect("rename");

    assert!(renamed.exists());
    assert!(!file.exists());

    let out = Command::new("git")
        .args(["status", "--porcelain"])
        .current_dir(dir.path())
        .output()
        .expect("git status");
    let status = String::from_utf8_lossy(&out.stdout);
    assert!(status.contains("R  a.txt -> b.txt"), "unexpected status: {status}");
}

#[test]
fn log_and_diff_passthrough() {
    let dir = tempfile::tempdir().expect("create tempdir");
    if !init_repo(dir.path()) {
        return;
    }
    let file = dir.path().join("a.txt");
    fs::write(&file, "one\n").expect("write");
    git(dir.path(), &["add", "a.txt"]);
    git(dir.path(), &["commit", "-q", "-m", "first change"]);

    let sync = FileTreeSync::open_path(dir.path(), TreeConfig::default()).expect("open");

    let log = sync.log_vcs(Some(&file), "").expect("log");
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].message, "first change");

    fs::write(&file, "one\ntwo\n").expect("rewrite");
    let diff = sync.diff_vcs(&file, "", "").expect("diff");
    assert!(diff.contains("+two"));
}

#[test]
fn vcs_disabled_never_annotates() {
    let dir = tempfile::tempdir().expect("create tempdir");
    if !init_repo(dir.path()) {
        return;
    }
    let file = dir.path().join("a.txt");
    fs::write(&file, "one\n").expect("write");

    let config = TreeConfig {
        vcs: ztree::VcsMode::Disabled,
        ..TreeConfig::default()
    };
    let sync = FileTreeSync::open_path(dir.path(), config).expect("open");
    assert_eq!(sync.node_vcs_status(&file), None);
}

//! Git adapter: shells out to the `git` CLI and parses porcelain output.

use super::{VcsError, VcsLogEntry, VcsRepo, VcsStatus};
use std::path::{Path, PathBuf};
use std::process::Command;

pub struct GitRepo {
    root: PathBuf,
}

impl GitRepo {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn run(&self, args: &[&str]) -> Result<Vec<u8>, VcsError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .output()?;
        if !output.status.success() {
            return Err(VcsError::CommandFailed {
                command: format!("git {}", args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(output.stdout)
    }

    fn rel<'a>(&self, path: &'a Path) -> &'a Path {
        path.strip_prefix(&self.root).unwrap_or(path)
    }
}

impl VcsRepo for GitRepo {
    fn root(&self) -> &Path {
        &self.root
    }

    fn kind(&self) -> &'static str {
        "git"
    }

    fn status_batch(&self) -> Result<Vec<(PathBuf, VcsStatus)>, VcsError> {
        let out = self.run(&["status", "--porcelain", "-z", "--untracked-files=all"])?;
        Ok(parse_status_porcelain_z(&out, &self.root))
    }

    fn add(&self, path: &Path) -> Result<(), VcsError> {
        self.run(&["add", "--", &self.rel(path).to_string_lossy()])?;
        Ok(())
    }

    fn remove(&self, path: &Path) -> Result<(), VcsError> {
        self.run(&["rm", "-r", "--", &self.rel(path).to_string_lossy()])?;
        Ok(())
    }

    fn commit(&self, path: &Path, message: &str) -> Result<(), VcsError> {
        self.run(&[
            "commit",
            "-m",
            message,
            "--",
            &self.rel(path).to_string_lossy(),
        ])?;
        Ok(())
    }

    fn revert(&self, path: &Path) -> Result<(), VcsError> {
        self.run(&["checkout", "--", &self.rel(path).to_string_lossy()])?;
        Ok(())
    }

    fn move_file(&self, src: &Path, dst: &Path) -> Result<(), VcsError> {
        self.run(&[
            "mv",
            &self.rel(src).to_string_lossy(),
            &self.rel(dst).to_string_lossy(),
        ])?;
        Ok(())
    }

    fn log(&self, path: Option<&Path>, since: &str) -> Result<Vec<VcsLogEntry>, VcsError> {
        let mut args: Vec<String> = vec![
            "log".into(),
            format!("--pretty=format:{LOG_FORMAT}"),
            "-z".into(),
        ];
        if !since.is_empty() {
            args.push(format!("--since={since}"));
        }
        if let Some(path) = path {
            args.push("--".into());
            args.push(self.rel(path).to_string_lossy().into_owned());
        }
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = self.run(&args)?;
        Ok(parse_log(&out))
    }

    fn diff(&self, path: &Path, rev_a: &str, rev_b: &str) -> Result<String, VcsError> {
        let rel = self.rel(path).to_string_lossy().into_owned();
        let mut args: Vec<&str> = vec!["diff"];
        let rev_a = if rev_a.is_empty() { "HEAD" } else { rev_a };
        args.push(rev_a);
        if !rev_b.is_empty() {
            args.push(rev_b);
        }
        args.push("--");
        args.push(&rel);
        let out = self.run(&args)?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    fn blame(&self, path: &Path) -> Result<String, VcsError> {
        let out = self.run(&["blame", "--", &self.rel(path).to_string_lossy()])?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}

// Record separator within one commit; commits themselves are NUL-separated.
const LOG_FORMAT: &str = "%H%x1f%an%x1f%ad%x1f%s";

/// Parse `git status --porcelain -z` output into absolute-path statuses.
/// Files not listed are Stored; ignored (`!!`) entries are skipped.
pub fn parse_status_porcelain_z(data: &[u8], repo_root: &Path) -> Vec<(PathBuf, VcsStatus)> {
    let mut out = Vec::new();
    let mut tokens = data.split(|b| *b == 0).filter(|t| !t.is_empty());
    while let Some(token) = tokens.next() {
        if token.len() < 4 || token[2] != b' ' {
            continue;
        }

        let x = token[0] as char;
        let y = token[1] as char;
        if x == '!' && y == '!' {
            continue;
        }

        let mut path = PathBuf::from(String::from_utf8_lossy(&token[3..]).into_owned());

        // R/C entries are followed by the original path in a separate token;
        // the first path is the current name.
        if x == 'R' || x == 'C' {
            let _orig = tokens.next();
        }
        if let Some(status) = status_from_xy(x, y) {
            path = repo_root.join(path);
            out.push((path, status));
        }
    }
    out
}

fn status_from_xy(x: char, y: char) -> Option<VcsStatus> {
    if x == 'U' || y == 'U' || (x == 'A' && y == 'A') || (x == 'D' && y == 'D') {
        return Some(VcsStatus::Conflicted);
    }
    if x == '?' && y == '?' {
        return Some(VcsStatus::Untracked);
    }
    if x == 'A' {
        return Some(VcsStatus::Added);
    }
    if x == 'D' || y == 'D' {
        return Some(VcsStatus::Deleted);
    }
    if x == 'M' || y == 'M' || x == 'R' || x == 'C' {
        return Some(VcsStatus::Modified);
    }
    None
}

fn parse_log(data: &[u8]) -> Vec<VcsLogEntry> {
    let text = String::from_utf8_lossy(data);
    text.split('\0')
        .filter(|rec| !rec.is_empty())
        .filter_map(|rec| {
            let mut fields = rec.splitn(4, '\u{1f}');
            Some(VcsLogEntry {
                rev: fields.next()?.trim_start_matches('\n').to_string(),
                author: fields.next()?.to_string(),
                date: fields.next()?.to_string(),
                message: fields.next().unwrap_or_default().to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn porcelain_modified_and_untracked() {
        let root = Path::new("/repo");
        let data = b" M src/a.rs\0?? notes.txt\0";
        let statuses = parse_status_porcelain_z(data, root);
        assert_eq!(
            statuses,
            vec![
                (PathBuf::from("/repo/src/a.rs"), VcsStatus::Modified),
                (PathBuf::from("/repo/notes.txt"), VcsStatus::Untracked),
            ]
        );
    }

    #[test]
    fn porcelain_added_deleted_conflicted() {
        let root = Path::new("/repo");
        let data = b"A  new.rs\0D  old.rs\0UU both.rs\0";
        let statuses = parse_status_porcelain_z(data, root);
        assert_eq!(statuses[0].1, VcsStatus::Added);
        assert_eq!(statuses[1].1, VcsStatus::Deleted);
        assert_eq!(statuses[2].1, VcsStatus::Conflicted);
    }

    #[test]
    fn porcelain_rename_uses_new_path_and_skips_orig_token() {
        let root = Path::new("/repo");
        let data = b"R  new_name.rs\0old_name.rs\0 M after.rs\0";
        let statuses = parse_status_porcelain_z(data, root);
        assert_eq!(
            statuses,
            vec![
                (PathBuf::from("/repo/new_name.rs"), VcsStatus::Modified),
                (PathBuf::from("/repo/after.rs"), VcsStatus::Modified),
            ]
        );
    }

    #[test]
    fn porcelain_skips_ignored_and_garbage() {
        let root = Path::new("/repo");
        let data = b"!! target\0xx\0";
        assert!(parse_status_porcelain_z(data, root).is_empty());
    }

    #[test]
    fn log_parsing_splits_records_and_fields() {
        let data =
            b"abc123\x1fAlice\x1fMon Jan 1\x1ffix: thing\0\ndef456\x1fBob\x1fTue Jan 2\x1ffeat: other\0";
        let log = parse_log(data);
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].rev, "abc123");
        assert_eq!(log[0].author, "Alice");
        assert_eq!(log[1].rev, "def456");
        assert_eq!(log[1].message, "feat: other");
    }
}

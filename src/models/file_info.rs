//! File metadata probe: everything the tree needs to know about one entry.

use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

/// Coarse content category, derived from the file extension.
/// Stands in for full MIME sniffing; directories are always `Folder`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FileCat {
    Folder,
    Code,
    Text,
    Doc,
    Data,
    Image,
    Audio,
    Video,
    Archive,
    Binary,
}

impl FileCat {
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "rs" | "go" | "py" | "c" | "h" | "cpp" | "hpp" | "cc" | "java" | "js" | "jsx"
            | "ts" | "tsx" | "sh" | "bash" | "zsh" | "rb" | "lua" | "zig" | "swift" | "kt" => {
                Self::Code
            }
            "txt" | "log" | "cfg" | "conf" | "ini" | "env" => Self::Text,
            "md" | "rst" | "org" | "tex" | "adoc" | "html" | "htm" => Self::Doc,
            "json" | "yaml" | "yml" | "toml" | "xml" | "csv" | "tsv" | "sql" | "lock" => {
                Self::Data
            }
            "png" | "jpg" | "jpeg" | "gif" | "bmp" | "svg" | "webp" | "ico" | "tiff" => {
                Self::Image
            }
            "mp3" | "wav" | "flac" | "ogg" | "m4a" => Self::Audio,
            "mp4" | "mkv" | "webm" | "avi" | "mov" => Self::Video,
            "zip" | "tar" | "gz" | "zst" | "xz" | "bz2" | "7z" | "rar" => Self::Archive,
            _ => Self::Binary,
        }
    }

    /// Icon hint for GUI consumers; this crate assigns names only.
    pub fn icon(self) -> &'static str {
        match self {
            Self::Folder => "folder",
            Self::Code => "file-code",
            Self::Text => "file-text",
            Self::Doc => "file-doc",
            Self::Data => "file-data",
            Self::Image => "file-image",
            Self::Audio => "file-audio",
            Self::Video => "file-video",
            Self::Archive => "file-archive",
            Self::Binary => "file",
        }
    }
}

/// Stat snapshot for one filesystem entry, symlinks resolved.
#[derive(Clone, Debug)]
pub struct FileInfo {
    /// Resolved absolute path at probe time.
    pub path: PathBuf,
    pub name: OsString,
    pub kind: EntryKind,
    pub cat: FileCat,
    pub size: u64,
    pub modified: Option<SystemTime>,
    pub readonly: bool,
    pub exec: bool,
}

impl FileInfo {
    /// Stat `path` and build the snapshot. Symlinks are resolved first so
    /// the node identity is the real file; a dangling link is an error.
    pub fn probe(path: &Path) -> io::Result<Self> {
        let meta = fs::symlink_metadata(path)?;
        let (path, meta) = if meta.is_symlink() {
            let resolved = fs::canonicalize(path)?;
            let meta = fs::metadata(&resolved)?;
            (resolved, meta)
        } else {
            (path.to_path_buf(), meta)
        };

        let name = path
            .file_name()
            .or_else(|| path.iter().next_back())
            .unwrap_or(path.as_os_str())
            .to_os_string();

        let kind = if meta.is_dir() {
            EntryKind::Dir
        } else {
            EntryKind::File
        };
        let cat = match kind {
            EntryKind::Dir => FileCat::Folder,
            EntryKind::File => path
                .extension()
                .and_then(|e| e.to_str())
                .map(FileCat::from_extension)
                .unwrap_or(FileCat::Binary),
        };

        Ok(Self {
            name,
            kind,
            cat,
            size: meta.len(),
            modified: meta.modified().ok(),
            readonly: meta.permissions().readonly(),
            exec: is_exec(&meta),
            path,
        })
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Dir
    }

    pub fn is_hidden(&self) -> bool {
        self.name.to_string_lossy().starts_with('.')
    }

    /// Editor auto-save artifacts (`#name#`) are excluded by the default policy.
    pub fn is_auto_save(&self) -> bool {
        let name = self.name.to_string_lossy();
        name.len() > 1 && name.starts_with('#') && name.ends_with('#')
    }

    pub fn icon(&self) -> &'static str {
        self.cat.icon()
    }
}

impl fmt::Display for FileInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({:?}, {} bytes)",
            self.path.display(),
            self.cat,
            self.size
        )
    }
}

#[cfg(unix)]
fn is_exec(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.is_file() && meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_exec(_meta: &fs::Metadata) -> bool {
    false
}

/// Pick a non-colliding `name_copy[N].ext` for duplicating `path` into its
/// own directory.
pub fn duplicate_path(path: &Path) -> io::Result<PathBuf> {
    let dir = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path.extension().map(|e| e.to_string_lossy().into_owned());

    for n in 0..1000u32 {
        let mut cand = if n == 0 {
            format!("{stem}_copy")
        } else {
            format!("{stem}_copy{n}")
        };
        if let Some(ext) = &ext {
            cand.push('.');
            cand.push_str(ext);
        }
        let cand = dir.join(cand);
        if !cand.exists() {
            return Ok(cand);
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        "no free duplicate name",
    ))
}

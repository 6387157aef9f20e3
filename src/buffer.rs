//! Rope-backed edit buffer, exclusively owned by the tree node for its file.

use ropey::Rope;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// One open file. Created on demand by `open_buf`, destroyed by `close_buf`
/// or together with its owning node.
#[derive(Clone, Debug)]
pub struct EditBuffer {
    path: PathBuf,
    rope: Rope,
    dirty: bool,
}

impl EditBuffer {
    pub fn open(path: &Path) -> io::Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            rope: Rope::from_str(&text),
            dirty: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Called when the owning node is renamed; the content is untouched.
    pub(crate) fn set_path(&mut self, path: PathBuf) {
        self.path = path;
    }

    pub fn rope(&self) -> &Rope {
        &self.rope
    }

    pub fn text(&self) -> String {
        self.rope.to_string()
    }

    pub fn len_chars(&self) -> usize {
        self.rope.len_chars()
    }

    /// True once the buffer has been edited since open/save/revert.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Insert `text` at char offset. Returns true if this edit made a clean
    /// buffer dirty, which is the trigger for the optimistic VCS flip.
    pub fn insert(&mut self, char_idx: usize, text: &str) -> bool {
        let idx = char_idx.min(self.rope.len_chars());
        self.rope.insert(idx, text);
        let first = !self.dirty;
        self.dirty = true;
        first
    }

    /// Remove the char range `start..end`. Returns true on a clean→dirty
    /// transition, as for [`EditBuffer::insert`].
    pub fn remove(&mut self, start: usize, end: usize) -> bool {
        let len = self.rope.len_chars();
        let start = start.min(len);
        let end = end.clamp(start, len);
        self.rope.remove(start..end);
        let first = !self.dirty;
        self.dirty = true;
        first
    }

    pub fn save(&mut self) -> io::Result<()> {
        fs::write(&self.path, self.rope.to_string())?;
        self.dirty = false;
        Ok(())
    }

    /// Re-read the file from disk, discarding unsaved edits.
    pub fn revert(&mut self) -> io::Result<()> {
        let text = fs::read_to_string(&self.path)?;
        self.rope = Rope::from_str(&text);
        self.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("create tempdir");
        let path = dir.path().join("b.txt");
        fs::write(&path, content).expect("write file");
        (dir, path)
    }

    #[test]
    fn open_reads_content() {
        let (_dir, path) = fixture("hello\n");
        let buf = EditBuffer::open(&path).expect("open");
        assert_eq!(buf.text(), "hello\n");
        assert!(!buf.is_dirty());
    }

    #[test]
    fn first_edit_reports_dirty_transition() {
        let (_dir, path) = fixture("hello");
        let mut buf = EditBuffer::open(&path).expect("open");
        assert!(buf.insert(5, " world"));
        assert!(!buf.insert(0, ">"));
        assert_eq!(buf.text(), ">hello world");
    }

    #[test]
    fn save_clears_dirty_and_writes() {
        let (_dir, path) = fixture("a");
        let mut buf = EditBuffer::open(&path).expect("open");
        buf.insert(1, "b");
        buf.save().expect("save");
        assert!(!buf.is_dirty());
        assert_eq!(fs::read_to_string(&path).expect("read"), "ab");
    }

    #[test]
    fn revert_discards_edits() {
        let (_dir, path) = fixture("orig");
        let mut buf = EditBuffer::open(&path).expect("open");
        buf.remove(0, 4);
        buf.revert().expect("revert");
        assert_eq!(buf.text(), "orig");
        assert!(!buf.is_dirty());
    }

    #[test]
    fn remove_clamps_out_of_range() {
        let (_dir, path) = fixture("ab");
        let mut buf = EditBuffer::open(&path).expect("open");
        buf.remove(1, 99);
        assert_eq!(buf.text(), "a");
    }
}

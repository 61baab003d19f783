//! Directory iteration cursors.
//!
//! Each open directory FD gets at most one cursor. The cursor snapshots
//! the directory's entries (sorted, with synthetic "." and ".." first, as
//! wasi-libc expects), and exposes them through a sliding window of
//! [`DIRENT_BUF_SIZE`] entries with monotonically increasing cookies.
//! Seeking is limited to cookie zero or a position inside the current
//! window; older cookies fail with `Inval` and forward seeks beyond the
//! window with `Notsup`.

use super::errno::{Errno, SysResult};
use std::fs;
use std::path::Path;

/// Window size, in entries.
pub const DIRENT_BUF_SIZE: usize = 16;

/// WASI file types (the subset dirents report).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileType {
    Unknown = 0,
    Directory = 3,
    RegularFile = 4,
    SymbolicLink = 7,
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub file_type: FileType,
}

/// A cursor over one directory's entries.
pub struct ReaddirCursor {
    entries: Vec<DirEntry>,
    /// Index of the first entry of the current window.
    window_start: u64,
    /// Next entry to hand out.
    pos: u64,
}

impl ReaddirCursor {
    /// Snapshot a directory. Entries are sorted by name; "." and ".."
    /// are prepended.
    pub fn open(path: &Path) -> SysResult<ReaddirCursor> {
        let mut names: Vec<DirEntry> = Vec::new();
        let iter = fs::read_dir(path).map_err(Errno::from)?;
        for entry in iter {
            let entry = entry.map_err(Errno::from)?;
            let file_type = entry
                .file_type()
                .map(|t| {
                    if t.is_dir() {
                        FileType::Directory
                    } else if t.is_symlink() {
                        FileType::SymbolicLink
                    } else {
                        FileType::RegularFile
                    }
                })
                .unwrap_or(FileType::Unknown);
            names.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                file_type,
            });
        }
        names.sort_by(|a, b| a.name.cmp(&b.name));

        let mut entries = vec![
            DirEntry {
                name: ".".to_string(),
                file_type: FileType::Directory,
            },
            DirEntry {
                name: "..".to_string(),
                file_type: FileType::Directory,
            },
        ];
        entries.extend(names);
        Ok(ReaddirCursor {
            entries,
            window_start: 0,
            pos: 0,
        })
    }

    /// Reposition to a previously returned cookie (or zero for a full
    /// rewind).
    pub fn seek(&mut self, cookie: u64) -> SysResult<()> {
        if cookie == 0 {
            self.window_start = 0;
            self.pos = 0;
            return Ok(());
        }
        if cookie < self.window_start {
            return Err(Errno::Inval);
        }
        if cookie > self.window_start + DIRENT_BUF_SIZE as u64 || cookie > self.entries.len() as u64
        {
            return Err(Errno::Notsup);
        }
        self.pos = cookie;
        Ok(())
    }

    /// The next entry with its cookie (the position to resume after it),
    /// or None at the end.
    pub fn next(&mut self) -> Option<(u64, &DirEntry)> {
        if self.pos as usize >= self.entries.len() {
            return None;
        }
        let idx = self.pos as usize;
        self.pos += 1;
        // Slide the window forward once a full buffer has been consumed.
        if self.pos >= self.window_start + DIRENT_BUF_SIZE as u64 {
            self.window_start = self.pos - 1;
        }
        Some((self.pos, &self.entries[idx]))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    fn cursor_over(names: &[&str]) -> ReaddirCursor {
        let dir = tempfile::tempdir().unwrap();
        for n in names {
            File::create(dir.path().join(n)).unwrap();
        }
        ReaddirCursor::open(dir.path()).unwrap()
    }

    #[test]
    fn test_synthetic_entries_come_first() {
        let mut c = cursor_over(&["b", "a"]);
        let names: Vec<String> = std::iter::from_fn(|| c.next().map(|(_, e)| e.name.clone()))
            .collect();
        assert_eq!(names, vec![".", "..", "a", "b"]);
    }

    #[test]
    fn test_cookies_strictly_increase() {
        let mut c = cursor_over(&["x", "y", "z"]);
        let mut last = 0;
        while let Some((cookie, _)) = c.next() {
            assert!(cookie > last);
            last = cookie;
        }
        assert_eq!(last, 5);
    }

    #[test]
    fn test_rewind_to_zero() {
        let mut c = cursor_over(&["x"]);
        while c.next().is_some() {}
        c.seek(0).unwrap();
        let (_, e) = c.next().unwrap();
        assert_eq!(e.name, ".");
    }

    #[test]
    fn test_rewind_within_window() {
        let mut c = cursor_over(&["a", "b", "c"]);
        let (first_cookie, _) = c.next().map(|(k, e)| (k, e.name.clone())).unwrap();
        c.next().unwrap();
        c.seek(first_cookie).unwrap();
        let (_, e) = c.next().unwrap();
        assert_eq!(e.name, "..");
    }

    #[test]
    fn test_old_cookie_rejected_after_window_slides() {
        let names: Vec<String> = (0..40).map(|i| format!("f{i:02}")).collect();
        let refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
        let mut c = cursor_over(&refs);
        // Consume well past the first window.
        for _ in 0..(DIRENT_BUF_SIZE * 2) {
            c.next().unwrap();
        }
        assert_eq!(c.seek(1), Err(Errno::Inval));
    }

    #[test]
    fn test_forward_seek_beyond_window_rejected() {
        let names: Vec<String> = (0..40).map(|i| format!("f{i:02}")).collect();
        let refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
        let mut c = cursor_over(&refs);
        assert_eq!(c.seek(30), Err(Errno::Notsup));
    }
}

//! The file-descriptor table and its operations.
//!
//! FDs 0/1/2 are stdio, 3.. are the pre-opens in the order supplied, and
//! new opens take the lowest free slot from 3 upward. Entries own their
//! handles; closing an entry drops the handle exactly once.

use super::errno::{Errno, SysResult};
use super::file::{filestat_of, FileEntry, Filestat, FDFLAG_NONBLOCK, OFLAG_DIRECTORY};
use super::nbreader::NbReader;
use super::readdir::{FileType, ReaddirCursor};
use super::sock::ListenerEntry;
use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::path::{Component, Path, PathBuf};

/// An open directory (always reachable from a pre-open).
pub struct DirHandle {
    /// Guest-visible path (what fd_prestat_dir_name reports).
    pub guest_path: String,
    pub host_path: PathBuf,
    pub preopen: bool,
    /// Iteration state; created on first readdir.
    pub cursor: Option<ReaddirCursor>,
}

/// A connected TCP stream.
pub struct StreamEntry {
    pub stream: TcpStream,
    pub nonblock: bool,
}

/// One slot of the FD table.
pub enum FdEntry {
    /// Stdin, with the background reader spawned on first non-blocking
    /// use.
    Stdin { reader: Option<NbReader>, nonblock: bool },
    Stdout,
    Stderr,
    Dir(DirHandle),
    File(FileEntry),
    Listener(ListenerEntry),
    Stream(StreamEntry),
}

impl FdEntry {
    pub fn file_type(&self) -> FileType {
        match self {
            FdEntry::Dir(_) => FileType::Directory,
            FdEntry::File(_) => FileType::RegularFile,
            _ => FileType::Unknown,
        }
    }
}

/// The per-instance filesystem context.
pub struct FsContext {
    entries: Vec<Option<FdEntry>>,
}

impl FsContext {
    /// Build the table: stdio at 0..2, then directory pre-opens, then
    /// listener pre-opens, in the order supplied.
    pub fn new(
        preopen_dirs: Vec<(String, PathBuf)>,
        preopen_listeners: Vec<TcpListener>,
    ) -> FsContext {
        let mut entries: Vec<Option<FdEntry>> = vec![
            Some(FdEntry::Stdin {
                reader: None,
                nonblock: false,
            }),
            Some(FdEntry::Stdout),
            Some(FdEntry::Stderr),
        ];
        for (guest_path, host_path) in preopen_dirs {
            entries.push(Some(FdEntry::Dir(DirHandle {
                guest_path,
                host_path,
                preopen: true,
                cursor: None,
            })));
        }
        for listener in preopen_listeners {
            entries.push(Some(FdEntry::Listener(ListenerEntry::new(listener))));
        }
        FsContext { entries }
    }

    pub fn get(&self, fd: u32) -> SysResult<&FdEntry> {
        self.entries
            .get(fd as usize)
            .and_then(|e| e.as_ref())
            .ok_or(Errno::Badf)
    }

    pub fn get_mut(&mut self, fd: u32) -> SysResult<&mut FdEntry> {
        self.entries
            .get_mut(fd as usize)
            .and_then(|e| e.as_mut())
            .ok_or(Errno::Badf)
    }

    /// Insert at the lowest free FD >= 3.
    pub fn insert(&mut self, entry: FdEntry) -> u32 {
        for (i, slot) in self.entries.iter_mut().enumerate().skip(3) {
            if slot.is_none() {
                *slot = Some(entry);
                return i as u32;
            }
        }
        self.entries.push(Some(entry));
        (self.entries.len() - 1) as u32
    }

    /// Close an FD; the underlying handle drops here, exactly once.
    pub fn close(&mut self, fd: u32) -> SysResult<()> {
        let slot = self
            .entries
            .get_mut(fd as usize)
            .ok_or(Errno::Badf)?;
        if slot.is_none() {
            return Err(Errno::Badf);
        }
        *slot = None;
        Ok(())
    }

    /// Move an entry from one FD number to another (closing the target).
    pub fn renumber(&mut self, from: u32, to: u32) -> SysResult<()> {
        if self.entries.get(from as usize).and_then(|e| e.as_ref()).is_none() {
            return Err(Errno::Badf);
        }
        if to as usize >= self.entries.len() {
            self.entries.resize_with(to as usize + 1, || None);
        }
        let entry = self.entries[from as usize].take();
        self.entries[to as usize] = entry;
        Ok(())
    }

    /// Resolve a guest path relative to a directory FD. Absolute paths
    /// and traversal above the pre-open are rejected.
    fn resolve(&self, dirfd: u32, path: &str) -> SysResult<PathBuf> {
        let FdEntry::Dir(dir) = self.get(dirfd)? else {
            return Err(Errno::Notdir);
        };
        if path.starts_with('/') {
            return Err(Errno::Perm);
        }
        let mut depth = 0i32;
        for comp in Path::new(path).components() {
            match comp {
                Component::Normal(_) => depth += 1,
                Component::ParentDir => {
                    depth -= 1;
                    if depth < 0 {
                        return Err(Errno::Perm);
                    }
                }
                Component::CurDir => {}
                _ => return Err(Errno::Inval),
            }
        }
        Ok(dir.host_path.join(path))
    }

    /// Open a file (or directory) under a directory FD. Returns the new
    /// FD number.
    pub fn open(
        &mut self,
        dirfd: u32,
        path: &str,
        oflags: u16,
        fdflags: u16,
        writable: bool,
    ) -> SysResult<u32> {
        let host_path = self.resolve(dirfd, path)?;
        if host_path.is_dir() || oflags & OFLAG_DIRECTORY != 0 {
            if writable {
                return Err(Errno::Isdir);
            }
            if !host_path.is_dir() {
                return if host_path.exists() {
                    Err(Errno::Notdir)
                } else {
                    Err(Errno::Noent)
                };
            }
            let guest_path = path.to_string();
            return Ok(self.insert(FdEntry::Dir(DirHandle {
                guest_path,
                host_path,
                preopen: false,
                cursor: None,
            })));
        }
        let entry = FileEntry::open(&host_path, oflags, fdflags, writable)?;
        Ok(self.insert(FdEntry::File(entry)))
    }

    pub fn read(&mut self, fd: u32, buf: &mut [u8]) -> SysResult<usize> {
        match self.get_mut(fd)? {
            FdEntry::Stdin { reader, nonblock } => {
                let nb = *nonblock;
                let r = reader.get_or_insert_with(|| NbReader::spawn(std::io::stdin()));
                if nb {
                    r.read_nonblocking(buf)
                } else {
                    r.read_blocking(buf)
                }
            }
            FdEntry::Stdout | FdEntry::Stderr => Err(Errno::Badf),
            FdEntry::File(f) => f.read(buf),
            FdEntry::Stream(s) => {
                use std::io::Read;
                s.stream
                    .set_nonblocking(s.nonblock)
                    .map_err(Errno::from)?;
                s.stream.read(buf).map_err(Errno::from)
            }
            _ => Err(Errno::Badf),
        }
    }

    pub fn pread(&mut self, fd: u32, buf: &mut [u8], offset: u64) -> SysResult<usize> {
        match self.get_mut(fd)? {
            FdEntry::File(f) => f.pread(buf, offset),
            FdEntry::Dir(_) => Err(Errno::Isdir),
            _ => Err(Errno::Spipe),
        }
    }

    pub fn write(&mut self, fd: u32, buf: &[u8]) -> SysResult<usize> {
        match self.get_mut(fd)? {
            FdEntry::Stdout => {
                let mut out = std::io::stdout().lock();
                out.write(buf).map_err(Errno::from)
            }
            FdEntry::Stderr => {
                let mut err = std::io::stderr().lock();
                err.write(buf).map_err(Errno::from)
            }
            FdEntry::File(f) => f.write(buf),
            FdEntry::Stream(s) => {
                s.stream
                    .set_nonblocking(s.nonblock)
                    .map_err(Errno::from)?;
                s.stream.write(buf).map_err(Errno::from)
            }
            _ => Err(Errno::Badf),
        }
    }

    pub fn pwrite(&mut self, fd: u32, buf: &[u8], offset: u64) -> SysResult<usize> {
        match self.get_mut(fd)? {
            FdEntry::File(f) => f.pwrite(buf, offset),
            FdEntry::Dir(_) => Err(Errno::Isdir),
            _ => Err(Errno::Spipe),
        }
    }

    pub fn seek(&mut self, fd: u32, offset: i64, whence: u8) -> SysResult<u64> {
        match self.get_mut(fd)? {
            FdEntry::File(f) => f.seek(offset, whence),
            _ => Err(Errno::Spipe),
        }
    }

    pub fn sync(&mut self, fd: u32) -> SysResult<()> {
        match self.get_mut(fd)? {
            FdEntry::File(f) => f.sync(),
            FdEntry::Dir(_) => Ok(()),
            _ => Err(Errno::Inval),
        }
    }

    pub fn filestat(&mut self, fd: u32) -> SysResult<Filestat> {
        match self.get_mut(fd)? {
            FdEntry::File(f) => f.filestat(),
            FdEntry::Dir(d) => filestat_of(&d.host_path),
            _ => Ok(Filestat {
                file_type: FileType::Unknown,
                size: 0,
                atim_ns: 0,
                mtim_ns: 0,
            }),
        }
    }

    pub fn path_filestat(&self, dirfd: u32, path: &str) -> SysResult<Filestat> {
        let host = self.resolve(dirfd, path)?;
        filestat_of(&host)
    }

    pub fn path_set_times(
        &self,
        dirfd: u32,
        path: &str,
        atim_ns: u64,
        mtim_ns: u64,
    ) -> SysResult<()> {
        let host = self.resolve(dirfd, path)?;
        super::file::set_times(&host, atim_ns, mtim_ns)
    }

    pub fn set_nonblock(&mut self, fd: u32, nonblock: bool) -> SysResult<()> {
        match self.get_mut(fd)? {
            FdEntry::Stdin { nonblock: nb, .. } => {
                *nb = nonblock;
                Ok(())
            }
            FdEntry::File(f) => {
                f.nonblock = nonblock;
                Ok(())
            }
            FdEntry::Listener(l) => l.set_nonblocking(nonblock),
            FdEntry::Stream(s) => {
                s.nonblock = nonblock;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub fn fd_flags(&self, fd: u32) -> SysResult<u16> {
        let flags = match self.get(fd)? {
            FdEntry::Stdin { nonblock, .. } => {
                if *nonblock {
                    FDFLAG_NONBLOCK
                } else {
                    0
                }
            }
            FdEntry::File(f) => {
                let mut flags = 0;
                if f.append {
                    flags |= super::file::FDFLAG_APPEND;
                }
                if f.nonblock {
                    flags |= FDFLAG_NONBLOCK;
                }
                flags
            }
            FdEntry::Listener(l) => {
                if l.nonblocking() {
                    FDFLAG_NONBLOCK
                } else {
                    0
                }
            }
            FdEntry::Stream(s) => {
                if s.nonblock {
                    FDFLAG_NONBLOCK
                } else {
                    0
                }
            }
            _ => 0,
        };
        Ok(flags)
    }

    /// Step the directory cursor of `fd`, creating it (or reseeking)
    /// first. Returns up to `max` entries as (cookie, entry) pairs.
    pub fn readdir(
        &mut self,
        fd: u32,
        cookie: u64,
        max: usize,
    ) -> SysResult<Vec<(u64, super::readdir::DirEntry)>> {
        let FdEntry::Dir(dir) = self.get_mut(fd)? else {
            return Err(Errno::Notdir);
        };
        if dir.cursor.is_none() || cookie == 0 {
            dir.cursor = Some(ReaddirCursor::open(&dir.host_path)?);
        }
        let cursor = dir.cursor.as_mut().unwrap();
        cursor.seek(cookie)?;
        let mut out = Vec::new();
        while out.len() < max {
            match cursor.next() {
                Some((cookie, entry)) => out.push((cookie, entry.clone())),
                None => break,
            }
        }
        Ok(out)
    }

    /// Accept on a pre-opened listener; the connection takes the lowest
    /// free FD.
    pub fn accept(&mut self, fd: u32) -> SysResult<u32> {
        let FdEntry::Listener(listener) = self.get_mut(fd)? else {
            return Err(Errno::Badf);
        };
        let stream = listener.accept()?;
        Ok(self.insert(FdEntry::Stream(StreamEntry {
            stream,
            nonblock: false,
        })))
    }

    /// Pre-opened directory info for fd_prestat_get.
    pub fn prestat_dir(&self, fd: u32) -> SysResult<&str> {
        match self.get(fd)? {
            FdEntry::Dir(d) if d.preopen => Ok(&d.guest_path),
            _ => Err(Errno::Badf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_fs() -> FsContext {
        FsContext::new(Vec::new(), Vec::new())
    }

    fn fs_with_dir() -> (FsContext, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let fs = FsContext::new(
            vec![("/".to_string(), dir.path().to_path_buf())],
            Vec::new(),
        );
        (fs, dir)
    }

    #[test]
    fn test_stdio_layout() {
        let fs = empty_fs();
        assert!(matches!(fs.get(0), Ok(FdEntry::Stdin { .. })));
        assert!(matches!(fs.get(1), Ok(FdEntry::Stdout)));
        assert!(matches!(fs.get(2), Ok(FdEntry::Stderr)));
        assert_eq!(fs.get(3).err(), Some(Errno::Badf));
    }

    #[test]
    fn test_preopen_is_fd3() {
        let (fs, _dir) = fs_with_dir();
        assert_eq!(fs.prestat_dir(3), Ok("/"));
    }

    #[test]
    fn test_open_uses_lowest_free_fd() {
        let (mut fs, dir) = fs_with_dir();
        std::fs::write(dir.path().join("a"), b"A").unwrap();
        std::fs::write(dir.path().join("b"), b"B").unwrap();

        let fd_a = fs.open(3, "a", 0, 0, false).unwrap();
        let fd_b = fs.open(3, "b", 0, 0, false).unwrap();
        assert_eq!(fd_a, 4);
        assert_eq!(fd_b, 5);

        // Closing frees the slot for reuse.
        fs.close(fd_a).unwrap();
        let fd_c = fs.open(3, "b", 0, 0, false).unwrap();
        assert_eq!(fd_c, 4);
    }

    #[test]
    fn test_close_twice_is_badf() {
        let (mut fs, dir) = fs_with_dir();
        std::fs::write(dir.path().join("a"), b"A").unwrap();
        let fd = fs.open(3, "a", 0, 0, false).unwrap();
        fs.close(fd).unwrap();
        assert_eq!(fs.close(fd).err(), Some(Errno::Badf));
    }

    #[test]
    fn test_renumber_moves_entry() {
        let (mut fs, dir) = fs_with_dir();
        std::fs::write(dir.path().join("a"), b"hi").unwrap();
        let fd = fs.open(3, "a", 0, 0, false).unwrap();
        fs.renumber(fd, 9).unwrap();
        assert_eq!(fs.get(fd).err(), Some(Errno::Badf));
        let mut buf = [0u8; 2];
        assert_eq!(fs.read(9, &mut buf), Ok(2));
    }

    #[test]
    fn test_absolute_and_escaping_paths_rejected() {
        let (mut fs, _dir) = fs_with_dir();
        assert_eq!(fs.open(3, "/etc/passwd", 0, 0, false).err(), Some(Errno::Perm));
        assert_eq!(fs.open(3, "../x", 0, 0, false).err(), Some(Errno::Perm));
    }

    #[test]
    fn test_readdir_via_table() {
        let (mut fs, dir) = fs_with_dir();
        std::fs::write(dir.path().join("z"), b"").unwrap();
        let entries = fs.readdir(3, 0, 16).unwrap();
        let names: Vec<&str> = entries.iter().map(|(_, e)| e.name.as_str()).collect();
        assert_eq!(names, vec![".", "..", "z"]);
    }

    #[test]
    fn test_nonblock_toggle_roundtrip() {
        let (mut fs, dir) = fs_with_dir();
        std::fs::write(dir.path().join("a"), b"data").unwrap();
        let fd = fs.open(3, "a", 0, 0, false).unwrap();
        fs.set_nonblock(fd, true).unwrap();
        fs.set_nonblock(fd, false).unwrap();
        // Regular files read identically either way.
        let mut buf = [0u8; 4];
        assert_eq!(fs.read(fd, &mut buf), Ok(4));
        assert_eq!(&buf, b"data");
    }
}

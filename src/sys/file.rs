//! Regular-file entries and metadata.

use super::errno::{Errno, SysResult};
use super::readdir::FileType;
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// WASI open flags.
pub const OFLAG_CREAT: u16 = 1;
pub const OFLAG_DIRECTORY: u16 = 2;
pub const OFLAG_EXCL: u16 = 4;
pub const OFLAG_TRUNC: u16 = 8;

/// WASI fd flags.
pub const FDFLAG_APPEND: u16 = 1;
pub const FDFLAG_NONBLOCK: u16 = 4;

/// Minimal file metadata surfaced through the WASI boundary.
#[derive(Debug, Clone, Copy)]
pub struct Filestat {
    pub file_type: FileType,
    pub size: u64,
    pub atim_ns: u64,
    pub mtim_ns: u64,
}

fn time_ns(t: std::io::Result<SystemTime>) -> u64 {
    t.ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

pub fn filestat_of(path: &Path) -> SysResult<Filestat> {
    let meta = std::fs::metadata(path).map_err(Errno::from)?;
    Ok(Filestat {
        file_type: if meta.is_dir() {
            FileType::Directory
        } else if meta.file_type().is_symlink() {
            FileType::SymbolicLink
        } else {
            FileType::RegularFile
        },
        size: meta.len(),
        atim_ns: time_ns(meta.accessed()),
        mtim_ns: time_ns(meta.modified()),
    })
}

/// Set a path's access/modification times (nanosecond inputs, rounded to
/// what the filesystem offers).
pub fn set_times(path: &Path, atim_ns: u64, mtim_ns: u64) -> SysResult<()> {
    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| Errno::Inval)?;
    let tv = |ns: u64| libc::timeval {
        tv_sec: (ns / 1_000_000_000) as libc::time_t,
        tv_usec: ((ns % 1_000_000_000) / 1000) as libc::suseconds_t,
    };
    let times = [tv(atim_ns), tv(mtim_ns)];
    let rc = unsafe { libc::utimes(c_path.as_ptr(), times.as_ptr()) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

/// An open regular file.
#[derive(Debug)]
pub struct FileEntry {
    pub file: File,
    pub path: PathBuf,
    pub append: bool,
    pub nonblock: bool,
}

impl FileEntry {
    /// Open with WASI oflags/fdflags semantics. Opening a directory for
    /// writing is `Isdir`.
    pub fn open(path: &Path, oflags: u16, fdflags: u16, writable: bool) -> SysResult<FileEntry> {
        let is_dir_target = path.is_dir();
        if oflags & OFLAG_DIRECTORY != 0 && writable {
            return Err(Errno::Isdir);
        }
        if is_dir_target && writable {
            return Err(Errno::Isdir);
        }
        if oflags & OFLAG_DIRECTORY != 0 && !is_dir_target && path.exists() {
            return Err(Errno::Notdir);
        }

        let mut options = OpenOptions::new();
        options.read(true);
        if writable {
            options.write(true);
        }
        if oflags & OFLAG_CREAT != 0 {
            if !writable {
                return Err(Errno::Inval);
            }
            options.create(true);
        }
        if oflags & OFLAG_EXCL != 0 {
            options.create_new(true);
        }
        if oflags & OFLAG_TRUNC != 0 {
            options.truncate(true);
        }
        if fdflags & FDFLAG_APPEND != 0 {
            options.append(true);
        }
        let file = options.open(path).map_err(Errno::from)?;
        Ok(FileEntry {
            file,
            path: path.to_path_buf(),
            append: fdflags & FDFLAG_APPEND != 0,
            nonblock: fdflags & FDFLAG_NONBLOCK != 0,
        })
    }

    pub fn read(&mut self, buf: &mut [u8]) -> SysResult<usize> {
        self.file.read(buf).map_err(Errno::from)
    }

    pub fn pread(&mut self, buf: &mut [u8], offset: u64) -> SysResult<usize> {
        let saved = self.file.stream_position().map_err(Errno::from)?;
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(Errno::from)?;
        let result = self.file.read(buf).map_err(Errno::from);
        self.file.seek(SeekFrom::Start(saved)).map_err(Errno::from)?;
        result
    }

    pub fn write(&mut self, buf: &[u8]) -> SysResult<usize> {
        self.file.write(buf).map_err(Errno::from)
    }

    pub fn pwrite(&mut self, buf: &[u8], offset: u64) -> SysResult<usize> {
        let saved = self.file.stream_position().map_err(Errno::from)?;
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(Errno::from)?;
        let result = self.file.write(buf).map_err(Errno::from);
        self.file.seek(SeekFrom::Start(saved)).map_err(Errno::from)?;
        result
    }

    /// Seek with WASI whence numbering: 0 = set, 1 = cur, 2 = end.
    pub fn seek(&mut self, offset: i64, whence: u8) -> SysResult<u64> {
        let from = match whence {
            0 => SeekFrom::Start(offset as u64),
            1 => SeekFrom::Current(offset),
            2 => SeekFrom::End(offset),
            _ => return Err(Errno::Inval),
        };
        self.file.seek(from).map_err(Errno::from)
    }

    pub fn tell(&mut self) -> SysResult<u64> {
        self.file.stream_position().map_err(Errno::from)
    }

    pub fn sync(&mut self) -> SysResult<()> {
        self.file.sync_all().map_err(Errno::from)
    }

    pub fn filestat(&self) -> SysResult<Filestat> {
        let meta = self.file.metadata().map_err(Errno::from)?;
        Ok(Filestat {
            file_type: FileType::RegularFile,
            size: meta.len(),
            atim_ns: time_ns(meta.accessed()),
            mtim_ns: time_ns(meta.modified()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_directory_for_writing_is_isdir() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileEntry::open(dir.path(), OFLAG_DIRECTORY, 0, true).unwrap_err();
        assert_eq!(err, Errno::Isdir);
    }

    #[test]
    fn test_read_write_seek() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        let mut f = FileEntry::open(&path, OFLAG_CREAT, 0, true).unwrap();
        assert_eq!(f.write(b"hello world"), Ok(11));
        assert_eq!(f.seek(6, 0), Ok(6));
        let mut buf = [0u8; 5];
        assert_eq!(f.read(&mut buf), Ok(5));
        assert_eq!(&buf, b"world");
    }

    #[test]
    fn test_pread_preserves_position() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        let mut f = FileEntry::open(&path, OFLAG_CREAT, 0, true).unwrap();
        f.write(b"abcdef").unwrap();
        f.seek(2, 0).unwrap();
        let mut buf = [0u8; 2];
        assert_eq!(f.pread(&mut buf, 4), Ok(2));
        assert_eq!(&buf, b"ef");
        assert_eq!(f.tell(), Ok(2));
    }

    #[test]
    fn test_utimes_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"x").unwrap();
        // One-second granularity survives every filesystem.
        let target_ns = 1_600_000_000u64 * 1_000_000_000;
        set_times(&path, target_ns, target_ns).unwrap();
        let stat = filestat_of(&path).unwrap();
        assert_eq!(stat.mtim_ns / 1_000_000_000, 1_600_000_000);
    }
}

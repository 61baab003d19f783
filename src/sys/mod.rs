//! The system-call abstraction layer: file-descriptor table, pre-opens,
//! directory cursors, sockets, non-blocking reads, and one-shot polling.
//! Everything crosses this boundary as errno-or-value.

mod errno;
mod fdtable;
mod file;
mod nbreader;
mod poll;
mod readdir;
mod sock;

pub use errno::{Errno, SysResult};
pub use fdtable::{DirHandle, FdEntry, FsContext, StreamEntry};
pub use file::{
    Filestat, FDFLAG_APPEND, FDFLAG_NONBLOCK, OFLAG_CREAT, OFLAG_DIRECTORY, OFLAG_EXCL,
    OFLAG_TRUNC,
};
pub use nbreader::NbReader;
pub use poll::{poll_oneshot, PollEvent, Subscription};
pub use readdir::{DirEntry, FileType, ReaddirCursor, DIRENT_BUF_SIZE};
pub use sock::ListenerEntry;

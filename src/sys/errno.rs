//! WASI errno numbering and translation from host I/O errors.

use std::io;

/// WASI errno values (the subset this host surfaces).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Errno {
    Success = 0,
    Again = 6,
    Badf = 8,
    Exist = 20,
    Fault = 21,
    Inval = 28,
    Io = 29,
    Isdir = 31,
    Nfile = 41,
    Noent = 44,
    Nosys = 52,
    Notdir = 54,
    Notsup = 58,
    Perm = 63,
    Pipe = 64,
    Spipe = 70,
}

impl Errno {
    pub fn raw(self) -> u16 {
        self as u16
    }
}

impl From<io::Error> for Errno {
    fn from(e: io::Error) -> Errno {
        use io::ErrorKind::*;
        match e.kind() {
            NotFound => Errno::Noent,
            PermissionDenied => Errno::Perm,
            AlreadyExists => Errno::Exist,
            WouldBlock => Errno::Again,
            InvalidInput => Errno::Inval,
            BrokenPipe => Errno::Pipe,
            _ => Errno::Io,
        }
    }
}

/// The sys layer's result type: errno-or-value, mirroring the syscall
/// boundary it models.
pub type SysResult<T> = Result<T, Errno>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_translation() {
        assert_eq!(
            Errno::from(io::Error::from(io::ErrorKind::NotFound)),
            Errno::Noent
        );
        assert_eq!(
            Errno::from(io::Error::from(io::ErrorKind::WouldBlock)),
            Errno::Again
        );
        assert_eq!(Errno::Success.raw(), 0);
    }
}

//! TCP listener pre-opens.

use super::errno::{Errno, SysResult};
use std::io;
use std::net::{TcpListener, TcpStream};

/// A pre-opened TCP listener file.
pub struct ListenerEntry {
    listener: TcpListener,
    nonblocking: bool,
}

impl ListenerEntry {
    pub fn new(listener: TcpListener) -> ListenerEntry {
        ListenerEntry {
            listener,
            nonblocking: false,
        }
    }

    pub fn set_nonblocking(&mut self, nb: bool) -> SysResult<()> {
        self.nonblocking = nb;
        Ok(())
    }

    pub fn nonblocking(&self) -> bool {
        self.nonblocking
    }

    /// Accept a pending connection. Non-blocking listeners check a
    /// zero-timeout readiness probe first and report `Again` when nothing
    /// is queued.
    pub fn accept(&self) -> SysResult<TcpStream> {
        if self.nonblocking && !self.ready() {
            return Err(Errno::Again);
        }
        match self.listener.accept() {
            Ok((stream, _)) => Ok(stream),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(Errno::Again),
            Err(e) => Err(e.into()),
        }
    }

    /// Zero-timeout readiness probe: whether an accept would succeed
    /// immediately.
    pub fn ready(&self) -> bool {
        use std::os::fd::AsRawFd;
        let mut pfd = libc::pollfd {
            fd: self.listener.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        unsafe { libc::poll(&mut pfd, 1, 0) > 0 && pfd.revents & libc::POLLIN != 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream as ClientStream;

    #[test]
    fn test_nonblocking_accept_reports_again() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut entry = ListenerEntry::new(listener);
        entry.set_nonblocking(true).unwrap();
        assert_eq!(entry.accept().err(), Some(Errno::Again));
    }

    #[test]
    fn test_accept_pending_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut entry = ListenerEntry::new(listener);
        entry.set_nonblocking(true).unwrap();

        let _client = ClientStream::connect(addr).unwrap();
        // Connection is queued; retry a few times for the handshake.
        let mut accepted = false;
        for _ in 0..100 {
            match entry.accept() {
                Ok(_) => {
                    accepted = true;
                    break;
                }
                Err(Errno::Again) => std::thread::sleep(std::time::Duration::from_millis(1)),
                Err(e) => panic!("unexpected errno {e:?}"),
            }
        }
        assert!(accepted);
    }
}

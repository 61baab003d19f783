//! Non-blocking reads over handles without native O_NONBLOCK.
//!
//! Console and pipe stdin handles cannot be made non-blocking everywhere,
//! so the blocking read runs on a background thread that feeds a channel.
//! Probing receives with a short timeout; an empty channel reports
//! `Again`. The thread parks on the blocking read and exits when the
//! owning FD drops the channel.

use super::errno::{Errno, SysResult};
use std::io::Read;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;
use std::time::Duration;

/// Probe timeout: long enough to win the race with an already-ready
/// reader, short enough to feel non-blocking.
const PROBE_TIMEOUT: Duration = Duration::from_millis(1);

/// A background reader wrapping a blocking byte source.
pub struct NbReader {
    rx: Receiver<Vec<u8>>,
    /// Bytes received but not yet consumed.
    pending: Vec<u8>,
    eof: bool,
}

impl NbReader {
    pub fn spawn<R: Read + Send + 'static>(mut source: R) -> NbReader {
        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        thread::Builder::new()
            .name("nbreader".to_string())
            .spawn(move || {
                let mut buf = [0u8; 4096];
                loop {
                    match source.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            if tx.send(buf[..n].to_vec()).is_err() {
                                // The owning FD is gone.
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
            })
            .expect("spawning the reader thread");
        NbReader {
            rx,
            pending: Vec::new(),
            eof: false,
        }
    }

    fn pump(&mut self, wait: bool) {
        if self.eof {
            return;
        }
        if self.pending.is_empty() {
            let first = if wait {
                self.rx.recv_timeout(PROBE_TIMEOUT).ok()
            } else {
                self.rx.try_recv().ok()
            };
            match first {
                Some(chunk) => self.pending = chunk,
                None => {
                    if matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected)) {
                        self.eof = true;
                    }
                    return;
                }
            }
        }
        // Drain whatever else is already queued.
        while let Ok(chunk) = self.rx.try_recv() {
            self.pending.extend_from_slice(&chunk);
        }
    }

    /// Non-blocking read: `Again` when no data is ready yet, 0 at EOF.
    pub fn read_nonblocking(&mut self, buf: &mut [u8]) -> SysResult<usize> {
        self.pump(true);
        if self.pending.is_empty() {
            if self.eof {
                return Ok(0);
            }
            return Err(Errno::Again);
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }

    /// Blocking read: waits for the background thread to deliver.
    pub fn read_blocking(&mut self, buf: &mut [u8]) -> SysResult<usize> {
        loop {
            self.pump(true);
            if !self.pending.is_empty() || self.eof {
                break;
            }
            match self.rx.recv() {
                Ok(chunk) => self.pending = chunk,
                Err(_) => self.eof = true,
            }
        }
        if self.pending.is_empty() {
            return Ok(0);
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }

    /// Whether a read would succeed immediately.
    pub fn ready(&mut self) -> bool {
        self.pump(false);
        !self.pending.is_empty() || self.eof
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A reader that blocks forever after an initial payload.
    struct OnceThenBlock {
        payload: Option<Vec<u8>>,
    }

    impl Read for OnceThenBlock {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.payload.take() {
                Some(data) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok(data.len())
                }
                None => {
                    // Simulate a pipe with no more data.
                    std::thread::sleep(Duration::from_secs(3600));
                    Ok(0)
                }
            }
        }
    }

    #[test]
    fn test_reads_initial_payload() {
        let mut r = NbReader::spawn(OnceThenBlock {
            payload: Some(b"hello".to_vec()),
        });
        let mut buf = [0u8; 16];
        // The background thread needs a beat to deliver.
        let mut got = 0;
        for _ in 0..100 {
            match r.read_nonblocking(&mut buf) {
                Ok(n) => {
                    got = n;
                    break;
                }
                Err(Errno::Again) => continue,
                Err(e) => panic!("unexpected errno {e:?}"),
            }
        }
        assert_eq!(&buf[..got], b"hello");
        // Nothing further: try-again.
        assert_eq!(r.read_nonblocking(&mut buf), Err(Errno::Again));
    }

    #[test]
    fn test_eof() {
        let mut r = NbReader::spawn(std::io::Cursor::new(b"x".to_vec()));
        let mut buf = [0u8; 4];
        assert_eq!(r.read_blocking(&mut buf), Ok(1));
        assert_eq!(r.read_blocking(&mut buf), Ok(0));
    }
}

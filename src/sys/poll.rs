//! One-shot poll over clock and FD-readiness subscriptions.
//!
//! Relative clock timers run as waiter threads signaling a shared
//! channel; FD readiness is probed with zero-timeout checks between
//! channel waits. The first signal wins. Absolute-time clocks are not
//! supported; regular files are always ready.

use super::errno::{Errno, SysResult};
use super::fdtable::{FdEntry, FsContext};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

/// What one subscription waits for.
#[derive(Debug, Clone, Copy)]
pub enum Subscription {
    /// A clock timer. `absolute` timers are refused with `Notsup`; a
    /// None timeout waits indefinitely (until another subscription or
    /// cancellation fires).
    Clock {
        userdata: u64,
        timeout_ns: Option<u64>,
        absolute: bool,
    },
    FdRead { userdata: u64, fd: u32 },
    FdWrite { userdata: u64, fd: u32 },
}

/// One delivered event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollEvent {
    pub userdata: u64,
    pub errno: Errno,
    /// 0 = clock, 1 = fd_read, 2 = fd_write (WASI eventtype numbering).
    pub event_type: u8,
}

fn fd_read_ready(fs: &mut FsContext, fd: u32) -> SysResult<bool> {
    match fs.get_mut(fd)? {
        // Regular files report ready immediately.
        FdEntry::File(_) | FdEntry::Dir(_) => Ok(true),
        FdEntry::Stdin { reader, .. } => {
            let r = reader.get_or_insert_with(|| super::nbreader::NbReader::spawn(std::io::stdin()));
            Ok(r.ready())
        }
        FdEntry::Listener(l) => Ok(l.ready()),
        FdEntry::Stream(s) => {
            use std::os::fd::AsRawFd;
            let mut pfd = libc::pollfd {
                fd: s.stream.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            Ok(unsafe { libc::poll(&mut pfd, 1, 0) > 0 })
        }
        _ => Ok(true),
    }
}

fn fd_write_ready(fs: &mut FsContext, fd: u32) -> SysResult<bool> {
    match fs.get_mut(fd)? {
        FdEntry::Stdout | FdEntry::Stderr | FdEntry::File(_) => Ok(true),
        FdEntry::Stream(s) => {
            use std::os::fd::AsRawFd;
            let mut pfd = libc::pollfd {
                fd: s.stream.as_raw_fd(),
                events: libc::POLLOUT,
                revents: 0,
            };
            Ok(unsafe { libc::poll(&mut pfd, 1, 0) > 0 })
        }
        _ => Ok(true),
    }
}

/// Wait for the first ready subscription and report every subscription
/// that is ready at that moment.
pub fn poll_oneshot(fs: &mut FsContext, subs: &[Subscription]) -> SysResult<Vec<PollEvent>> {
    if subs.is_empty() {
        return Err(Errno::Inval);
    }

    // Absolute clocks fail their subscription immediately.
    let mut events = Vec::new();
    for sub in subs {
        if let Subscription::Clock {
            userdata,
            absolute: true,
            ..
        } = sub
        {
            events.push(PollEvent {
                userdata: *userdata,
                errno: Errno::Notsup,
                event_type: 0,
            });
        }
    }
    if !events.is_empty() {
        return Ok(events);
    }

    // Spawn a waiter per clock subscription; the first tick wins.
    let (tx, rx) = mpsc::channel::<u64>();
    let mut indefinite_only = true;
    for sub in subs {
        if let Subscription::Clock {
            userdata,
            timeout_ns: Some(ns),
            absolute: false,
        } = sub
        {
            indefinite_only = false;
            let tx = tx.clone();
            let userdata = *userdata;
            let wait = Duration::from_nanos(*ns);
            thread::Builder::new()
                .name("poll-timer".to_string())
                .spawn(move || {
                    thread::sleep(wait);
                    let _ = tx.send(userdata);
                })
                .map_err(|_| Errno::Nfile)?;
        }
    }
    drop(tx);

    let probe_gap = Duration::from_millis(1);
    let start = Instant::now();
    loop {
        // FD readiness first: a zero timeout means probe once.
        let mut ready = Vec::new();
        for sub in subs {
            match sub {
                Subscription::FdRead { userdata, fd } => match fd_read_ready(fs, *fd) {
                    Ok(true) => ready.push(PollEvent {
                        userdata: *userdata,
                        errno: Errno::Success,
                        event_type: 1,
                    }),
                    Ok(false) => {}
                    Err(errno) => ready.push(PollEvent {
                        userdata: *userdata,
                        errno,
                        event_type: 1,
                    }),
                },
                Subscription::FdWrite { userdata, fd } => match fd_write_ready(fs, *fd) {
                    Ok(true) => ready.push(PollEvent {
                        userdata: *userdata,
                        errno: Errno::Success,
                        event_type: 2,
                    }),
                    Ok(false) => {}
                    Err(errno) => ready.push(PollEvent {
                        userdata: *userdata,
                        errno,
                        event_type: 2,
                    }),
                },
                Subscription::Clock {
                    userdata,
                    timeout_ns: Some(0),
                    ..
                } => ready.push(PollEvent {
                    userdata: *userdata,
                    errno: Errno::Success,
                    event_type: 0,
                }),
                Subscription::Clock { .. } => {}
            }
        }
        if !ready.is_empty() {
            return Ok(ready);
        }

        match rx.recv_timeout(probe_gap) {
            Ok(userdata) => {
                return Ok(vec![PollEvent {
                    userdata,
                    errno: Errno::Success,
                    event_type: 0,
                }]);
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                if indefinite_only {
                    // Nothing will ever signal; avoid spinning forever in
                    // a process with no cancellation source.
                    thread::sleep(probe_gap);
                }
            }
        }
        // Bound pure-clock waits defensively far beyond any test horizon.
        if start.elapsed() > Duration::from_secs(3600) {
            return Err(Errno::Again);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_fs() -> FsContext {
        FsContext::new(Vec::new(), Vec::new())
    }

    #[test]
    fn test_zero_timeout_probes_once() {
        let mut fs = empty_fs();
        let events = poll_oneshot(
            &mut fs,
            &[Subscription::Clock {
                userdata: 7,
                timeout_ns: Some(0),
                absolute: false,
            }],
        )
        .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].userdata, 7);
        assert_eq!(events[0].errno, Errno::Success);
    }

    #[test]
    fn test_absolute_clock_not_supported() {
        let mut fs = empty_fs();
        let events = poll_oneshot(
            &mut fs,
            &[Subscription::Clock {
                userdata: 1,
                timeout_ns: Some(1),
                absolute: true,
            }],
        )
        .unwrap();
        assert_eq!(events[0].errno, Errno::Notsup);
    }

    #[test]
    fn test_timer_fires() {
        let mut fs = empty_fs();
        let start = Instant::now();
        let events = poll_oneshot(
            &mut fs,
            &[Subscription::Clock {
                userdata: 42,
                timeout_ns: Some(5_000_000),
                absolute: false,
            }],
        )
        .unwrap();
        assert_eq!(events[0].userdata, 42);
        assert!(start.elapsed() >= Duration::from_millis(4));
    }

    #[test]
    fn test_regular_file_read_always_ready() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"x").unwrap();
        let mut fs = FsContext::new(
            vec![("/".to_string(), dir.path().to_path_buf())],
            Vec::new(),
        );
        let fd = fs.open(3, "f", 0, 0, false).unwrap();
        let events = poll_oneshot(
            &mut fs,
            &[Subscription::FdRead {
                userdata: 9,
                fd,
            }],
        )
        .unwrap();
        assert_eq!(events[0].userdata, 9);
        assert_eq!(events[0].event_type, 1);
    }
}

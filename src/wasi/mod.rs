//! WASI-style host module (`wasi_snapshot_preview1`).
//!
//! Each function reads its arguments from guest value-stack slots, does
//! its work through the sys layer, writes results into linear memory,
//! and returns a WASI errno. Guest memory accesses are bounds-checked
//! here; a bad pointer is `Fault`, never a host crash.

use crate::module::PAGE_SIZE;
use crate::runtime::context::{VmContext, EXIT_SET_BIT};
use crate::runtime::instance::{HostFn, HostOutcome, InstanceState};
use crate::sys::{poll_oneshot, Errno, Subscription, DIRENT_BUF_SIZE};
use std::io::Read;
use std::sync::atomic::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

/// Resolve one import to a host function.
pub fn resolve(module: &str, name: &str) -> Option<HostFn> {
    if module != "wasi_snapshot_preview1" && module != "wasi_unstable" {
        return None;
    }
    Some(match name {
        "args_get" => args_get,
        "args_sizes_get" => args_sizes_get,
        "environ_get" => environ_get,
        "environ_sizes_get" => environ_sizes_get,
        "clock_time_get" => clock_time_get,
        "random_get" => random_get,
        "proc_exit" => proc_exit,
        "fd_close" => fd_close,
        "fd_read" => fd_read,
        "fd_pread" => fd_pread,
        "fd_write" => fd_write,
        "fd_pwrite" => fd_pwrite,
        "fd_seek" => fd_seek,
        "fd_sync" => fd_sync,
        "fd_fdstat_get" => fd_fdstat_get,
        "fd_fdstat_set_flags" => fd_fdstat_set_flags,
        "fd_filestat_get" => fd_filestat_get,
        "fd_readdir" => fd_readdir,
        "fd_renumber" => fd_renumber,
        "fd_prestat_get" => fd_prestat_get,
        "fd_prestat_dir_name" => fd_prestat_dir_name,
        "path_open" => path_open,
        "path_filestat_get" => path_filestat_get,
        "path_filestat_set_times" => path_filestat_set_times,
        "poll_oneoff" => poll_oneoff,
        "sock_accept" => sock_accept,
        "sched_yield" => sched_yield,
        _ => return None,
    })
}

// ==================== guest memory access ====================

fn mem<'a>(ctx: &mut VmContext) -> &'a mut [u8] {
    if ctx.memory_base.is_null() {
        return &mut [];
    }
    let len = ctx.memory_pages as usize * PAGE_SIZE as usize;
    unsafe { std::slice::from_raw_parts_mut(ctx.memory_base, len) }
}

fn checked_range(mem: &[u8], ptr: u32, len: u32) -> Result<std::ops::Range<usize>, Errno> {
    let start = ptr as usize;
    let end = start.checked_add(len as usize).ok_or(Errno::Fault)?;
    if end > mem.len() {
        return Err(Errno::Fault);
    }
    Ok(start..end)
}

fn write_u32(mem: &mut [u8], ptr: u32, v: u32) -> Result<(), Errno> {
    let r = checked_range(mem, ptr, 4)?;
    mem[r].copy_from_slice(&v.to_le_bytes());
    Ok(())
}

fn write_u64(mem: &mut [u8], ptr: u32, v: u64) -> Result<(), Errno> {
    let r = checked_range(mem, ptr, 8)?;
    mem[r].copy_from_slice(&v.to_le_bytes());
    Ok(())
}

fn read_u32(mem: &[u8], ptr: u32) -> Result<u32, Errno> {
    let r = checked_range(mem, ptr, 4)?;
    Ok(u32::from_le_bytes(mem[r].try_into().unwrap()))
}

fn read_u64(mem: &[u8], ptr: u32) -> Result<u64, Errno> {
    let r = checked_range(mem, ptr, 8)?;
    Ok(u64::from_le_bytes(mem[r].try_into().unwrap()))
}

fn read_str(mem: &[u8], ptr: u32, len: u32) -> Result<String, Errno> {
    let r = checked_range(mem, ptr, len)?;
    String::from_utf8(mem[r].to_vec()).map_err(|_| Errno::Inval)
}

/// The iovec walk shared by the read/write families.
fn iter_iovs(mem: &[u8], iovs: u32, count: u32) -> Result<Vec<(u32, u32)>, Errno> {
    let mut out = Vec::with_capacity(count as usize);
    for i in 0..count {
        let base = iovs + i * 8;
        out.push((read_u32(mem, base)?, read_u32(mem, base + 4)?));
    }
    Ok(out)
}

fn errno_result(results: &mut [u64], errno: Errno) -> HostOutcome {
    if let Some(slot) = results.first_mut() {
        *slot = errno.raw() as u64;
    }
    HostOutcome::Ok
}

macro_rules! host_try {
    ($results:expr, $expr:expr) => {
        match $expr {
            Ok(v) => v,
            Err(errno) => return errno_result($results, errno),
        }
    };
}

// ==================== environment ====================

fn args_get(
    ctx: &mut VmContext,
    st: &mut InstanceState,
    args: &[u64],
    results: &mut [u64],
) -> HostOutcome {
    let (argv, argv_buf) = (args[0] as u32, args[1] as u32);
    let mem = mem(ctx);
    let mut ptr = argv_buf;
    for (i, arg) in st.args.iter().enumerate() {
        host_try!(results, write_u32(mem, argv + i as u32 * 4, ptr));
        let bytes = arg.as_bytes();
        let r = host_try!(results, checked_range(mem, ptr, bytes.len() as u32 + 1));
        mem[r.start..r.end - 1].copy_from_slice(bytes);
        mem[r.end - 1] = 0;
        ptr += bytes.len() as u32 + 1;
    }
    errno_result(results, Errno::Success)
}

fn args_sizes_get(
    ctx: &mut VmContext,
    st: &mut InstanceState,
    args: &[u64],
    results: &mut [u64],
) -> HostOutcome {
    let mem = mem(ctx);
    let count = st.args.len() as u32;
    let size: u32 = st.args.iter().map(|a| a.len() as u32 + 1).sum();
    host_try!(results, write_u32(mem, args[0] as u32, count));
    host_try!(results, write_u32(mem, args[1] as u32, size));
    errno_result(results, Errno::Success)
}

fn environ_get(
    ctx: &mut VmContext,
    st: &mut InstanceState,
    args: &[u64],
    results: &mut [u64],
) -> HostOutcome {
    let (envp, env_buf) = (args[0] as u32, args[1] as u32);
    let mem = mem(ctx);
    let mut ptr = env_buf;
    for (i, (k, v)) in st.envs.iter().enumerate() {
        host_try!(results, write_u32(mem, envp + i as u32 * 4, ptr));
        let entry = format!("{k}={v}");
        let bytes = entry.as_bytes();
        let r = host_try!(results, checked_range(mem, ptr, bytes.len() as u32 + 1));
        mem[r.start..r.end - 1].copy_from_slice(bytes);
        mem[r.end - 1] = 0;
        ptr += bytes.len() as u32 + 1;
    }
    errno_result(results, Errno::Success)
}

fn environ_sizes_get(
    ctx: &mut VmContext,
    st: &mut InstanceState,
    args: &[u64],
    results: &mut [u64],
) -> HostOutcome {
    let mem = mem(ctx);
    let count = st.envs.len() as u32;
    let size: u32 = st
        .envs
        .iter()
        .map(|(k, v)| k.len() as u32 + v.len() as u32 + 2)
        .sum();
    host_try!(results, write_u32(mem, args[0] as u32, count));
    host_try!(results, write_u32(mem, args[1] as u32, size));
    errno_result(results, Errno::Success)
}

fn clock_time_get(
    ctx: &mut VmContext,
    _st: &mut InstanceState,
    args: &[u64],
    results: &mut [u64],
) -> HostOutcome {
    let mem = mem(ctx);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    host_try!(results, write_u64(mem, args[2] as u32, now));
    errno_result(results, Errno::Success)
}

fn random_get(
    ctx: &mut VmContext,
    _st: &mut InstanceState,
    args: &[u64],
    results: &mut [u64],
) -> HostOutcome {
    let (ptr, len) = (args[0] as u32, args[1] as u32);
    let mem = mem(ctx);
    let r = host_try!(results, checked_range(mem, ptr, len));
    let filled = std::fs::File::open("/dev/urandom")
        .and_then(|mut f| f.read_exact(&mut mem[r]))
        .is_ok();
    errno_result(
        results,
        if filled { Errno::Success } else { Errno::Io },
    )
}

fn proc_exit(
    ctx: &mut VmContext,
    _st: &mut InstanceState,
    args: &[u64],
    _results: &mut [u64],
) -> HostOutcome {
    let code = args[0] as u32;
    // The context carries a pointer to the engine's exit cell.
    unsafe {
        (*ctx.exit_code).store(EXIT_SET_BIT | code as u64, Ordering::Release);
    }
    HostOutcome::Exit
}

fn sched_yield(
    _ctx: &mut VmContext,
    _st: &mut InstanceState,
    _args: &[u64],
    results: &mut [u64],
) -> HostOutcome {
    std::thread::yield_now();
    errno_result(results, Errno::Success)
}

// ==================== file descriptors ====================

fn fd_close(
    _ctx: &mut VmContext,
    st: &mut InstanceState,
    args: &[u64],
    results: &mut [u64],
) -> HostOutcome {
    host_try!(results, st.fs.close(args[0] as u32));
    errno_result(results, Errno::Success)
}

fn fd_read(
    ctx: &mut VmContext,
    st: &mut InstanceState,
    args: &[u64],
    results: &mut [u64],
) -> HostOutcome {
    let (fd, iovs, count, out) = (
        args[0] as u32,
        args[1] as u32,
        args[2] as u32,
        args[3] as u32,
    );
    let mem = mem(ctx);
    let iovs = host_try!(results, iter_iovs(mem, iovs, count));
    let mut total = 0u32;
    for (ptr, len) in iovs {
        let r = host_try!(results, checked_range(mem, ptr, len));
        let n = host_try!(results, st.fs.read(fd, &mut mem[r]));
        total += n as u32;
        if (n as u32) < len {
            break;
        }
    }
    host_try!(results, write_u32(mem, out, total));
    errno_result(results, Errno::Success)
}

fn fd_pread(
    ctx: &mut VmContext,
    st: &mut InstanceState,
    args: &[u64],
    results: &mut [u64],
) -> HostOutcome {
    let (fd, iovs, count, offset, out) = (
        args[0] as u32,
        args[1] as u32,
        args[2] as u32,
        args[3],
        args[4] as u32,
    );
    let mem = mem(ctx);
    let iovs = host_try!(results, iter_iovs(mem, iovs, count));
    let mut total = 0u32;
    let mut at = offset;
    for (ptr, len) in iovs {
        let r = host_try!(results, checked_range(mem, ptr, len));
        let n = host_try!(results, st.fs.pread(fd, &mut mem[r], at));
        total += n as u32;
        at += n as u64;
        if (n as u32) < len {
            break;
        }
    }
    host_try!(results, write_u32(mem, out, total));
    errno_result(results, Errno::Success)
}

fn fd_write(
    ctx: &mut VmContext,
    st: &mut InstanceState,
    args: &[u64],
    results: &mut [u64],
) -> HostOutcome {
    let (fd, iovs, count, out) = (
        args[0] as u32,
        args[1] as u32,
        args[2] as u32,
        args[3] as u32,
    );
    let mem = mem(ctx);
    let iovs = host_try!(results, iter_iovs(mem, iovs, count));
    let mut total = 0u32;
    for (ptr, len) in iovs {
        let r = host_try!(results, checked_range(mem, ptr, len));
        let data = mem[r].to_vec();
        let n = host_try!(results, st.fs.write(fd, &data));
        total += n as u32;
        if (n as u32) < len {
            break;
        }
    }
    host_try!(results, write_u32(mem, out, total));
    errno_result(results, Errno::Success)
}

fn fd_pwrite(
    ctx: &mut VmContext,
    st: &mut InstanceState,
    args: &[u64],
    results: &mut [u64],
) -> HostOutcome {
    let (fd, iovs, count, offset, out) = (
        args[0] as u32,
        args[1] as u32,
        args[2] as u32,
        args[3],
        args[4] as u32,
    );
    let mem = mem(ctx);
    let iovs = host_try!(results, iter_iovs(mem, iovs, count));
    let mut total = 0u32;
    let mut at = offset;
    for (ptr, len) in iovs {
        let r = host_try!(results, checked_range(mem, ptr, len));
        let data = mem[r].to_vec();
        let n = host_try!(results, st.fs.pwrite(fd, &data, at));
        total += n as u32;
        at += n as u64;
        if (n as u32) < len {
            break;
        }
    }
    host_try!(results, write_u32(mem, out, total));
    errno_result(results, Errno::Success)
}

fn fd_seek(
    ctx: &mut VmContext,
    st: &mut InstanceState,
    args: &[u64],
    results: &mut [u64],
) -> HostOutcome {
    let (fd, offset, whence, out) = (args[0] as u32, args[1] as i64, args[2] as u8, args[3] as u32);
    let pos = host_try!(results, st.fs.seek(fd, offset, whence));
    let mem = mem(ctx);
    host_try!(results, write_u64(mem, out, pos));
    errno_result(results, Errno::Success)
}

fn fd_sync(
    _ctx: &mut VmContext,
    st: &mut InstanceState,
    args: &[u64],
    results: &mut [u64],
) -> HostOutcome {
    host_try!(results, st.fs.sync(args[0] as u32));
    errno_result(results, Errno::Success)
}

fn fd_fdstat_get(
    ctx: &mut VmContext,
    st: &mut InstanceState,
    args: &[u64],
    results: &mut [u64],
) -> HostOutcome {
    let (fd, out) = (args[0] as u32, args[1] as u32);
    let file_type = host_try!(results, st.fs.get(fd)).file_type();
    let flags = host_try!(results, st.fs.fd_flags(fd));
    let mem = mem(ctx);
    let r = host_try!(results, checked_range(mem, out, 24));
    mem[r.clone()].fill(0);
    mem[r.start] = file_type as u8;
    mem[r.start + 2..r.start + 4].copy_from_slice(&flags.to_le_bytes());
    // All rights, base and inheriting.
    mem[r.start + 8..r.start + 16].copy_from_slice(&u64::MAX.to_le_bytes());
    mem[r.start + 16..r.start + 24].copy_from_slice(&u64::MAX.to_le_bytes());
    errno_result(results, Errno::Success)
}

fn fd_fdstat_set_flags(
    _ctx: &mut VmContext,
    st: &mut InstanceState,
    args: &[u64],
    results: &mut [u64],
) -> HostOutcome {
    let (fd, flags) = (args[0] as u32, args[1] as u16);
    host_try!(
        results,
        st.fs
            .set_nonblock(fd, flags & crate::sys::FDFLAG_NONBLOCK != 0)
    );
    errno_result(results, Errno::Success)
}

fn write_filestat(
    mem: &mut [u8],
    out: u32,
    stat: &crate::sys::Filestat,
) -> Result<(), Errno> {
    let r = checked_range(mem, out, 64)?;
    mem[r.clone()].fill(0);
    let base = r.start;
    mem[base + 16] = stat.file_type as u8;
    mem[base + 24..base + 32].copy_from_slice(&1u64.to_le_bytes()); // nlink
    mem[base + 32..base + 40].copy_from_slice(&stat.size.to_le_bytes());
    mem[base + 40..base + 48].copy_from_slice(&stat.atim_ns.to_le_bytes());
    mem[base + 48..base + 56].copy_from_slice(&stat.mtim_ns.to_le_bytes());
    mem[base + 56..base + 64].copy_from_slice(&stat.mtim_ns.to_le_bytes());
    Ok(())
}

fn fd_filestat_get(
    ctx: &mut VmContext,
    st: &mut InstanceState,
    args: &[u64],
    results: &mut [u64],
) -> HostOutcome {
    let (fd, out) = (args[0] as u32, args[1] as u32);
    let stat = host_try!(results, st.fs.filestat(fd));
    let mem = mem(ctx);
    host_try!(results, write_filestat(mem, out, &stat));
    errno_result(results, Errno::Success)
}

fn fd_readdir(
    ctx: &mut VmContext,
    st: &mut InstanceState,
    args: &[u64],
    results: &mut [u64],
) -> HostOutcome {
    let (fd, buf, buf_len, cookie, out) = (
        args[0] as u32,
        args[1] as u32,
        args[2] as u32,
        args[3],
        args[4] as u32,
    );
    let entries = host_try!(results, st.fs.readdir(fd, cookie, DIRENT_BUF_SIZE));
    let mem = mem(ctx);
    let region = host_try!(results, checked_range(mem, buf, buf_len));
    let mut used = 0usize;
    for (next_cookie, entry) in entries {
        let name = entry.name.as_bytes();
        let dirent_len = 24 + name.len();
        let remaining = buf_len as usize - used;
        if remaining == 0 {
            break;
        }
        let take = dirent_len.min(remaining);
        let mut dirent = vec![0u8; 24];
        dirent[0..8].copy_from_slice(&next_cookie.to_le_bytes());
        dirent[16..20].copy_from_slice(&(name.len() as u32).to_le_bytes());
        dirent[20] = entry.file_type as u8;
        let mut packed = dirent;
        packed.extend_from_slice(name);
        let at = region.start + used;
        mem[at..at + take].copy_from_slice(&packed[..take]);
        used += take;
        if take < dirent_len {
            // Truncated tail tells the caller to come back with a bigger
            // buffer.
            break;
        }
    }
    host_try!(results, write_u32(mem, out, used as u32));
    errno_result(results, Errno::Success)
}

fn fd_renumber(
    _ctx: &mut VmContext,
    st: &mut InstanceState,
    args: &[u64],
    results: &mut [u64],
) -> HostOutcome {
    host_try!(results, st.fs.renumber(args[0] as u32, args[1] as u32));
    errno_result(results, Errno::Success)
}

fn fd_prestat_get(
    ctx: &mut VmContext,
    st: &mut InstanceState,
    args: &[u64],
    results: &mut [u64],
) -> HostOutcome {
    let (fd, out) = (args[0] as u32, args[1] as u32);
    let name = host_try!(results, st.fs.prestat_dir(fd)).to_string();
    let mem = mem(ctx);
    let r = host_try!(results, checked_range(mem, out, 8));
    mem[r.clone()].fill(0);
    mem[r.start] = 0; // preopentype::dir
    mem[r.start + 4..r.start + 8].copy_from_slice(&(name.len() as u32).to_le_bytes());
    errno_result(results, Errno::Success)
}

fn fd_prestat_dir_name(
    ctx: &mut VmContext,
    st: &mut InstanceState,
    args: &[u64],
    results: &mut [u64],
) -> HostOutcome {
    let (fd, path, path_len) = (args[0] as u32, args[1] as u32, args[2] as u32);
    let name = host_try!(results, st.fs.prestat_dir(fd)).to_string();
    if name.len() > path_len as usize {
        return errno_result(results, Errno::Inval);
    }
    let mem = mem(ctx);
    let r = host_try!(results, checked_range(mem, path, name.len() as u32));
    mem[r].copy_from_slice(name.as_bytes());
    errno_result(results, Errno::Success)
}

// ==================== paths ====================

fn path_open(
    ctx: &mut VmContext,
    st: &mut InstanceState,
    args: &[u64],
    results: &mut [u64],
) -> HostOutcome {
    let dirfd = args[0] as u32;
    let path_ptr = args[2] as u32;
    let path_len = args[3] as u32;
    let oflags = args[4] as u16;
    let rights_base = args[5];
    let fdflags = args[7] as u16;
    let out = args[8] as u32;

    const RIGHT_FD_WRITE: u64 = 1 << 6;
    let writable = rights_base & RIGHT_FD_WRITE != 0;

    let path = {
        let mem = mem(ctx);
        host_try!(results, read_str(mem, path_ptr, path_len))
    };
    let fd = host_try!(results, st.fs.open(dirfd, &path, oflags, fdflags, writable));
    let mem = mem(ctx);
    host_try!(results, write_u32(mem, out, fd));
    errno_result(results, Errno::Success)
}

fn path_filestat_get(
    ctx: &mut VmContext,
    st: &mut InstanceState,
    args: &[u64],
    results: &mut [u64],
) -> HostOutcome {
    let dirfd = args[0] as u32;
    let path_ptr = args[2] as u32;
    let path_len = args[3] as u32;
    let out = args[4] as u32;
    let path = {
        let mem = mem(ctx);
        host_try!(results, read_str(mem, path_ptr, path_len))
    };
    let stat = host_try!(results, st.fs.path_filestat(dirfd, &path));
    let mem = mem(ctx);
    host_try!(results, write_filestat(mem, out, &stat));
    errno_result(results, Errno::Success)
}

fn path_filestat_set_times(
    ctx: &mut VmContext,
    st: &mut InstanceState,
    args: &[u64],
    results: &mut [u64],
) -> HostOutcome {
    let dirfd = args[0] as u32;
    let path_ptr = args[2] as u32;
    let path_len = args[3] as u32;
    let atim = args[4];
    let mtim = args[5];
    let path = {
        let mem = mem(ctx);
        host_try!(results, read_str(mem, path_ptr, path_len))
    };
    host_try!(results, st.fs.path_set_times(dirfd, &path, atim, mtim));
    errno_result(results, Errno::Success)
}

// ==================== poll & sockets ====================

fn poll_oneoff(
    ctx: &mut VmContext,
    st: &mut InstanceState,
    args: &[u64],
    results: &mut [u64],
) -> HostOutcome {
    let (subs_ptr, events_ptr, nsubs, out) = (
        args[0] as u32,
        args[1] as u32,
        args[2] as u32,
        args[3] as u32,
    );
    let mut subs = Vec::with_capacity(nsubs as usize);
    {
        let mem = mem(ctx);
        for i in 0..nsubs {
            let base = subs_ptr + i * 48;
            let userdata = host_try!(results, read_u64(mem, base));
            let tag = host_try!(results, read_u32(mem, base + 8)) as u8;
            match tag {
                0 => {
                    let timeout = host_try!(results, read_u64(mem, base + 24));
                    let flags = host_try!(results, read_u32(mem, base + 40)) as u16;
                    let absolute = flags & 1 != 0;
                    subs.push(Subscription::Clock {
                        userdata,
                        timeout_ns: Some(timeout),
                        absolute,
                    });
                }
                1 => {
                    let fd = host_try!(results, read_u32(mem, base + 16));
                    subs.push(Subscription::FdRead { userdata, fd });
                }
                2 => {
                    let fd = host_try!(results, read_u32(mem, base + 16));
                    subs.push(Subscription::FdWrite { userdata, fd });
                }
                _ => return errno_result(results, Errno::Inval),
            }
        }
    }

    let events = host_try!(results, poll_oneshot(&mut st.fs, &subs));
    let mem = mem(ctx);
    for (i, ev) in events.iter().enumerate() {
        let base = events_ptr + i as u32 * 32;
        let r = host_try!(results, checked_range(mem, base, 32));
        mem[r.clone()].fill(0);
        mem[r.start..r.start + 8].copy_from_slice(&ev.userdata.to_le_bytes());
        mem[r.start + 8..r.start + 10].copy_from_slice(&ev.errno.raw().to_le_bytes());
        mem[r.start + 10] = ev.event_type;
    }
    host_try!(results, write_u32(mem, out, events.len() as u32));
    errno_result(results, Errno::Success)
}

fn sock_accept(
    ctx: &mut VmContext,
    st: &mut InstanceState,
    args: &[u64],
    results: &mut [u64],
) -> HostOutcome {
    let (fd, out) = (args[0] as u32, args[2] as u32);
    let new_fd = host_try!(results, st.fs.accept(fd));
    let mem = mem(ctx);
    host_try!(results, write_u32(mem, out, new_fd));
    errno_result(results, Errno::Success)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_known_and_unknown() {
        assert!(resolve("wasi_snapshot_preview1", "fd_write").is_some());
        assert!(resolve("wasi_snapshot_preview1", "fd_frobnicate").is_none());
        assert!(resolve("env", "fd_write").is_none());
    }

    #[test]
    fn test_checked_range_rejects_overflow() {
        let mem = vec![0u8; 16];
        assert!(checked_range(&mem, 12, 4).is_ok());
        assert!(checked_range(&mem, 13, 4).is_err());
        assert!(checked_range(&mem, u32::MAX, 2).is_err());
    }
}

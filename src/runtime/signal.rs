//! Guard-page fault translation.
//!
//! Out-of-bounds linear-memory accesses land on PROT_NONE guard pages and
//! arrive as SIGSEGV/SIGBUS. A process-global handler (installed once, on
//! first engine construction) checks that the faulting PC lies inside a
//! registered executable segment and that the faulting thread is running
//! guest code; if so it records the trap in the thread's active context
//! and redirects the PC to the segment's unwind stub. Anything else is
//! re-raised to the host's default handling.
//!
//! The segment registry is a swap-on-update list so the handler never
//! takes a lock.

use super::context::{VmContext, SIGNAL_SITE_BIT, STATUS_TRAP};
use super::trap::TrapKind;
use std::cell::Cell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Mutex, Once};

/// Executable ranges, swapped wholesale on every registry change. Old
/// lists are intentionally leaked; segments come and go rarely and the
/// handler may still be reading a stale list.
static SEGMENTS: AtomicPtr<Vec<(usize, usize)>> = AtomicPtr::new(ptr::null_mut());
static SEGMENTS_WRITER: Mutex<()> = Mutex::new(());
static INSTALL: Once = Once::new();

thread_local! {
    static ACTIVE_CTX: Cell<*mut VmContext> = const { Cell::new(ptr::null_mut()) };
}

/// Mark the context as executing on this thread for the duration of an
/// invocation.
pub fn enter_guest(ctx: *mut VmContext) {
    ACTIVE_CTX.with(|c| c.set(ctx));
}

pub fn leave_guest() {
    ACTIVE_CTX.with(|c| c.set(ptr::null_mut()));
}

/// Register an executable segment range.
pub fn register_segment(start: usize, len: usize) {
    let _guard = SEGMENTS_WRITER.lock().unwrap();
    let old = SEGMENTS.load(Ordering::Acquire);
    let mut list = if old.is_null() {
        Vec::new()
    } else {
        unsafe { (*old).clone() }
    };
    list.push((start, start + len));
    let leaked = Box::into_raw(Box::new(list));
    SEGMENTS.store(leaked, Ordering::Release);
}

/// Remove a segment range (on engine teardown).
pub fn unregister_segment(start: usize) {
    let _guard = SEGMENTS_WRITER.lock().unwrap();
    let old = SEGMENTS.load(Ordering::Acquire);
    let mut list = if old.is_null() {
        Vec::new()
    } else {
        unsafe { (*old).clone() }
    };
    list.retain(|(s, _)| *s != start);
    let leaked = Box::into_raw(Box::new(list));
    SEGMENTS.store(leaked, Ordering::Release);
}

fn segment_containing(pc: usize) -> Option<(usize, usize)> {
    let list = SEGMENTS.load(Ordering::Acquire);
    if list.is_null() {
        return None;
    }
    unsafe { (*list).iter().copied().find(|(s, e)| pc >= *s && pc < *e) }
}

/// Install the fault handler once per process.
pub fn install_handler() {
    INSTALL.call_once(|| unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = fault_handler as usize;
        action.sa_flags = libc::SA_SIGINFO;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(libc::SIGSEGV, &action, ptr::null_mut());
        libc::sigaction(libc::SIGBUS, &action, ptr::null_mut());
    });
}

unsafe fn reraise(sig: libc::c_int) {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = libc::SIG_DFL;
        libc::sigaction(sig, &action, ptr::null_mut());
        // Returning re-executes the faulting instruction under SIG_DFL.
    }
}

extern "C" fn fault_handler(
    sig: libc::c_int,
    _info: *mut libc::siginfo_t,
    uctx: *mut libc::c_void,
) {
    let ctx = ACTIVE_CTX.with(|c| c.get());
    if ctx.is_null() {
        unsafe { reraise(sig) };
        return;
    }
    let pc = unsafe { read_pc(uctx) };
    let Some((seg_start, _)) = segment_containing(pc) else {
        unsafe { reraise(sig) };
        return;
    };
    unsafe {
        (*ctx).status = STATUS_TRAP;
        (*ctx).trap_kind = TrapKind::OutOfBoundsMemoryAccess as u64;
        (*ctx).trap_site = SIGNAL_SITE_BIT | (pc - seg_start) as u64;
        write_pc(uctx, (*ctx).exit_stub as usize);
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
unsafe fn read_pc(uctx: *mut libc::c_void) -> usize {
    unsafe {
        let uc = uctx as *mut libc::ucontext_t;
        (*uc).uc_mcontext.gregs[libc::REG_RIP as usize] as usize
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
unsafe fn write_pc(uctx: *mut libc::c_void, pc: usize) {
    unsafe {
        let uc = uctx as *mut libc::ucontext_t;
        (*uc).uc_mcontext.gregs[libc::REG_RIP as usize] = pc as i64;
    }
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
unsafe fn read_pc(uctx: *mut libc::c_void) -> usize {
    unsafe {
        let uc = uctx as *mut libc::ucontext_t;
        (*uc).uc_mcontext.pc as usize
    }
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
unsafe fn write_pc(uctx: *mut libc::c_void, pc: usize) {
    unsafe {
        let uc = uctx as *mut libc::ucontext_t;
        (*uc).uc_mcontext.pc = pc as u64;
    }
}

#[cfg(all(target_os = "macos", target_arch = "x86_64"))]
unsafe fn read_pc(uctx: *mut libc::c_void) -> usize {
    unsafe {
        let uc = uctx as *mut libc::ucontext_t;
        (*(*uc).uc_mcontext).__ss.__rip as usize
    }
}

#[cfg(all(target_os = "macos", target_arch = "x86_64"))]
unsafe fn write_pc(uctx: *mut libc::c_void, pc: usize) {
    unsafe {
        let uc = uctx as *mut libc::ucontext_t;
        (*(*uc).uc_mcontext).__ss.__rip = pc as u64;
    }
}

#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
unsafe fn read_pc(uctx: *mut libc::c_void) -> usize {
    unsafe {
        let uc = uctx as *mut libc::ucontext_t;
        (*(*uc).uc_mcontext).__ss.__pc as usize
    }
}

#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
unsafe fn write_pc(uctx: *mut libc::c_void, pc: usize) {
    unsafe {
        let uc = uctx as *mut libc::ucontext_t;
        (*(*uc).uc_mcontext).__ss.__pc = pc as u64;
    }
}

#[cfg(not(any(
    all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")),
    all(target_os = "macos", any(target_arch = "x86_64", target_arch = "aarch64")),
)))]
unsafe fn read_pc(_uctx: *mut libc::c_void) -> usize {
    0
}

#[cfg(not(any(
    all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")),
    all(target_os = "macos", any(target_arch = "x86_64", target_arch = "aarch64")),
)))]
unsafe fn write_pc(_uctx: *mut libc::c_void, _pc: usize) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup() {
        register_segment(0x10000, 0x1000);
        register_segment(0x30000, 0x1000);
        assert_eq!(segment_containing(0x10000), Some((0x10000, 0x11000)));
        assert_eq!(segment_containing(0x10FFF), Some((0x10000, 0x11000)));
        assert_eq!(segment_containing(0x11000), None);
        assert_eq!(segment_containing(0x30800), Some((0x30000, 0x31000)));
        unregister_segment(0x10000);
        assert_eq!(segment_containing(0x10000), None);
        unregister_segment(0x30000);
    }
}

//! Executable code segments.
//!
//! A segment is a page-granular anonymous mapping that walks the lifecycle
//! `Writable → Relocated → Executable → Released`, never backwards. On
//! x86-64 the pages are mapped read-write-execute where the OS permits
//! (with a W^X fallback); on AArch64 they are written read-write and
//! re-protected read-execute before the first call into them.

use std::ptr::NonNull;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("code segment allocation of {0} bytes failed")]
    AllocationFailed(usize),
    #[error("memory protection change failed")]
    ProtectionFailed,
    #[error("invalid segment size")]
    InvalidSize,
    #[error("segment is no longer writable")]
    NotWritable,
}

/// Lifecycle state of a code segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    /// Pages mapped, function bytes being written.
    Writable,
    /// All bytes written and every call site patched.
    Relocated,
    /// Protected for execution; immutable from here on.
    Executable,
}

/// A contiguous executable code region owned by the engine.
pub struct CodeSegment {
    ptr: NonNull<u8>,
    size: usize,
    state: SegmentState,
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn round_up_to_page(size: usize) -> usize {
    let page = page_size();
    (size + page - 1) & !(page - 1)
}

/// Whether this build writes code into an already-executable mapping.
fn maps_rwx() -> bool {
    cfg!(target_arch = "x86_64")
}

fn mmap_anon(size: usize, prot: libc::c_int) -> Option<NonNull<u8>> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            prot,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        None
    } else {
        NonNull::new(ptr as *mut u8)
    }
}

impl CodeSegment {
    /// Map a fresh writable segment of at least `size` bytes.
    pub fn new(size: usize) -> Result<Self, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidSize);
        }
        let aligned = round_up_to_page(size);

        let ptr = if maps_rwx() {
            // Prefer one RWX mapping so relocation patching needs no
            // protection flips; some hardened kernels refuse W+X.
            mmap_anon(
                aligned,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            )
            .or_else(|| mmap_anon(aligned, libc::PROT_READ | libc::PROT_WRITE))
        } else {
            mmap_anon(aligned, libc::PROT_READ | libc::PROT_WRITE)
        }
        .ok_or(MemoryError::AllocationFailed(aligned))?;

        Ok(Self {
            ptr,
            size: aligned,
            state: SegmentState::Writable,
        })
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn state(&self) -> SegmentState {
        self.state
    }

    /// Address of the byte at `offset`.
    pub fn addr_of(&self, offset: usize) -> *const u8 {
        debug_assert!(offset < self.size);
        unsafe { self.ptr.as_ptr().add(offset) }
    }

    /// Write bytes at the given offset. Only legal before the executable
    /// transition.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), MemoryError> {
        if self.state == SegmentState::Executable {
            return Err(MemoryError::NotWritable);
        }
        if offset + data.len() > self.size {
            return Err(MemoryError::InvalidSize);
        }
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len());
        }
        Ok(())
    }

    /// Patch a 32-bit field in place (relocation resolution).
    pub fn patch_u32(&mut self, offset: usize, value: u32) -> Result<(), MemoryError> {
        self.write(offset, &value.to_le_bytes())
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        assert!(offset + 4 <= self.size);
        let mut buf = [0u8; 4];
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), buf.as_mut_ptr(), 4);
        }
        u32::from_le_bytes(buf)
    }

    /// Grow the segment to at least `new_size` bytes by remapping: map a
    /// larger region, copy the current bytes, and unmap the old mapping.
    /// All recorded offsets stay valid because they are segment-relative.
    pub fn remap(&mut self, new_size: usize) -> Result<(), MemoryError> {
        if self.state == SegmentState::Executable {
            return Err(MemoryError::NotWritable);
        }
        let aligned = round_up_to_page(new_size);
        if aligned <= self.size {
            return Ok(());
        }
        let mut grown = CodeSegment::new(aligned)?;
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr(), grown.ptr.as_ptr(), self.size);
        }
        std::mem::swap(self, &mut grown);
        self.state = grown.state;
        // `grown` now holds the old mapping and unmaps it on drop.
        Ok(())
    }

    /// Mark every call site as patched. No protection change; this is the
    /// bookkeeping step between writing and execution.
    pub fn mark_relocated(&mut self) {
        assert_eq!(self.state, SegmentState::Writable);
        self.state = SegmentState::Relocated;
    }

    /// Transition to executable. On x86-64 with an RWX mapping this only
    /// flips the state; otherwise the pages are re-protected read-execute
    /// and the instruction cache is synchronized.
    pub fn make_executable(&mut self) -> Result<(), MemoryError> {
        assert_eq!(
            self.state,
            SegmentState::Relocated,
            "segment must be relocated before execution"
        );
        let rc = unsafe {
            libc::mprotect(
                self.ptr.as_ptr() as *mut libc::c_void,
                self.size,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if rc != 0 {
            return Err(MemoryError::ProtectionFailed);
        }
        #[cfg(target_arch = "aarch64")]
        unsafe {
            clear_icache(self.ptr.as_ptr(), self.size);
        }
        self.state = SegmentState::Executable;
        Ok(())
    }
}

#[cfg(target_arch = "aarch64")]
unsafe fn clear_icache(start: *const u8, len: usize) {
    extern "C" {
        fn __clear_cache(start: *mut libc::c_char, end: *mut libc::c_char);
    }
    unsafe {
        __clear_cache(
            start as *mut libc::c_char,
            start.add(len) as *mut libc::c_char,
        );
    }
}

impl Drop for CodeSegment {
    fn drop(&mut self) {
        assert!(self.size != 0, "releasing an absent code segment");
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
        }
        self.size = 0;
    }
}

// The segment owns its mapping; once executable it is immutable and may
// be read/executed from any thread.
unsafe impl Send for CodeSegment {}
unsafe impl Sync for CodeSegment {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_rounds_to_page() {
        let seg = CodeSegment::new(100).unwrap();
        assert!(seg.size() >= 100);
        assert_eq!(seg.size() % page_size(), 0);
        assert_eq!(seg.state(), SegmentState::Writable);
    }

    #[test]
    fn test_zero_size_rejected() {
        assert!(matches!(CodeSegment::new(0), Err(MemoryError::InvalidSize)));
    }

    #[test]
    fn test_write_and_read_back() {
        let mut seg = CodeSegment::new(4096).unwrap();
        seg.write(8, &[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();
        assert_eq!(seg.read_u32(8), 0xEFBE_ADDE);
    }

    #[test]
    fn test_lifecycle() {
        let mut seg = CodeSegment::new(4096).unwrap();
        seg.write(0, &[0xC3]).unwrap();
        seg.mark_relocated();
        seg.patch_u32(4, 0x1234).unwrap();
        seg.make_executable().unwrap();
        assert_eq!(seg.state(), SegmentState::Executable);
        assert!(seg.write(0, &[0x90]).is_err());
    }

    #[test]
    fn test_remap_preserves_bytes() {
        let mut seg = CodeSegment::new(4096).unwrap();
        seg.write(0, &[1, 2, 3, 4]).unwrap();
        let old_size = seg.size();
        seg.remap(old_size * 4).unwrap();
        assert!(seg.size() >= old_size * 4);
        assert_eq!(seg.read_u32(0), u32::from_le_bytes([1, 2, 3, 4]));
    }
}

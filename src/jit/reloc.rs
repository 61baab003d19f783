//! Call-site relocations and long-branch trampolines.
//!
//! Inter-function calls are emitted with a zero displacement and recorded
//! as relocation sites. Once every function's segment offset is known the
//! sites are patched. On AArch64 a `BL` reaches ±128 MiB; farther targets
//! are routed through a per-site trampoline slot reserved in the calling
//! function's island: the slot loads the absolute callee address into the
//! scratch register and transfers with `BR`, so the link register still
//! holds the original return address and the callee returns straight to
//! the caller.

use super::memory::CodeSegment;
use thiserror::Error;

/// One pending call site within a function's code.
#[derive(Debug, Clone, Copy)]
pub struct Reloc {
    /// Offset of the patch point, relative to the function start. On
    /// x86-64 this addresses the 4-byte displacement field of the CALL;
    /// on AArch64 it addresses the BL instruction word.
    pub site: usize,
    /// Callee function index.
    pub callee: u32,
}

#[derive(Debug, Error)]
pub enum RelocError {
    #[error("call displacement {0} out of range and no trampoline slot available")]
    OutOfRange(i64),
    #[error("unresolved call site at segment offset {0:#x}")]
    Unresolved(usize),
}

/// PC-relative range of an AArch64 `BL` (±128 MiB).
pub const A64_BL_RANGE: i64 = 128 * 1024 * 1024;

/// Bytes reserved per trampoline slot: movz + 3×movk + br.
pub const A64_TRAMPOLINE_SIZE: usize = 20;

/// Patch the 26-bit immediate of a B/BL instruction word.
pub fn a64_patch_branch26(inst: u32, byte_disp: i64) -> u32 {
    debug_assert_eq!(byte_disp % 4, 0);
    let imm26 = ((byte_disp / 4) as u32) & 0x03FF_FFFF;
    (inst & 0xFC00_0000) | imm26
}

/// Whether a displacement fits the 26-bit branch immediate.
pub fn a64_branch_in_range(byte_disp: i64) -> bool {
    (-A64_BL_RANGE..A64_BL_RANGE).contains(&byte_disp)
}

/// The five instruction words of a long-branch trampoline: load the
/// absolute target into x17 and branch without touching the link
/// register.
pub fn a64_trampoline_words(target: u64) -> [u32; 5] {
    let piece = |hw: u64| ((target >> (16 * hw)) & 0xFFFF) as u32;
    let movz = 0xD280_0000 | (piece(0) << 5) | 17;
    let movk = |hw: u32| 0xF280_0000 | (hw << 21) | (piece(hw as u64) << 5) | 17;
    let br_x17 = 0xD61F_0000 | (17 << 5);
    [movz, movk(1), movk(2), movk(3), br_x17]
}

/// x86-64 CALL rel32 displacement for a site whose 4-byte field starts at
/// `field_offset` (displacement is measured from the end of the field).
pub fn x64_call_disp(field_offset: usize, callee_offset: usize) -> i64 {
    callee_offset as i64 - (field_offset as i64 + 4)
}

/// Resolve every recorded call site in the segment.
///
/// `sites` holds (segment-relative patch offset, callee, island slot
/// offset) triples; `func_offsets` maps function indices to their segment
/// offsets. The island slot is used on AArch64 when the callee is out of
/// `BL` range; `usize::MAX` means no slot was reserved (x86-64).
pub fn resolve_relocations(
    seg: &mut CodeSegment,
    sites: &[(usize, u32, usize)],
    func_offsets: &[usize],
) -> Result<(), RelocError> {
    for &(site, callee, island_slot) in sites {
        let callee_offset = func_offsets[callee as usize];
        if cfg!(target_arch = "x86_64") {
            let disp = x64_call_disp(site, callee_offset);
            debug_assert!((i32::MIN as i64..=i32::MAX as i64).contains(&disp));
            seg.patch_u32(site, disp as u32)
                .map_err(|_| RelocError::Unresolved(site))?;
        } else {
            let disp = callee_offset as i64 - site as i64;
            let inst = seg.read_u32(site);
            if a64_branch_in_range(disp) {
                seg.patch_u32(site, a64_patch_branch26(inst, disp))
                    .map_err(|_| RelocError::Unresolved(site))?;
            } else {
                if island_slot == usize::MAX {
                    return Err(RelocError::OutOfRange(disp));
                }
                // Write the trampoline and point the BL at it.
                let target = seg.as_ptr() as u64 + callee_offset as u64;
                let words = a64_trampoline_words(target);
                for (i, word) in words.iter().enumerate() {
                    seg.patch_u32(island_slot + i * 4, *word)
                        .map_err(|_| RelocError::Unresolved(site))?;
                }
                let tramp_disp = island_slot as i64 - site as i64;
                debug_assert!(a64_branch_in_range(tramp_disp));
                seg.patch_u32(site, a64_patch_branch26(inst, tramp_disp))
                    .map_err(|_| RelocError::Unresolved(site))?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_branch26() {
        // BL forward 8 bytes.
        let patched = a64_patch_branch26(0x9400_0000, 8);
        assert_eq!(patched, 0x9400_0002);
        // BL backward 4 bytes keeps the opcode bits.
        let patched = a64_patch_branch26(0x9400_0000, -4);
        assert_eq!(patched, 0x97FF_FFFF);
    }

    #[test]
    fn test_branch_range() {
        assert!(a64_branch_in_range(0));
        assert!(a64_branch_in_range(A64_BL_RANGE - 4));
        assert!(a64_branch_in_range(-A64_BL_RANGE));
        assert!(!a64_branch_in_range(A64_BL_RANGE));
    }

    #[test]
    fn test_trampoline_words() {
        let words = a64_trampoline_words(0x0000_7F12_3456_789A);
        // movz x17, #0x789a
        assert_eq!(words[0], 0xD280_0000 | (0x789A << 5) | 17);
        // movk x17, #0x3456, lsl #16
        assert_eq!(words[1], 0xF280_0000 | (1 << 21) | (0x3456 << 5) | 17);
        // movk x17, #0x7f12, lsl #32
        assert_eq!(words[2], 0xF280_0000 | (2 << 21) | (0x7F12 << 5) | 17);
        // movk x17, #0, lsl #48
        assert_eq!(words[3], 0xF280_0000 | (3 << 21) | 17);
        // br x17, not blr: the link register stays the caller's.
        assert_eq!(words[4], 0xD61F_0220);
    }

    #[test]
    fn test_x64_call_disp() {
        // CALL at field offset 16 to a callee at 32: disp from end of
        // field (20).
        assert_eq!(x64_call_disp(16, 32), 12);
        assert_eq!(x64_call_disp(16, 0), -20);
    }
}

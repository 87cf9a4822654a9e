//! Cache maintenance by virtual address, as described in the Arm ARM
//! "Concurrent modification and execution of instructions" section.
//!
//! The sequence is: clean every data cache line to the point of unification,
//! `dsb ish`, invalidate every instruction cache line, `dsb ish`, `isb`.
//! `CTR_EL0` tells us the line sizes, and whether either half of that can be
//! skipped because the hardware already keeps the caches coherent.

use super::CacheBackend;
use core::arch::asm;

pub(super) struct DcIcBackend;

/// The cache type register, `CTR_EL0`.
#[derive(Copy, Clone, Debug)]
struct CacheType(u64);

impl CacheType {
    fn read() -> Self {
        let ctr: u64;
        // Safety: Linux and the BSDs set SCTLR_EL1.UCT, so EL0 may read CTR_EL0
        unsafe {
            asm!("mrs {}, ctr_el0", out(reg) ctr, options(nomem, nostack, preserves_flags));
        }
        Self(ctr)
    }

    /// Smallest data cache line, in bytes.
    fn dcache_line_size(self) -> usize {
        4 << ((self.0 >> 16) & 0xf)
    }

    /// Smallest instruction cache line, in bytes.
    fn icache_line_size(self) -> usize {
        4 << (self.0 & 0xf)
    }

    /// Data cache clean to PoU is not required for instruction to data coherence.
    fn idc(self) -> bool {
        self.0 & (1 << 28) != 0
    }

    /// Instruction cache invalidation to PoU is not required for data to instruction coherence.
    fn dic(self) -> bool {
        self.0 & (1 << 29) != 0
    }
}

impl CacheBackend for DcIcBackend {
    const HAS_FLUSH: bool = true;

    unsafe fn flush(begin: *const u8, end: *const u8) {
        let ctr = CacheType::read();
        let (begin, end) = (begin as usize, end as usize);

        if !ctr.idc() {
            let line = ctr.dcache_line_size();
            let mut addr = begin & !(line - 1);
            while addr < end {
                // Safety: the line is mapped, ensured by caller
                unsafe {
                    asm!("dc cvau, {}", in(reg) addr, options(nostack, preserves_flags));
                }
                addr = addr.saturating_add(line);
            }
        }

        // Safety: barriers have no memory safety preconditions
        unsafe {
            asm!("dsb ish", options(nostack, preserves_flags));
        }

        if !ctr.dic() {
            let line = ctr.icache_line_size();
            let mut addr = begin & !(line - 1);
            while addr < end {
                // Safety: the line is mapped, ensured by caller
                unsafe {
                    asm!("ic ivau, {}", in(reg) addr, options(nostack, preserves_flags));
                }
                addr = addr.saturating_add(line);
            }

            // Safety: barriers have no memory safety preconditions
            unsafe {
                asm!("dsb ish", options(nostack, preserves_flags));
            }
        }

        // Safety: barriers have no memory safety preconditions
        unsafe {
            asm!("isb", options(nostack, preserves_flags));
        }
    }
}

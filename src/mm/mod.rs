//! Memory management
//!
//! Provides:
//! - Reference-counted physical frames (`frame`)
//! - Page table entry encoding (`paging`)
//! - Page directory walking, mapping and permission checks (`pmap`)
//! - The emulated paging unit and its translation cache (`mmu`)
//!
//! # Principles
//! - Every frame access is bounds-checked through a frame number
//! - Allocation failure is an error value, never a crash
//! - Mapping changes invalidate exactly the affected translation

mod frame;
mod mmu;
mod paging;
mod pmap;

pub use frame::{FrameNumber, PhysMemory};
pub use mmu::{Access, Mmu, PageFault, TlbStats, FEC_PR, FEC_U, FEC_WR};
pub use paging::{PageTableEntry, PteFlags};
pub use pmap::{Mapping, PteSlot};

/// The emulated hardware: physical memory plus the paging unit.
pub struct Machine {
    pub mem: PhysMemory,
    pub mmu: Mmu,
}

impl Machine {
    /// Build a machine with `nframes` frames and a translation cache of
    /// `tlb_entries` entries.
    pub fn new(nframes: usize, tlb_entries: usize) -> Self {
        Self {
            mem: PhysMemory::new(nframes),
            mmu: Mmu::new(tlb_entries),
        }
    }
}

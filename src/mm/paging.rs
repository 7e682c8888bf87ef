//! x86 Two-Level Page Table Entries
//!
//! Implements the 32-bit page directory / page table entry format.
//!
//! # Entry Layout
//! ```text
//!  31                    12 11   9 8 7 6 5 4 3 2 1 0
//! +------------------------+------+---+-+-+-+-+-+-+-+
//! |  physical frame number | AVAIL| MBZ|D|A|C|T|U|W|P|
//! +------------------------+------+---+-+-+-+-+-+-+-+
//! ```
//!
//! # Invariants
//! - Must-be-zero bits are never set by the kernel
//! - Raw entries never leave the `mm` module; callers see `PteFlags`
//! - Writable and copy-on-write are never granted together through the
//!   system call boundary

use bitflags::bitflags;

use crate::memlayout::PhysAddr;

bitflags! {
    /// Page table entry flags.
    ///
    /// The same bits are used for page directory entries, where they
    /// apply to the whole 4 MiB region the page table covers.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct PteFlags: u32 {
        /// Entry is present.
        const PRESENT = 1 << 0;
        /// Page is writable.
        const WRITABLE = 1 << 1;
        /// Page is accessible from user mode.
        const USER = 1 << 2;
        /// Write-through caching.
        const WRITE_THROUGH = 1 << 3;
        /// Caching disabled.
        const CACHE_DISABLE = 1 << 4;
        /// Set by the MMU on any access.
        const ACCESSED = 1 << 5;
        /// Set by the MMU on write.
        const DIRTY = 1 << 6;
        /// Large page / global bits; must be zero in this design.
        const MBZ = 0x180;
        /// Copy-on-write: an available bit reserved for the fork library.
        const COW = 1 << 11;
        /// Remaining available bits.
        const AVAIL_LO = 1 << 9;
        const AVAIL_MID = 1 << 10;
    }
}

impl PteFlags {
    /// All bits the user may set through a system call.
    pub const SYSCALL: Self = Self::PRESENT
        .union(Self::WRITABLE)
        .union(Self::USER)
        .union(Self::AVAIL_LO)
        .union(Self::AVAIL_MID)
        .union(Self::COW);

    /// Bits available to software.
    pub const AVAIL: Self = Self::AVAIL_LO.union(Self::AVAIL_MID).union(Self::COW);

    /// Hardware-maintained bits.
    pub const HW_STATUS: Self = Self::ACCESSED.union(Self::DIRTY);

    /// Permission set for a fresh user page table entry in the directory.
    pub const USER_TABLE: Self = Self::PRESENT.union(Self::WRITABLE).union(Self::USER);

    /// Read-write user data.
    pub const USER_RW: Self = Self::PRESENT.union(Self::WRITABLE).union(Self::USER);

    /// Read-only user data.
    pub const USER_RO: Self = Self::PRESENT.union(Self::USER);

    /// Read-only, copy-on-write user data.
    pub const USER_COW: Self = Self::PRESENT.union(Self::USER).union(Self::COW);

    #[inline]
    pub const fn is_present(self) -> bool {
        self.contains(Self::PRESENT)
    }

    #[inline]
    pub const fn is_writable(self) -> bool {
        self.contains(Self::WRITABLE)
    }

    #[inline]
    pub const fn is_user(self) -> bool {
        self.contains(Self::USER)
    }

    #[inline]
    pub const fn is_cow(self) -> bool {
        self.contains(Self::COW)
    }

    #[inline]
    pub const fn is_accessed(self) -> bool {
        self.contains(Self::ACCESSED)
    }

    #[inline]
    pub const fn is_dirty(self) -> bool {
        self.contains(Self::DIRTY)
    }

    /// Permission bits without the hardware-maintained status bits.
    #[inline]
    pub const fn permissions(self) -> Self {
        self.difference(Self::HW_STATUS)
    }

    /// Render as the monitor's `AVLGPDACTUWP`-style string.
    pub fn describe(self) -> [u8; 12] {
        const SET: &[u8; 12] = b"AVLGPDACTUWP";
        const CLEAR: &[u8; 12] = b"_________SR_";
        let mut out = [0u8; 12];
        let bits = self.bits();
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = if (bits >> (11 - i)) & 1 == 1 {
                SET[i]
            } else {
                CLEAR[i]
            };
        }
        out
    }
}

/// A single page directory or page table entry.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u32);

impl PageTableEntry {
    /// Address mask for entries (bits [31:12]).
    const ADDR_MASK: u32 = 0xFFFF_F000;

    /// Create an empty (not present) entry.
    #[inline]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Create an entry mapping a physical frame.
    ///
    /// # Panics
    /// Panics if must-be-zero bits are requested or the address is unaligned.
    #[inline]
    pub fn new(pa: PhysAddr, flags: PteFlags) -> Self {
        assert!(pa.is_aligned(), "unaligned frame address {}", pa);
        assert!(
            !flags.intersects(PteFlags::MBZ),
            "must-be-zero bits set in {:?}",
            flags
        );
        Self(pa.as_u32() | flags.bits())
    }

    /// Decode a raw entry read from a table frame.
    #[inline]
    pub(crate) const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw value as stored in the table frame.
    #[inline]
    pub(crate) const fn raw(self) -> u32 {
        self.0
    }

    /// Check if the entry is present.
    #[inline]
    pub const fn is_present(self) -> bool {
        self.0 & PteFlags::PRESENT.bits() != 0
    }

    /// Get the physical address from this entry.
    #[inline]
    pub const fn addr(self) -> PhysAddr {
        PhysAddr::new(self.0 & Self::ADDR_MASK)
    }

    /// Get the flags from this entry.
    #[inline]
    pub const fn flags(self) -> PteFlags {
        PteFlags::from_bits_retain(self.0 & !Self::ADDR_MASK)
    }

    /// Same frame, different flags.
    #[inline]
    pub fn with_flags(self, flags: PteFlags) -> Self {
        Self::new(self.addr(), flags)
    }
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_present() {
            write!(f, "PTE(addr={}, flags={:?})", self.addr(), self.flags())
        } else {
            write!(f, "PTE(not present)")
        }
    }
}

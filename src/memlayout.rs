//! Physical and Virtual Address Types and the Fixed Memory Layout
//!
//! Type-safe wrappers for 32-bit addresses that prevent mixing
//! physical and virtual addresses at compile time, plus the constants
//! that carve the virtual address space into user and kernel ranges.
//!
//! # Virtual Memory Map
//! ```text
//!  4 GiB ---------> +------------------------------+
//!                   |  Remapped physical memory    |  RW/--
//!  KERNBASE ------> +------------------------------+ 0xf0000000
//!                   |  Kernel stacks / reserved    |  RW/--
//!  ULIM ----------> +------------------------------+ 0xef800000
//!                   |  Current page table (UVPT)   |  R-/R-
//!  UVPT ----------> +------------------------------+ 0xef400000
//!                   |  Reserved (UPAGES, UENVS)    |  R-/R-
//!  UTOP, -------->  +------------------------------+ 0xeec00000
//!  UXSTACKTOP       |  User exception stack        |  RW/RW  PGSIZE
//!                   +------------------------------+ 0xeebff000
//!                   |  Empty (guard)               |  --/--  PGSIZE
//!  USTACKTOP -----> +------------------------------+ 0xeebfe000
//!                   |  Normal user stack           |  RW/RW
//!                   ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
//!                   |  Program data, heap, text    |
//!  UTEXT ---------> +------------------------------+ 0x00800000
//!  PFTEMP --------> |  Empty                       | 0x007ff000
//!  UTEMP ---------> +------------------------------+ 0x00400000
//!                   |  Empty                       |
//!  0 -------------> +------------------------------+
//! ```
//!
//! None of these are configurable at runtime; the fault resolver and
//! the fork library depend on them structurally.

use core::fmt;

/// Page size (4 KiB)
pub const PGSIZE: usize = 4096;
/// Page size mask
pub const PAGE_MASK: u32 = PGSIZE as u32 - 1;
/// Bits to shift for page number
pub const PGSHIFT: u32 = 12;
/// Bits to shift for page directory index
pub const PDXSHIFT: u32 = 22;

/// Number of entries per page directory or page table
pub const NPTENTRIES: usize = 1024;
/// Number of entries per page directory
pub const NPDENTRIES: usize = 1024;
/// Bytes mapped by a single page directory entry (4 MiB)
pub const PTSIZE: u32 = (PGSIZE * NPTENTRIES) as u32;

/// Physical memory is mapped for the kernel starting here.
pub const KERNBASE: u32 = 0xF000_0000;
/// Kernel stack top; the kernel stack sits just below KERNBASE.
pub const KSTACKTOP: u32 = KERNBASE;
/// User-inaccessible region starts here.
pub const ULIM: u32 = KSTACKTOP - PTSIZE - PTSIZE;
/// Read-only self-map of the current page directory.
pub const UVPT: u32 = ULIM - PTSIZE;
/// Read-only copy of the physical page metadata (reserved).
pub const UPAGES: u32 = UVPT - PTSIZE;
/// Read-only copy of the process table (reserved).
pub const UENVS: u32 = UPAGES - PTSIZE;
/// Top of user-owned memory.
pub const UTOP: u32 = UENVS;
/// Top of the one-page user exception stack.
pub const UXSTACKTOP: u32 = UTOP;
/// Top of the normal user stack; one guard page sits above it.
pub const USTACKTOP: u32 = UTOP - 2 * PGSIZE as u32;
/// Where user programs generally begin.
pub const UTEXT: u32 = 2 * PTSIZE;
/// Scratch mapping used by fork to reach another process's pages.
pub const UTEMP: u32 = PTSIZE;
/// Scratch mapping used by the copy-on-write fault handler.
pub const PFTEMP: u32 = UTEMP + PTSIZE - PGSIZE as u32;

/// Largest amount of physical memory the KERNBASE window can hold.
pub const MAX_PHYS_MEM: usize = (0u32.wrapping_sub(KERNBASE)) as usize;

/// Page directory index of a virtual address.
#[inline]
pub const fn pdx(va: u32) -> usize {
    ((va >> PDXSHIFT) & 0x3FF) as usize
}

/// Page table index of a virtual address.
#[inline]
pub const fn ptx(va: u32) -> usize {
    ((va >> PGSHIFT) & 0x3FF) as usize
}

/// Virtual page number of an address.
#[inline]
pub const fn vpn(va: u32) -> usize {
    (va >> PGSHIFT) as usize
}

/// Build a virtual address from directory index, table index and offset.
#[inline]
pub const fn pgaddr(pdx: usize, ptx: usize, offset: u32) -> u32 {
    ((pdx as u32) << PDXSHIFT) | ((ptx as u32) << PGSHIFT) | offset
}

/// Round down to the nearest multiple of `n` (a power of two).
#[inline]
pub const fn round_down(value: u32, n: u32) -> u32 {
    value & !(n - 1)
}

/// A physical memory address.
///
/// This is a newtype wrapper that prevents accidental mixing of
/// physical and virtual addresses. Physical addresses cannot be
/// dereferenced; they are resolved through the frame arena.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(u32);

impl PhysAddr {
    /// Create a new physical address.
    #[inline]
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    /// Get the raw address value.
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Check if the address is page-aligned.
    #[inline]
    pub const fn is_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }

    /// Align the address down to the nearest page boundary.
    #[inline]
    pub const fn align_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Get the physical page number.
    #[inline]
    pub const fn ppn(self) -> usize {
        (self.0 >> PGSHIFT) as usize
    }

    /// Offset within the page.
    #[inline]
    pub const fn page_offset(self) -> usize {
        (self.0 & PAGE_MASK) as usize
    }

    /// Create from a physical page number.
    #[inline]
    pub const fn from_ppn(ppn: usize) -> Self {
        Self((ppn as u32) << PGSHIFT)
    }

    /// Add an offset to this address.
    #[inline]
    pub const fn add(self, offset: u32) -> Self {
        Self(self.0 + offset)
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#010x})", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// A virtual memory address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(u32);

impl VirtAddr {
    /// Create a new virtual address.
    #[inline]
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    /// Get the raw address value.
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Check if the address is page-aligned.
    #[inline]
    pub const fn is_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }

    /// Align the address down to the nearest page boundary.
    #[inline]
    pub const fn align_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Page directory index.
    #[inline]
    pub const fn pdx(self) -> usize {
        pdx(self.0)
    }

    /// Page table index.
    #[inline]
    pub const fn ptx(self) -> usize {
        ptx(self.0)
    }

    /// Virtual page number.
    #[inline]
    pub const fn vpn(self) -> usize {
        vpn(self.0)
    }

    /// Get the page offset (lowest 12 bits).
    #[inline]
    pub const fn page_offset(self) -> usize {
        (self.0 & PAGE_MASK) as usize
    }

    /// Add an offset to this address.
    #[inline]
    pub const fn add(self, offset: u32) -> Self {
        Self(self.0.wrapping_add(offset))
    }

    /// Check if this address is below UTOP (owned by the user).
    #[inline]
    pub const fn is_user(self) -> bool {
        self.0 < UTOP
    }

    /// Check if this address lies inside the one-page exception stack.
    #[inline]
    pub const fn on_exception_stack(self) -> bool {
        self.0 >= UXSTACKTOP - PGSIZE as u32 && self.0 < UXSTACKTOP
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#010x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Translate a physical address into the kernel's KERNBASE window.
///
/// # Panics
/// Panics if the address lies beyond the window, like `KADDR`.
#[inline]
pub fn kaddr(pa: PhysAddr) -> VirtAddr {
    if pa.as_u32() as usize >= MAX_PHYS_MEM {
        panic!("kaddr called with invalid pa {:#010x}", pa.as_u32());
    }
    VirtAddr::new(pa.as_u32() + KERNBASE)
}

/// Translate a KERNBASE window address back to physical.
///
/// # Panics
/// Panics on addresses below KERNBASE, like `PADDR`.
#[inline]
pub fn paddr(kva: VirtAddr) -> PhysAddr {
    if kva.as_u32() < KERNBASE {
        panic!("paddr called with invalid kva {:#010x}", kva.as_u32());
    }
    PhysAddr::new(kva.as_u32() - KERNBASE)
}

//! Emulated Paging Unit
//!
//! Translates virtual addresses through the loaded page directory the
//! way an x86 MMU does, with a small translation cache in front.
//!
//! # Behavior
//! - User and write permission are the AND of the directory and table
//!   entries
//! - Supervisor writes honor read-only pages (CR0.WP is always set)
//! - Accessed is set on both levels, Dirty on the leaf for writes
//! - The cache holds translations of the loaded directory only; loading
//!   a different directory flushes it, `invalidate` drops one page

use alloc::vec::Vec;
use core::fmt;

use crate::memlayout::{PhysAddr, VirtAddr, PGSIZE};

use super::frame::FrameNumber;
use super::paging::{PageTableEntry, PteFlags};
use super::Machine;

/// Fault error code bit: the page was present (protection violation).
pub const FEC_PR: u32 = 0x1;
/// Fault error code bit: the access was a write.
pub const FEC_WR: u32 = 0x2;
/// Fault error code bit: the access came from user mode.
pub const FEC_U: u32 = 0x4;

/// Kind of memory access being translated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Access {
    pub write: bool,
    pub user: bool,
}

impl Access {
    pub const USER_READ: Self = Self { write: false, user: true };
    pub const USER_WRITE: Self = Self { write: true, user: true };
    pub const KERNEL_READ: Self = Self { write: false, user: false };
    pub const KERNEL_WRITE: Self = Self { write: true, user: false };

    /// Error code bits describing this access.
    #[inline]
    const fn error_bits(self) -> u32 {
        (if self.write { FEC_WR } else { 0 }) | (if self.user { FEC_U } else { 0 })
    }
}

/// A translation failure, as the CPU would report it in CR2 and the
/// trap frame's error code.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    /// Faulting virtual address.
    pub va: VirtAddr,
    /// `FEC_*` bits.
    pub err: u32,
}

impl PageFault {
    #[inline]
    pub const fn was_write(&self) -> bool {
        self.err & FEC_WR != 0
    }

    #[inline]
    pub const fn was_present(&self) -> bool {
        self.err & FEC_PR != 0
    }

    #[inline]
    pub const fn from_user(&self) -> bool {
        self.err & FEC_U != 0
    }
}

impl fmt::Debug for PageFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PageFault(va={}, {} {} {})",
            self.va,
            if self.from_user() { "user" } else { "kernel" },
            if self.was_write() { "write" } else { "read" },
            if self.was_present() { "protection" } else { "not-present" },
        )
    }
}

#[derive(Clone, Copy)]
struct TlbEntry {
    vpn: usize,
    frame: PhysAddr,
    user: bool,
    writable: bool,
    dirty: bool,
}

/// Hit/miss counters for the translation cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TlbStats {
    pub hits: u64,
    pub misses: u64,
    pub flushes: u64,
}

/// Paging unit state: the loaded directory and the translation cache.
pub struct Mmu {
    cr2: VirtAddr,
    cr3: Option<FrameNumber>,
    tlb: Vec<TlbEntry>,
    capacity: usize,
    stats: TlbStats,
}

impl Mmu {
    pub fn new(capacity: usize) -> Self {
        Self {
            cr2: VirtAddr::new(0),
            cr3: None,
            tlb: Vec::with_capacity(capacity),
            capacity: capacity.max(1),
            stats: TlbStats::default(),
        }
    }

    /// Address of the most recent translation fault.
    #[inline]
    pub fn cr2(&self) -> VirtAddr {
        self.cr2
    }

    /// The loaded page directory.
    #[inline]
    pub fn cr3(&self) -> Option<FrameNumber> {
        self.cr3
    }

    /// Load a page directory. Reloading the same directory keeps the cache.
    pub fn load_cr3(&mut self, pgdir: FrameNumber) {
        if self.cr3 != Some(pgdir) {
            self.cr3 = Some(pgdir);
            self.flush();
        }
    }

    /// Drop every cached translation.
    pub fn flush(&mut self) {
        self.tlb.clear();
        self.stats.flushes += 1;
    }

    /// Drop the cached translation of one page, if any.
    pub fn invalidate(&mut self, va: VirtAddr) {
        let vpn = va.vpn();
        self.tlb.retain(|e| e.vpn != vpn);
    }

    /// Number of cached translations.
    #[inline]
    pub fn cached(&self) -> usize {
        self.tlb.len()
    }

    #[inline]
    pub fn stats(&self) -> TlbStats {
        self.stats
    }

    fn lookup(&self, vpn: usize) -> Option<TlbEntry> {
        self.tlb.iter().find(|e| e.vpn == vpn).copied()
    }

    fn fill(&mut self, entry: TlbEntry) {
        self.tlb.retain(|e| e.vpn != entry.vpn);
        if self.tlb.len() == self.capacity {
            self.tlb.remove(0);
        }
        self.tlb.push(entry);
    }
}

impl Machine {
    /// Translate a virtual address through the loaded page directory.
    ///
    /// A failed translation latches the faulting address in CR2.
    ///
    /// # Panics
    /// Panics if paging is not enabled or a directory entry points
    /// outside physical memory.
    pub fn translate(&mut self, va: VirtAddr, access: Access) -> Result<PhysAddr, PageFault> {
        let result = self.walk(va, access);
        if let Err(fault) = result {
            self.mmu.cr2 = fault.va;
        }
        result
    }

    fn walk(&mut self, va: VirtAddr, access: Access) -> Result<PhysAddr, PageFault> {
        let pgdir = match self.mmu.cr3 {
            Some(pgdir) => pgdir,
            None => panic!("translate {} with paging disabled", va),
        };
        let offset = va.page_offset() as u32;

        if let Some(e) = self.mmu.lookup(va.vpn()) {
            let allowed = (!access.user || e.user) && (!access.write || e.writable);
            if allowed && (!access.write || e.dirty) {
                self.mmu.stats.hits += 1;
                return Ok(e.frame.add(offset));
            }
        }
        self.mmu.stats.misses += 1;

        let not_present = PageFault { va, err: access.error_bits() };
        let protection = PageFault { va, err: access.error_bits() | FEC_PR };

        let pde = self.mem.entry(pgdir, va.pdx());
        if !pde.is_present() {
            return Err(not_present);
        }
        let table = match self.mem.frame_of(pde.addr()) {
            Some(table) => table,
            None => panic!("directory entry {:?} for {} outside physical memory", pde, va),
        };
        let pte = self.mem.entry(table, va.ptx());
        if !pte.is_present() {
            return Err(not_present);
        }

        let user = pde.flags().is_user() && pte.flags().is_user();
        let writable = pde.flags().is_writable() && pte.flags().is_writable();
        if (access.user && !user) || (access.write && !writable) {
            return Err(protection);
        }

        let mut pte_flags = pte.flags() | PteFlags::ACCESSED;
        if access.write {
            pte_flags |= PteFlags::DIRTY;
        }
        self.mem.set_entry(
            pgdir,
            va.pdx(),
            PageTableEntry::from_raw(pde.raw() | PteFlags::ACCESSED.bits()),
        );
        self.mem.set_entry(
            table,
            va.ptx(),
            PageTableEntry::from_raw(pte.addr().as_u32() | pte_flags.bits()),
        );

        self.mmu.fill(TlbEntry {
            vpn: va.vpn(),
            frame: pte.addr(),
            user,
            writable,
            dirty: pte_flags.is_dirty(),
        });
        Ok(pte.addr().add(offset))
    }

    /// Read through the MMU. Nothing is copied unless every page translates.
    pub fn read_virt(&mut self, va: VirtAddr, buf: &mut [u8], user: bool) -> Result<(), PageFault> {
        let access = Access { write: false, user };
        let chunks = self.translate_range(va, buf.len(), access)?;
        let mut done = 0;
        for (pa, n) in chunks {
            // translated addresses are inside physical memory
            let _ = self.mem.read_phys(pa, &mut buf[done..done + n]);
            done += n;
        }
        Ok(())
    }

    /// Write through the MMU. Nothing is written unless every page translates.
    pub fn write_virt(&mut self, va: VirtAddr, data: &[u8], user: bool) -> Result<(), PageFault> {
        let access = Access { write: true, user };
        let chunks = self.translate_range(va, data.len(), access)?;
        let mut done = 0;
        for (pa, n) in chunks {
            let _ = self.mem.write_phys(pa, &data[done..done + n]);
            done += n;
        }
        Ok(())
    }

    fn translate_range(
        &mut self,
        va: VirtAddr,
        len: usize,
        access: Access,
    ) -> Result<Vec<(PhysAddr, usize)>, PageFault> {
        let mut chunks = Vec::new();
        let mut cur = va;
        let mut left = len;
        while left > 0 {
            let n = (PGSIZE - cur.page_offset()).min(left);
            let pa = self.translate(cur, access)?;
            chunks.push((pa, n));
            cur = cur.add(n as u32);
            left -= n;
        }
        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memlayout::UTEXT;

    fn machine_with_page(flags: PteFlags) -> (Machine, FrameNumber, FrameNumber) {
        let mut m = Machine::new(16, 8);
        let pgdir = m.mem.alloc().unwrap();
        m.mem.retain(pgdir).unwrap();
        let page = m.mem.alloc().unwrap();
        m.page_insert(pgdir, page, VirtAddr::new(UTEXT), flags).unwrap();
        m.mmu.load_cr3(pgdir);
        (m, pgdir, page)
    }

    #[test]
    fn test_user_read_of_read_only_page() {
        let (mut m, _, page) = machine_with_page(PteFlags::USER_RO);
        let pa = m.translate(VirtAddr::new(UTEXT + 8), Access::USER_READ).unwrap();
        assert_eq!(pa, page.addr().add(8));
    }

    #[test]
    fn test_write_to_read_only_is_protection_fault() {
        let (mut m, _, _) = machine_with_page(PteFlags::USER_COW);
        let fault = m.translate(VirtAddr::new(UTEXT), Access::USER_WRITE).unwrap_err();
        assert_eq!(fault.err, FEC_PR | FEC_WR | FEC_U);
        assert_eq!(fault.va, VirtAddr::new(UTEXT));
        assert_eq!(m.mmu.cr2(), VirtAddr::new(UTEXT));
    }

    #[test]
    fn test_unmapped_is_not_present_fault() {
        let (mut m, _, _) = machine_with_page(PteFlags::USER_RW);
        let fault = m.translate(VirtAddr::new(UTEXT + PGSIZE as u32), Access::USER_READ).unwrap_err();
        assert_eq!(fault.err, FEC_U);
        let fault = m.translate(VirtAddr::new(0x1000_0000), Access::KERNEL_WRITE).unwrap_err();
        assert_eq!(fault.err, FEC_WR);
    }

    #[test]
    fn test_kernel_only_page_rejects_user() {
        let (mut m, _, _) = machine_with_page(PteFlags::PRESENT | PteFlags::WRITABLE);
        assert!(m.translate(VirtAddr::new(UTEXT), Access::KERNEL_WRITE).is_ok());
        let fault = m.translate(VirtAddr::new(UTEXT), Access::USER_READ).unwrap_err();
        assert!(fault.was_present());
    }

    #[test]
    fn test_accessed_and_dirty_bits() {
        let (mut m, pgdir, _) = machine_with_page(PteFlags::USER_RW);
        let va = VirtAddr::new(UTEXT);
        m.translate(va, Access::USER_READ).unwrap();
        let flags = m.page_lookup(pgdir, va).unwrap().flags;
        assert!(flags.is_accessed() && !flags.is_dirty());
        m.translate(va, Access::USER_WRITE).unwrap();
        let flags = m.page_lookup(pgdir, va).unwrap().flags;
        assert!(flags.is_dirty());
    }

    #[test]
    fn test_cache_hit_and_reload_of_same_directory() {
        let (mut m, pgdir, _) = machine_with_page(PteFlags::USER_RW);
        let va = VirtAddr::new(UTEXT);
        m.translate(va, Access::USER_READ).unwrap();
        m.translate(va, Access::USER_READ).unwrap();
        assert_eq!(m.mmu.stats().hits, 1);
        m.mmu.load_cr3(pgdir);
        assert_eq!(m.mmu.cached(), 1);
    }

    #[test]
    fn test_write_spanning_pages_is_all_or_nothing() {
        let (mut m, _, page) = machine_with_page(PteFlags::USER_RW);
        let va = VirtAddr::new(UTEXT + PGSIZE as u32 - 2);
        let fault = m.write_virt(va, b"abcd", true).unwrap_err();
        assert_eq!(fault.va, VirtAddr::new(UTEXT + PGSIZE as u32));
        assert!(m.mem.page(page).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_cache_capacity_is_bounded() {
        let mut m = Machine::new(32, 2);
        let pgdir = m.mem.alloc().unwrap();
        m.mem.retain(pgdir).unwrap();
        for i in 0..4u32 {
            let page = m.mem.alloc().unwrap();
            m.page_insert(pgdir, page, VirtAddr::new(UTEXT + i * PGSIZE as u32), PteFlags::USER_RW)
                .unwrap();
        }
        m.mmu.load_cr3(pgdir);
        for i in 0..4u32 {
            m.translate(VirtAddr::new(UTEXT + i * PGSIZE as u32), Access::USER_READ).unwrap();
        }
        assert_eq!(m.mmu.cached(), 2);
    }
}

//! Page Directory Management
//!
//! High-level API for building and walking two-level page tables.
//!
//! # Guarantees
//! - `pgdir_walk` either installs a complete, zeroed page table or
//!   changes nothing
//! - `page_insert` takes the new reference before dropping the old one,
//!   so remapping a frame onto itself never frees it
//! - Every mapping change invalidates the cached translation of that
//!   page, and only when the directory is the loaded one
//! - `user_mem_check` validates whole byte ranges before the kernel
//!   touches memory named by a user

use crate::error::{KResult, KernelError};
use crate::memlayout::{
    pgaddr, round_down, PhysAddr, VirtAddr, NPDENTRIES, NPTENTRIES, PGSIZE, ULIM, UTOP, UVPT,
};

use super::frame::FrameNumber;
use super::paging::{PageTableEntry, PteFlags};
use super::Machine;

/// Location of a leaf entry: a page table frame and an index into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PteSlot {
    pub table: FrameNumber,
    pub index: usize,
}

/// Result of a successful lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    /// Frame the page maps to.
    pub frame: FrameNumber,
    /// Flags of the leaf entry, including hardware status bits.
    pub flags: PteFlags,
    /// Where the leaf entry lives.
    pub slot: PteSlot,
}

impl Machine {
    /// Find the leaf entry slot for `va`, optionally creating its page table.
    ///
    /// Returns `Ok(None)` when the page table is absent and `create` is
    /// false, `Err(NoMem)` when it cannot be allocated. A new page table
    /// is zeroed and referenced once by its directory entry.
    ///
    /// # Panics
    /// Panics if a present directory entry points outside physical memory.
    pub fn pgdir_walk(&mut self, pgdir: FrameNumber, va: VirtAddr, create: bool) -> KResult<Option<PteSlot>> {
        let pde = self.mem.entry(pgdir, va.pdx());
        if pde.is_present() {
            let table = match self.mem.frame_of(pde.addr()) {
                Some(table) => table,
                None => panic!("pgdir_walk: directory entry {:?} outside physical memory", pde),
            };
            return Ok(Some(PteSlot { table, index: va.ptx() }));
        }
        if !create {
            return Ok(None);
        }

        let table = self.mem.alloc()?;
        self.mem.retain(table)?;
        self.mem
            .set_entry(pgdir, va.pdx(), PageTableEntry::new(table.addr(), PteFlags::USER_TABLE));
        Ok(Some(PteSlot { table, index: va.ptx() }))
    }

    /// Map `frame` at `va` with permissions `perm | PRESENT`.
    ///
    /// Any existing mapping at `va` is removed. The new frame is
    /// retained before the old one is released.
    pub fn page_insert(&mut self, pgdir: FrameNumber, frame: FrameNumber, va: VirtAddr, perm: PteFlags) -> KResult<()> {
        let slot = self
            .pgdir_walk(pgdir, va, true)?
            .ok_or(KernelError::NoMem)?;

        self.mem.retain(frame)?;
        if self.mem.entry(slot.table, slot.index).is_present() {
            self.page_remove(pgdir, va);
        }
        let perm = perm.permissions() | PteFlags::PRESENT;
        self.mem
            .set_entry(slot.table, slot.index, PageTableEntry::new(frame.addr(), perm));
        self.tlb_invalidate(pgdir, va);
        Ok(())
    }

    /// Look up the mapping at `va` without changing anything.
    pub fn page_lookup(&self, pgdir: FrameNumber, va: VirtAddr) -> Option<Mapping> {
        let pde = self.mem.entry(pgdir, va.pdx());
        if !pde.is_present() {
            return None;
        }
        let table = self.mem.frame_of(pde.addr())?;
        let pte = self.mem.entry(table, va.ptx());
        if !pte.is_present() {
            return None;
        }
        let frame = match self.mem.frame_of(pte.addr()) {
            Some(frame) => frame,
            None => panic!("page_lookup: entry {:?} for {} outside physical memory", pte, va),
        };
        Some(Mapping {
            frame,
            flags: pte.flags(),
            slot: PteSlot { table, index: va.ptx() },
        })
    }

    /// Unmap the page at `va`, if any, releasing its frame.
    pub fn page_remove(&mut self, pgdir: FrameNumber, va: VirtAddr) {
        let Some(mapping) = self.page_lookup(pgdir, va) else {
            return;
        };
        self.mem.release(mapping.frame);
        self.mem
            .set_entry(mapping.slot.table, mapping.slot.index, PageTableEntry::empty());
        self.tlb_invalidate(pgdir, va);
    }

    /// Invalidate the cached translation of `va`, but only if `pgdir`
    /// is the directory currently loaded.
    pub fn tlb_invalidate(&mut self, pgdir: FrameNumber, va: VirtAddr) {
        if self.mmu.cr3() == Some(pgdir) {
            self.mmu.invalidate(va);
        }
    }

    /// Rewrite the permission bits of an existing mapping in place.
    ///
    /// The frame and its reference count are untouched.
    pub fn set_permissions(&mut self, pgdir: FrameNumber, va: VirtAddr, perm: PteFlags) -> KResult<()> {
        let mapping = self.page_lookup(pgdir, va).ok_or(KernelError::Inval)?;
        let entry = self
            .mem
            .entry(mapping.slot.table, mapping.slot.index)
            .with_flags(perm.difference(PteFlags::MBZ) | PteFlags::PRESENT);
        self.mem.set_entry(mapping.slot.table, mapping.slot.index, entry);
        self.tlb_invalidate(pgdir, va);
        Ok(())
    }

    /// Map `[la, la + size)` to `[pa, pa + size)` without touching
    /// reference counts. Only for the kernel's static window.
    pub fn boot_map_segment(&mut self, pgdir: FrameNumber, la: VirtAddr, size: usize, pa: PhysAddr, perm: PteFlags) -> KResult<()> {
        let mut off = 0;
        while off < size {
            let va = la.add(off as u32);
            let slot = self
                .pgdir_walk(pgdir, va, true)?
                .ok_or(KernelError::NoMem)?;
            let entry = PageTableEntry::new(pa.add(off as u32), perm | PteFlags::PRESENT);
            self.mem.set_entry(slot.table, slot.index, entry);
            off += PGSIZE;
        }
        Ok(())
    }

    /// Map the directory itself at UVPT, read-only for users.
    ///
    /// The self-map is not counted as a reference to the directory.
    pub fn install_vpt(&mut self, pgdir: FrameNumber) {
        let entry = PageTableEntry::new(pgdir.addr(), PteFlags::PRESENT | PteFlags::USER);
        self.mem.set_entry(pgdir, VirtAddr::new(UVPT).pdx(), entry);
    }

    /// Copy the directory entries at and above UTOP from `src` into `dst`.
    ///
    /// The page tables behind them are shared, not referenced.
    pub fn share_kernel_tables(&mut self, src: FrameNumber, dst: FrameNumber) {
        for pdx in VirtAddr::new(UTOP).pdx()..NPDENTRIES {
            let pde = self.mem.entry(src, pdx);
            self.mem.set_entry(dst, pdx, pde);
        }
    }

    /// Unmap every user page below UTOP and free the page tables that
    /// held them. Entries at and above UTOP are left alone.
    pub fn clear_user_space(&mut self, pgdir: FrameNumber) {
        for pdx in 0..VirtAddr::new(UTOP).pdx() {
            let pde = self.mem.entry(pgdir, pdx);
            if !pde.is_present() {
                continue;
            }
            let table = match self.mem.frame_of(pde.addr()) {
                Some(table) => table,
                None => panic!("clear_user_space: directory entry {:?} outside physical memory", pde),
            };
            for ptx in 0..NPTENTRIES {
                if self.mem.entry(table, ptx).is_present() {
                    self.page_remove(pgdir, VirtAddr::new(pgaddr(pdx, ptx, 0)));
                }
            }
            self.mem.set_entry(pgdir, pdx, PageTableEntry::empty());
            self.mem.release(table);
        }
        if self.mmu.cr3() == Some(pgdir) {
            self.mmu.flush();
        }
    }

    /// Check that `[va, va + len)` is mapped with at least `perm | PRESENT`
    /// and lies below ULIM.
    ///
    /// On failure returns the first offending address: `va` itself if
    /// the first page fails, otherwise the start of the failing page.
    pub fn user_mem_check(&self, pgdir: FrameNumber, va: VirtAddr, len: usize, perm: PteFlags) -> Result<(), VirtAddr> {
        if len == 0 {
            return Ok(());
        }
        let need = perm | PteFlags::PRESENT;
        let start = round_down(va.as_u32(), PGSIZE as u32) as u64;
        let end = va.as_u32() as u64 + len as u64;

        let mut page = start;
        while page < end {
            let bad = VirtAddr::new(page.max(va.as_u32() as u64) as u32);
            if page >= ULIM as u64 {
                return Err(bad);
            }
            match self.page_lookup(pgdir, VirtAddr::new(page as u32)) {
                Some(m) if m.flags.contains(need) => {}
                _ => return Err(bad),
            }
            page += PGSIZE as u64;
        }
        Ok(())
    }

    /// Physical address `va` maps to in `pgdir`, ignoring permissions.
    pub fn va2pa(&self, pgdir: FrameNumber, va: VirtAddr) -> Option<PhysAddr> {
        self.page_lookup(pgdir, va)
            .map(|m| m.frame.addr().add(va.page_offset() as u32))
    }

    /// Copy out of an address space without the MMU. The caller must
    /// have validated the range.
    pub fn copy_from(&self, pgdir: FrameNumber, va: VirtAddr, buf: &mut [u8]) -> KResult<()> {
        let mut done = 0;
        while done < buf.len() {
            let cur = va.add(done as u32);
            let n = (PGSIZE - cur.page_offset()).min(buf.len() - done);
            let pa = self.va2pa(pgdir, cur).ok_or(KernelError::Fault)?;
            self.mem.read_phys(pa, &mut buf[done..done + n])?;
            done += n;
        }
        Ok(())
    }

    /// Copy into an address space without the MMU. The caller must have
    /// validated the range.
    pub fn copy_to(&mut self, pgdir: FrameNumber, va: VirtAddr, data: &[u8]) -> KResult<()> {
        let mut done = 0;
        while done < data.len() {
            let cur = va.add(done as u32);
            let n = (PGSIZE - cur.page_offset()).min(data.len() - done);
            let pa = self.va2pa(pgdir, cur).ok_or(KernelError::Fault)?;
            self.mem.write_phys(pa, &data[done..done + n])?;
            done += n;
        }
        Ok(())
    }
}

//! Physical Frame Allocator
//!
//! Manages emulated physical memory as an arena of 4 KiB frames indexed
//! by frame number, with a reference count and an intrusive free list.
//!
//! # Design
//! - Each slot holds the frame's bytes, its reference count and a link
//!   to the next free frame
//! - Page tables and page directories live inside frames like any other
//!   data, so exhausting memory also exhausts page-table space
//! - Cross references are frame numbers, bounds-checked on every access
//!
//! # Invariants
//! - A frame with reference count zero is either on the free list or
//!   has just been handed out by `alloc` and not yet mapped
//! - A frame referenced by N page table entries has reference count N
//! - All allocated frames are zeroed before they are returned
//! - Freeing a frame that is still referenced, or freeing twice, panics

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;

use crate::error::{KResult, KernelError};
use crate::memlayout::{PhysAddr, NPTENTRIES, PGSIZE};

use super::paging::PageTableEntry;

/// Index of a physical frame in the arena.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FrameNumber(u32);

impl FrameNumber {
    /// Frame containing the given physical address.
    #[inline]
    pub const fn containing(pa: PhysAddr) -> Self {
        Self(pa.ppn() as u32)
    }

    /// Raw index.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Physical address of the first byte of the frame.
    #[inline]
    pub const fn addr(self) -> PhysAddr {
        PhysAddr::from_ppn(self.0 as usize)
    }
}

impl fmt::Debug for FrameNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({})", self.0)
    }
}

type Page = [u8; PGSIZE];

/// One frame slot in the arena.
struct FrameSlot {
    /// Frame contents, materialized on first allocation.
    data: Option<Box<Page>>,
    /// Number of page table entries (or owners) referencing this frame.
    refcount: u16,
    /// Next frame on the free list.
    next_free: Option<FrameNumber>,
    /// Whether the frame currently sits on the free list.
    on_free_list: bool,
}

/// Emulated physical memory with reference-counted frames.
pub struct PhysMemory {
    frames: Vec<FrameSlot>,
    free_head: Option<FrameNumber>,
    free_count: usize,
}

impl PhysMemory {
    /// Build `nframes` frames of physical memory.
    ///
    /// Frame 0 is reserved (it would hold the real-mode IDT and BIOS
    /// structures) and never handed out. The remaining frames go on the
    /// free list so that lower frames are allocated first.
    ///
    /// # Panics
    /// Panics if fewer than two frames are requested.
    pub fn new(nframes: usize) -> Self {
        assert!(nframes >= 2, "need at least two physical frames");

        let mut frames = Vec::with_capacity(nframes);
        for _ in 0..nframes {
            frames.push(FrameSlot {
                data: None,
                refcount: 0,
                next_free: None,
                on_free_list: false,
            });
        }
        frames[0].refcount = 1;

        let mut mem = Self {
            frames,
            free_head: None,
            free_count: 0,
        };
        for i in (1..nframes).rev() {
            mem.push_free(FrameNumber(i as u32));
        }
        mem
    }

    /// Total number of frames under management.
    #[inline]
    pub fn nframes(&self) -> usize {
        self.frames.len()
    }

    /// Number of frames on the free list.
    #[inline]
    pub fn free_count(&self) -> usize {
        self.free_count
    }

    /// Validate a physical address and return its frame.
    pub fn frame_of(&self, pa: PhysAddr) -> Option<FrameNumber> {
        let frame = FrameNumber::containing(pa);
        (frame.index() < self.frames.len()).then_some(frame)
    }

    #[inline]
    fn slot(&self, frame: FrameNumber) -> &FrameSlot {
        match self.frames.get(frame.index()) {
            Some(slot) => slot,
            None => panic!("frame {:?} outside physical memory", frame),
        }
    }

    #[inline]
    fn slot_mut(&mut self, frame: FrameNumber) -> &mut FrameSlot {
        let nframes = self.frames.len();
        match self.frames.get_mut(frame.index()) {
            Some(slot) => slot,
            None => panic!("frame {:?} outside physical memory ({} frames)", frame, nframes),
        }
    }

    fn push_free(&mut self, frame: FrameNumber) {
        let head = self.free_head;
        let slot = self.slot_mut(frame);
        slot.next_free = head;
        slot.on_free_list = true;
        self.free_head = Some(frame);
        self.free_count += 1;
    }

    /// Allocate a single zeroed frame.
    ///
    /// The reference count of the returned frame is zero; mapping it
    /// (or otherwise retaining it) is the caller's job. Running out of
    /// frames is reported, never fatal.
    pub fn alloc(&mut self) -> KResult<FrameNumber> {
        let frame = match self.free_head {
            Some(frame) => frame,
            None => {
                log::warn!("physical memory exhausted");
                return Err(KernelError::NoMem);
            }
        };

        let slot = self.slot_mut(frame);
        let next = slot.next_free.take();
        slot.on_free_list = false;
        debug_assert_eq!(slot.refcount, 0);
        match slot.data.as_mut() {
            Some(data) => data.fill(0),
            None => slot.data = Some(Box::new([0u8; PGSIZE])),
        }

        self.free_head = next;
        self.free_count -= 1;
        log::trace!("alloc {:?}", frame);
        Ok(frame)
    }

    /// Return a frame to the free list.
    ///
    /// # Panics
    /// Panics if the frame is still referenced or already free.
    pub fn free(&mut self, frame: FrameNumber) {
        let slot = self.slot(frame);
        if slot.on_free_list {
            panic!("double free of {:?}", frame);
        }
        if slot.refcount != 0 {
            panic!("freeing {:?} with reference count {}", frame, slot.refcount);
        }
        self.push_free(frame);
        log::trace!("free {:?}", frame);
    }

    /// Take one more reference to a frame.
    ///
    /// Fails with `NoMem` once the count is saturated; the count is left
    /// unchanged.
    pub fn retain(&mut self, frame: FrameNumber) -> KResult<()> {
        let slot = self.slot_mut(frame);
        if slot.on_free_list {
            panic!("retaining free {:?}", frame);
        }
        match slot.refcount.checked_add(1) {
            Some(n) => {
                slot.refcount = n;
                Ok(())
            }
            None => {
                log::warn!("reference count of {:?} saturated", frame);
                Err(KernelError::NoMem)
            }
        }
    }

    /// Drop one reference; the frame goes back to the free list at zero.
    ///
    /// Returns `true` if the frame was freed.
    pub fn release(&mut self, frame: FrameNumber) -> bool {
        let slot = self.slot_mut(frame);
        if slot.refcount == 0 {
            panic!("releasing unreferenced {:?}", frame);
        }
        slot.refcount -= 1;
        if slot.refcount == 0 {
            self.free(frame);
            true
        } else {
            false
        }
    }

    /// Current reference count.
    #[inline]
    pub fn refcount(&self, frame: FrameNumber) -> u16 {
        self.slot(frame).refcount
    }

    /// Whether the frame sits on the free list.
    #[inline]
    pub fn is_free(&self, frame: FrameNumber) -> bool {
        self.slot(frame).on_free_list
    }

    /// Frame contents. Never-allocated frames read as zero.
    pub fn page(&self, frame: FrameNumber) -> &[u8] {
        static ZERO_PAGE: Page = [0u8; PGSIZE];
        match &self.slot(frame).data {
            Some(data) => &data[..],
            None => &ZERO_PAGE[..],
        }
    }

    /// Mutable frame contents.
    pub fn page_mut(&mut self, frame: FrameNumber) -> &mut [u8] {
        let slot = self.slot_mut(frame);
        &mut slot.data.get_or_insert_with(|| Box::new([0u8; PGSIZE]))[..]
    }

    /// Read entry `index` of the page table stored in `frame`.
    pub fn entry(&self, frame: FrameNumber, index: usize) -> PageTableEntry {
        assert!(index < NPTENTRIES, "page table index {} out of range", index);
        let off = index * 4;
        let bytes = &self.page(frame)[off..off + 4];
        PageTableEntry::from_raw(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Write entry `index` of the page table stored in `frame`.
    pub fn set_entry(&mut self, frame: FrameNumber, index: usize, entry: PageTableEntry) {
        assert!(index < NPTENTRIES, "page table index {} out of range", index);
        let off = index * 4;
        self.page_mut(frame)[off..off + 4].copy_from_slice(&entry.raw().to_le_bytes());
    }

    /// Copy bytes out of physical memory, possibly spanning frames.
    pub fn read_phys(&self, pa: PhysAddr, buf: &mut [u8]) -> KResult<()> {
        let mut pa = pa;
        let mut done = 0;
        while done < buf.len() {
            let frame = self.frame_of(pa).ok_or(KernelError::Fault)?;
            let off = pa.page_offset();
            let n = (PGSIZE - off).min(buf.len() - done);
            buf[done..done + n].copy_from_slice(&self.page(frame)[off..off + n]);
            done += n;
            pa = pa.add(n as u32);
        }
        Ok(())
    }

    /// Copy bytes into physical memory, possibly spanning frames.
    pub fn write_phys(&mut self, pa: PhysAddr, data: &[u8]) -> KResult<()> {
        let mut pa = pa;
        let mut done = 0;
        while done < data.len() {
            let frame = self.frame_of(pa).ok_or(KernelError::Fault)?;
            let off = pa.page_offset();
            let n = (PGSIZE - off).min(data.len() - done);
            self.page_mut(frame)[off..off + n].copy_from_slice(&data[done..done + n]);
            done += n;
            pa = pa.add(n as u32);
        }
        Ok(())
    }
}

//! System Call Input Validation
//!
//! # Principles
//! - Validate ALL inputs before use
//! - Deny by default: unknown permission bits are rejected, not masked
//! - User buffers are copied into the kernel only after the whole range
//!   has been checked against the caller's page tables

use alloc::vec;
use alloc::vec::Vec;

use crate::error::{KResult, KernelError};
use crate::memlayout::{VirtAddr, UTOP};
use crate::mm::{FrameNumber, Machine, PteFlags};

/// Validate permission bits passed to `page_alloc` or `page_map`.
///
/// Present and User must be set; only `PteFlags::SYSCALL` bits are
/// allowed; Writable and copy-on-write exclude each other.
pub fn check_perm(perm: u32) -> KResult<PteFlags> {
    let flags = PteFlags::from_bits(perm).ok_or(KernelError::Inval)?;
    if !PteFlags::SYSCALL.contains(flags) {
        return Err(KernelError::Inval);
    }
    if !flags.contains(PteFlags::PRESENT | PteFlags::USER) {
        return Err(KernelError::Inval);
    }
    if flags.is_writable() && flags.is_cow() {
        return Err(KernelError::Inval);
    }
    Ok(flags)
}

/// Validate a page address named by a user: below UTOP and page-aligned.
pub fn check_user_page(va: u32) -> KResult<VirtAddr> {
    let va = VirtAddr::new(va);
    if !va.is_user() || !va.is_aligned() {
        return Err(KernelError::Inval);
    }
    Ok(va)
}

/// A user byte range the kernel has checked against a page directory.
///
/// Only constructible through `UserBuffer::new`, so holding one means
/// every page of the range was mapped with the required permissions at
/// the time of the check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserBuffer {
    pgdir: FrameNumber,
    va: VirtAddr,
    len: usize,
}

impl UserBuffer {
    /// Check `[va, va + len)` in `pgdir` for `perm | USER`.
    ///
    /// On failure returns the first address that failed the check.
    pub fn new(machine: &Machine, pgdir: FrameNumber, va: u32, len: usize, perm: PteFlags) -> Result<Self, VirtAddr> {
        let va = VirtAddr::new(va);
        machine.user_mem_check(pgdir, va, len, perm | PteFlags::USER)?;
        Ok(Self { pgdir, va, len })
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy the buffer into the kernel.
    pub fn read(&self, machine: &Machine) -> KResult<Vec<u8>> {
        let mut bytes = vec![0u8; self.len];
        machine.copy_from(self.pgdir, self.va, &mut bytes)?;
        Ok(bytes)
    }
}

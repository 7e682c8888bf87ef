//! User Environments (Processes)
//!
//! A fixed table of `NENV` process slots. Identifiers carry a
//! generation counter above the slot index, so an identifier that
//! outlives its process never resolves to the slot's next occupant.
//!
//! # Lifecycle
//! ```text
//! Free --env_alloc--> Runnable <--env_run/yield--> Running
//!                        ^  |                         |
//!            set_status  |  v set_status              | destroyed inside a trap
//!                    NotRunnable                      v
//!                                                   Dying --trap exit--> Free
//! ```
//! Any process other than the one inside the trap path is freed
//! immediately when destroyed.

use alloc::vec::Vec;
use core::fmt;

use crate::error::{KResult, KernelError};
use crate::kernel::{Kernel, TrapState};
use crate::memlayout::{VirtAddr, PGSIZE, USTACKTOP};
use crate::mm::{FrameNumber, PteFlags};
use crate::trap::Trapframe;

/// log2 of the process table size.
pub const LOG2NENV: u32 = 10;
/// Process table size.
pub const NENV: usize = 1 << LOG2NENV;
/// Generation counter position inside an identifier.
const ENVGENSHIFT: u32 = 12;

/// Process identifier: `generation << 12 | slot`.
///
/// `EnvId::CURRENT` (zero) stands for the calling process in system
/// calls; real identifiers are always positive.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EnvId(i32);

impl EnvId {
    pub const CURRENT: Self = Self(0);

    #[inline]
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> i32 {
        self.0
    }

    /// Process table slot this identifier names.
    #[inline]
    pub const fn slot(self) -> usize {
        (self.0 as u32 as usize) & (NENV - 1)
    }

    /// Identifier for the next occupant of `slot`, given the previous one.
    fn next(prev: EnvId, slot: usize) -> Self {
        let mut generation = prev.0.wrapping_add(1 << ENVGENSHIFT) & !(NENV as i32 - 1);
        if generation <= 0 {
            generation = 1 << ENVGENSHIFT;
        }
        Self(generation | slot as i32)
    }
}

impl fmt::Debug for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EnvId({:08x})", self.0)
    }
}

impl fmt::Display for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Process status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EnvStatus {
    Free = 0,
    Dying = 1,
    Runnable = 2,
    Running = 3,
    NotRunnable = 4,
}

impl EnvStatus {
    /// Decode the status word passed to `env_set_status`.
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Free),
            1 => Some(Self::Dying),
            2 => Some(Self::Runnable),
            3 => Some(Self::Running),
            4 => Some(Self::NotRunnable),
            _ => None,
        }
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self as u32
    }
}

/// One process slot.
#[derive(Debug, Clone)]
pub struct Env {
    /// Saved user registers.
    pub tf: Trapframe,
    pub id: EnvId,
    /// Creator, or `EnvId::CURRENT` for processes the kernel made.
    pub parent_id: EnvId,
    pub status: EnvStatus,
    /// Times this process was put on the CPU.
    pub runs: u32,
    /// Page directory, present while the slot is in use.
    pub pgdir: Option<FrameNumber>,
    /// User-mode page fault entry point.
    pub pgfault_upcall: Option<VirtAddr>,
}

impl Env {
    fn empty() -> Self {
        Self {
            tf: Trapframe::default(),
            id: EnvId::CURRENT,
            parent_id: EnvId::CURRENT,
            status: EnvStatus::Free,
            runs: 0,
            pgdir: None,
            pgfault_upcall: None,
        }
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.status == EnvStatus::Free
    }

    /// Eligible for the CPU.
    #[inline]
    pub fn is_runnable(&self) -> bool {
        matches!(self.status, EnvStatus::Runnable | EnvStatus::Running)
    }
}

/// The process table and its free list.
pub struct EnvTable {
    envs: Vec<Env>,
    /// Free slots; the last element is handed out next.
    free: Vec<usize>,
}

impl EnvTable {
    pub fn new() -> Self {
        Self {
            envs: (0..NENV).map(|_| Env::empty()).collect(),
            free: (0..NENV).rev().collect(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.envs.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.envs.is_empty()
    }

    /// # Panics
    /// Panics if `slot` is out of range.
    #[inline]
    pub fn get(&self, slot: usize) -> &Env {
        &self.envs[slot]
    }

    #[inline]
    pub fn get_mut(&mut self, slot: usize) -> &mut Env {
        &mut self.envs[slot]
    }

    #[inline]
    pub fn status(&self, slot: usize) -> EnvStatus {
        self.envs[slot].status
    }

    /// Slots that are not free, in table order.
    pub fn live(&self) -> impl Iterator<Item = (usize, &Env)> {
        self.envs.iter().enumerate().filter(|(_, e)| !e.is_free())
    }

    fn peek_free(&self) -> Option<usize> {
        self.free.last().copied()
    }

    fn claim(&mut self) -> Option<usize> {
        self.free.pop()
    }

    fn release(&mut self, slot: usize) {
        debug_assert!(!self.free.contains(&slot));
        self.free.push(slot);
    }
}

impl Default for EnvTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel {
    /// Build a fresh address space: kernel entries shared, user part
    /// empty, its own UVPT self-map.
    fn env_setup_vm(&mut self) -> KResult<FrameNumber> {
        let pgdir = self.machine.mem.alloc()?;
        self.machine.mem.retain(pgdir)?;
        self.machine.share_kernel_tables(self.kern_pgdir, pgdir);
        self.machine.install_vpt(pgdir);
        Ok(pgdir)
    }

    /// Allocate and initialize a process slot.
    ///
    /// The new process is Runnable with an empty user address space and
    /// registers set up to start on the normal user stack.
    pub(crate) fn env_alloc(&mut self, parent_id: EnvId) -> KResult<usize> {
        if self.envs.peek_free().is_none() {
            return Err(KernelError::NoFreeEnv);
        }
        let pgdir = self.env_setup_vm()?;
        let slot = self.envs.claim().ok_or(KernelError::NoFreeEnv)?;

        let env = self.envs.get_mut(slot);
        env.id = EnvId::next(env.id, slot);
        env.parent_id = parent_id;
        env.status = EnvStatus::Runnable;
        env.runs = 0;
        env.pgdir = Some(pgdir);
        env.pgfault_upcall = None;
        env.tf = Trapframe::user(USTACKTOP);
        let id = env.id;

        log::info!("[{}] new env {}", self.curenv().unwrap_or_default(), id);
        Ok(slot)
    }

    /// Create a Runnable process with one zeroed stack page below
    /// USTACKTOP.
    pub fn env_create(&mut self) -> KResult<EnvId> {
        let slot = self.env_alloc(EnvId::CURRENT)?;
        let pgdir = self.envs.get(slot).pgdir.ok_or(KernelError::BadEnv)?;
        let stack = VirtAddr::new(USTACKTOP - PGSIZE as u32);

        let mapped = match self.machine.mem.alloc() {
            Ok(frame) => {
                let r = self.machine.page_insert(pgdir, frame, stack, PteFlags::USER_RW);
                if r.is_err() {
                    self.machine.mem.free(frame);
                }
                r
            }
            Err(e) => Err(e),
        };
        if let Err(e) = mapped {
            self.env_free(slot);
            return Err(e);
        }
        Ok(self.envs.get(slot).id)
    }

    /// Tear down a process: unmap its user memory, free its page tables
    /// and directory, and return the slot to the free list.
    ///
    /// # Panics
    /// Panics if the slot is already free.
    pub(crate) fn env_free(&mut self, slot: usize) {
        let env = self.envs.get(slot);
        let id = env.id;
        let pgdir = match env.pgdir {
            Some(pgdir) => pgdir,
            None => panic!("env_free: env {} has no page directory", id),
        };

        if self.machine.mmu.cr3() == Some(pgdir) {
            self.machine.mmu.load_cr3(self.kern_pgdir);
        }
        self.machine.clear_user_space(pgdir);
        self.machine.mem.release(pgdir);

        log::info!("[{}] free env {}", self.curenv().unwrap_or_default(), id);

        let env = self.envs.get_mut(slot);
        env.pgdir = None;
        env.status = EnvStatus::Free;
        env.pgfault_upcall = None;
        self.envs.release(slot);
        if self.curenv == Some(slot) {
            self.curenv = None;
        }
    }

    /// Destroy a process.
    ///
    /// The process inside the trap path is only marked Dying and is
    /// reaped when the trap returns; any other is freed right away.
    pub fn env_destroy(&mut self, id: EnvId) -> KResult<()> {
        let slot = self.envid2env(id, false)?;
        self.env_destroy_slot(slot);
        Ok(())
    }

    pub(crate) fn env_destroy_slot(&mut self, slot: usize) {
        let in_trap = self.trap_state != TrapState::Idle;
        if in_trap && self.curenv == Some(slot) {
            self.envs.get_mut(slot).status = EnvStatus::Dying;
        } else if self.envs.status(slot) != EnvStatus::Free {
            self.env_free(slot);
        }
    }

    /// Context switch to a process: it becomes Running and its address
    /// space is loaded.
    ///
    /// # Panics
    /// Panics if the process is not runnable.
    pub(crate) fn env_run(&mut self, slot: usize) {
        let env = self.envs.get(slot);
        if !env.is_runnable() {
            panic!("env_run: env {} is {:?}", env.id, env.status);
        }
        let pgdir = match env.pgdir {
            Some(pgdir) => pgdir,
            None => panic!("env_run: env {} has no page directory", env.id),
        };

        if let Some(prev) = self.curenv {
            if prev != slot && self.envs.status(prev) == EnvStatus::Running {
                self.envs.get_mut(prev).status = EnvStatus::Runnable;
            }
        }
        self.curenv = Some(slot);
        self.last_run = Some(slot);
        let env = self.envs.get_mut(slot);
        env.status = EnvStatus::Running;
        env.runs += 1;
        self.machine.mmu.load_cr3(pgdir);
        log::trace!("run env {}", self.envs.get(slot).id);
    }
}

//! Kernel Context
//!
//! Everything the kernel would otherwise keep in globals: the machine,
//! the kernel page directory, the process table, the current process,
//! the console and the dispatcher state. Every entry point (`trap`,
//! `sched_yield`, the monitor, process management) is a method on this
//! object.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;

use crate::config::KernelConfig;
use crate::console::Console;
use crate::env::{Env, EnvId, EnvTable};
use crate::error::{KResult, KernelError};
use crate::memlayout::{PhysAddr, VirtAddr, KERNBASE, PGSIZE, UTEXT};
use crate::mm::{FrameNumber, Machine, PteFlags};
use crate::trap::Trapframe;
use crate::user::PgfaultHandler;

/// Where the emulated program text starts. Linked handlers get entry
/// addresses from here up.
const TEXT_BASE: u32 = UTEXT;
/// Distance between consecutive linked entry points.
const TEXT_ALIGN: u32 = 0x10;

/// Whole-system state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemState {
    /// Processes are being scheduled.
    Running,
    /// Nothing was left to run; control went to the monitor for good.
    Interactive,
}

/// Trap dispatcher state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapState {
    Idle,
    Dispatching,
    RunningHandler,
    Returning,
}

/// What the CPU does after the kernel is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    /// Return to user mode in this process.
    Env(EnvId),
    /// Return to the interrupted kernel code.
    Kernel(Trapframe),
    /// Nothing is runnable; the system is in the interactive fallback.
    Halted,
}

/// The kernel.
pub struct Kernel {
    pub(crate) config: KernelConfig,
    pub(crate) machine: Machine,
    pub(crate) kern_pgdir: FrameNumber,
    pub(crate) envs: EnvTable,
    pub(crate) curenv: Option<usize>,
    /// Slot most recently put on the CPU; survives that process's exit.
    pub(crate) last_run: Option<usize>,
    pub(crate) trap_state: TrapState,
    pub(crate) state: SystemState,
    pub(crate) reschedule: bool,
    pub(crate) console: Box<dyn Console>,
    text: BTreeMap<u32, PgfaultHandler>,
    symbols: BTreeMap<&'static str, VirtAddr>,
}

impl Kernel {
    /// Bring up the machine and the kernel address space.
    ///
    /// Physical memory is mapped at KERNBASE for the kernel only, and
    /// the kernel directory maps itself read-only at UVPT. Both mappings
    /// are static and carry no reference counts. The configured log
    /// level takes effect here; installing a sink is left to
    /// `logging::init`.
    pub fn boot(config: KernelConfig, console: Box<dyn Console>) -> KResult<Self> {
        config.validate()?;
        log::set_max_level(config.log_level);

        let mut machine = Machine::new(config.nframes, config.tlb_entries);
        let kern_pgdir = machine.mem.alloc()?;
        machine.mem.retain(kern_pgdir)?;
        machine.boot_map_segment(
            kern_pgdir,
            VirtAddr::new(KERNBASE),
            config.nframes * PGSIZE,
            PhysAddr::new(0),
            PteFlags::WRITABLE,
        )?;
        machine.install_vpt(kern_pgdir);
        machine.mmu.load_cr3(kern_pgdir);

        log::info!(
            "boot: {} frames, {} free after kernel mappings",
            machine.mem.nframes(),
            machine.mem.free_count()
        );

        Ok(Self {
            config,
            machine,
            kern_pgdir,
            envs: EnvTable::new(),
            curenv: None,
            last_run: None,
            trap_state: TrapState::Idle,
            state: SystemState::Running,
            reschedule: false,
            console,
            text: BTreeMap::new(),
            symbols: BTreeMap::new(),
        })
    }

    #[inline]
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    #[inline]
    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    #[inline]
    pub fn machine_mut(&mut self) -> &mut Machine {
        &mut self.machine
    }

    #[inline]
    pub fn kern_pgdir(&self) -> FrameNumber {
        self.kern_pgdir
    }

    #[inline]
    pub fn state(&self) -> SystemState {
        self.state
    }

    #[inline]
    pub fn trap_state(&self) -> TrapState {
        self.trap_state
    }

    /// The debug console.
    #[inline]
    pub fn console(&mut self) -> &mut dyn Console {
        &mut *self.console
    }

    /// Identifier of the process on the CPU, if any.
    pub fn curenv(&self) -> Option<EnvId> {
        self.curenv.map(|slot| self.envs.get(slot).id)
    }

    /// Look up a live process by identifier, without permission checks.
    pub fn env(&self, id: EnvId) -> Option<&Env> {
        let env = self.envs.get(id.slot());
        (env.id == id && !env.is_free()).then_some(env)
    }

    pub(crate) fn env_mut(&mut self, id: EnvId) -> Option<&mut Env> {
        let env = self.envs.get_mut(id.slot());
        (env.id == id && !env.is_free()).then_some(env)
    }

    /// Page directory loaded on the CPU.
    pub(crate) fn current_pgdir(&self) -> FrameNumber {
        self.machine.mmu.cr3().unwrap_or(self.kern_pgdir)
    }

    /// Place a fault handler in the emulated program text and return its
    /// entry address. Linking the same name twice returns the same entry.
    pub fn link(&mut self, name: &'static str, handler: PgfaultHandler) -> VirtAddr {
        if let Some(&entry) = self.symbols.get(name) {
            return entry;
        }
        let entry = VirtAddr::new(TEXT_BASE + self.text.len() as u32 * TEXT_ALIGN);
        self.text.insert(entry.as_u32(), handler);
        self.symbols.insert(name, entry);
        log::debug!("link {} at {}", name, entry);
        entry
    }

    /// Code at an entry address, if something was linked there.
    pub(crate) fn text(&self, eip: u32) -> Option<PgfaultHandler> {
        self.text.get(&eip).copied()
    }

    /// Symbol lookup for linked entry points.
    pub fn symbol(&self, name: &str) -> Option<VirtAddr> {
        self.symbols.get(name).copied()
    }

    /// Resolve an identifier for a system call.
    ///
    /// `0` names the caller. With `checkperm`, the target must be the
    /// caller or one of its immediate children.
    pub(crate) fn envid2env(&self, id: EnvId, checkperm: bool) -> KResult<usize> {
        if id == EnvId::CURRENT {
            return self.curenv.ok_or(KernelError::BadEnv);
        }
        let slot = id.slot();
        let env = self.envs.get(slot);
        if env.is_free() || env.id != id {
            return Err(KernelError::BadEnv);
        }
        if checkperm {
            let cur = self.curenv.ok_or(KernelError::BadEnv)?;
            if slot != cur && env.parent_id != self.envs.get(cur).id {
                return Err(KernelError::BadEnv);
            }
        }
        Ok(slot)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::console::{BufferConsole, ConsoleOutput};
    use crate::memlayout::{UVPT, ULIM};
    use crate::mm::Access;

    /// Every kernel booted by tests uses this level, since it is global.
    pub(crate) const TEST_LOG_LEVEL: &str = "debug";

    /// A small kernel with a scripted console.
    pub(crate) fn kernel_with_input(lines: &[&str]) -> (Kernel, ConsoleOutput) {
        let con = BufferConsole::with_input(lines.iter().copied());
        let out = con.output();
        let config = KernelConfig::default()
            .with_frames(256)
            .with_tlb_entries(16)
            .with_log_level(Some(TEST_LOG_LEVEL));
        let kernel = Kernel::boot(config, Box::new(con)).unwrap();
        (kernel, out)
    }

    pub(crate) fn kernel() -> (Kernel, ConsoleOutput) {
        kernel_with_input(&[])
    }

    #[test]
    fn test_boot_maps_kernel_window_for_supervisor_only() {
        let (mut k, _) = kernel();
        let pgdir = k.kern_pgdir();
        let m = k.machine_mut();
        let pa = m.translate(VirtAddr::new(KERNBASE + 0x5123), Access::KERNEL_WRITE).unwrap();
        assert_eq!(pa, PhysAddr::new(0x5123));
        assert!(m.translate(VirtAddr::new(KERNBASE), Access::USER_READ).is_err());
        let window = m.page_lookup(pgdir, VirtAddr::new(KERNBASE + 0x5000)).unwrap();
        assert_eq!(m.mem.refcount(window.frame), 0);
    }

    #[test]
    fn test_boot_self_map_is_read_only() {
        let (mut k, _) = kernel();
        let pgdir = k.kern_pgdir();
        let m = k.machine_mut();
        let uvpd = VirtAddr::new(UVPT + (UVPT >> 22) * PGSIZE as u32);
        let pa = m.translate(uvpd, Access::USER_READ).unwrap();
        assert_eq!(pa, pgdir.addr());
        assert!(m.translate(uvpd, Access::USER_WRITE).is_err());
        assert!(m.translate(VirtAddr::new(ULIM), Access::USER_READ).is_err());
    }

    #[test]
    fn test_boot_applies_log_level() {
        let (k, _) = kernel();
        assert_eq!(k.config().log_level, log::LevelFilter::Debug);
        assert_eq!(log::max_level(), log::LevelFilter::Debug);
    }

    #[test]
    fn test_boot_rejects_bad_config() {
        let config = KernelConfig::default().with_frames(2);
        assert!(Kernel::boot(config, Box::new(BufferConsole::new())).is_err());
    }

    fn noop(_: &mut crate::user::UserEnv<'_>, _: &crate::trap::UTrapframe) -> Result<(), crate::user::UserError> {
        Ok(())
    }

    #[test]
    fn test_link_is_idempotent_per_name() {
        let (mut k, _) = kernel();
        let a = k.link("noop", noop);
        let b = k.link("noop", noop);
        let c = k.link("other", noop);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(k.text(a.as_u32()).is_some());
        assert!(k.text(a.as_u32() + 1).is_none());
        assert_eq!(k.symbol("other"), Some(c));
    }
}

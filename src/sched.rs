//! Round-Robin Scheduler
//!
//! Slot 0 holds the idle process and is only chosen when no other slot
//! can run. With nothing runnable at all the system drops into the
//! monitor for good.

use crate::env::EnvStatus;
use crate::kernel::{Kernel, Resume, SystemState};
use crate::kprintln;

/// Pick the next slot to run.
///
/// Scans the `n` slots circularly, starting just after `prev`, and
/// returns the first one `status` reports as runnable, skipping slot 0.
/// `prev` itself comes last in the scan, so it is chosen again only
/// when nothing else can run. Falls back to slot 0, then to `None`.
pub fn round_robin<F>(n: usize, prev: Option<usize>, status: F) -> Option<usize>
where
    F: Fn(usize) -> EnvStatus,
{
    let runnable = |slot: usize| matches!(status(slot), EnvStatus::Runnable | EnvStatus::Running);
    let start = prev.unwrap_or(0);
    (1..=n)
        .map(|i| (start + i) % n)
        .find(|&slot| slot != 0 && runnable(slot))
        .or_else(|| (n > 0 && runnable(0)).then_some(0))
}

impl Kernel {
    /// Give the CPU to the next runnable process.
    ///
    /// The scan continues after the slot that ran last, even if that
    /// process has since been freed.
    ///
    /// With nothing left to run, reports it, unloads every user address
    /// space and hands the console to the monitor until its input runs
    /// out. The system then stays in `SystemState::Interactive`.
    pub fn sched_yield(&mut self) -> Resume {
        let envs = &self.envs;
        let next = round_robin(envs.len(), self.last_run, |slot| envs.status(slot));

        match next {
            Some(slot) => {
                self.env_run(slot);
                log::trace!("schedule env {}", self.envs.get(slot).id);
                Resume::Env(self.envs.get(slot).id)
            }
            None => {
                self.idle_fallback();
                Resume::Halted
            }
        }
    }

    fn idle_fallback(&mut self) {
        log::info!("no runnable environments");
        kprintln!(self.console, "Destroyed all environments - nothing more to do!");
        self.curenv = None;
        self.machine.mmu.load_cr3(self.kern_pgdir);
        self.state = SystemState::Interactive;
        self.monitor(None);
    }
}

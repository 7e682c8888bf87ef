//! Copy-on-Write Fork
//!
//! `fork` duplicates the caller's address space lazily. Writable pages
//! are shared read-only and marked `COW` in both processes; the first
//! write on either side faults into `pgfault`, which gives the writer a
//! private copy of that one page.
//!
//! Everything here runs in user mode on top of the system calls; the
//! kernel knows nothing about copy-on-write.

use alloc::format;

use crate::env::{EnvId, EnvStatus};
use crate::memlayout::{vpn, VirtAddr, NPTENTRIES, PFTEMP, PGSHIFT, PGSIZE, UTEMP, UTOP, UXSTACKTOP};
use crate::mm::{PteFlags, FEC_WR};
use crate::trap::UTrapframe;

use super::{UserEnv, UserError};

/// Name `pgfault` is linked under.
pub const PGFAULT: &str = "pgfault";

/// Turn a failed system call into a user panic naming `what`.
fn or_panic<T>(env: &mut UserEnv<'_>, r: Result<T, UserError>, what: &str) -> Result<T, UserError> {
    r.map_err(|e| match e {
        UserError::Sys(e) => env.panic(&format!("{}: {}", what, e)),
        other => other,
    })
}

/// Copy-on-write fault handler.
///
/// Only write faults on `COW` pages are legitimate; anything else
/// panics. The copy is built at PFTEMP and then mapped over the
/// faulting page, which stays mapped throughout.
pub fn pgfault(env: &mut UserEnv<'_>, utf: &UTrapframe) -> Result<(), UserError> {
    let addr = VirtAddr::new(utf.fault_va);
    let page = addr.align_down();

    if utf.err & FEC_WR == 0 {
        return Err(env.panic("pgfault: faulting access not a write"));
    }
    let cow = env.vpd(addr.pdx())?.is_present() && env.vpt(addr.vpn())?.flags().is_cow();
    if !cow {
        return Err(env.panic("pgfault: faulting access not to a CoW page"));
    }

    let pftemp = VirtAddr::new(PFTEMP);
    let r = env.sys_page_alloc(EnvId::CURRENT, pftemp, PteFlags::USER_RW);
    or_panic(env, r, "pgfault: page alloc")?;
    env.copy_page(pftemp, page)?;
    let r = env.sys_page_map(EnvId::CURRENT, pftemp, EnvId::CURRENT, page, PteFlags::USER_RW);
    or_panic(env, r, "pgfault: page map")?;
    let r = env.sys_page_unmap(EnvId::CURRENT, pftemp);
    or_panic(env, r, "pgfault: page unmap")?;
    log::trace!("[{}] copied page {} on write", env.id(), page);
    Ok(())
}

/// Share virtual page `pn` with `child` at the same address.
///
/// Writable and `COW` pages become `COW` in both processes, the child
/// first. Read-only pages are shared read-only as they are.
fn duppage(env: &mut UserEnv<'_>, child: EnvId, pn: usize) -> Result<(), UserError> {
    let va = VirtAddr::new((pn as u32) << PGSHIFT);
    let flags = env.vpt(pn)?.flags();

    if flags.is_writable() || flags.is_cow() {
        env.sys_page_map(EnvId::CURRENT, va, child, va, PteFlags::USER_COW)?;
        env.sys_page_map(EnvId::CURRENT, va, EnvId::CURRENT, va, PteFlags::USER_COW)?;
    } else {
        let perm = flags.permissions() & PteFlags::SYSCALL;
        env.sys_page_map(EnvId::CURRENT, va, child, va, perm)?;
    }
    Ok(())
}

/// Fork the calling process.
///
/// Returns the child's identifier. The child starts out with this
/// process's registers and 0 as the result of its `sys_exofork`, its own
/// fresh copy of the exception stack, and the same page fault upcall.
/// If anything fails once the child exists, the child is destroyed
/// before the error is returned.
pub fn fork(env: &mut UserEnv<'_>) -> Result<EnvId, UserError> {
    let upcall = env.set_pgfault_handler(PGFAULT, pgfault)?;
    let child = env.sys_exofork()?;

    match copy_into(env, child, upcall) {
        Ok(()) => {
            log::debug!("[{}] forked {}", env.id(), child);
            Ok(child)
        }
        Err(e) => {
            discard_child(env, child);
            Err(e)
        }
    }
}

/// Destroy a half-built child. Returns whether it is gone.
fn discard_child(env: &mut UserEnv<'_>, child: EnvId) -> bool {
    match env.sys_env_destroy(child) {
        Ok(()) => true,
        Err(e) => {
            log::warn!("[{}] fork: could not destroy child {}: {}", env.id(), child, e);
            false
        }
    }
}

fn copy_into(env: &mut UserEnv<'_>, child: EnvId, upcall: VirtAddr) -> Result<(), UserError> {
    let xstack = VirtAddr::new(UXSTACKTOP - PGSIZE as u32);

    for pdx in 0..VirtAddr::new(UTOP).pdx() {
        if !env.vpd(pdx)?.is_present() {
            continue;
        }
        for ptx in 0..NPTENTRIES {
            let pn = pdx * NPTENTRIES + ptx;
            if pn >= vpn(xstack.as_u32()) {
                break;
            }
            if env.vpt(pn)?.is_present() {
                duppage(env, child, pn)?;
            }
        }
    }

    // The exception stack is never shared: the child gets its own copy.
    let utemp = VirtAddr::new(UTEMP);
    env.sys_page_alloc(child, xstack, PteFlags::USER_RW)?;
    env.sys_page_map(child, xstack, EnvId::CURRENT, utemp, PteFlags::USER_RW)?;
    env.copy_page(utemp, xstack)?;
    env.sys_page_unmap(EnvId::CURRENT, utemp)?;

    env.sys_env_set_pgfault_upcall(child, upcall)?;
    env.sys_env_set_status(child, EnvStatus::Runnable)
}

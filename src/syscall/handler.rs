//! System Call Handler
//!
//! Dispatches system calls and implements the individual handlers.
//!
//! # Security Considerations
//! - Unknown system call numbers return `Inval`
//! - Every handler validates its own arguments
//! - Failures are returned to the caller as negative codes; only a bad
//!   `cputs` buffer destroys the caller

use alloc::string::String;

use crate::env::{EnvId, EnvStatus};
use crate::error::{into_syscall_ret, KResult, KernelError};
use crate::kernel::Kernel;
use crate::memlayout::VirtAddr;
use crate::mm::{FrameNumber, PteFlags};
use crate::{kprint, kprintln};

use super::validate::{check_perm, check_user_page, UserBuffer};

/// System call numbers
pub mod numbers {
    pub const SYS_CPUTS: u32 = 0;
    pub const SYS_GETENVID: u32 = 1;
    pub const SYS_ENV_DESTROY: u32 = 2;
    pub const SYS_PAGE_ALLOC: u32 = 3;
    pub const SYS_PAGE_MAP: u32 = 4;
    pub const SYS_PAGE_UNMAP: u32 = 5;
    pub const SYS_EXOFORK: u32 = 6;
    pub const SYS_ENV_SET_STATUS: u32 = 7;
    pub const SYS_ENV_SET_PGFAULT_UPCALL: u32 = 8;
    pub const SYS_YIELD: u32 = 9;
}

/// Dispatch a system call
///
/// # Arguments
/// * `num` - System call number (from eax)
/// * `a1`..`a5` - Arguments (from edx, ecx, ebx, edi, esi)
///
/// # Returns
/// The value to be placed in eax
pub fn dispatch(k: &mut Kernel, num: u32, a1: u32, a2: u32, a3: u32, a4: u32, a5: u32) -> i32 {
    use numbers::*;

    let result = match num {
        SYS_CPUTS => sys_cputs(k, a1, a2),
        SYS_GETENVID => sys_getenvid(k),
        SYS_ENV_DESTROY => sys_env_destroy(k, EnvId::from_raw(a1 as i32)),
        SYS_PAGE_ALLOC => sys_page_alloc(k, EnvId::from_raw(a1 as i32), a2, a3),
        SYS_PAGE_MAP => sys_page_map(k, EnvId::from_raw(a1 as i32), a2, EnvId::from_raw(a3 as i32), a4, a5),
        SYS_PAGE_UNMAP => sys_page_unmap(k, EnvId::from_raw(a1 as i32), a2),
        SYS_EXOFORK => sys_exofork(k),
        SYS_ENV_SET_STATUS => sys_env_set_status(k, EnvId::from_raw(a1 as i32), a2),
        SYS_ENV_SET_PGFAULT_UPCALL => sys_env_set_pgfault_upcall(k, EnvId::from_raw(a1 as i32), a2),
        SYS_YIELD => sys_yield(k),
        _ => {
            log::warn!("unknown syscall {}", num);
            Err(KernelError::Inval)
        }
    };
    if let Err(e) = result {
        log::debug!("syscall {} failed: {}", num, e);
    }
    into_syscall_ret(result)
}

fn current(k: &Kernel) -> KResult<usize> {
    k.curenv.ok_or(KernelError::BadEnv)
}

fn pgdir_of(k: &Kernel, slot: usize) -> KResult<FrameNumber> {
    k.envs.get(slot).pgdir.ok_or(KernelError::BadEnv)
}

/// Print a string from user memory on the console.
///
/// The whole buffer must be user-readable; otherwise the caller is
/// destroyed.
fn sys_cputs(k: &mut Kernel, s: u32, len: u32) -> KResult<i32> {
    let cur = current(k)?;
    let pgdir = pgdir_of(k, cur)?;
    let buf = match UserBuffer::new(&k.machine, pgdir, s, len as usize, PteFlags::empty()) {
        Ok(buf) => buf,
        Err(bad) => {
            let id = k.envs.get(cur).id;
            kprintln!(k.console, "[{}] user_mem_check assertion failure for va {:08x}", id, bad.as_u32());
            k.env_destroy_slot(cur);
            return Err(KernelError::Fault);
        }
    };
    if buf.is_empty() {
        return Ok(0);
    }
    let bytes = buf.read(&k.machine)?;
    kprint!(k.console, "{}", String::from_utf8_lossy(&bytes));
    Ok(0)
}

/// The caller's identifier.
fn sys_getenvid(k: &mut Kernel) -> KResult<i32> {
    let cur = current(k)?;
    Ok(k.envs.get(cur).id.raw())
}

/// Destroy the caller or one of its children.
fn sys_env_destroy(k: &mut Kernel, id: EnvId) -> KResult<i32> {
    let slot = k.envid2env(id, true)?;
    let cur = current(k)?;
    let cur_id = k.envs.get(cur).id;
    if slot == cur {
        kprintln!(k.console, "[{}] exiting gracefully", cur_id);
    } else {
        kprintln!(k.console, "[{}] destroying {}", cur_id, k.envs.get(slot).id);
    }
    k.env_destroy_slot(slot);
    Ok(0)
}

/// Allocate a zeroed page and map it at `va` in `id`'s address space.
///
/// Any page already mapped there is unmapped first.
fn sys_page_alloc(k: &mut Kernel, id: EnvId, va: u32, perm: u32) -> KResult<i32> {
    let slot = k.envid2env(id, true)?;
    let va = check_user_page(va)?;
    let perm = check_perm(perm)?;
    let pgdir = pgdir_of(k, slot)?;

    let frame = k.machine.mem.alloc()?;
    if let Err(e) = k.machine.page_insert(pgdir, frame, va, perm) {
        k.machine.mem.free(frame);
        return Err(e);
    }
    Ok(0)
}

/// Map the page at `srcva` in `srcid` at `dstva` in `dstid`.
///
/// Writable is granted only if the source mapping is writable.
fn sys_page_map(k: &mut Kernel, srcid: EnvId, srcva: u32, dstid: EnvId, dstva: u32, perm: u32) -> KResult<i32> {
    let src = k.envid2env(srcid, true)?;
    let dst = k.envid2env(dstid, true)?;
    let srcva = check_user_page(srcva)?;
    let dstva = check_user_page(dstva)?;
    let perm = check_perm(perm)?;

    let src_pgdir = pgdir_of(k, src)?;
    let dst_pgdir = pgdir_of(k, dst)?;
    let mapping = k.machine.page_lookup(src_pgdir, srcva).ok_or(KernelError::Inval)?;
    if perm.is_writable() && !mapping.flags.is_writable() {
        return Err(KernelError::Inval);
    }
    k.machine.page_insert(dst_pgdir, mapping.frame, dstva, perm)?;
    Ok(0)
}

/// Unmap the page at `va` in `id`'s address space. Unmapping nothing
/// succeeds.
fn sys_page_unmap(k: &mut Kernel, id: EnvId, va: u32) -> KResult<i32> {
    let slot = k.envid2env(id, true)?;
    let va = check_user_page(va)?;
    let pgdir = pgdir_of(k, slot)?;
    k.machine.page_remove(pgdir, va);
    Ok(0)
}

/// Create a child with the caller's registers and an empty address
/// space. The child is not runnable and sees 0 as the call's result.
fn sys_exofork(k: &mut Kernel) -> KResult<i32> {
    let cur = current(k)?;
    let parent = k.envs.get(cur);
    let parent_id = parent.id;
    let tf = parent.tf;

    let slot = k.env_alloc(parent_id)?;
    let child = k.envs.get_mut(slot);
    child.tf = tf;
    child.tf.regs.eax = 0;
    child.status = EnvStatus::NotRunnable;
    Ok(child.id.raw())
}

/// Set a process Runnable or NotRunnable.
fn sys_env_set_status(k: &mut Kernel, id: EnvId, status: u32) -> KResult<i32> {
    let status = match EnvStatus::from_raw(status) {
        Some(s @ (EnvStatus::Runnable | EnvStatus::NotRunnable)) => s,
        _ => return Err(KernelError::Inval),
    };
    let slot = k.envid2env(id, true)?;
    k.envs.get_mut(slot).status = status;
    Ok(0)
}

/// Register the page fault entry point of a process. Zero removes it.
fn sys_env_set_pgfault_upcall(k: &mut Kernel, id: EnvId, func: u32) -> KResult<i32> {
    let slot = k.envid2env(id, true)?;
    k.envs.get_mut(slot).pgfault_upcall = (func != 0).then(|| VirtAddr::new(func));
    Ok(0)
}

/// Give up the CPU once the trap returns.
fn sys_yield(k: &mut Kernel) -> KResult<i32> {
    k.reschedule = true;
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::numbers::*;
    use super::*;
    use crate::kernel::tests::kernel;
    use crate::memlayout::{PGSIZE, USTACKTOP, UTEXT, UTOP};

    fn call(k: &mut Kernel, num: u32, args: [u32; 5]) -> i32 {
        dispatch(k, num, args[0], args[1], args[2], args[3], args[4])
    }

    fn running(k: &mut Kernel) -> EnvId {
        let id = k.env_create().unwrap();
        k.env_run(id.slot());
        id
    }

    const RW: u32 = PteFlags::USER_RW.bits();
    const RO: u32 = PteFlags::USER_RO.bits();

    #[test]
    fn test_unknown_number_is_inval() {
        let (mut k, _) = kernel();
        running(&mut k);
        assert_eq!(call(&mut k, 77, [0; 5]), KernelError::Inval.code());
    }

    #[test]
    fn test_getenvid() {
        let (mut k, _) = kernel();
        let id = running(&mut k);
        assert_eq!(call(&mut k, SYS_GETENVID, [0; 5]), id.raw());
    }

    #[test]
    fn test_cputs_prints_checked_buffer() {
        let (mut k, out) = kernel();
        let id = running(&mut k);
        let pgdir = k.env(id).unwrap().pgdir.unwrap();
        let va = USTACKTOP - 64;
        k.machine.copy_to(pgdir, VirtAddr::new(va), b"hi there\n").unwrap();
        assert_eq!(call(&mut k, SYS_CPUTS, [va, 9, 0, 0, 0]), 0);
        assert_eq!(out.contents(), "hi there\n");
    }

    #[test]
    fn test_cputs_of_nothing_prints_nothing() {
        let (mut k, out) = kernel();
        let id = running(&mut k);
        assert_eq!(call(&mut k, SYS_CPUTS, [USTACKTOP - 64, 0, 0, 0, 0]), 0);
        assert_eq!(out.contents(), "");
        assert!(k.env(id).is_some());
    }

    #[test]
    fn test_cputs_with_kernel_address_destroys_caller() {
        let (mut k, out) = kernel();
        let id = running(&mut k);
        assert_eq!(call(&mut k, SYS_CPUTS, [0xf010_0000, 4, 0, 0, 0]), KernelError::Fault.code());
        assert!(k.env(id).is_none());
        assert!(out.contents().contains(&format!("[{}] user_mem_check assertion failure for va f0100000", id)));
    }

    #[test]
    fn test_page_alloc_validates_arguments() {
        let (mut k, _) = kernel();
        let id = running(&mut k);
        assert_eq!(call(&mut k, SYS_PAGE_ALLOC, [0, UTEXT, RW, 0, 0]), 0);
        assert_eq!(call(&mut k, SYS_PAGE_ALLOC, [0, UTEXT + 4, RW, 0, 0]), KernelError::Inval.code());
        assert_eq!(call(&mut k, SYS_PAGE_ALLOC, [0, UTOP, RW, 0, 0]), KernelError::Inval.code());
        assert_eq!(call(&mut k, SYS_PAGE_ALLOC, [0, UTEXT, 0x3, 0, 0]), KernelError::Inval.code());
        assert_eq!(call(&mut k, SYS_PAGE_ALLOC, [0x7777, UTEXT, RW, 0, 0]), KernelError::BadEnv.code());

        let pgdir = k.env(id).unwrap().pgdir.unwrap();
        let m = k.machine.page_lookup(pgdir, VirtAddr::new(UTEXT)).unwrap();
        assert_eq!(m.flags.permissions(), PteFlags::USER_RW);
        assert!(k.machine.mem.page(m.frame).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_page_alloc_out_of_memory_leaks_nothing() {
        let (mut k, _) = kernel();
        running(&mut k);
        assert_eq!(call(&mut k, SYS_PAGE_ALLOC, [0, UTEXT, RW, 0, 0]), 0);
        while k.machine.mem.alloc().is_ok() {}
        assert_eq!(
            call(&mut k, SYS_PAGE_ALLOC, [0, UTEXT + PGSIZE as u32, RW, 0, 0]),
            KernelError::NoMem.code()
        );
        assert_eq!(k.machine.mem.free_count(), 0);
    }

    #[test]
    fn test_page_map_shares_frame_and_refuses_upgrade() {
        let (mut k, _) = kernel();
        let id = running(&mut k);
        let pgdir = k.env(id).unwrap().pgdir.unwrap();
        assert_eq!(call(&mut k, SYS_PAGE_ALLOC, [0, UTEXT, RO, 0, 0]), 0);

        let dst = UTEXT + 4 * PGSIZE as u32;
        assert_eq!(call(&mut k, SYS_PAGE_MAP, [0, UTEXT, 0, dst, RW]), KernelError::Inval.code());
        assert_eq!(call(&mut k, SYS_PAGE_MAP, [0, UTEXT, 0, dst, RO]), 0);
        let a = k.machine.page_lookup(pgdir, VirtAddr::new(UTEXT)).unwrap();
        let b = k.machine.page_lookup(pgdir, VirtAddr::new(dst)).unwrap();
        assert_eq!(a.frame, b.frame);
        assert_eq!(k.machine.mem.refcount(a.frame), 2);

        assert_eq!(
            call(&mut k, SYS_PAGE_MAP, [0, UTEXT + PGSIZE as u32, 0, dst, RO]),
            KernelError::Inval.code()
        );

        assert_eq!(call(&mut k, SYS_PAGE_UNMAP, [0, dst, 0, 0, 0]), 0);
        assert_eq!(k.machine.mem.refcount(a.frame), 1);
        assert_eq!(call(&mut k, SYS_PAGE_UNMAP, [0, dst, 0, 0, 0]), 0);
    }

    #[test]
    fn test_page_map_past_reference_limit_fails_for_caller_only() {
        let (mut k, _) = kernel();
        let id = running(&mut k);
        let pgdir = k.env(id).unwrap().pgdir.unwrap();
        assert_eq!(call(&mut k, SYS_PAGE_ALLOC, [0, UTEXT, RO, 0, 0]), 0);
        let frame = k.machine.page_lookup(pgdir, VirtAddr::new(UTEXT)).unwrap().frame;

        let mut i = 1u32;
        let r = loop {
            let r = call(&mut k, SYS_PAGE_MAP, [0, UTEXT, 0, UTEXT + i * PGSIZE as u32, RO]);
            if r != 0 {
                break r;
            }
            i += 1;
        };
        assert_eq!(r, KernelError::NoMem.code());
        assert_eq!(i, u32::from(u16::MAX));
        assert_eq!(k.machine.mem.refcount(frame), u16::MAX);
        assert!(k.machine.page_lookup(pgdir, VirtAddr::new(UTEXT + i * PGSIZE as u32)).is_none());
        assert_eq!(k.env(id).unwrap().status, EnvStatus::Running);

        assert_eq!(call(&mut k, SYS_PAGE_UNMAP, [0, UTEXT + PGSIZE as u32, 0, 0, 0]), 0);
        assert_eq!(call(&mut k, SYS_PAGE_MAP, [0, UTEXT, 0, UTEXT + i * PGSIZE as u32, RO]), 0);
    }

    #[test]
    fn test_exofork_copies_registers_and_parents_child() {
        let (mut k, _) = kernel();
        let parent = running(&mut k);
        k.env_mut(parent).unwrap().tf.regs.ebx = 0x1234;
        let ret = call(&mut k, SYS_EXOFORK, [0; 5]);
        assert!(ret > 0);

        let child = EnvId::from_raw(ret);
        let env = k.env(child).unwrap();
        assert_eq!(env.status, EnvStatus::NotRunnable);
        assert_eq!(env.parent_id, parent);
        assert_eq!(env.tf.regs.ebx, 0x1234);
        assert_eq!(env.tf.regs.eax, 0);

        // the parent may manage its child, but not the reverse
        assert_eq!(call(&mut k, SYS_PAGE_ALLOC, [ret as u32, UTEXT, RW, 0, 0]), 0);
        assert_eq!(call(&mut k, SYS_ENV_SET_STATUS, [ret as u32, EnvStatus::Runnable.raw(), 0, 0, 0]), 0);
        k.env_run(child.slot());
        assert_eq!(
            call(&mut k, SYS_PAGE_UNMAP, [parent.raw() as u32, UTEXT, 0, 0, 0]),
            KernelError::BadEnv.code()
        );
    }

    #[test]
    fn test_set_status_accepts_only_runnable_states() {
        let (mut k, _) = kernel();
        running(&mut k);
        let child = call(&mut k, SYS_EXOFORK, [0; 5]) as u32;
        for bad in [EnvStatus::Free, EnvStatus::Dying, EnvStatus::Running] {
            assert_eq!(call(&mut k, SYS_ENV_SET_STATUS, [child, bad.raw(), 0, 0, 0]), KernelError::Inval.code());
        }
        assert_eq!(call(&mut k, SYS_ENV_SET_STATUS, [child, 99, 0, 0, 0]), KernelError::Inval.code());
        assert_eq!(call(&mut k, SYS_ENV_SET_STATUS, [child, EnvStatus::Runnable.raw(), 0, 0, 0]), 0);
    }

    #[test]
    fn test_set_pgfault_upcall() {
        let (mut k, _) = kernel();
        let id = running(&mut k);
        assert_eq!(call(&mut k, SYS_ENV_SET_PGFAULT_UPCALL, [0, 0x80_0100, 0, 0, 0]), 0);
        assert_eq!(k.env(id).unwrap().pgfault_upcall, Some(VirtAddr::new(0x80_0100)));
        assert_eq!(call(&mut k, SYS_ENV_SET_PGFAULT_UPCALL, [0, 0, 0, 0, 0]), 0);
        assert_eq!(k.env(id).unwrap().pgfault_upcall, None);
    }

    #[test]
    fn test_env_destroy_reports_who() {
        let (mut k, out) = kernel();
        let parent = running(&mut k);
        let child = call(&mut k, SYS_EXOFORK, [0; 5]);
        assert_eq!(call(&mut k, SYS_ENV_DESTROY, [child as u32, 0, 0, 0, 0]), 0);
        assert!(k.env(EnvId::from_raw(child)).is_none());
        assert!(out
            .contents()
            .contains(&format!("[{}] destroying {}", parent, EnvId::from_raw(child))));

        assert_eq!(call(&mut k, SYS_ENV_DESTROY, [0; 5]), 0);
        assert!(out.contents().contains(&format!("[{}] exiting gracefully", parent)));
        assert!(k.env(parent).is_none());
    }

    #[test]
    fn test_yield_requests_reschedule() {
        let (mut k, _) = kernel();
        running(&mut k);
        assert_eq!(call(&mut k, SYS_YIELD, [0; 5]), 0);
        assert!(k.reschedule);
    }
}

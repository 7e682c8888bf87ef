//! User-Mode Library
//!
//! What a user program links against: system call stubs, memory access
//! through the MMU, the `vpt`/`vpd` page table windows, page fault
//! handler registration and copy-on-write `fork`.
//!
//! A program is Rust code driving a `UserEnv` handle. Every call enters
//! the kernel the way the hardware would: through `Kernel::trap` with a
//! system call or page fault frame built from the process's saved
//! registers.
//!
//! # Page Fault Upcalls
//! When an access faults and the kernel redirects the process to its
//! upcall, the handle plays the part of the entry trampoline: it looks
//! up the handler linked at the new `eip`, reads the fault record the
//! kernel pushed on the exception stack, runs the handler and restores
//! the trap-time registers before the access is retried. A handler that
//! faults nests the same way, one level deeper on the exception stack.

mod fork;

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use crate::env::{EnvId, EnvStatus};
use crate::error::KernelError;
use crate::kernel::Kernel;
use crate::memlayout::{VirtAddr, PGSHIFT, PGSIZE, UVPT, UXSTACKTOP};
use crate::mm::{Machine, PageFault, PageTableEntry, PteFlags};
use crate::syscall::numbers::*;
use crate::trap::{Trapframe, UTrapframe, T_GPFLT, T_PGFLT, T_SYSCALL, UTF_SIZE};

pub use fork::{fork, pgfault, PGFAULT};

/// A user-mode page fault handler, linked into the program text with
/// `Kernel::link`.
pub type PgfaultHandler = fn(&mut UserEnv<'_>, &UTrapframe) -> Result<(), UserError>;

/// How often one access is retried after its fault was handled.
const MAX_FAULT_RETRIES: usize = 8;

/// Bytes `cputs` hands to the kernel per system call.
const CPUTS_CHUNK: usize = 128;

/// Where the page directory appears inside the UVPT window.
const UVPD: u32 = UVPT + (UVPT >> PGSHIFT) * 4;

/// Errors seen by user code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserError {
    /// A system call returned an error code.
    Sys(KernelError),
    /// The process no longer exists.
    Killed,
    /// The process exists but is not allowed on the CPU.
    NotRunnable,
    /// The program panicked; the process has been destroyed.
    Panic(String),
    /// A fault kept recurring after its handler returned.
    Unresolved(VirtAddr),
}

impl fmt::Display for UserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sys(e) => write!(f, "{}", e),
            Self::Killed => write!(f, "environment destroyed"),
            Self::NotRunnable => write!(f, "environment not runnable"),
            Self::Panic(msg) => write!(f, "panic: {}", msg),
            Self::Unresolved(va) => write!(f, "unresolved fault at {}", va),
        }
    }
}

impl From<KernelError> for UserError {
    fn from(e: KernelError) -> Self {
        Self::Sys(e)
    }
}

/// A running user program: a process and the kernel it traps into.
pub struct UserEnv<'k> {
    kernel: &'k mut Kernel,
    id: EnvId,
}

impl<'k> UserEnv<'k> {
    /// Run code as process `id`.
    pub fn attach(kernel: &'k mut Kernel, id: EnvId) -> Self {
        Self { kernel, id }
    }

    #[inline]
    pub fn id(&self) -> EnvId {
        self.id
    }

    /// The kernel underneath, for inspection.
    pub fn kernel(&mut self) -> &mut Kernel {
        &mut *self.kernel
    }

    /// Saved registers of the process, if it still exists.
    pub fn trapframe(&self) -> Option<Trapframe> {
        self.kernel.env(self.id).map(|e| e.tf)
    }

    /// Put the process on the CPU unless it already is.
    fn enter(&mut self) -> Result<usize, UserError> {
        let env = self.kernel.env(self.id).ok_or(UserError::Killed)?;
        if !env.is_runnable() {
            return Err(UserError::NotRunnable);
        }
        let slot = self.id.slot();
        if self.kernel.curenv != Some(slot) || env.status != EnvStatus::Running {
            self.kernel.env_run(slot);
        }
        Ok(slot)
    }

    /// Trap into the kernel with `eax = num` and the arguments in
    /// `edx, ecx, ebx, edi, esi`.
    fn syscall(&mut self, num: u32, args: [u32; 5]) -> Result<u32, UserError> {
        let slot = self.enter()?;
        let mut tf = self.kernel.envs.get(slot).tf;
        tf.trapno = T_SYSCALL;
        tf.regs.eax = num;
        tf.regs.edx = args[0];
        tf.regs.ecx = args[1];
        tf.regs.ebx = args[2];
        tf.regs.edi = args[3];
        tf.regs.esi = args[4];
        self.kernel.trap(tf);

        let env = self.kernel.env(self.id).ok_or(UserError::Killed)?;
        let ret = env.tf.regs.eax as i32;
        match KernelError::from_code(ret) {
            Some(e) => Err(UserError::Sys(e)),
            None => Ok(ret as u32),
        }
    }

    pub fn sys_cputs(&mut self, va: VirtAddr, len: usize) -> Result<(), UserError> {
        self.syscall(SYS_CPUTS, [va.as_u32(), len as u32, 0, 0, 0]).map(drop)
    }

    pub fn sys_getenvid(&mut self) -> Result<EnvId, UserError> {
        self.syscall(SYS_GETENVID, [0; 5]).map(|r| EnvId::from_raw(r as i32))
    }

    pub fn sys_env_destroy(&mut self, id: EnvId) -> Result<(), UserError> {
        self.syscall(SYS_ENV_DESTROY, [id.raw() as u32, 0, 0, 0, 0]).map(drop)
    }

    pub fn sys_page_alloc(&mut self, id: EnvId, va: VirtAddr, perm: PteFlags) -> Result<(), UserError> {
        self.syscall(SYS_PAGE_ALLOC, [id.raw() as u32, va.as_u32(), perm.bits(), 0, 0])
            .map(drop)
    }

    pub fn sys_page_map(
        &mut self,
        src: EnvId,
        srcva: VirtAddr,
        dst: EnvId,
        dstva: VirtAddr,
        perm: PteFlags,
    ) -> Result<(), UserError> {
        let args = [src.raw() as u32, srcva.as_u32(), dst.raw() as u32, dstva.as_u32(), perm.bits()];
        self.syscall(SYS_PAGE_MAP, args).map(drop)
    }

    pub fn sys_page_unmap(&mut self, id: EnvId, va: VirtAddr) -> Result<(), UserError> {
        self.syscall(SYS_PAGE_UNMAP, [id.raw() as u32, va.as_u32(), 0, 0, 0]).map(drop)
    }

    /// Create a not-yet-runnable copy of this process's registers.
    ///
    /// Returns the child's identifier. The child, once run, resumes from
    /// the same call with 0 in `eax`.
    pub fn sys_exofork(&mut self) -> Result<EnvId, UserError> {
        self.syscall(SYS_EXOFORK, [0; 5]).map(|r| EnvId::from_raw(r as i32))
    }

    pub fn sys_env_set_status(&mut self, id: EnvId, status: EnvStatus) -> Result<(), UserError> {
        self.syscall(SYS_ENV_SET_STATUS, [id.raw() as u32, status.raw(), 0, 0, 0])
            .map(drop)
    }

    pub fn sys_env_set_pgfault_upcall(&mut self, id: EnvId, entry: VirtAddr) -> Result<(), UserError> {
        self.syscall(SYS_ENV_SET_PGFAULT_UPCALL, [id.raw() as u32, entry.as_u32(), 0, 0, 0])
            .map(drop)
    }

    pub fn sys_yield(&mut self) -> Result<(), UserError> {
        self.syscall(SYS_YIELD, [0; 5]).map(drop)
    }

    /// Perform a memory operation, handling page faults until it
    /// succeeds or cannot.
    fn access<F>(&mut self, mut op: F) -> Result<(), UserError>
    where
        F: FnMut(&mut Machine) -> Result<(), PageFault>,
    {
        let mut last = VirtAddr::new(0);
        for _ in 0..MAX_FAULT_RETRIES {
            self.enter()?;
            match op(&mut self.kernel.machine) {
                Ok(()) => return Ok(()),
                Err(fault) => {
                    last = fault.va;
                    self.page_fault(fault)?;
                }
            }
        }
        Err(UserError::Unresolved(last))
    }

    /// Raise a page fault and, if the kernel sends it to an upcall, run
    /// that upcall to completion.
    fn page_fault(&mut self, fault: PageFault) -> Result<(), UserError> {
        let slot = self.id.slot();
        let mut tf = self.kernel.envs.get(slot).tf;
        tf.trapno = T_PGFLT;
        tf.err = fault.err;
        self.kernel.trap(tf);

        let tf = self.trapframe().ok_or(UserError::Killed)?;
        let Some(handler) = self.kernel.text(tf.eip) else {
            // nothing linked at the upcall entry
            self.enter()?;
            let mut gp = tf;
            gp.trapno = T_GPFLT;
            self.kernel.trap(gp);
            return Err(UserError::Killed);
        };

        let mut raw = [0u8; UTF_SIZE];
        self.read(VirtAddr::new(tf.esp), &mut raw)?;
        let utf = UTrapframe::from_bytes(&raw);
        handler(self, &utf)?;

        let env = self.kernel.env_mut(self.id).ok_or(UserError::Killed)?;
        env.tf.regs = utf.regs;
        env.tf.eip = utf.eip;
        env.tf.eflags = utf.eflags;
        env.tf.esp = utf.esp;
        Ok(())
    }

    pub fn read(&mut self, va: VirtAddr, buf: &mut [u8]) -> Result<(), UserError> {
        self.access(|m| m.read_virt(va, &mut *buf, true))
    }

    pub fn write(&mut self, va: VirtAddr, data: &[u8]) -> Result<(), UserError> {
        self.access(|m| m.write_virt(va, data, true))
    }

    pub fn read_u32(&mut self, va: VirtAddr) -> Result<u32, UserError> {
        let mut word = [0u8; 4];
        self.read(va, &mut word)?;
        Ok(u32::from_le_bytes(word))
    }

    pub fn write_u32(&mut self, va: VirtAddr, value: u32) -> Result<(), UserError> {
        self.write(va, &value.to_le_bytes())
    }

    /// Leaf entry for virtual page `pn`, read through UVPT.
    ///
    /// The page table holding it must exist (see `vpd`), or the read
    /// itself faults.
    pub fn vpt(&mut self, pn: usize) -> Result<PageTableEntry, UserError> {
        let va = VirtAddr::new(UVPT + (pn * 4) as u32);
        self.read_u32(va).map(PageTableEntry::from_raw)
    }

    /// Page directory entry `pdx`, read through UVPT.
    pub fn vpd(&mut self, pdx: usize) -> Result<PageTableEntry, UserError> {
        let va = VirtAddr::new(UVPD + (pdx * 4) as u32);
        self.read_u32(va).map(PageTableEntry::from_raw)
    }

    /// Whether `va` is mapped, judged from the page table windows.
    pub fn is_mapped(&mut self, va: VirtAddr) -> Result<bool, UserError> {
        Ok(self.vpd(va.pdx())?.is_present() && self.vpt(va.vpn())?.is_present())
    }

    /// Install `handler` for this process's page faults.
    ///
    /// Allocates the exception stack the first time; links the handler
    /// under `name` and registers its entry as the upcall. Returns the
    /// entry address.
    pub fn set_pgfault_handler(&mut self, name: &'static str, handler: PgfaultHandler) -> Result<VirtAddr, UserError> {
        let xstack = VirtAddr::new(UXSTACKTOP - PGSIZE as u32);
        if !self.is_mapped(xstack)? {
            self.sys_page_alloc(EnvId::CURRENT, xstack, PteFlags::USER_RW)?;
        }
        let entry = self.kernel.link(name, handler);
        self.sys_env_set_pgfault_upcall(EnvId::CURRENT, entry)?;
        Ok(entry)
    }

    /// Print `s` on the console, staging it in a buffer on the stack.
    pub fn cputs(&mut self, s: &str) -> Result<(), UserError> {
        for chunk in s.as_bytes().chunks(CPUTS_CHUNK) {
            let esp = self.trapframe().ok_or(UserError::Killed)?.esp;
            let buf = VirtAddr::new(esp.wrapping_sub(CPUTS_CHUNK as u32) & !3);
            self.write(buf, chunk)?;
            self.sys_cputs(buf, chunk.len())?;
        }
        Ok(())
    }

    /// Destroy this process.
    pub fn exit(&mut self) -> Result<(), UserError> {
        match self.sys_env_destroy(EnvId::CURRENT) {
            Ok(()) | Err(UserError::Killed) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Report a fatal error and destroy this process. Returns the error
    /// for the caller to propagate.
    pub fn panic(&mut self, msg: &str) -> UserError {
        let _ = self.cputs(&format!("user panic in [{}]: {}\n", self.id, msg));
        let _ = self.exit();
        UserError::Panic(String::from(msg))
    }

    /// Copy one page of this address space onto another.
    fn copy_page(&mut self, dst: VirtAddr, src: VirtAddr) -> Result<(), UserError> {
        let mut page: Vec<u8> = alloc::vec![0u8; PGSIZE];
        self.read(src, &mut page)?;
        self.write(dst, &page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::tests::{kernel, kernel_with_input};
    use crate::memlayout::{KERNBASE, USTACKTOP, UTEXT};
    use core::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_syscalls_through_trap_path() {
        let (mut k, out) = kernel();
        let id = k.env_create().unwrap();
        let mut u = UserEnv::attach(&mut k, id);
        assert_eq!(u.sys_getenvid(), Ok(id));
        u.cputs("hello, world\n").unwrap();
        assert_eq!(
            u.sys_page_alloc(EnvId::CURRENT, VirtAddr::new(UTEXT + 1), PteFlags::USER_RW),
            Err(UserError::Sys(KernelError::Inval))
        );
        assert_eq!(out.contents(), "hello, world\n");
        assert_eq!(u.kernel().trap_state(), crate::kernel::TrapState::Idle);
    }

    #[test]
    fn test_long_cputs_is_chunked() {
        let (mut k, out) = kernel();
        let id = k.env_create().unwrap();
        let text: String = (0..300).map(|i| (b'a' + (i % 26) as u8) as char).collect();
        UserEnv::attach(&mut k, id).cputs(&text).unwrap();
        assert_eq!(out.contents(), text);
    }

    #[test]
    fn test_memory_round_trip_and_page_windows() {
        let (mut k, _) = kernel();
        let id = k.env_create().unwrap();
        let mut u = UserEnv::attach(&mut k, id);
        let va = VirtAddr::new(UTEXT);
        u.sys_page_alloc(EnvId::CURRENT, va, PteFlags::USER_RW).unwrap();
        u.write_u32(va.add(8), 0xcafe_f00d).unwrap();
        assert_eq!(u.read_u32(va.add(8)), Ok(0xcafe_f00d));

        assert!(u.vpd(va.pdx()).unwrap().is_present());
        let pte = u.vpt(va.vpn()).unwrap();
        assert!(pte.flags().contains(PteFlags::USER_RW | PteFlags::DIRTY));
        assert!(u.is_mapped(VirtAddr::new(USTACKTOP - PGSIZE as u32)).unwrap());
        assert!(!u.is_mapped(VirtAddr::new(USTACKTOP)).unwrap());
        assert!(!u.is_mapped(VirtAddr::new(0x1000_0000)).unwrap());
    }

    #[test]
    fn test_fault_without_handler_kills() {
        let (mut k, out) = kernel();
        let id = k.env_create().unwrap();
        let mut u = UserEnv::attach(&mut k, id);
        assert_eq!(u.read_u32(VirtAddr::new(KERNBASE)), Err(UserError::Killed));
        assert!(u.kernel().env(id).is_none());
        assert!(out.contents().contains("user fault va f0000000"));
    }

    #[test]
    fn test_upcall_with_nothing_linked_kills() {
        let (mut k, out) = kernel();
        let id = k.env_create().unwrap();
        let mut u = UserEnv::attach(&mut k, id);
        let xstack = VirtAddr::new(UXSTACKTOP - PGSIZE as u32);
        u.sys_page_alloc(EnvId::CURRENT, xstack, PteFlags::USER_RW).unwrap();
        u.sys_env_set_pgfault_upcall(EnvId::CURRENT, VirtAddr::new(0x00ba_d000)).unwrap();
        assert_eq!(u.read_u32(VirtAddr::new(0x1000_0000)), Err(UserError::Killed));
        assert!(out.contents().contains("General Protection"));
    }

    static NESTED: AtomicUsize = AtomicUsize::new(0);
    const LAZY_A: u32 = 0x1000_0000;
    const LAZY_B: u32 = 0x2000_0000;

    /// Maps pages on demand; touching A first touches B.
    fn demand_alloc(env: &mut UserEnv<'_>, utf: &UTrapframe) -> Result<(), UserError> {
        if VirtAddr::new(utf.esp).on_exception_stack() {
            NESTED.fetch_add(1, Ordering::SeqCst);
        }
        let page = VirtAddr::new(utf.fault_va).align_down();
        if page.as_u32() == LAZY_A {
            env.read_u32(VirtAddr::new(LAZY_B))?;
        }
        env.sys_page_alloc(EnvId::CURRENT, page, PteFlags::USER_RW)
    }

    #[test]
    fn test_recursive_faults_nest_on_exception_stack() {
        let (mut k, _) = kernel();
        let id = k.env_create().unwrap();
        let mut u = UserEnv::attach(&mut k, id);
        u.set_pgfault_handler("demand_alloc", demand_alloc).unwrap();

        u.write_u32(VirtAddr::new(LAZY_A + 4), 7).unwrap();
        assert_eq!(u.read_u32(VirtAddr::new(LAZY_A + 4)), Ok(7));
        assert!(u.is_mapped(VirtAddr::new(LAZY_B)).unwrap());
        assert_eq!(NESTED.load(Ordering::SeqCst), 1);

        let tf = u.trapframe().unwrap();
        assert_eq!(tf.esp, USTACKTOP);
    }

    #[test]
    fn test_handler_that_fixes_nothing_is_unresolved() {
        fn ignore(_: &mut UserEnv<'_>, _: &UTrapframe) -> Result<(), UserError> {
            Ok(())
        }
        let (mut k, _) = kernel();
        let id = k.env_create().unwrap();
        let mut u = UserEnv::attach(&mut k, id);
        u.set_pgfault_handler("ignore", ignore).unwrap();
        assert_eq!(
            u.read_u32(VirtAddr::new(0x3000_0000)),
            Err(UserError::Unresolved(VirtAddr::new(0x3000_0000)))
        );
        assert!(u.kernel().env(id).is_some());
    }

    #[test]
    fn test_set_pgfault_handler_is_idempotent() {
        let (mut k, _) = kernel();
        let id = k.env_create().unwrap();
        let mut u = UserEnv::attach(&mut k, id);
        let a = u.set_pgfault_handler("demand_alloc", demand_alloc).unwrap();
        let free = u.kernel().machine().mem.free_count();
        let b = u.set_pgfault_handler("demand_alloc", demand_alloc).unwrap();
        assert_eq!(a, b);
        assert_eq!(u.kernel().machine().mem.free_count(), free);
        assert_eq!(u.kernel().env(id).unwrap().pgfault_upcall, Some(a));
    }

    #[test]
    fn test_panic_reports_and_destroys() {
        let (mut k, out) = kernel_with_input(&[]);
        let id = k.env_create().unwrap();
        let mut u = UserEnv::attach(&mut k, id);
        let err = u.panic("out of luck");
        assert_eq!(err, UserError::Panic(String::from("out of luck")));
        assert!(u.kernel().env(id).is_none());
        let text = out.contents();
        assert!(text.contains(&format!("user panic in [{}]: out of luck", id)));
        assert!(text.contains(&format!("[{}] exiting gracefully", id)));
    }

    #[test]
    fn test_not_runnable_process_cannot_run() {
        let (mut k, _) = kernel();
        let id = k.env_create().unwrap();
        let mut u = UserEnv::attach(&mut k, id);
        let child = u.sys_exofork().unwrap();
        let mut c = UserEnv::attach(u.kernel(), child);
        assert_eq!(c.sys_getenvid(), Err(UserError::NotRunnable));
    }
}

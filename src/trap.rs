//! x86 Trap Handling
//!
//! The single entry point from exceptions, interrupts and system calls
//! into the kernel.
//!
//! # Trap Classes
//! - Processor exceptions: vectors 0-19 (page fault, breakpoint, ...)
//! - System calls: `T_SYSCALL`
//! - Device interrupts: `IRQ_OFFSET` + line, spurious on line 7
//!
//! # Guarantees
//! - A frame trapped from user mode is copied into the process record
//!   first; all handling works on that copy, so a handler may reschedule
//! - Unexpected traps from user mode destroy the process; from kernel
//!   mode they halt the system
//! - A process destroyed inside the trap is reaped before the trap
//!   returns

use core::fmt;

use crate::env::EnvStatus;
use crate::kernel::{Kernel, Resume, TrapState};
use crate::kprintln;
use crate::memlayout::{VirtAddr, PGSIZE, UXSTACKTOP};
use crate::mm::PteFlags;
use crate::syscall;

// Processor exception vectors.
pub const T_DIVIDE: u32 = 0;
pub const T_DEBUG: u32 = 1;
pub const T_NMI: u32 = 2;
pub const T_BRKPT: u32 = 3;
pub const T_OFLOW: u32 = 4;
pub const T_BOUND: u32 = 5;
pub const T_ILLOP: u32 = 6;
pub const T_DEVICE: u32 = 7;
pub const T_DBLFLT: u32 = 8;
pub const T_TSS: u32 = 10;
pub const T_SEGNP: u32 = 11;
pub const T_STACK: u32 = 12;
pub const T_GPFLT: u32 = 13;
pub const T_PGFLT: u32 = 14;
pub const T_FPERR: u32 = 16;
pub const T_ALIGN: u32 = 17;
pub const T_MCHK: u32 = 18;
pub const T_SIMDERR: u32 = 19;

/// System call vector.
pub const T_SYSCALL: u32 = 48;

/// First vector used for device interrupts.
pub const IRQ_OFFSET: u32 = 32;
pub const IRQ_TIMER: u32 = 0;
pub const IRQ_KBD: u32 = 1;
pub const IRQ_SERIAL: u32 = 4;
pub const IRQ_SPURIOUS: u32 = 7;
pub const IRQ_IDE: u32 = 14;
pub const IRQ_ERROR: u32 = 19;

// Segment selectors.
pub const GD_KT: u16 = 0x08;
pub const GD_KD: u16 = 0x10;
pub const GD_UT: u16 = 0x18;
pub const GD_UD: u16 = 0x20;

/// Trap flag (single step).
pub const FL_TF: u32 = 0x0000_0100;
/// Interrupt enable flag.
pub const FL_IF: u32 = 0x0000_0200;

/// Size in bytes of the fault record pushed on the exception stack.
pub const UTF_SIZE: usize = 13 * 4;

/// General-purpose registers in `pushal` order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushRegs {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    /// Ignored on restore.
    pub oesp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
}

impl PushRegs {
    fn words(&self) -> [u32; 8] {
        [self.edi, self.esi, self.ebp, self.oesp, self.ebx, self.edx, self.ecx, self.eax]
    }

    fn from_words(w: &[u32]) -> Self {
        Self {
            edi: w[0],
            esi: w[1],
            ebp: w[2],
            oesp: w[3],
            ebx: w[4],
            edx: w[5],
            ecx: w[6],
            eax: w[7],
        }
    }
}

/// Register state saved when control enters the kernel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Trapframe {
    pub regs: PushRegs,
    pub es: u16,
    pub ds: u16,
    pub trapno: u32,
    pub err: u32,
    pub eip: u32,
    pub cs: u16,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u16,
}

impl Trapframe {
    /// Initial user-mode registers: user segments, interrupts enabled,
    /// stack at `esp`.
    pub fn user(esp: u32) -> Self {
        Self {
            es: GD_UD | 3,
            ds: GD_UD | 3,
            ss: GD_UD | 3,
            cs: GD_UT | 3,
            esp,
            eflags: FL_IF,
            ..Self::default()
        }
    }

    /// Kernel-mode registers, as for a trap taken inside the kernel.
    pub fn kernel(trapno: u32) -> Self {
        Self {
            es: GD_KD,
            ds: GD_KD,
            ss: GD_KD,
            cs: GD_KT,
            trapno,
            ..Self::default()
        }
    }

    /// Trapped from ring 3.
    #[inline]
    pub fn from_user(&self) -> bool {
        self.cs & 3 == 3
    }
}

impl fmt::Display for Trapframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  edi  0x{:08x}", self.regs.edi)?;
        writeln!(f, "  esi  0x{:08x}", self.regs.esi)?;
        writeln!(f, "  ebp  0x{:08x}", self.regs.ebp)?;
        writeln!(f, "  oesp 0x{:08x}", self.regs.oesp)?;
        writeln!(f, "  ebx  0x{:08x}", self.regs.ebx)?;
        writeln!(f, "  edx  0x{:08x}", self.regs.edx)?;
        writeln!(f, "  ecx  0x{:08x}", self.regs.ecx)?;
        writeln!(f, "  eax  0x{:08x}", self.regs.eax)?;
        writeln!(f, "  es   0x----{:04x}", self.es)?;
        writeln!(f, "  ds   0x----{:04x}", self.ds)?;
        writeln!(f, "  trap 0x{:08x} {}", self.trapno, trapname(self.trapno))?;
        writeln!(f, "  err  0x{:08x}", self.err)?;
        writeln!(f, "  eip  0x{:08x}", self.eip)?;
        writeln!(f, "  cs   0x----{:04x}", self.cs)?;
        writeln!(f, "  flag 0x{:08x}", self.eflags)?;
        writeln!(f, "  esp  0x{:08x}", self.esp)?;
        write!(f, "  ss   0x----{:04x}", self.ss)
    }
}

/// Fault record the kernel pushes on the user exception stack before
/// entering the page fault upcall.
///
/// Layout, lowest address first: fault address, error code, the eight
/// general registers, eip, eflags, esp.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UTrapframe {
    pub fault_va: u32,
    pub err: u32,
    pub regs: PushRegs,
    pub eip: u32,
    pub eflags: u32,
    pub esp: u32,
}

impl UTrapframe {
    pub fn to_bytes(&self) -> [u8; UTF_SIZE] {
        let mut words = [0u32; 13];
        words[0] = self.fault_va;
        words[1] = self.err;
        words[2..10].copy_from_slice(&self.regs.words());
        words[10] = self.eip;
        words[11] = self.eflags;
        words[12] = self.esp;

        let mut out = [0u8; UTF_SIZE];
        for (chunk, w) in out.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&w.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(raw: &[u8; UTF_SIZE]) -> Self {
        let mut words = [0u32; 13];
        for (w, chunk) in words.iter_mut().zip(raw.chunks_exact(4)) {
            *w = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Self {
            fault_va: words[0],
            err: words[1],
            regs: PushRegs::from_words(&words[2..10]),
            eip: words[10],
            eflags: words[11],
            esp: words[12],
        }
    }
}

/// Human-readable trap name.
pub fn trapname(trapno: u32) -> &'static str {
    const EXCNAMES: [&str; 20] = [
        "Divide error",
        "Debug",
        "Non-Maskable Interrupt",
        "Breakpoint",
        "Overflow",
        "BOUND Range Exceeded",
        "Invalid Opcode",
        "Device Not Available",
        "Double Fault",
        "Coprocessor Segment Overrun",
        "Invalid TSS",
        "Segment Not Present",
        "Stack Fault",
        "General Protection",
        "Page Fault",
        "(unknown trap)",
        "x87 FPU Floating-Point Error",
        "Alignment Check",
        "Machine-Check",
        "SIMD Floating-Point Exception",
    ];

    if let Some(name) = EXCNAMES.get(trapno as usize) {
        return name;
    }
    if trapno == T_SYSCALL {
        return "System call";
    }
    if (IRQ_OFFSET..IRQ_OFFSET + 16).contains(&trapno) {
        return "Hardware Interrupt";
    }
    "(unknown trap)"
}

/// Trap class, decided by vector number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapKind {
    /// Processor exception with its vector.
    Exception(u32),
    SystemCall,
    /// Device interrupt with its IRQ line.
    Device(u32),
    Spurious,
    Unknown,
}

impl TrapKind {
    pub fn classify(trapno: u32) -> Self {
        match trapno {
            0..=19 => Self::Exception(trapno),
            T_SYSCALL => Self::SystemCall,
            n if n == IRQ_OFFSET + IRQ_SPURIOUS => Self::Spurious,
            n if (IRQ_OFFSET..IRQ_OFFSET + 16).contains(&n) => Self::Device(n - IRQ_OFFSET),
            _ => Self::Unknown,
        }
    }
}

/// Where the frame being handled lives.
#[derive(Clone, Copy)]
enum Frame {
    /// In the current process's record (trapped from user mode).
    Env(usize),
    /// On the kernel stack (trapped from kernel mode).
    Kernel(Trapframe),
}

impl Kernel {
    /// Handle a trap.
    ///
    /// `tf` is the frame the hardware pushed. Returns what the CPU runs
    /// next: a process, the interrupted kernel code, or nothing.
    ///
    /// # Panics
    /// Panics on a trap from user mode with no current process, on a
    /// nested trap, and on unexpected traps taken in kernel mode.
    pub fn trap(&mut self, tf: Trapframe) -> Resume {
        if self.trap_state != TrapState::Idle {
            panic!("trap {} while {:?}", trapname(tf.trapno), self.trap_state);
        }
        self.trap_state = TrapState::Dispatching;
        log::trace!("trap {:#x} ({})", tf.trapno, trapname(tf.trapno));

        let mut frame = if tf.from_user() {
            let cur = match self.curenv {
                Some(cur) => cur,
                None => panic!("trap from user mode with no current environment"),
            };
            self.envs.get_mut(cur).tf = tf;
            Frame::Env(cur)
        } else {
            Frame::Kernel(tf)
        };

        self.trap_state = TrapState::RunningHandler;
        self.trap_dispatch(&mut frame);

        self.trap_state = TrapState::Returning;
        let resume = match frame {
            Frame::Kernel(tf) => Resume::Kernel(tf),
            Frame::Env(cur) => self.trap_return(cur),
        };
        self.trap_state = TrapState::Idle;
        resume
    }

    fn frame_tf(&self, frame: &Frame) -> Trapframe {
        match frame {
            Frame::Env(cur) => self.envs.get(*cur).tf,
            Frame::Kernel(tf) => *tf,
        }
    }

    fn store_tf(&mut self, frame: &mut Frame, tf: Trapframe) {
        match frame {
            Frame::Env(cur) => {
                let env = self.envs.get_mut(*cur);
                if !env.is_free() {
                    env.tf = tf;
                }
            }
            Frame::Kernel(saved) => *saved = tf,
        }
    }

    fn trap_dispatch(&mut self, frame: &mut Frame) {
        let tf = self.frame_tf(frame);
        let from_user = matches!(frame, Frame::Env(_));
        match (TrapKind::classify(tf.trapno), from_user) {
            (TrapKind::Exception(T_PGFLT), _) => self.page_fault_handler(frame),
            (TrapKind::Exception(T_BRKPT), _) => {
                let mut tf = tf;
                self.monitor(Some(&mut tf));
                self.store_tf(frame, tf);
            }
            (TrapKind::Exception(T_DEBUG), _) => {
                let mut tf = tf;
                self.monitor_debug(&mut tf);
                self.store_tf(frame, tf);
            }
            (TrapKind::SystemCall, true) => {
                let r = tf.regs;
                let ret = syscall::dispatch(self, r.eax, r.edx, r.ecx, r.ebx, r.edi, r.esi);
                if let Frame::Env(cur) = *frame {
                    let env = self.envs.get_mut(cur);
                    if !env.is_free() {
                        env.tf.regs.eax = ret as u32;
                    }
                }
            }
            (TrapKind::Device(IRQ_TIMER), true) => {
                self.reschedule = true;
            }
            (TrapKind::Device(irq), true) => {
                log::debug!("ignoring irq {}", irq);
            }
            (TrapKind::Spurious, _) => {
                kprintln!(self.console, "Spurious interrupt on irq {}", IRQ_SPURIOUS);
                self.print_trapframe(&tf);
            }
            (_, false) => {
                self.print_trapframe(&tf);
                panic!("unhandled trap in kernel");
            }
            (_, true) => {
                self.print_trapframe(&tf);
                if let Frame::Env(cur) = *frame {
                    self.env_destroy_slot(cur);
                }
            }
        }
    }

    /// Leave the trap: reap a dying process, then resume the current one
    /// if it can still run, or pick another.
    fn trap_return(&mut self, cur: usize) -> Resume {
        if self.envs.status(cur) == EnvStatus::Dying {
            self.env_free(cur);
        }
        let still_running = self.curenv == Some(cur) && self.envs.status(cur) == EnvStatus::Running;
        if still_running && !self.reschedule {
            return Resume::Env(self.envs.get(cur).id);
        }
        self.reschedule = false;
        self.sched_yield()
    }

    /// Render a trap frame on the debug console.
    pub fn print_trapframe(&mut self, tf: &Trapframe) {
        kprintln!(self.console, "TRAP frame");
        kprintln!(self.console, "{}", tf);
    }

    fn page_fault_handler(&mut self, frame: &mut Frame) {
        let fault_va = self.machine.mmu.cr2();
        let cur = match *frame {
            Frame::Env(cur) => cur,
            Frame::Kernel(tf) => {
                self.print_trapframe(&tf);
                panic!("page fault in kernel mode at va {}", fault_va);
            }
        };
        self.deliver_page_fault(cur, fault_va);
    }

    /// Send a user page fault to the process's upcall, or destroy the
    /// process if it cannot take it.
    ///
    /// The fault record goes just below UXSTACKTOP, or, when the fault
    /// hit while already on the exception stack, below the trap-time
    /// stack pointer with one word of scratch space in between.
    fn deliver_page_fault(&mut self, cur: usize, fault_va: VirtAddr) {
        let env = self.envs.get(cur);
        let id = env.id;
        let tf = env.tf;

        let Some(upcall) = env.pgfault_upcall else {
            kprintln!(self.console, "[{}] user fault va {:08x} ip {:08x}", id, fault_va.as_u32(), tf.eip);
            self.print_trapframe(&tf);
            self.env_destroy_slot(cur);
            return;
        };
        let pgdir = match env.pgdir {
            Some(pgdir) => pgdir,
            None => panic!("page fault in env {} without a page directory", id),
        };

        let esp = VirtAddr::new(tf.esp);
        let top = if esp.on_exception_stack() {
            tf.esp - 4
        } else {
            UXSTACKTOP
        };
        let utf_va = VirtAddr::new(top.wrapping_sub(UTF_SIZE as u32));

        let writable = PteFlags::USER | PteFlags::WRITABLE;
        let checked = if utf_va.as_u32() < UXSTACKTOP - PGSIZE as u32 || utf_va.as_u32() > top {
            Err(utf_va)
        } else {
            self.machine.user_mem_check(pgdir, utf_va, UTF_SIZE, writable)
        };
        if let Err(bad) = checked {
            kprintln!(self.console, "[{}] user_mem_check assertion failure for va {:08x}", id, bad.as_u32());
            self.env_destroy_slot(cur);
            return;
        }

        let utf = UTrapframe {
            fault_va: fault_va.as_u32(),
            err: tf.err,
            regs: tf.regs,
            eip: tf.eip,
            eflags: tf.eflags,
            esp: tf.esp,
        };
        if self.machine.copy_to(pgdir, utf_va, &utf.to_bytes()).is_err() {
            self.env_destroy_slot(cur);
            return;
        }

        let env = self.envs.get_mut(cur);
        env.tf.eip = upcall.as_u32();
        env.tf.esp = utf_va.as_u32();
        log::debug!("[{}] page fault at {} sent to upcall {}", id, fault_va, upcall);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::EnvId;
    use crate::kernel::tests::{kernel, kernel_with_input};
    use crate::kernel::SystemState;
    use crate::memlayout::USTACKTOP;
    use crate::mm::Access;

    fn fault_on(k: &mut Kernel, id: EnvId, va: u32, write: bool) -> Resume {
        let access = Access { write, user: true };
        let fault = k.machine_mut().translate(VirtAddr::new(va), access).unwrap_err();
        let mut tf = k.env(id).unwrap().tf;
        tf.trapno = T_PGFLT;
        tf.err = fault.err;
        k.trap(tf)
    }

    fn running_env(k: &mut Kernel) -> EnvId {
        let id = k.env_create().unwrap();
        k.env_run(id.slot());
        id
    }

    #[test]
    fn test_classify() {
        assert_eq!(TrapKind::classify(T_PGFLT), TrapKind::Exception(T_PGFLT));
        assert_eq!(TrapKind::classify(T_SYSCALL), TrapKind::SystemCall);
        assert_eq!(TrapKind::classify(IRQ_OFFSET + IRQ_TIMER), TrapKind::Device(IRQ_TIMER));
        assert_eq!(TrapKind::classify(IRQ_OFFSET + IRQ_SPURIOUS), TrapKind::Spurious);
        assert_eq!(TrapKind::classify(200), TrapKind::Unknown);
        assert_eq!(trapname(T_GPFLT), "General Protection");
        assert_eq!(trapname(IRQ_OFFSET + IRQ_IDE), "Hardware Interrupt");
    }

    #[test]
    fn test_utrapframe_layout() {
        let utf = UTrapframe {
            fault_va: 0xdead_b000,
            err: 7,
            regs: PushRegs { eax: 0x11, ..PushRegs::default() },
            eip: 0x80_0020,
            eflags: FL_IF,
            esp: USTACKTOP - 8,
        };
        let raw = utf.to_bytes();
        assert_eq!(&raw[0..4], &0xdead_b000u32.to_le_bytes());
        assert_eq!(&raw[36..40], &0x11u32.to_le_bytes());
        assert_eq!(&raw[48..52], &(USTACKTOP - 8).to_le_bytes());
        assert_eq!(UTrapframe::from_bytes(&raw), utf);
    }

    #[test]
    fn test_fault_without_upcall_destroys_env() {
        let (mut k, out) = kernel();
        let id = running_env(&mut k);
        let resume = fault_on(&mut k, id, 0x1000_0000, false);
        assert!(k.env(id).is_none());
        assert_eq!(resume, Resume::Halted);
        assert_eq!(k.state(), SystemState::Interactive);
        let text = out.contents();
        assert!(text.contains(&format!("[{}] user fault va 10000000 ip 00000000", id)));
        assert!(text.contains("trap 0x0000000e Page Fault"));
        assert_eq!(k.trap_state(), TrapState::Idle);
    }

    #[test]
    fn test_fault_with_upcall_pushes_record() {
        let (mut k, _) = kernel();
        let id = running_env(&mut k);
        let pgdir = k.env(id).unwrap().pgdir.unwrap();
        let xstack = k.machine.mem.alloc().unwrap();
        k.machine
            .page_insert(pgdir, xstack, VirtAddr::new(UXSTACKTOP - PGSIZE as u32), PteFlags::USER_RW)
            .unwrap();
        k.env_mut(id).unwrap().pgfault_upcall = Some(VirtAddr::new(0x80_0040));
        k.env_mut(id).unwrap().tf.eip = 0x80_1234;

        let resume = fault_on(&mut k, id, 0x1000_0004, true);
        assert_eq!(resume, Resume::Env(id));

        let tf = k.env(id).unwrap().tf;
        assert_eq!(tf.eip, 0x80_0040);
        assert_eq!(tf.esp, UXSTACKTOP - UTF_SIZE as u32);
        let mut raw = [0u8; UTF_SIZE];
        k.machine.copy_from(pgdir, VirtAddr::new(tf.esp), &mut raw).unwrap();
        let utf = UTrapframe::from_bytes(&raw);
        assert_eq!(utf.fault_va, 0x1000_0004);
        assert_eq!(utf.err, crate::mm::FEC_U | crate::mm::FEC_WR);
        assert_eq!(utf.eip, 0x80_1234);
        assert_eq!(utf.esp, USTACKTOP);

        // recursive fault while on the exception stack leaves one word
        let resume = fault_on(&mut k, id, 0x1000_0008, false);
        assert_eq!(resume, Resume::Env(id));
        let nested = k.env(id).unwrap().tf;
        assert_eq!(nested.esp, tf.esp - 4 - UTF_SIZE as u32);
    }

    #[test]
    fn test_fault_with_unmapped_exception_stack_destroys_env() {
        let (mut k, out) = kernel();
        let id = running_env(&mut k);
        k.env_mut(id).unwrap().pgfault_upcall = Some(VirtAddr::new(0x80_0040));
        fault_on(&mut k, id, 0x1000_0000, true);
        assert!(k.env(id).is_none());
        assert!(out.contents().contains("user_mem_check assertion failure"));
    }

    #[test]
    fn test_timer_interrupt_rotates_processes() {
        let (mut k, _) = kernel();
        let _idle = k.env_create().unwrap();
        let a = k.env_create().unwrap();
        let b = k.env_create().unwrap();
        k.env_run(a.slot());

        let mut tf = k.env(a).unwrap().tf;
        tf.trapno = IRQ_OFFSET + IRQ_TIMER;
        assert_eq!(k.trap(tf), Resume::Env(b));
        let mut tf = k.env(b).unwrap().tf;
        tf.trapno = IRQ_OFFSET + IRQ_TIMER;
        assert_eq!(k.trap(tf), Resume::Env(a));
    }

    #[test]
    fn test_unknown_user_trap_destroys_env() {
        let (mut k, out) = kernel();
        let id = running_env(&mut k);
        let mut tf = k.env(id).unwrap().tf;
        tf.trapno = T_DIVIDE;
        k.trap(tf);
        assert!(k.env(id).is_none());
        assert!(out.contents().contains("Divide error"));
    }

    #[test]
    fn test_spurious_interrupt_resumes_same_env() {
        let (mut k, out) = kernel();
        let id = running_env(&mut k);
        let mut tf = k.env(id).unwrap().tf;
        tf.trapno = IRQ_OFFSET + IRQ_SPURIOUS;
        assert_eq!(k.trap(tf), Resume::Env(id));
        assert!(out.contents().contains("Spurious interrupt on irq 7"));
    }

    #[test]
    fn test_breakpoint_runs_monitor_and_resumes() {
        let (mut k, out) = kernel_with_input(&["help", "cont"]);
        let id = running_env(&mut k);
        let mut tf = k.env(id).unwrap().tf;
        tf.trapno = T_BRKPT;
        tf.eflags |= FL_TF;
        assert_eq!(k.trap(tf), Resume::Env(id));
        assert_eq!(k.env(id).unwrap().tf.eflags & FL_TF, 0);
        assert!(out.contents().contains("K> help"));
    }

    #[test]
    fn test_kernel_breakpoint_returns_to_kernel() {
        let (mut k, _) = kernel_with_input(&["next"]);
        let resume = k.trap(Trapframe::kernel(T_BRKPT));
        match resume {
            Resume::Kernel(tf) => assert_ne!(tf.eflags & FL_TF, 0),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    #[should_panic(expected = "page fault in kernel mode")]
    fn test_kernel_page_fault_panics() {
        let (mut k, _) = kernel();
        k.trap(Trapframe::kernel(T_PGFLT));
    }

    #[test]
    #[should_panic(expected = "unhandled trap in kernel")]
    fn test_kernel_unknown_trap_panics() {
        let (mut k, _) = kernel();
        k.trap(Trapframe::kernel(T_GPFLT));
    }
}

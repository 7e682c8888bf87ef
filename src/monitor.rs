//! Kernel Monitor
//!
//! A small command interpreter on the debug console, entered on
//! breakpoints, single-step traps and when nothing is left to run.
//!
//! # Commands
//! - `help`, `kerninfo`, `envs`
//! - `showmappings <lo> <hi>`, `setperm <va> <perm>`
//! - `dumpva <lo> <hi>`, `dumppa <lo> <hi>`
//! - `next`, `cont` (only with a trap frame)
//!
//! Addresses are `0x`-prefixed hex. A session ends when a command asks
//! to leave or the console runs out of input.

use alloc::vec::Vec;

use crate::config::KernelConfig;
use crate::kernel::Kernel;
use crate::memlayout::{
    PhysAddr, VirtAddr, KERNBASE, PGSIZE, ULIM, USTACKTOP, UTEXT, UTOP, UVPT, UXSTACKTOP,
};
use crate::mm::PteFlags;
use crate::trap::{Trapframe, FL_TF};
use crate::{kprint, kprintln};

const MAXARGS: usize = 16;
const PROMPT: &str = "K> ";
const DEBUG_PROMPT: &str = "DEBUG (next/cont) >> ";
/// Bytes per hex dump row.
const DUMP_ROW: u32 = 16;

/// How a monitor session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorExit {
    /// A command (`next`, `cont`) asked to resume.
    Leave,
    /// The console has no more input.
    InputClosed,
}

/// What the interpreter does after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Stay,
    Leave,
}

type CommandFn = fn(&mut Kernel, &[&str], Option<&mut Trapframe>) -> Flow;

struct Command {
    name: &'static str,
    desc: &'static str,
    func: CommandFn,
}

static COMMANDS: &[Command] = &[
    Command { name: "help", desc: "Display this list of commands", func: mon_help },
    Command { name: "kerninfo", desc: "Display information about the kernel", func: mon_kerninfo },
    Command {
        name: "showmappings",
        desc: "Display the physical page mappings and permission bits",
        func: mon_showmappings,
    },
    Command { name: "setperm", desc: "Set the permission bits of a mapping", func: mon_setperm },
    Command { name: "dumpva", desc: "Dump memory between two virtual addresses", func: mon_dumpva },
    Command { name: "dumppa", desc: "Dump memory between two physical addresses", func: mon_dumppa },
    Command { name: "envs", desc: "List the live environments", func: mon_envs },
    Command { name: "setmappingperm", desc: "Same as setperm", func: mon_setperm },
    Command { name: "dumpph", desc: "Same as dumppa", func: mon_dumppa },
    Command { name: "next", desc: "(debug) next instruction", func: mon_next },
    Command { name: "cont", desc: "(debug) continue execution", func: mon_cont },
];

/// Parse a `0x`-prefixed hex number.
pub fn parse_addr(s: &str) -> Option<u32> {
    let digits = s.strip_prefix("0x")?;
    if digits.is_empty() {
        return None;
    }
    u32::from_str_radix(digits, 16).ok()
}

fn parse_range(k: &mut Kernel, args: &[&str]) -> Option<(u32, u32)> {
    let range = match args {
        [_, lo, hi] => parse_addr(lo).zip(parse_addr(hi)),
        _ => None,
    };
    match range {
        Some((lo, hi)) if lo <= hi => Some((lo, hi)),
        _ => {
            kprintln!(k.console, "usage: {} <lo> <hi>", args[0]);
            None
        }
    }
}

fn mon_help(k: &mut Kernel, _: &[&str], _: Option<&mut Trapframe>) -> Flow {
    for cmd in COMMANDS {
        kprintln!(k.console, "{} - {}", cmd.name, cmd.desc);
    }
    Flow::Stay
}

fn mon_kerninfo(k: &mut Kernel, _: &[&str], _: Option<&mut Trapframe>) -> Flow {
    let config: KernelConfig = *k.config();
    let tlb = k.machine.mmu.stats();
    kprintln!(k.console, "exokern v{}", crate::VERSION);
    kprintln!(k.console, "Virtual memory layout:");
    kprintln!(k.console, "  KERNBASE   {:08x}", KERNBASE);
    kprintln!(k.console, "  ULIM       {:08x}", ULIM);
    kprintln!(k.console, "  UVPT       {:08x}", UVPT);
    kprintln!(k.console, "  UTOP       {:08x}", UTOP);
    kprintln!(k.console, "  UXSTACKTOP {:08x}", UXSTACKTOP);
    kprintln!(k.console, "  USTACKTOP  {:08x}", USTACKTOP);
    kprintln!(k.console, "  UTEXT      {:08x}", UTEXT);
    kprintln!(
        k.console,
        "Physical memory: {}KB, {} frames, {} free",
        config.nframes * PGSIZE / 1024,
        k.machine.mem.nframes(),
        k.machine.mem.free_count()
    );
    kprintln!(
        k.console,
        "TLB: {} entries, {} hits, {} misses",
        config.tlb_entries,
        tlb.hits,
        tlb.misses
    );
    Flow::Stay
}

fn mon_showmappings(k: &mut Kernel, args: &[&str], _: Option<&mut Trapframe>) -> Flow {
    let Some((lo, hi)) = parse_range(k, args) else {
        return Flow::Stay;
    };
    let pgdir = k.current_pgdir();
    let mut va = lo & !(PGSIZE as u32 - 1);
    loop {
        match k.machine.page_lookup(pgdir, VirtAddr::new(va)) {
            Some(m) => {
                let bits = m.flags.describe();
                kprintln!(
                    k.console,
                    "0x{:08x}: 0x{:08x} {}",
                    va,
                    m.frame.addr().as_u32(),
                    core::str::from_utf8(&bits).unwrap_or("?")
                );
            }
            None => kprintln!(k.console, "0x{:08x}: not present", va),
        }
        match va.checked_add(PGSIZE as u32) {
            Some(next) if next <= hi => va = next,
            _ => break,
        }
    }
    Flow::Stay
}

fn mon_setperm(k: &mut Kernel, args: &[&str], _: Option<&mut Trapframe>) -> Flow {
    let parsed = match args {
        [_, va, perm] => parse_addr(va).zip(parse_addr(perm)),
        _ => None,
    };
    let Some((va, perm)) = parsed else {
        kprintln!(k.console, "usage: setperm <va> <perm>");
        return Flow::Stay;
    };

    let pgdir = k.current_pgdir();
    let va = VirtAddr::new(va);
    let perm = PteFlags::from_bits_truncate(perm & 0xfff);
    let Some(before) = k.machine.page_lookup(pgdir, va) else {
        kprintln!(k.console, "There is no mapping for 0x{:x}", va.as_u32());
        return Flow::Stay;
    };
    kprintln!(k.console, "pte = {:x}", before.frame.addr().as_u32() | before.flags.bits());
    if k.machine.set_permissions(pgdir, va, perm).is_ok() {
        if let Some(after) = k.machine.page_lookup(pgdir, va) {
            kprintln!(k.console, "pte = {:x}", after.frame.addr().as_u32() | after.flags.bits());
        }
    }
    Flow::Stay
}

/// Length of the dump row at `addr`: stops at `hi` and at the end of
/// the page.
fn row_len(addr: u32, hi: u32) -> usize {
    let page_left = PGSIZE as u32 - (addr & (PGSIZE as u32 - 1));
    DUMP_ROW.min(hi - addr).min(page_left) as usize
}

fn dump_row(k: &mut Kernel, addr: u32, bytes: &[u8]) {
    kprint!(k.console, "0x{:08x}:", addr);
    for b in bytes {
        kprint!(k.console, " {:02x}", b);
    }
    kprintln!(k.console);
}

fn mon_dumpva(k: &mut Kernel, args: &[&str], _: Option<&mut Trapframe>) -> Flow {
    let Some((lo, hi)) = parse_range(k, args) else {
        return Flow::Stay;
    };
    let pgdir = k.current_pgdir();
    let mut addr = lo;
    while addr < hi {
        let n = row_len(addr, hi);
        let mut row = [0u8; DUMP_ROW as usize];
        match k.machine.copy_from(pgdir, VirtAddr::new(addr), &mut row[..n]) {
            Ok(()) => dump_row(k, addr, &row[..n]),
            Err(_) => kprintln!(k.console, "0x{:08x}: not mapped", addr),
        }
        addr = match addr.checked_add(n as u32) {
            Some(next) => next,
            None => break,
        };
    }
    Flow::Stay
}

fn mon_dumppa(k: &mut Kernel, args: &[&str], _: Option<&mut Trapframe>) -> Flow {
    let Some((lo, hi)) = parse_range(k, args) else {
        return Flow::Stay;
    };
    let mut addr = lo;
    while addr < hi {
        let n = row_len(addr, hi);
        let mut row = [0u8; DUMP_ROW as usize];
        match k.machine.mem.read_phys(PhysAddr::new(addr), &mut row[..n]) {
            Ok(()) => dump_row(k, addr, &row[..n]),
            Err(_) => {
                kprintln!(k.console, "0x{:08x}: beyond physical memory", addr);
                break;
            }
        }
        addr += n as u32;
    }
    Flow::Stay
}

fn mon_envs(k: &mut Kernel, _: &[&str], _: Option<&mut Trapframe>) -> Flow {
    let rows: Vec<_> = k
        .envs
        .live()
        .map(|(slot, e)| (slot, e.id, e.parent_id, e.status, e.runs, e.pgfault_upcall))
        .collect();
    for (slot, id, parent, status, runs, upcall) in rows {
        kprint!(k.console, "[{}] slot {} parent {} {:?} runs {}", id, slot, parent, status, runs);
        if let Some(upcall) = upcall {
            kprint!(k.console, " upcall {:08x}", upcall.as_u32());
        }
        kprintln!(k.console);
    }
    Flow::Stay
}

fn mon_next(k: &mut Kernel, _: &[&str], tf: Option<&mut Trapframe>) -> Flow {
    match tf {
        Some(tf) => {
            tf.eflags |= FL_TF;
            Flow::Leave
        }
        None => {
            kprintln!(k.console, "next: no trap frame");
            Flow::Stay
        }
    }
}

fn mon_cont(k: &mut Kernel, _: &[&str], tf: Option<&mut Trapframe>) -> Flow {
    match tf {
        Some(tf) => {
            tf.eflags &= !FL_TF;
            Flow::Leave
        }
        None => {
            kprintln!(k.console, "cont: no trap frame");
            Flow::Stay
        }
    }
}

impl Kernel {
    /// Run the monitor until a command leaves or input runs out.
    ///
    /// Commands that resume execution edit `tf` in place.
    pub fn monitor(&mut self, mut tf: Option<&mut Trapframe>) -> MonitorExit {
        kprintln!(self.console, "Welcome to the exokern kernel monitor!");
        kprintln!(self.console, "Type 'help' for a list of commands.");
        if let Some(tf) = tf.as_deref() {
            self.print_trapframe(tf);
        }
        self.command_loop(PROMPT, tf.as_deref_mut())
    }

    /// Short monitor session after a single-step trap.
    pub fn monitor_debug(&mut self, tf: &mut Trapframe) -> MonitorExit {
        kprintln!(self.console, "current eip: {:x}", tf.eip);
        self.command_loop(DEBUG_PROMPT, Some(tf))
    }

    fn command_loop(&mut self, prompt: &str, mut tf: Option<&mut Trapframe>) -> MonitorExit {
        loop {
            let Some(line) = self.console.read_line(prompt) else {
                return MonitorExit::InputClosed;
            };
            if self.runcmd(&line, tf.as_deref_mut()) == Flow::Leave {
                return MonitorExit::Leave;
            }
        }
    }

    fn runcmd(&mut self, line: &str, tf: Option<&mut Trapframe>) -> Flow {
        let args: Vec<&str> = line.split_whitespace().collect();
        let Some(&name) = args.first() else {
            return Flow::Stay;
        };
        if args.len() >= MAXARGS {
            kprintln!(self.console, "Too many arguments (max {})", MAXARGS);
            return Flow::Stay;
        }
        match COMMANDS.iter().find(|c| c.name == name) {
            Some(cmd) => (cmd.func)(self, &args, tf),
            None => {
                kprintln!(self.console, "Unknown command '{}'", name);
                Flow::Stay
            }
        }
    }
}

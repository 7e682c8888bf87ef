//! Exokern - Paged Virtual-Memory Kernel Core
//!
//! The memory and process core of a small single-CPU x86-32 kernel,
//! run on an emulated machine so it can be driven and tested hosted.
//!
//! # Layers
//! - `mm`: physical frames, two-level page tables, the MMU and its TLB
//! - `env`, `sched`: the process table and round-robin scheduling
//! - `trap`, `syscall`: the only ways a process enters the kernel
//! - `monitor`: the interactive debug monitor
//! - `user`: the user library, including copy-on-write `fork`
//!
//! # Security Model
//! - Kernel memory is mapped supervisor-only above ULIM
//! - Every address and permission a process hands in is validated
//! - A process may only act on itself and its immediate children
//!
//! # Usage
//! ```ignore
//! let config = KernelConfig::default();
//! let mut kernel = Kernel::boot(config, Box::new(BufferConsole::new()))?;
//! let id = kernel.env_create()?;
//! let mut env = UserEnv::attach(&mut kernel, id);
//! let child = exokern::user::fork(&mut env)?;
//! ```

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]

extern crate alloc;

pub mod config;
pub mod console;
pub mod env;
pub mod error;
pub mod kernel;
pub mod logging;
pub mod memlayout;
pub mod mm;
pub mod monitor;
pub mod sched;
pub mod syscall;
pub mod trap;
pub mod user;

pub use config::KernelConfig;
pub use console::{BufferConsole, Console, ConsoleOutput};
pub use env::{EnvId, EnvStatus};
pub use error::{KResult, KernelError};
pub use kernel::{Kernel, Resume, SystemState};
pub use memlayout::{PhysAddr, VirtAddr};
pub use user::{UserEnv, UserError};

/// Kernel version string
pub const VERSION: &str = "0.1.0";

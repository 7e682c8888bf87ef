//! System Call Interface
//!
//! The kernel services user processes reach through `T_SYSCALL`.
//!
//! # Calling Convention
//! - `eax`: system call number
//! - `edx`, `ecx`, `ebx`, `edi`, `esi`: up to five arguments
//! - `eax` on return: a non-negative value, or a negative `KernelError`
//!
//! # Security Model
//! - Only the numbers in `numbers` are accepted; anything else is `Inval`
//! - Addresses and permission bits are validated before use
//! - Calls that name another process succeed only for the caller itself
//!   or its immediate children
//! - A bad buffer passed to `cputs` destroys the caller, as a fault
//!   would

mod handler;
mod validate;

pub use handler::{dispatch, numbers};
pub use validate::{check_perm, check_user_page, UserBuffer};

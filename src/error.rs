//! Kernel Error Kinds
//!
//! Recoverable failures reported up the call chain and, at the system
//! call boundary, as negative result codes. Invariant violations are not
//! represented here; they panic.

use core::fmt;

/// Errors returned by kernel routines and system calls.
///
/// The discriminants are the negative codes placed in `eax` when a
/// system call fails.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelError {
    /// Unspecified or unknown problem.
    Unspecified = -1,
    /// Process doesn't exist or otherwise cannot be used.
    BadEnv = -2,
    /// Invalid parameter.
    Inval = -3,
    /// Request failed due to memory shortage.
    NoMem = -4,
    /// Attempt to create a new process beyond the maximum allowed.
    NoFreeEnv = -5,
    /// Memory fault.
    Fault = -6,
}

impl KernelError {
    /// The negative result code for this error.
    #[inline]
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Decode a negative result code.
    ///
    /// Non-negative values are not errors and yield `None`; unknown
    /// negative codes decode as `Unspecified`.
    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            0.. => None,
            -2 => Some(Self::BadEnv),
            -3 => Some(Self::Inval),
            -4 => Some(Self::NoMem),
            -5 => Some(Self::NoFreeEnv),
            -6 => Some(Self::Fault),
            _ => Some(Self::Unspecified),
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unspecified => write!(f, "unspecified error"),
            Self::BadEnv => write!(f, "bad environment"),
            Self::Inval => write!(f, "invalid parameter"),
            Self::NoMem => write!(f, "out of memory"),
            Self::NoFreeEnv => write!(f, "out of environments"),
            Self::Fault => write!(f, "segmentation fault"),
        }
    }
}

/// Shorthand used throughout the kernel.
pub type KResult<T> = Result<T, KernelError>;

/// Convert a kernel result into the value left in `eax`.
#[inline]
pub fn into_syscall_ret(result: KResult<i32>) -> i32 {
    match result {
        Ok(v) => v,
        Err(e) => e.code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_round_trip_through_eax() {
        for e in [
            KernelError::Unspecified,
            KernelError::BadEnv,
            KernelError::Inval,
            KernelError::NoMem,
            KernelError::NoFreeEnv,
            KernelError::Fault,
        ] {
            assert!(e.code() < 0);
            assert_eq!(KernelError::from_code(e.code()), Some(e));
        }
    }

    #[test]
    fn test_non_negative_is_success() {
        assert_eq!(KernelError::from_code(0), None);
        assert_eq!(KernelError::from_code(0x1001), None);
        assert_eq!(KernelError::from_code(-99), Some(KernelError::Unspecified));
        assert_eq!(into_syscall_ret(Err(KernelError::NoMem)), -4);
        assert_eq!(into_syscall_ret(Ok(7)), 7);
    }
}

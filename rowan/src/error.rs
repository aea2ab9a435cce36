//! Kernel error codes.
//!
//! One enum for everything that can fail recoverably inside the kernel.
//! At the system-call boundary each variant maps to a small negative
//! integer handed back to user code; inside the kernel the variants are
//! matched directly. Conditions that can never be tolerated (allocator
//! exhaustion, a corrupt page table) are not errors, they are panics.

use core::fmt;

/// Recoverable kernel failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// An argument was malformed (null, misaligned, out of range).
    Invalid,
    /// The target already exists or is already in use.
    Busy,
    /// A resource table or memory pool is exhausted.
    NoMem,
    /// The named object does not exist.
    NotFound,
    /// The backing device failed.
    Io,
    /// A file or executable image is malformed.
    BadFormat,
    /// A user-supplied pointer failed validation.
    BadAddress,
    /// The operation is recognized but not supported.
    NotSupported,
    /// The caller has no child matching the request.
    NoChild,
}

impl Error {
    /// The negative integer reported to user space for this error.
    pub fn to_errno(self) -> i64 {
        match self {
            Error::Invalid => -1,
            Error::Busy => -2,
            Error::NoMem => -3,
            Error::NotFound => -4,
            Error::Io => -5,
            Error::BadFormat => -6,
            Error::BadAddress => -7,
            Error::NotSupported => -8,
            Error::NoChild => -9,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::Invalid => "invalid argument",
            Error::Busy => "resource busy",
            Error::NoMem => "out of memory",
            Error::NotFound => "not found",
            Error::Io => "i/o error",
            Error::BadFormat => "bad format",
            Error::BadAddress => "bad address",
            Error::NotSupported => "not supported",
            Error::NoChild => "no such child",
        };
        f.write_str(msg)
    }
}

/// Crate-wide result alias.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errnos_are_negative_and_distinct() {
        let all = [
            Error::Invalid,
            Error::Busy,
            Error::NoMem,
            Error::NotFound,
            Error::Io,
            Error::BadFormat,
            Error::BadAddress,
            Error::NotSupported,
            Error::NoChild,
        ];
        for (i, a) in all.iter().enumerate() {
            assert!(a.to_errno() < 0);
            for b in &all[i + 1..] {
                assert_ne!(a.to_errno(), b.to_errno());
            }
        }
    }
}

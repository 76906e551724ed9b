//! Kernel-visible error kinds returned by the syscall surface.
//!
//! Every syscall handler returns `Result<usize, SysError>`; the dispatcher
//! converts the error into a small negative `isize` at the ABI boundary.

use core::fmt;

/// Negative-return error codes visible to user code.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysError {
    /// Identifier does not name a live environment, or caller lacks
    /// permission to name it.
    BadEnv = -1,
    /// Argument failed validation (alignment, permission bits, range).
    Inval = -2,
    /// Physical memory exhausted.
    NoMem = -3,
    /// Environment table has no free slot.
    NoFreeEnv = -4,
    /// `ipc_try_send` target was not in the receive-blocked state
    /// (baseline variant only).
    IpcNotRecv = -5,
    /// Caller is no longer runnable; do not resume. Never actually
    /// observed by user code -- used internally to mark "yielded".
    Unspecified = -6,
}

impl fmt::Display for SysError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SysError::BadEnv => "bad environment id",
            SysError::Inval => "invalid argument",
            SysError::NoMem => "out of memory",
            SysError::NoFreeEnv => "no free environment slots",
            SysError::IpcNotRecv => "target not receiving",
            SysError::Unspecified => "unspecified",
        };
        write!(f, "{}", s)
    }
}

impl From<SysError> for isize {
    fn from(err: SysError) -> isize {
        err as i32 as isize
    }
}

pub type SysResult<T> = Result<T, SysError>;

//! Error types for the CastorOS kernel core.
//!
//! Two layers: [`KernelError`] carries structured context between kernel
//! subsystems, and [`Errno`] is the flat numeric category surfaced to user
//! mode through the system-call return word.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Memory-related errors
    OutOfMemory {
        requested: usize,
    },
    InvalidAddress {
        addr: usize,
    },
    UnmappedMemory {
        addr: usize,
    },
    Misaligned {
        addr: usize,
        align: usize,
    },
    DoubleFree {
        frame: u64,
    },

    /// Process-related errors
    ProcessNotFound {
        pid: u64,
    },
    NoChildren,
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    /// File and descriptor errors
    BadFileDescriptor {
        fd: i32,
    },
    TooManyOpenFiles,
    NotFound {
        resource: &'static str,
    },
    NotADirectory,
    IsADirectory,
    AlreadyExists {
        resource: &'static str,
    },

    /// Generic errors
    InvalidArgument {
        name: &'static str,
        value: &'static str,
    },
    PermissionDenied {
        operation: &'static str,
    },
    ResourceExhausted {
        resource: &'static str,
    },
    WouldBlock,
    Interrupted,
    NotImplemented {
        feature: &'static str,
    },
    /// Subsystem not initialized (called before init())
    NotInitialized {
        subsystem: &'static str,
    },
}

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::OutOfMemory { requested } => {
                write!(f, "out of memory (requested {} bytes)", requested)
            }
            KernelError::InvalidAddress { addr } => {
                write!(f, "invalid address {:#x}", addr)
            }
            KernelError::UnmappedMemory { addr } => {
                write!(f, "unmapped memory at {:#x}", addr)
            }
            KernelError::Misaligned { addr, align } => {
                write!(f, "address {:#x} not aligned to {:#x}", addr, align)
            }
            KernelError::DoubleFree { frame } => {
                write!(f, "double free of frame {}", frame)
            }
            KernelError::ProcessNotFound { pid } => write!(f, "no such process {}", pid),
            KernelError::NoChildren => write!(f, "no children to wait for"),
            KernelError::InvalidState { expected, actual } => {
                write!(f, "invalid state: expected {}, got {}", expected, actual)
            }
            KernelError::BadFileDescriptor { fd } => write!(f, "bad file descriptor {}", fd),
            KernelError::TooManyOpenFiles => write!(f, "too many open files"),
            KernelError::NotFound { resource } => write!(f, "{} not found", resource),
            KernelError::NotADirectory => write!(f, "not a directory"),
            KernelError::IsADirectory => write!(f, "is a directory"),
            KernelError::AlreadyExists { resource } => write!(f, "{} already exists", resource),
            KernelError::InvalidArgument { name, value } => {
                write!(f, "invalid argument {}: {}", name, value)
            }
            KernelError::PermissionDenied { operation } => {
                write!(f, "permission denied: {}", operation)
            }
            KernelError::ResourceExhausted { resource } => {
                write!(f, "resource exhausted: {}", resource)
            }
            KernelError::WouldBlock => write!(f, "operation would block"),
            KernelError::Interrupted => write!(f, "interrupted"),
            KernelError::NotImplemented { feature } => {
                write!(f, "not implemented: {}", feature)
            }
            KernelError::NotInitialized { subsystem } => {
                write!(f, "{} not initialized", subsystem)
            }
        }
    }
}

/// Numeric error categories surfaced to user mode.
///
/// System calls return a single machine word: `>= 0` on success, the
/// negated `Errno` value otherwise.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    InvalidArgument = 1,
    NoSuchFileOrDirectory = 2,
    PermissionDenied = 3,
    FileExists = 4,
    NotADirectory = 5,
    IsADirectory = 6,
    TooManyOpenFiles = 7,
    BadFileDescriptor = 8,
    WouldBlock = 9,
    Interrupted = 10,
    OutOfMemory = 11,
    NoSuchProcess = 12,
    NotImplemented = 13,
}

impl Errno {
    /// The negative return word for this category.
    pub const fn as_return_word(self) -> isize {
        -(self as i32 as isize)
    }
}

impl From<KernelError> for Errno {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::OutOfMemory { .. } => Errno::OutOfMemory,
            KernelError::InvalidAddress { .. }
            | KernelError::UnmappedMemory { .. }
            | KernelError::Misaligned { .. }
            | KernelError::InvalidArgument { .. }
            | KernelError::InvalidState { .. }
            | KernelError::DoubleFree { .. } => Errno::InvalidArgument,
            KernelError::ProcessNotFound { .. } | KernelError::NoChildren => Errno::NoSuchProcess,
            KernelError::BadFileDescriptor { .. } => Errno::BadFileDescriptor,
            KernelError::TooManyOpenFiles | KernelError::ResourceExhausted { .. } => {
                Errno::TooManyOpenFiles
            }
            KernelError::NotFound { .. } => Errno::NoSuchFileOrDirectory,
            KernelError::NotADirectory => Errno::NotADirectory,
            KernelError::IsADirectory => Errno::IsADirectory,
            KernelError::AlreadyExists { .. } => Errno::FileExists,
            KernelError::PermissionDenied { .. } => Errno::PermissionDenied,
            KernelError::WouldBlock => Errno::WouldBlock,
            KernelError::Interrupted => Errno::Interrupted,
            KernelError::NotImplemented { .. } | KernelError::NotInitialized { .. } => {
                Errno::NotImplemented
            }
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn errno_return_word_is_negative() {
        assert_eq!(Errno::InvalidArgument.as_return_word(), -1);
        assert_eq!(Errno::NoSuchProcess.as_return_word(), -12);
    }

    #[test]
    fn kernel_error_lowers_to_errno_category() {
        assert_eq!(
            Errno::from(KernelError::OutOfMemory { requested: 4096 }),
            Errno::OutOfMemory
        );
        assert_eq!(
            Errno::from(KernelError::BadFileDescriptor { fd: 7 }),
            Errno::BadFileDescriptor
        );
        assert_eq!(Errno::from(KernelError::WouldBlock), Errno::WouldBlock);
    }
}

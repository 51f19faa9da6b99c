//! Process control: creation, fork, exec, exit, and reaping.

pub mod exec;
pub mod exit;
pub mod fd;
pub mod fork;

use bitflags::bitflags;

use crate::mm::AddressSpace;
use crate::sched::{self, Pid};

bitflags! {
    /// `waitpid` options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WaitOptions: u32 {
        const WNOHANG = 1 << 0;
    }
}

/// Raw pointer to the current task's address space, `None` for kernel
/// threads and the boot context (which run on the kernel template).
///
/// The pointer stays valid while the task exists; callers must finish
/// using it before the task can be reaped.
pub fn current_address_space_ptr() -> Option<*mut AddressSpace> {
    sched::with_current_mut(|task| {
        task.address_space
            .as_mut()
            .map(|space| space as *mut AddressSpace)
    })
    .flatten()
}

/// PID of the current task.
pub fn getpid() -> Pid {
    sched::current_pid().unwrap_or(Pid(0))
}

/// Parent PID of the current task.
pub fn getppid() -> Pid {
    sched::with_current_mut(|task| task.ppid).unwrap_or(Pid(0))
}

//! Task control block.
//!
//! A [`Task`] is both the scheduling and the protection unit. Tasks live
//! in the scheduler's arena and refer to each other only by [`Pid`]; wait
//! queues and parent/child links hold PIDs, never pointers.

extern crate alloc;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

use crate::arch::context::{ArchContext, ThreadContext};
use crate::arch::port::interrupts::InterruptFrame;
use crate::mm::AddressSpace;
use crate::process::fd::FdTable;

/// Process identifier. Never reused while an uncollected zombie holds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub u64);

impl core::fmt::Display for Pid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Created, not yet runnable.
    New,
    /// On the ready queue.
    Ready,
    /// The one task owning the CPU.
    Running,
    /// Off all run queues, waiting for a wake.
    Blocked,
    /// Exited, awaiting `waitpid` by the parent.
    Zombie,
}

/// Default time slice in timer ticks.
pub const DEFAULT_TIME_SLICE: u32 = 10;

/// Kernel stack size per task.
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

/// Where anonymous `mmap` placements begin in a fresh user space.
pub const MMAP_REGION_BASE: u64 = 0x2000_0000;

/// Per-task scheduling statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskStats {
    /// Ticks spent running.
    pub runtime_ticks: u64,
    /// Times this task was given the CPU.
    pub run_count: u64,
    /// Involuntary preemptions at slice expiry.
    pub preempt_count: u64,
    /// Voluntary yields and blocks.
    pub yield_count: u64,
}

/// Task control block.
pub struct Task {
    pub pid: Pid,
    pub ppid: Pid,
    pub name: String,
    pub state: TaskState,
    /// Saved CPU state while not running.
    pub context: ArchContext,
    /// Kernel stack backing; the top is the published transition stack.
    pub kernel_stack: Box<[u8]>,
    /// User address space. `None` for the idle task and kernel threads,
    /// which run on the kernel template.
    pub address_space: Option<AddressSpace>,
    pub open_files: FdTable,
    pub cwd: String,
    pub user_entry: u64,
    pub user_stack: u64,
    /// Program break: start (end of the loaded image) and current end.
    pub brk_start: u64,
    pub brk: u64,
    /// Bump pointer for anonymous `mmap` placements.
    pub mmap_next: u64,
    pub exit_code: i32,
    pub time_slice: u32,
    pub children: Vec<Pid>,
    pub stats: TaskStats,
    /// The live trap frame while this task executes a system call. Read
    /// by `fork` to duplicate the exact user state.
    pub syscall_frame: Option<*mut InterruptFrame>,
}

// SAFETY: tasks are only reached through the scheduler's IRQ-save lock on
// a uniprocessor; the raw frame pointer is valid exactly while its task is
// inside a system call.
unsafe impl Send for Task {}

impl Task {
    /// Build a kernel-thread task entering `entry`.
    pub fn new_kernel(pid: Pid, name: String, entry: usize) -> Self {
        let kernel_stack = alloc::vec![0u8; KERNEL_STACK_SIZE].into_boxed_slice();
        let stack_top = kernel_stack.as_ptr() as usize + KERNEL_STACK_SIZE;
        Self {
            pid,
            ppid: Pid(0),
            name,
            state: TaskState::New,
            context: ArchContext::new_kernel(entry, stack_top),
            kernel_stack,
            address_space: None,
            open_files: FdTable::new(),
            cwd: String::from("/"),
            user_entry: 0,
            user_stack: 0,
            brk_start: 0,
            brk: 0,
            mmap_next: 0,
            exit_code: 0,
            time_slice: DEFAULT_TIME_SLICE,
            children: Vec::new(),
            stats: TaskStats::default(),
            syscall_frame: None,
        }
    }

    /// Build a user task entering `user_entry` on `user_stack_top` in the
    /// given address space.
    pub fn new_user(
        pid: Pid,
        ppid: Pid,
        name: String,
        address_space: AddressSpace,
        user_entry: u64,
        user_stack_top: u64,
    ) -> Self {
        let kernel_stack = alloc::vec![0u8; KERNEL_STACK_SIZE].into_boxed_slice();
        let stack_top = kernel_stack.as_ptr() as usize + KERNEL_STACK_SIZE;
        Self {
            pid,
            ppid,
            name,
            state: TaskState::New,
            context: ArchContext::new_user(user_entry as usize, user_stack_top as usize, stack_top),
            kernel_stack,
            address_space: Some(address_space),
            open_files: FdTable::new(),
            cwd: String::from("/"),
            user_entry,
            user_stack: user_stack_top,
            brk_start: 0,
            brk: 0,
            mmap_next: MMAP_REGION_BASE,
            exit_code: 0,
            time_slice: DEFAULT_TIME_SLICE,
            children: Vec::new(),
            stats: TaskStats::default(),
            syscall_frame: None,
        }
    }

    /// Top of the kernel stack (published to the CPU on switch-in).
    pub fn kernel_stack_top(&self) -> usize {
        self.kernel_stack.as_ptr() as usize + self.kernel_stack.len()
    }

    pub fn is_zombie(&self) -> bool {
        self.state == TaskState::Zombie
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn kernel_task_has_full_slice_and_stack() {
        let task = Task::new_kernel(Pid(9), String::from("worker"), 0x1000);
        assert_eq!(task.state, TaskState::New);
        assert_eq!(task.time_slice, DEFAULT_TIME_SLICE);
        assert_eq!(task.kernel_stack_top() % 8, 0);
        assert!(task.address_space.is_none());
    }
}

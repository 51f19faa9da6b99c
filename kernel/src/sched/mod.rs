//! Preemptive round-robin scheduling.

pub mod scheduler;
pub mod task;

pub use scheduler::{
    add_ready, block_current, block_on, current_pid, init, preempt, remove, reschedule,
    should_preempt, spawn, spawn_kernel_thread, take_task, tick, wake, with_current_mut,
    with_task_mut, yield_now,
};
pub use task::{Pid, Task, TaskState, TaskStats, DEFAULT_TIME_SLICE, KERNEL_STACK_SIZE};

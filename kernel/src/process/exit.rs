//! Task termination and reaping.
//!
//! `exit` turns the task into a zombie holding only its PID, exit code,
//! and parent link; resources are released immediately. The parent
//! collects the code with `waitpid`, which frees the zombie slot.
//! `kill` is terminate-only: the supported signals end the target with a
//! signal-coded exit, with no queued delivery.

extern crate alloc;

use crate::error::{KernelError, KernelResult};
use crate::mm::KernelFrameSource;
use crate::sched::{self, Pid, TaskState};
use crate::sync::WaitQueue;

use super::WaitOptions;

/// Signal numbers with terminate semantics.
pub const SIGKILL: i32 = 9;
pub const SIGSEGV: i32 = 11;
pub const SIGTERM: i32 = 15;

/// Exit-code encoding for signal deaths (128 + signal).
pub fn signal_exit_code(signal: i32) -> i32 {
    128 + signal
}

/// Parents blocked in `waitpid` wait here; `exit` wakes them all and each
/// re-checks its own children.
static CHILD_WAITERS: WaitQueue = WaitQueue::new();

/// Terminate the current task. Never returns.
pub fn exit_current(code: i32) -> ! {
    let pid = sched::current_pid().expect("exit with no current task");
    release_resources(pid, code);
    // Leave the CPU for good; the zombie is reaped by waitpid.
    sched::reschedule(TaskState::Zombie);
    unreachable!("zombie task {} rescheduled", pid);
}

/// Fault-path termination: exit with a segfault-coded status.
pub fn kill_current_for_fault() {
    exit_current(signal_exit_code(SIGSEGV));
}

/// Minimal `kill`: supported signals terminate the target.
pub fn kill(pid: Pid, signal: i32) -> KernelResult<()> {
    if !matches!(signal, SIGKILL | SIGSEGV | SIGTERM) {
        return Err(KernelError::InvalidArgument {
            name: "signal",
            value: "unsupported signal",
        });
    }

    if Some(pid) == sched::current_pid() {
        exit_current(signal_exit_code(signal));
    }

    let state = sched::with_task_mut(pid, |task| task.state).ok_or(
        KernelError::ProcessNotFound { pid: pid.0 },
    )?;
    if state == TaskState::Zombie {
        return Err(KernelError::ProcessNotFound { pid: pid.0 });
    }

    // Zombie state must be visible before the parent's waitpid is woken,
    // or the wake is lost.
    sched::with_task_mut(pid, |task| task.state = TaskState::Zombie);
    sched::remove(pid);
    release_resources(pid, signal_exit_code(signal));
    log::debug!("pid {} killed by signal {}", pid, signal);
    Ok(())
}

/// Release everything but the zombie shell: address space, descriptors,
/// children (re-parented to init). Wakes the parent's waitpid.
fn release_resources(pid: Pid, code: i32) {
    let (space, children) = sched::with_task_mut(pid, |task| {
        task.exit_code = code;
        task.open_files.clear();
        task.syscall_frame = None;
        (
            task.address_space.take(),
            core::mem::take(&mut task.children),
        )
    })
    .unwrap_or((None, alloc::vec::Vec::new()));

    // Tear down the address space outside the scheduler lock; COW share
    // counts decide which frames actually return to the allocator.
    if let Some(mut space) = space {
        let mut source = KernelFrameSource;
        space.destroy(&mut source);
    }

    // Orphans belong to init from here on.
    const INIT: Pid = Pid(1);
    for child in children {
        sched::with_task_mut(child, |task| task.ppid = INIT);
        sched::with_task_mut(INIT, |init| init.children.push(child));
    }

    CHILD_WAITERS.wake_all();
}

/// Wait for a child to exit.
///
/// `pid > 0` waits for that specific child, `pid == -1` for any child.
/// With `WNOHANG` and no exited child the call returns `(Pid(0), 0)`
/// immediately. The reaped child's PID and exit code are returned and its
/// zombie entry is freed.
pub fn waitpid(pid: i64, options: WaitOptions) -> KernelResult<(Pid, i32)> {
    let parent = sched::current_pid().ok_or(KernelError::NotInitialized {
        subsystem: "scheduler",
    })?;

    loop {
        let children =
            sched::with_task_mut(parent, |task| task.children.clone()).unwrap_or_default();

        let candidates: alloc::vec::Vec<Pid> = match pid {
            -1 => children.clone(),
            target if target > 0 => {
                let target = Pid(target as u64);
                if !children.contains(&target) {
                    return Err(KernelError::ProcessNotFound { pid: target.0 });
                }
                alloc::vec![target]
            }
            _ => {
                return Err(KernelError::InvalidArgument {
                    name: "pid",
                    value: "process groups are not supported",
                })
            }
        };

        if candidates.is_empty() {
            return Err(KernelError::NoChildren);
        }

        let zombie = candidates.into_iter().find(|&child| {
            sched::with_task_mut(child, |task| task.is_zombie()).unwrap_or(false)
        });

        if let Some(child) = zombie {
            let task = sched::take_task(child).ok_or(KernelError::ProcessNotFound {
                pid: child.0,
            })?;
            sched::with_task_mut(parent, |parent_task| {
                parent_task.children.retain(|&c| c != child)
            });
            log::debug!("pid {} reaped child {} (status {})", parent, child, task.exit_code);
            return Ok((child, task.exit_code));
        }

        if options.contains(WaitOptions::WNOHANG) {
            return Ok((Pid(0), 0));
        }

        sched::block_on(&CHILD_WAITERS);
    }
}

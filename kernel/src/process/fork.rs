//! `fork`: duplicate the current task.
//!
//! The child gets a COW clone of the address space, a copy of the
//! descriptor table (each node's reference count rises), a fresh kernel
//! stack carrying a duplicate of the parent's trap frame, and a context
//! that resumes at the instruction after the syscall trap with return
//! value zero. The parent's return value is the child's PID.

extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;

use crate::arch::context::ThreadContext;
use crate::arch::context::ArchContext;
use crate::error::{KernelError, KernelResult};
use crate::mm::KernelFrameSource;
use crate::sched::{self, Pid, Task, TaskState, TaskStats, DEFAULT_TIME_SLICE, KERNEL_STACK_SIZE};

pub fn fork() -> KernelResult<Pid> {
    // Snapshot everything we need from the parent, then release the
    // scheduler lock before the allocating clone work.
    let (parent_pid, space_ptr, frame, fd_copy, cwd, name, user_entry, user_stack, brk_state) =
        sched::with_current_mut(|task| {
            let space_ptr = task
                .address_space
                .as_mut()
                .map(|space| space as *mut crate::mm::AddressSpace);
            let frame = task.syscall_frame.map(|frame_ptr| {
                // SAFETY: the frame lives on this task's kernel stack for
                // the duration of the syscall we are inside.
                unsafe { (*frame_ptr).clone() }
            });
            (
                task.pid,
                space_ptr,
                frame,
                task.open_files.clone_for_fork(),
                task.cwd.clone(),
                task.name.clone(),
                task.user_entry,
                task.user_stack,
                (task.brk_start, task.brk, task.mmap_next),
            )
        })
        .ok_or(KernelError::NotInitialized {
            subsystem: "scheduler",
        })?;

    let space_ptr = space_ptr.ok_or(KernelError::InvalidState {
        expected: "user task",
        actual: "kernel thread",
    })?;
    let frame = frame.ok_or(KernelError::InvalidState {
        expected: "syscall context",
        actual: "no trap frame",
    })?;

    // COW-clone the address space. The parent keeps running (it is the
    // caller), so the raw pointer is stable.
    let mut source = KernelFrameSource;
    // SAFETY: space_ptr targets the current task's address space; only
    // this task mutates it.
    let child_space = unsafe { (*space_ptr).clone_for_fork(&mut source)? };

    let kernel_stack = alloc::vec![0u8; KERNEL_STACK_SIZE].into_boxed_slice();
    let stack_top = kernel_stack.as_ptr() as usize + KERNEL_STACK_SIZE;
    let context = ArchContext::new_forked(&frame, stack_top);

    let child = sched::spawn(|pid| Task {
        pid,
        ppid: parent_pid,
        name: String::from(name.as_str()),
        state: TaskState::New,
        context,
        kernel_stack,
        address_space: Some(child_space),
        open_files: fd_copy,
        cwd,
        user_entry,
        user_stack,
        brk_start: brk_state.0,
        brk: brk_state.1,
        mmap_next: brk_state.2,
        exit_code: 0,
        time_slice: DEFAULT_TIME_SLICE,
        children: Vec::new(),
        stats: TaskStats::default(),
        syscall_frame: None,
    });

    sched::with_task_mut(parent_pid, |parent| parent.children.push(child));
    log::debug!("pid {} forked child {}", parent_pid, child);
    Ok(child)
}

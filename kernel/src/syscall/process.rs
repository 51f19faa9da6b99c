//! Process-group system calls.

extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;

use crate::arch::port::interrupts::InterruptFrame;
use crate::error::{KernelError, KernelResult};
use crate::mm::user;
use crate::process::{self, WaitOptions};
use crate::sched::{self, Pid};

use super::with_user_space;

pub fn sys_exit(code: i32) -> KernelResult<usize> {
    process::exit::exit_current(code);
}

pub fn sys_fork() -> KernelResult<usize> {
    process::fork::fork().map(|pid| pid.0 as usize)
}

/// Upper bound on argv/envp entries accepted from user mode.
const MAX_ARG_COUNT: usize = 64;

/// Read a NULL-terminated user array of string pointers.
fn read_string_array(array_ptr: u64) -> KernelResult<Vec<String>> {
    let mut strings = Vec::new();
    if array_ptr == 0 {
        return Ok(strings);
    }

    with_user_space(|space, source| {
        let word = core::mem::size_of::<usize>() as u64;
        for index in 0..MAX_ARG_COUNT as u64 {
            let mut raw = [0u8; 8];
            user::copy_from_user(
                space,
                source,
                array_ptr + index * word,
                &mut raw[..word as usize],
            )?;
            let ptr = u64::from_le_bytes(raw);
            if ptr == 0 {
                return Ok(());
            }
            strings.push(user::copy_string_from_user(space, source, ptr)?);
        }
        Err(KernelError::InvalidArgument {
            name: "argv",
            value: "too many entries",
        })
    })?;
    Ok(strings)
}

pub fn sys_execve(
    path_ptr: u64,
    argv_ptr: u64,
    envp_ptr: u64,
    frame: &mut InterruptFrame,
) -> KernelResult<usize> {
    let path = with_user_space(|space, source| {
        user::copy_string_from_user(space, source, path_ptr)
    })?;
    let argv = read_string_array(argv_ptr)?;
    let envp = read_string_array(envp_ptr)?;

    process::exec::execve(&path, &argv, &envp, frame)
}

pub fn sys_waitpid(pid: i64, status_ptr: u64, options: u32) -> KernelResult<usize> {
    let options = WaitOptions::from_bits_truncate(options);
    let (child, code) = process::exit::waitpid(pid, options)?;

    if status_ptr != 0 && child != Pid(0) {
        with_user_space(|space, source| {
            user::copy_to_user(space, source, status_ptr, &code.to_le_bytes())
        })?;
    }
    Ok(child.0 as usize)
}

pub fn sys_getpid() -> KernelResult<usize> {
    Ok(process::getpid().0 as usize)
}

pub fn sys_getppid() -> KernelResult<usize> {
    Ok(process::getppid().0 as usize)
}

pub fn sys_sched_yield() -> KernelResult<usize> {
    sched::yield_now();
    Ok(0)
}

pub fn sys_kill(pid: i64, signal: i32) -> KernelResult<usize> {
    if pid <= 0 {
        return Err(KernelError::InvalidArgument {
            name: "pid",
            value: "process groups are not supported",
        });
    }
    process::exit::kill(Pid(pid as u64), signal)?;
    Ok(0)
}

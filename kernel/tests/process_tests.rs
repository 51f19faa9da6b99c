//! Process-lifecycle tests: kill, zombie reaping, and waitpid semantics.

#![no_std]
#![cfg_attr(target_os = "none", no_main)]
#![feature(custom_test_frameworks)]
#![cfg_attr(target_os = "none", test_runner(castor_kernel::test_framework::test_runner))]
#![cfg_attr(target_os = "none", reexport_test_harness_main = "test_main")]

extern crate alloc;

use castor_kernel::process::{self, exit, WaitOptions};
use castor_kernel::sched::{self, TaskState};
use castor_kernel::{kernel_assert, kernel_assert_eq, KernelError};

#[cfg(target_os = "none")]
#[path = "common/mod.rs"]
mod common;

#[cfg(target_os = "none")]
#[no_mangle]
pub extern "C" fn _start() -> ! {
    common::init_test_env("Process Tests");
    test_main();
    loop {}
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    castor_kernel::test_panic_handler(info)
}

// These binaries only have content on bare metal; host test runs build
// them as empty programs.
#[cfg(not(target_os = "none"))]
fn main() {}

fn spin_forever() {
    loop {
        sched::yield_now();
    }
}

#[cfg(target_os = "none")]
#[test_case]
fn kill_turns_task_into_zombie() {
    let pid = sched::spawn_kernel_thread("victim", spin_forever);
    exit::kill(pid, exit::SIGTERM).expect("kill");

    let state = sched::with_task_mut(pid, |task| task.state).expect("zombie exists");
    kernel_assert_eq!(state, TaskState::Zombie);
    let code = sched::with_task_mut(pid, |task| task.exit_code).expect("zombie exists");
    kernel_assert_eq!(code, exit::signal_exit_code(exit::SIGTERM));
    let _ = sched::take_task(pid);
}

#[cfg(target_os = "none")]
#[test_case]
fn kill_of_missing_process_errors() {
    kernel_assert!(matches!(
        exit::kill(sched::Pid(0xDEAD), exit::SIGKILL),
        Err(KernelError::ProcessNotFound { .. })
    ));
}

#[cfg(target_os = "none")]
#[test_case]
fn waitpid_reaps_killed_child() {
    let child = sched::spawn_kernel_thread("child", spin_forever);
    let me = process::getpid();
    sched::with_task_mut(child, |task| task.ppid = me);
    sched::with_current_mut(|task| task.children.push(child));

    exit::kill(child, exit::SIGKILL).expect("kill");

    let (reaped, status) = exit::waitpid(-1, WaitOptions::empty()).expect("waitpid");
    kernel_assert_eq!(reaped, child);
    kernel_assert_eq!(status, exit::signal_exit_code(exit::SIGKILL));

    // The zombie is gone: a second wait finds no children.
    kernel_assert!(matches!(
        exit::waitpid(-1, WaitOptions::empty()),
        Err(KernelError::NoChildren)
    ));
}

#[cfg(target_os = "none")]
#[test_case]
fn wnohang_returns_immediately_for_live_child() {
    let child = sched::spawn_kernel_thread("live-child", spin_forever);
    let me = process::getpid();
    sched::with_task_mut(child, |task| task.ppid = me);
    sched::with_current_mut(|task| task.children.push(child));

    let (pid, status) = exit::waitpid(-1, WaitOptions::WNOHANG).expect("waitpid");
    kernel_assert_eq!(pid, sched::Pid(0));
    kernel_assert_eq!(status, 0);

    // Clean up.
    exit::kill(child, exit::SIGKILL).expect("kill");
    let _ = exit::waitpid(-1, WaitOptions::empty());
}

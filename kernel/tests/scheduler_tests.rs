//! Scheduler tests: ready-queue behavior and tick-driven preemption
//! bookkeeping against the live scheduler.

#![no_std]
#![cfg_attr(target_os = "none", no_main)]
#![feature(custom_test_frameworks)]
#![cfg_attr(target_os = "none", test_runner(castor_kernel::test_framework::test_runner))]
#![cfg_attr(target_os = "none", reexport_test_harness_main = "test_main")]

extern crate alloc;

use core::sync::atomic::{AtomicU32, Ordering};

use castor_kernel::sched::{self, TaskState, DEFAULT_TIME_SLICE};
use castor_kernel::{kernel_assert, kernel_assert_eq};

#[cfg(target_os = "none")]
#[path = "common/mod.rs"]
mod common;

#[cfg(target_os = "none")]
#[no_mangle]
pub extern "C" fn _start() -> ! {
    common::init_test_env("Scheduler Tests");
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

static COUNTER: AtomicU32 = AtomicU32::new(0);

fn count_and_exit() {
    COUNTER.fetch_add(1, Ordering::Relaxed);
}

#[cfg(target_os = "none")]
#[test_case]
fn spawned_thread_is_admitted_ready() {
    let pid = sched::spawn_kernel_thread("admitted", count_and_exit);
    let state = sched::with_task_mut(pid, |task| task.state).expect("task exists");
    kernel_assert_eq!(state, TaskState::Ready);
    let _ = sched::take_task(pid);
}

#[cfg(target_os = "none")]
#[test_case]
fn spawned_thread_runs_on_yield() {
    let before = COUNTER.load(Ordering::Relaxed);
    let pid = sched::spawn_kernel_thread("runner", count_and_exit);

    // Give the thread slices until it has run and exited.
    for _ in 0..64 {
        sched::yield_now();
        if COUNTER.load(Ordering::Relaxed) > before {
            break;
        }
    }
    kernel_assert!(COUNTER.load(Ordering::Relaxed) > before);

    // The thread exited through the trampoline; its zombie remains until
    // reaped here.
    let _ = sched::take_task(pid);
}

#[cfg(target_os = "none")]
#[test_case]
fn tick_burns_the_time_slice() {
    let slice_before =
        sched::with_current_mut(|task| task.time_slice).expect("current task exists");
    sched::tick();
    let slice_after = sched::with_current_mut(|task| task.time_slice).expect("current task");
    kernel_assert!(slice_after < slice_before || slice_before == 0);
}

#[cfg(target_os = "none")]
#[test_case]
fn wake_makes_blocked_task_ready() {
    let pid = sched::spawn_kernel_thread("sleeper", count_and_exit);
    sched::with_task_mut(pid, |task| task.state = TaskState::Blocked);
    sched::remove(pid);

    sched::wake(pid);
    let state = sched::with_task_mut(pid, |task| task.state).expect("task exists");
    kernel_assert_eq!(state, TaskState::Ready);
    let slice = sched::with_task_mut(pid, |task| task.time_slice).expect("task exists");
    kernel_assert_eq!(slice, DEFAULT_TIME_SLICE);
    let _ = sched::take_task(pid);
}

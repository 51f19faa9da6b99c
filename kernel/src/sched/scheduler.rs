//! Round-robin scheduler.
//!
//! One arena of tasks keyed by PID, one ready queue of PIDs, exactly one
//! Running task. Preemption happens at tick boundaries when the running
//! task's slice is spent (and only for user-mode interrupts); kernel code
//! reschedules at `yield_now` and at blocking points.

extern crate alloc;

use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::String;

use crate::arch::context;
use crate::sync::{SpinLock, WaitQueue};

use super::task::{Pid, Task, TaskState, DEFAULT_TIME_SLICE};

pub struct Scheduler {
    tasks: BTreeMap<u64, Task>,
    ready: VecDeque<Pid>,
    current: Option<Pid>,
    idle: Option<Pid>,
    need_resched: bool,
    next_pid: u64,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            tasks: BTreeMap::new(),
            ready: VecDeque::new(),
            current: None,
            idle: None,
            need_resched: false,
            next_pid: 1,
        }
    }

    fn alloc_pid(&mut self) -> Pid {
        let pid = Pid(self.next_pid);
        self.next_pid += 1;
        pid
    }

    /// Insert a task and put it on the ready queue.
    fn admit(&mut self, mut task: Task) -> Pid {
        let pid = task.pid;
        task.state = TaskState::Ready;
        task.time_slice = DEFAULT_TIME_SLICE;
        self.tasks.insert(pid.0, task);
        self.ready.push_back(pid);
        pid
    }

    /// Choose the next task to run: head of the ready queue, the idle
    /// task otherwise.
    fn select_next(&mut self) -> Option<Pid> {
        while let Some(pid) = self.ready.pop_front() {
            if matches!(
                self.tasks.get(&pid.0).map(|t| t.state),
                Some(TaskState::Ready)
            ) {
                return Some(pid);
            }
            // Stale queue entry (task exited or blocked since); drop it.
        }
        self.idle
    }

    fn requeue_current(&mut self, new_state: TaskState) {
        if let Some(pid) = self.current {
            if let Some(task) = self.tasks.get_mut(&pid.0) {
                if task.state == TaskState::Running {
                    task.state = new_state;
                    if new_state == TaskState::Ready && Some(pid) != self.idle {
                        self.ready.push_back(pid);
                    }
                }
            }
        }
    }
}

pub static SCHEDULER: SpinLock<Scheduler> = SpinLock::new(Scheduler::new());

/// Create the idle task from the boot context and make it current. Called
/// once before interrupts are enabled.
pub fn init() {
    {
        let mut sched = SCHEDULER.lock();
        // PID 0 is the idle task; PIDs from 1 go to real tasks. Its saved
        // context is filled in by the first switch away from the boot
        // thread.
        let pid = Pid(0);
        let mut task = Task::new_kernel(pid, String::from("idle"), idle_loop as usize);
        task.state = TaskState::Running;
        sched.tasks.insert(pid.0, task);
        sched.idle = Some(pid);
        sched.current = Some(pid);
    }
    log::info!("scheduler online, idle task is pid 0");
}

/// The idle task: halt until the next interrupt, yield to anyone ready.
fn idle_loop() {
    loop {
        crate::arch::enable_interrupts();
        crate::arch::halt();
        yield_now();
    }
}

/// Allocate a PID and admit a task built by `build`.
pub fn spawn(build: impl FnOnce(Pid) -> Task) -> Pid {
    let mut sched = SCHEDULER.lock();
    let pid = sched.alloc_pid();
    let task = build(pid);
    debug_assert_eq!(task.pid, pid);
    sched.admit(task)
}

/// Spawn a kernel thread running `entry`.
pub fn spawn_kernel_thread(name: &str, entry: fn()) -> Pid {
    let pid = spawn(|pid| Task::new_kernel(pid, String::from(name), entry as usize));
    log::debug!("kernel thread '{}' spawned as pid {}", name, pid);
    pid
}

/// Put a task on the ready queue (it must exist and not be running).
/// Returns whether a state transition actually happened.
pub fn add_ready(pid: Pid) -> bool {
    let mut sched = SCHEDULER.lock();
    if let Some(task) = sched.tasks.get_mut(&pid.0) {
        // Zombies never run again; Running/Ready tasks keep their single
        // queue membership.
        if matches!(task.state, TaskState::Blocked | TaskState::New) {
            task.state = TaskState::Ready;
            task.time_slice = DEFAULT_TIME_SLICE;
            sched.ready.push_back(pid);
            return true;
        }
    }
    false
}

/// Remove a task from scheduling consideration (it stays in the arena).
pub fn remove(pid: Pid) {
    let mut sched = SCHEDULER.lock();
    sched.ready.retain(|&p| p != pid);
}

/// PID of the task owning the CPU.
pub fn current_pid() -> Option<Pid> {
    SCHEDULER.lock().current
}

/// Run `f` on the current task.
pub fn with_current_mut<R>(f: impl FnOnce(&mut Task) -> R) -> Option<R> {
    let mut sched = SCHEDULER.lock();
    let pid = sched.current?;
    sched.tasks.get_mut(&pid.0).map(f)
}

/// Run `f` on an arbitrary task.
pub fn with_task_mut<R>(pid: Pid, f: impl FnOnce(&mut Task) -> R) -> Option<R> {
    SCHEDULER.lock().tasks.get_mut(&pid.0).map(f)
}

/// Remove a task from the arena entirely (reaping a zombie).
pub fn take_task(pid: Pid) -> Option<Task> {
    let mut sched = SCHEDULER.lock();
    sched.ready.retain(|&p| p != pid);
    sched.tasks.remove(&pid.0)
}

/// Timer tick: burn down the running task's slice; mark a reschedule when
/// it hits zero. The actual preemption happens at the interrupt-return
/// boundary (user mode) or the next explicit scheduling point (kernel).
pub fn tick() {
    let mut sched = SCHEDULER.lock();
    let (current, idle) = (sched.current, sched.idle);
    if let Some(pid) = current {
        if let Some(task) = sched.tasks.get_mut(&pid.0) {
            task.stats.runtime_ticks += 1;
            if task.time_slice > 0 {
                task.time_slice -= 1;
            }
            if task.time_slice == 0 && (Some(pid) == idle || !sched.ready.is_empty()) {
                sched.need_resched = true;
            }
            if Some(pid) == idle && !sched.ready.is_empty() {
                sched.need_resched = true;
            }
        }
    }
}

/// Whether the tick marked the current task for preemption.
pub fn should_preempt() -> bool {
    SCHEDULER.lock().need_resched
}

/// Preempt the current task: back of the ready queue, slice refilled on
/// next entry.
pub fn preempt() {
    {
        let mut sched = SCHEDULER.lock();
        sched.need_resched = false;
        if let Some(pid) = sched.current {
            if let Some(task) = sched.tasks.get_mut(&pid.0) {
                task.stats.preempt_count += 1;
            }
        }
    }
    reschedule(TaskState::Ready);
}

/// Voluntarily give up the CPU; the task stays runnable.
pub fn yield_now() {
    if let Some(pid) = current_pid() {
        with_task_mut(pid, |task| task.stats.yield_count += 1);
    }
    reschedule(TaskState::Ready);
}

/// Block the current task until `wake`.
pub fn block_current() {
    reschedule(TaskState::Blocked);
}

/// Block the current task on a wait queue.
pub fn block_on(queue: &WaitQueue) {
    if let Some(pid) = current_pid() {
        queue.enqueue(pid);
    }
    block_current();
}

/// Make a blocked task runnable. The task is observable as Ready before
/// this returns. Returns false when there was nothing to wake (unknown,
/// zombie, or already-runnable PID).
pub fn wake(pid: Pid) -> bool {
    add_ready(pid)
}

/// Switch away from the current task, leaving it in `current_state`.
///
/// The scheduler lock is released with interrupts still disabled; the
/// switch itself runs interrupt-free and the incoming task's saved flags
/// re-enable as appropriate.
pub fn reschedule(current_state: TaskState) {
    let irqs_were_enabled = crate::arch::interrupts_enabled();
    crate::arch::disable_interrupts();

    let mut sched = SCHEDULER.lock();
    let previous = sched.current;
    sched.requeue_current(current_state);

    let next = sched.select_next();

    let switch: Option<(*mut context::ArchContext, *const context::ArchContext)> =
        if next.is_none() {
            // Nothing else runnable and no idle task yet (early boot):
            // keep running.
            if let Some(pid) = previous {
                if let Some(task) = sched.tasks.get_mut(&pid.0) {
                    task.state = TaskState::Running;
                }
            }
            None
        } else if next == previous {
            let next = next.expect("checked above");
            // Only runnable task: keep the CPU.
            if let Some(task) = sched.tasks.get_mut(&next.0) {
                task.state = TaskState::Running;
                if task.time_slice == 0 {
                    task.time_slice = DEFAULT_TIME_SLICE;
                }
            }
            None
        } else {
            let next = next.expect("checked above");
            sched.current = Some(next);
            sched.need_resched = false;

            let next_task = sched.tasks.get_mut(&next.0).expect("next task vanished");
            next_task.state = TaskState::Running;
            next_task.time_slice = DEFAULT_TIME_SLICE;
            next_task.stats.run_count += 1;

            // Publish the incoming kernel stack and switch address spaces
            // if the next task owns one.
            context::set_kernel_stack(next_task.kernel_stack_top());
            let next_root = next_task.address_space.as_ref().map(|space| space.root());
            let to: *const context::ArchContext = &next_task.context;

            let from: *mut context::ArchContext = match previous {
                Some(prev) => {
                    let prev_task = sched.tasks.get_mut(&prev.0).expect("previous task vanished");
                    &mut prev_task.context
                }
                None => core::ptr::null_mut(),
            };

            if let Some(root) = next_root {
                if crate::arch::paging::current_root() != root {
                    crate::arch::paging::activate(root);
                }
            }

            Some((from, to))
        };

    // Drop the scheduler lock but keep interrupts off through the switch;
    // the incoming context's saved flags decide when they come back on.
    sched.release_without_irq_restore();

    if let Some((from, to)) = switch {
        if !from.is_null() {
            #[cfg(target_os = "none")]
            // SAFETY: both pointers target live contexts in the arena;
            // interrupts are disabled across the switch.
            unsafe {
                context::switch_context(&mut *from, &*to)
            };
            #[cfg(not(target_os = "none"))]
            let _ = (from, to);
        }
    }

    if irqs_were_enabled {
        crate::arch::enable_interrupts();
    }
}

#[cfg(all(test, not(target_os = "none")))]
pub(super) fn reset_for_test() {
    let mut sched = SCHEDULER.lock();
    sched.tasks.clear();
    sched.ready.clear();
    sched.current = None;
    sched.idle = None;
    sched.need_resched = false;
    sched.next_pid = 1;
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use std::sync::Mutex;

    extern crate std;

    // The scheduler is a process-wide singleton; serialize the tests that
    // reshape it.
    static TEST_GUARD: Mutex<()> = Mutex::new(());

    fn noop() {}

    #[test]
    fn spawn_admits_ready_tasks_in_order() {
        let _guard = TEST_GUARD.lock().unwrap();
        reset_for_test();

        let a = spawn_kernel_thread("a", noop);
        let b = spawn_kernel_thread("b", noop);
        assert!(a < b);

        let mut sched = SCHEDULER.lock();
        assert_eq!(sched.ready.len(), 2);
        assert_eq!(sched.select_next(), Some(a));
        assert_eq!(sched.select_next(), Some(b));
    }

    #[test]
    fn running_task_is_on_no_queue() {
        let _guard = TEST_GUARD.lock().unwrap();
        reset_for_test();

        let a = spawn_kernel_thread("a", noop);
        {
            let mut sched = SCHEDULER.lock();
            let next = sched.select_next().unwrap();
            assert_eq!(next, a);
            sched.current = Some(next);
            sched.tasks.get_mut(&next.0).unwrap().state = TaskState::Running;
            // Exactly one Running task, and it is on no queue.
            assert!(!sched.ready.contains(&a));
            let running = sched
                .tasks
                .values()
                .filter(|t| t.state == TaskState::Running)
                .count();
            assert_eq!(running, 1);
        }
    }

    #[test]
    fn tick_requests_preemption_at_slice_expiry() {
        let _guard = TEST_GUARD.lock().unwrap();
        reset_for_test();

        let a = spawn_kernel_thread("a", noop);
        let _b = spawn_kernel_thread("b", noop);
        {
            let mut sched = SCHEDULER.lock();
            let next = sched.select_next().unwrap();
            sched.current = Some(next);
            sched.tasks.get_mut(&next.0).unwrap().state = TaskState::Running;
        }

        // Other tests may tick the global clock concurrently; the slice
        // can only burn down faster, never slower.
        for _ in 0..DEFAULT_TIME_SLICE {
            tick();
        }
        assert!(should_preempt());
        assert_eq!(with_task_mut(a, |t| t.time_slice).unwrap(), 0);
    }

    #[test]
    fn blocked_task_skips_scheduling_until_woken() {
        let _guard = TEST_GUARD.lock().unwrap();
        reset_for_test();

        let a = spawn_kernel_thread("a", noop);
        let b = spawn_kernel_thread("b", noop);

        with_task_mut(a, |task| task.state = TaskState::Blocked);
        {
            let mut sched = SCHEDULER.lock();
            // The stale ready entry for `a` is skipped.
            assert_eq!(sched.select_next(), Some(b));
        }

        wake(a);
        {
            let mut sched = SCHEDULER.lock();
            assert_eq!(sched.select_next(), Some(a));
        }
    }

    #[test]
    fn wake_is_idempotent_for_ready_tasks() {
        let _guard = TEST_GUARD.lock().unwrap();
        reset_for_test();

        let a = spawn_kernel_thread("a", noop);
        wake(a);
        wake(a);
        let sched = SCHEDULER.lock();
        // Single queue membership despite repeated wakes.
        assert_eq!(sched.ready.iter().filter(|&&p| p == a).count(), 1);
    }
}

//! Time keeping: the tick counter, timed sleep, and software timers.
//!
//! The timer driver raises one interrupt per tick; [`tick`] advances the
//! monotonic counter, fires expired software timers (in IRQ context with
//! interrupts disabled; callbacks must be short), wakes due sleepers, and
//! drives scheduler preemption.

extern crate alloc;

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::error::{KernelError, KernelResult};
use crate::sched::Pid;
use crate::sync::SpinLock;

/// Default tick frequency.
pub const DEFAULT_HZ: u32 = 100;

/// Maximum number of software timers that can be active simultaneously.
/// Slot array, indexed search.
const MAX_TIMERS: usize = 64;

static TICKS: AtomicU64 = AtomicU64::new(0);
static HZ: AtomicU32 = AtomicU32::new(DEFAULT_HZ);
static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a registered timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId(pub u64);

/// Timer firing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerMode {
    /// Fire once, then deactivate.
    OneShot,
    /// Fire repeatedly until cancelled.
    Periodic,
}

/// Timer callbacks are plain function pointers so the slot array needs no
/// allocation; they run in IRQ context and must be short.
pub type TimerCallback = fn(TimerId);

#[derive(Debug, Clone, Copy)]
struct TimerEntry {
    id: TimerId,
    callback: TimerCallback,
    fire_tick: u64,
    /// Zero for one-shot timers.
    period_ticks: u64,
}

static TIMERS: SpinLock<[Option<TimerEntry>; MAX_TIMERS]> = SpinLock::new([None; MAX_TIMERS]);

/// Sleeping tasks ordered by wake tick (earliest first).
struct Sleeper {
    wake_tick: u64,
    pid: Pid,
}

static SLEEPERS: SpinLock<Vec<Sleeper>> = SpinLock::new(Vec::new());

/// Hook the tick vector. The timer driver programs its hardware for `hz`
/// and raises the line; the core only counts.
pub fn init(hz: u32) {
    HZ.store(hz, Ordering::Relaxed);
    let _ = crate::irq::register(crate::irq::TIMER_VECTOR, |_| tick());
    log::info!("timekeeper online at {} Hz", hz);
}

/// Ticks since boot.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

pub fn hz() -> u32 {
    HZ.load(Ordering::Relaxed)
}

/// Milliseconds since boot.
pub fn uptime_ms() -> u64 {
    ticks() * 1000 / hz() as u64
}

fn ms_to_ticks(ms: u64) -> u64 {
    (ms * hz() as u64).div_ceil(1000).max(1)
}

fn ticks_to_ms(ticks: u64) -> u64 {
    ticks * 1000 / hz() as u64
}

/// Advance time by one tick. Called from the timer interrupt.
pub fn tick() {
    let now = TICKS.fetch_add(1, Ordering::Relaxed) + 1;

    fire_expired_timers(now);
    wake_due_sleepers(now);
    crate::sched::tick();
}

fn fire_expired_timers(now: u64) {
    // Collect expired callbacks under the lock, run them outside it so a
    // callback may re-arm or cancel timers.
    let mut expired: [Option<(TimerCallback, TimerId)>; MAX_TIMERS] = [None; MAX_TIMERS];
    let mut count = 0;
    {
        let mut timers = TIMERS.lock();
        for slot in timers.iter_mut() {
            if let Some(entry) = slot {
                if entry.fire_tick <= now {
                    expired[count] = Some((entry.callback, entry.id));
                    count += 1;
                    if entry.period_ticks > 0 {
                        entry.fire_tick = now + entry.period_ticks;
                    } else {
                        *slot = None;
                    }
                }
            }
        }
    }
    for (callback, id) in expired.iter().take(count).flatten() {
        callback(*id);
    }
}

fn wake_due_sleepers(now: u64) {
    loop {
        let pid = {
            let mut sleepers = SLEEPERS.lock();
            match sleepers.first() {
                Some(first) if first.wake_tick <= now => Some(sleepers.remove(0).pid),
                _ => None,
            }
        };
        match pid {
            Some(pid) => {
                crate::sched::wake(pid);
            }
            None => break,
        }
    }
}

/// Register a software timer firing after `interval_ms` (and every
/// `interval_ms` thereafter for periodic mode).
pub fn create_timer(
    mode: TimerMode,
    interval_ms: u64,
    callback: TimerCallback,
) -> KernelResult<TimerId> {
    if interval_ms == 0 {
        return Err(KernelError::InvalidArgument {
            name: "interval_ms",
            value: "must be > 0",
        });
    }

    let interval_ticks = ms_to_ticks(interval_ms);
    let id = TimerId(NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed));
    let entry = TimerEntry {
        id,
        callback,
        fire_tick: ticks() + interval_ticks,
        period_ticks: match mode {
            TimerMode::OneShot => 0,
            TimerMode::Periodic => interval_ticks,
        },
    };

    let mut timers = TIMERS.lock();
    let slot = timers
        .iter_mut()
        .find(|slot| slot.is_none())
        .ok_or(KernelError::ResourceExhausted {
            resource: "timer slots",
        })?;
    *slot = Some(entry);
    Ok(id)
}

/// Cancel an active timer.
pub fn cancel_timer(id: TimerId) -> KernelResult<()> {
    let mut timers = TIMERS.lock();
    for slot in timers.iter_mut() {
        if matches!(slot, Some(entry) if entry.id == id) {
            *slot = None;
            return Ok(());
        }
    }
    Err(KernelError::NotFound { resource: "timer" })
}

/// Block the current task for `ms` milliseconds.
///
/// A `wake` before the deadline (signal delivery) ends the sleep early;
/// the return value is the remaining time in milliseconds, zero when the
/// full interval elapsed.
pub fn sleep(ms: u64) -> u64 {
    let wake_tick = ticks() + ms_to_ticks(ms);
    let pid = match crate::sched::current_pid() {
        Some(pid) => pid,
        None => return ms, // no scheduler yet; nothing to block
    };

    {
        let mut sleepers = SLEEPERS.lock();
        let pos = sleepers
            .iter()
            .position(|s| s.wake_tick > wake_tick)
            .unwrap_or(sleepers.len());
        sleepers.insert(pos, Sleeper { wake_tick, pid });
    }

    crate::sched::block_current();

    // Woken: either the deadline passed or something woke us early.
    let now = ticks();
    if now >= wake_tick {
        0
    } else {
        SLEEPERS.lock().retain(|s| s.pid != pid);
        ticks_to_ms(wake_tick - now)
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    // Distinct counters per test: the tick counter is global and tests
    // run concurrently, so any tick may fire any armed timer.
    static ONE_SHOT_FIRED: AtomicUsize = AtomicUsize::new(0);
    static PERIODIC_FIRED: AtomicUsize = AtomicUsize::new(0);

    #[test]
    fn uptime_follows_ticks() {
        let before = uptime_ms();
        for _ in 0..hz() {
            tick();
        }
        assert!(uptime_ms() >= before + 1000);
    }

    #[test]
    fn one_shot_timer_fires_once() {
        fn firing(_id: TimerId) {
            ONE_SHOT_FIRED.fetch_add(1, Ordering::Relaxed);
        }

        let _id = create_timer(TimerMode::OneShot, 10, firing).unwrap();
        // 10 ms at 100 Hz is one tick.
        for _ in 0..5 {
            tick();
        }
        assert_eq!(ONE_SHOT_FIRED.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn periodic_timer_rearms_until_cancelled() {
        fn firing(_id: TimerId) {
            PERIODIC_FIRED.fetch_add(1, Ordering::Relaxed);
        }

        let id = create_timer(TimerMode::Periodic, 10, firing).unwrap();
        for _ in 0..3 {
            tick();
        }
        let fired = PERIODIC_FIRED.load(Ordering::Relaxed);
        assert!(fired >= 2, "periodic timer fired {} times", fired);

        cancel_timer(id).unwrap();
        let after_cancel = PERIODIC_FIRED.load(Ordering::Relaxed);
        for _ in 0..3 {
            tick();
        }
        assert_eq!(PERIODIC_FIRED.load(Ordering::Relaxed), after_cancel);
    }

    #[test]
    fn cancel_unknown_timer_errors() {
        assert!(cancel_timer(TimerId(u64::MAX)).is_err());
    }

    #[test]
    fn zero_interval_rejected() {
        fn firing(_id: TimerId) {}

        assert!(matches!(
            create_timer(TimerMode::OneShot, 0, firing),
            Err(KernelError::InvalidArgument { .. })
        ));
    }
}

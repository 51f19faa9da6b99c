//! Synchronization primitives: IRQ-save spinlocks, sleeping mutexes, and
//! FIFO wait queues.

pub mod mutex;
pub mod once;
pub mod spinlock;
pub mod waitqueue;

pub use mutex::Mutex;
pub use once::GlobalState;
pub use spinlock::{SpinLock, SpinLockGuard};
pub use waitqueue::WaitQueue;

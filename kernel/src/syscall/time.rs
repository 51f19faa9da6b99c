//! Time-group system calls.

use crate::error::KernelResult;
use crate::mm::user;
use crate::timer;

use super::with_user_space;

/// Seconds since boot. Wall-clock time is an RTC driver concern; the core
/// surfaces its monotonic clock.
pub fn sys_time() -> KernelResult<usize> {
    Ok((timer::uptime_ms() / 1000) as usize)
}

/// `nanosleep(req, rem)`: timespec is two little-endian u64 words
/// (seconds, nanoseconds).
pub fn sys_nanosleep(req_ptr: u64, rem_ptr: u64) -> KernelResult<usize> {
    let mut raw = [0u8; 16];
    with_user_space(|space, source| user::copy_from_user(space, source, req_ptr, &mut raw))?;

    let mut word = [0u8; 8];
    word.copy_from_slice(&raw[0..8]);
    let seconds = u64::from_le_bytes(word);
    word.copy_from_slice(&raw[8..16]);
    let nanos = u64::from_le_bytes(word);

    if nanos >= 1_000_000_000 {
        return Err(crate::error::KernelError::InvalidArgument {
            name: "req",
            value: "nanoseconds out of range",
        });
    }

    let ms = seconds * 1000 + nanos.div_ceil(1_000_000);
    let remaining_ms = timer::sleep(ms);

    if rem_ptr != 0 {
        let mut out = [0u8; 16];
        out[0..8].copy_from_slice(&(remaining_ms / 1000).to_le_bytes());
        out[8..16].copy_from_slice(&((remaining_ms % 1000) * 1_000_000).to_le_bytes());
        with_user_space(|space, source| user::copy_to_user(space, source, rem_ptr, &out))?;
    }

    if remaining_ms > 0 {
        return Err(crate::error::KernelError::Interrupted);
    }
    Ok(0)
}

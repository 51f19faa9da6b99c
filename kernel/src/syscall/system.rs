//! System-group calls: `reboot`, `poweroff`, `uname`.

use crate::error::KernelResult;
use crate::mm::user;

use super::with_user_space;

/// `utsname`: five NUL-padded 65-byte fields (sysname, nodename, release,
/// version, machine).
const UTS_FIELD: usize = 65;

fn uts_field(out: &mut [u8], index: usize, value: &str) {
    let start = index * UTS_FIELD;
    let len = value.len().min(UTS_FIELD - 1);
    out[start..start + len].copy_from_slice(&value.as_bytes()[..len]);
}

pub fn sys_uname(buf_ptr: u64) -> KernelResult<usize> {
    let mut out = [0u8; UTS_FIELD * 5];
    uts_field(&mut out, 0, "CastorOS");
    uts_field(&mut out, 1, "castor");
    uts_field(&mut out, 2, env!("CARGO_PKG_VERSION"));
    uts_field(&mut out, 3, "castor-core");
    uts_field(
        &mut out,
        4,
        if cfg!(target_arch = "x86_64") {
            "x86_64"
        } else if cfg!(target_arch = "aarch64") {
            "aarch64"
        } else {
            "i686"
        },
    );

    with_user_space(|space, source| user::copy_to_user(space, source, buf_ptr, &out))?;
    Ok(0)
}

/// Restart the machine. The platform reset method is a driver concern; the
/// core quiesces and halts if no reset path exists.
pub fn sys_reboot() -> KernelResult<usize> {
    log::warn!("reboot requested");
    crate::arch::disable_interrupts();

    // Legacy keyboard-controller reset on the x86 ports.
    #[cfg(target_arch = "x86_64")]
    {
        use x86_64::instructions::port::Port;
        let mut port: Port<u8> = Port::new(0x64);
        // SAFETY: 8042 pulse-reset command; the machine goes down.
        unsafe { port.write(0xFE) };
    }
    #[cfg(target_arch = "x86")]
    crate::arch::port::outb(0x64, 0xFE);

    loop {
        crate::arch::halt();
    }
}

/// Stop the machine.
pub fn sys_poweroff() -> KernelResult<usize> {
    log::warn!("poweroff requested");
    crate::arch::disable_interrupts();
    loop {
        crate::arch::halt();
    }
}

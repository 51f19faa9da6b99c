//! Bare-metal test plumbing: the custom test runner, QEMU exit device,
//! and assertion macros used by the integration-test binaries.

use core::panic::PanicInfo;

/// QEMU isa-debug-exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QemuExitCode {
    Success = 0x10,
    Failed = 0x11,
}

/// Terminate the emulated machine with the given code.
pub fn exit_qemu(exit_code: QemuExitCode) -> ! {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        use x86_64::instructions::port::Port;
        // SAFETY: isa-debug-exit device port; the machine stops here.
        unsafe {
            let mut port = Port::new(0xF4);
            port.write(exit_code as u32);
        }
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    let _ = exit_code;

    loop {
        crate::arch::halt();
    }
}

/// A test that prints its own name and result.
pub trait Testable {
    fn run(&self);
}

impl<T: Fn()> Testable for T {
    fn run(&self) {
        serial_print!("{}...\t", core::any::type_name::<T>());
        self();
        serial_println!("[ok]");
    }
}

/// Run every test, then exit QEMU with success.
pub fn test_runner(tests: &[&dyn Testable]) -> ! {
    serial_println!("running {} tests", tests.len());
    for test in tests {
        test.run();
    }
    exit_qemu(QemuExitCode::Success)
}

/// Panic handler for test binaries: report and exit with failure.
pub fn test_panic_handler(info: &PanicInfo) -> ! {
    serial_println!("[failed]");
    serial_println!("{}", info);
    exit_qemu(QemuExitCode::Failed)
}

#[macro_export]
macro_rules! kernel_assert {
    ($cond:expr) => {
        if !$cond {
            panic!("assertion failed: {}", stringify!($cond));
        }
    };
}

#[macro_export]
macro_rules! kernel_assert_eq {
    ($left:expr, $right:expr) => {{
        let left = $left;
        let right = $right;
        if left != right {
            panic!(
                "assertion failed: {} == {} ({:?} != {:?})",
                stringify!($left),
                stringify!($right),
                left,
                right
            );
        }
    }};
}

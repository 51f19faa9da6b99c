// Print macros for kernel console output

#[cfg(target_os = "none")]
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::serial::_print(format_args!($($arg)*)));
}

#[cfg(target_os = "none")]
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

#[cfg(target_os = "none")]
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => ($crate::serial::_print(format_args!($($arg)*)));
}

#[cfg(target_os = "none")]
#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => ($crate::serial_print!("{}\n", format_args!($($arg)*)));
}

// Host builds (unit tests) route console output to std so test failures
// stay readable.
#[cfg(not(target_os = "none"))]
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => (std::print!($($arg)*));
}

#[cfg(not(target_os = "none"))]
#[macro_export]
macro_rules! println {
    () => (std::println!());
    ($($arg:tt)*) => (std::println!($($arg)*));
}

#[cfg(not(target_os = "none"))]
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => (std::print!($($arg)*));
}

#[cfg(not(target_os = "none"))]
#[macro_export]
macro_rules! serial_println {
    () => (std::println!());
    ($($arg:tt)*) => (std::println!($($arg)*));
}

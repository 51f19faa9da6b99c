//! System-call dispatch.
//!
//! The single entry from user mode. Each port's trap stub hands over its
//! frame; the number and six arguments are read from declared registers
//! (never from saved frame slots), routed through a fixed numeric table,
//! and the result is marshalled back as one machine word: `>= 0` success,
//! `< 0` the negated [`Errno`].

mod fs;
mod memory;
mod process;
mod socket;
mod system;
mod time;

use crate::arch::port::interrupts::InterruptFrame;
use crate::error::{Errno, KernelError, KernelResult};
use crate::mm::{AddressSpace, KernelFrameSource};

/// System call numbers. The table is ABI; numbers never change meaning.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    // Process
    Exit = 1,
    Fork = 2,
    Execve = 3,
    Waitpid = 4,
    Getpid = 5,
    Getppid = 6,
    SchedYield = 7,
    Kill = 8,

    // Files
    Open = 10,
    Close = 11,
    Read = 12,
    Write = 13,
    Lseek = 14,
    Stat = 15,
    Fstat = 16,
    Mkdir = 17,
    Unlink = 18,
    Rename = 19,
    Getcwd = 20,
    Chdir = 21,
    Getdents = 22,
    Ftruncate = 23,
    Pipe = 24,
    Dup = 25,
    Dup2 = 26,
    Ioctl = 27,

    // Time
    Time = 30,
    Nanosleep = 31,

    // Memory
    Brk = 35,
    Mmap = 36,
    Munmap = 37,

    // System
    Reboot = 40,
    Poweroff = 41,
    Uname = 42,

    // Sockets
    Socket = 50,
    Bind = 51,
    Listen = 52,
    Accept = 53,
    Connect = 54,
    Send = 55,
    Recv = 56,
    Sendto = 57,
    Recvfrom = 58,
    Shutdown = 59,
    Setsockopt = 60,
    Getsockopt = 61,
    Getsockname = 62,
    Getpeername = 63,
    Select = 64,
    Fcntl = 65,
}

impl TryFrom<usize> for Syscall {
    type Error = ();

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Syscall::Exit,
            2 => Syscall::Fork,
            3 => Syscall::Execve,
            4 => Syscall::Waitpid,
            5 => Syscall::Getpid,
            6 => Syscall::Getppid,
            7 => Syscall::SchedYield,
            8 => Syscall::Kill,
            10 => Syscall::Open,
            11 => Syscall::Close,
            12 => Syscall::Read,
            13 => Syscall::Write,
            14 => Syscall::Lseek,
            15 => Syscall::Stat,
            16 => Syscall::Fstat,
            17 => Syscall::Mkdir,
            18 => Syscall::Unlink,
            19 => Syscall::Rename,
            20 => Syscall::Getcwd,
            21 => Syscall::Chdir,
            22 => Syscall::Getdents,
            23 => Syscall::Ftruncate,
            24 => Syscall::Pipe,
            25 => Syscall::Dup,
            26 => Syscall::Dup2,
            27 => Syscall::Ioctl,
            30 => Syscall::Time,
            31 => Syscall::Nanosleep,
            35 => Syscall::Brk,
            36 => Syscall::Mmap,
            37 => Syscall::Munmap,
            40 => Syscall::Reboot,
            41 => Syscall::Poweroff,
            42 => Syscall::Uname,
            50 => Syscall::Socket,
            51 => Syscall::Bind,
            52 => Syscall::Listen,
            53 => Syscall::Accept,
            54 => Syscall::Connect,
            55 => Syscall::Send,
            56 => Syscall::Recv,
            57 => Syscall::Sendto,
            58 => Syscall::Recvfrom,
            59 => Syscall::Shutdown,
            60 => Syscall::Setsockopt,
            61 => Syscall::Getsockopt,
            62 => Syscall::Getsockname,
            63 => Syscall::Getpeername,
            64 => Syscall::Select,
            65 => Syscall::Fcntl,
            _ => return Err(()),
        })
    }
}

/// Entry from the x86_64 trap stub: number in rax, arguments in rdi, rsi,
/// rdx, r10, r8, r9.
#[cfg(target_arch = "x86_64")]
pub fn dispatch_from_frame(frame: &mut InterruptFrame) -> isize {
    let num = frame.rax as usize;
    let args = [
        frame.rdi as usize,
        frame.rsi as usize,
        frame.rdx as usize,
        frame.r10 as usize,
        frame.r8 as usize,
        frame.r9 as usize,
    ];
    dispatch(num, args, frame)
}

/// Entry from the i686 trap stub: number in eax, arguments in ebx, ecx,
/// edx, esi, edi, ebp.
#[cfg(target_arch = "x86")]
pub fn dispatch_from_i686_frame(frame: &mut InterruptFrame) -> isize {
    let num = frame.eax as usize;
    let args = [
        frame.ebx as usize,
        frame.ecx as usize,
        frame.edx as usize,
        frame.esi as usize,
        frame.edi as usize,
        frame.ebp as usize,
    ];
    dispatch(num, args, frame)
}

/// Entry from the AArch64 SVC path: number in x8, arguments in x0-x5.
#[cfg(target_arch = "aarch64")]
pub fn dispatch_from_aarch64_frame(frame: &mut InterruptFrame) -> isize {
    let num = frame.x[8] as usize;
    let args = [
        frame.x[0] as usize,
        frame.x[1] as usize,
        frame.x[2] as usize,
        frame.x[3] as usize,
        frame.x[4] as usize,
        frame.x[5] as usize,
    ];
    dispatch(num, args, frame)
}

/// Route one system call. The frame is published on the task for the
/// duration (fork reads it) and the return word is marshalled here.
pub fn dispatch(num: usize, args: [usize; 6], frame: &mut InterruptFrame) -> isize {
    let frame_ptr = frame as *mut InterruptFrame;
    crate::sched::with_current_mut(|task| task.syscall_frame = Some(frame_ptr));

    let result = match Syscall::try_from(num) {
        Ok(syscall) => route(syscall, args, frame),
        Err(()) => {
            log::debug!("unknown syscall number {}", num);
            Err(KernelError::NotImplemented {
                feature: "unknown syscall",
            })
        }
    };

    crate::sched::with_current_mut(|task| task.syscall_frame = None);

    match result {
        Ok(value) => value as isize,
        Err(err) => Errno::from(err).as_return_word(),
    }
}

fn route(
    syscall: Syscall,
    args: [usize; 6],
    frame: &mut InterruptFrame,
) -> KernelResult<usize> {
    let [a1, a2, a3, a4, a5, a6] = args;
    match syscall {
        Syscall::Exit => process::sys_exit(a1 as i32),
        Syscall::Fork => process::sys_fork(),
        Syscall::Execve => process::sys_execve(a1 as u64, a2 as u64, a3 as u64, frame),
        Syscall::Waitpid => process::sys_waitpid(a1 as i64, a2 as u64, a3 as u32),
        Syscall::Getpid => process::sys_getpid(),
        Syscall::Getppid => process::sys_getppid(),
        Syscall::SchedYield => process::sys_sched_yield(),
        Syscall::Kill => process::sys_kill(a1 as i64, a2 as i32),

        Syscall::Open => fs::sys_open(a1 as u64, a2 as u32),
        Syscall::Close => fs::sys_close(a1 as i32),
        Syscall::Read => fs::sys_read(a1 as i32, a2 as u64, a3),
        Syscall::Write => fs::sys_write(a1 as i32, a2 as u64, a3),
        Syscall::Lseek => fs::sys_lseek(a1 as i32, a2 as i64, a3 as u32),
        Syscall::Stat => fs::sys_stat(a1 as u64, a2 as u64),
        Syscall::Fstat => fs::sys_fstat(a1 as i32, a2 as u64),
        Syscall::Mkdir => fs::sys_mkdir(a1 as u64, a2 as u32),
        Syscall::Unlink => fs::sys_unlink(a1 as u64),
        Syscall::Rename => fs::sys_rename(a1 as u64, a2 as u64),
        Syscall::Getcwd => fs::sys_getcwd(a1 as u64, a2),
        Syscall::Chdir => fs::sys_chdir(a1 as u64),
        Syscall::Getdents => fs::sys_getdents(a1 as i32, a2 as u64, a3),
        Syscall::Ftruncate => fs::sys_ftruncate(a1 as i32, a2 as u64),
        Syscall::Pipe => fs::sys_pipe(a1 as u64),
        Syscall::Dup => fs::sys_dup(a1 as i32),
        Syscall::Dup2 => fs::sys_dup2(a1 as i32, a2 as i32),
        Syscall::Ioctl => fs::sys_ioctl(a1 as i32, a2 as u32, a3),

        Syscall::Time => time::sys_time(),
        Syscall::Nanosleep => time::sys_nanosleep(a1 as u64, a2 as u64),

        Syscall::Brk => memory::sys_brk(a1 as u64),
        Syscall::Mmap => memory::sys_mmap(a1 as u64, a2, a3 as u32, a4 as u32, a5 as i32, a6 as u64),
        Syscall::Munmap => memory::sys_munmap(a1 as u64, a2),

        Syscall::Reboot => system::sys_reboot(),
        Syscall::Poweroff => system::sys_poweroff(),
        Syscall::Uname => system::sys_uname(a1 as u64),

        Syscall::Socket => socket::sys_socket(a1 as i32, a2 as i32, a3 as i32),
        Syscall::Bind => socket::sys_bind(a1 as i32, a2 as u64, a3),
        Syscall::Listen => socket::sys_listen(a1 as i32, a2 as i32),
        Syscall::Accept => socket::sys_accept(a1 as i32, a2 as u64, a3 as u64),
        Syscall::Connect => socket::sys_connect(a1 as i32, a2 as u64, a3),
        Syscall::Send => socket::sys_send(a1 as i32, a2 as u64, a3, a4 as i32),
        Syscall::Recv => socket::sys_recv(a1 as i32, a2 as u64, a3, a4 as i32),
        Syscall::Sendto => socket::sys_sendto(a1 as i32, a2 as u64, a3, a4 as i32, a5 as u64, a6),
        Syscall::Recvfrom => {
            socket::sys_recvfrom(a1 as i32, a2 as u64, a3, a4 as i32, a5 as u64, a6 as u64)
        }
        Syscall::Shutdown => socket::sys_shutdown(a1 as i32, a2 as i32),
        Syscall::Setsockopt => socket::sys_setsockopt(a1 as i32, a2 as i32, a3 as i32, a4 as u64, a5),
        Syscall::Getsockopt => {
            socket::sys_getsockopt(a1 as i32, a2 as i32, a3 as i32, a4 as u64, a5 as u64)
        }
        Syscall::Getsockname => socket::sys_getsockname(a1 as i32, a2 as u64, a3 as u64),
        Syscall::Getpeername => socket::sys_getpeername(a1 as i32, a2 as u64, a3 as u64),
        Syscall::Select => socket::sys_select(a1, a2 as u64, a3 as u64, a4 as u64, a5 as u64),
        Syscall::Fcntl => fs::sys_fcntl(a1 as i32, a2 as i32, a3),
    }
}

/// Run `f` with the calling task's address space and the kernel frame
/// source. Fails for kernel threads, which have no user half.
pub(crate) fn with_user_space<R>(
    f: impl FnOnce(&mut AddressSpace, &mut KernelFrameSource) -> KernelResult<R>,
) -> KernelResult<R> {
    let space = crate::process::current_address_space_ptr().ok_or(KernelError::PermissionDenied {
        operation: "user-memory access from kernel thread",
    })?;
    let mut source = KernelFrameSource;
    // SAFETY: the pointer targets the current task's address space; the
    // task cannot be reaped while executing this syscall.
    unsafe { f(&mut *space, &mut source) }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn syscall_numbers_round_trip() {
        for syscall in [
            Syscall::Exit,
            Syscall::Fork,
            Syscall::Open,
            Syscall::Mmap,
            Syscall::Select,
            Syscall::Fcntl,
        ] {
            assert_eq!(Syscall::try_from(syscall as usize), Ok(syscall));
        }
    }

    #[test]
    fn unknown_numbers_are_rejected() {
        assert!(Syscall::try_from(0).is_err());
        assert!(Syscall::try_from(9).is_err());
        assert!(Syscall::try_from(1000).is_err());
    }
}

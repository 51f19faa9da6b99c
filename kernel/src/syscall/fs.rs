//! File-group system calls.
//!
//! All user pointers are validated and copied through `mm::user` before
//! any VFS call. Descriptors 0-2 fall back to the boot console when the
//! task has not opened anything else there.

extern crate alloc;

use alloc::format;
use alloc::string::String;

use crate::error::{KernelError, KernelResult};
use crate::fs::{self, NodeKind, OpenFlags, Stat};
use crate::mm::user;
use crate::process::fd::{FileHandle, MAX_FDS};
use crate::sched;

use super::with_user_space;

/// Serialized `stat` record handed to user mode (32 bytes, little
/// endian): inode, size, mode, kind, nlink, pad.
const USTAT_SIZE: usize = 32;

fn encode_stat(stat: &Stat) -> [u8; USTAT_SIZE] {
    let mut out = [0u8; USTAT_SIZE];
    out[0..8].copy_from_slice(&stat.inode.to_le_bytes());
    out[8..16].copy_from_slice(&stat.size.to_le_bytes());
    out[16..20].copy_from_slice(&stat.mode.to_le_bytes());
    out[20..24].copy_from_slice(&(kind_code(stat.kind)).to_le_bytes());
    out[24..28].copy_from_slice(&stat.nlink.to_le_bytes());
    out
}

fn kind_code(kind: NodeKind) -> u32 {
    match kind {
        NodeKind::File => 1,
        NodeKind::Dir => 2,
        NodeKind::CharDev => 3,
        NodeKind::BlockDev => 4,
        NodeKind::Pipe => 5,
        NodeKind::Symlink => 6,
    }
}

/// Serialized directory entry (64 bytes): inode, kind, name length, name
/// bytes (truncated to 48).
const UDIRENT_SIZE: usize = 64;
const UDIRENT_NAME_MAX: usize = 48;

/// Join a possibly relative path onto the task's working directory.
fn absolute_path(path: &str) -> String {
    if path.starts_with('/') {
        return String::from(path);
    }
    let cwd = sched::with_current_mut(|task| task.cwd.clone()).unwrap_or_else(|| String::from("/"));
    if cwd == "/" {
        format!("/{}", path)
    } else {
        format!("{}/{}", cwd, path)
    }
}

fn copy_path(path_ptr: u64) -> KernelResult<String> {
    let raw = with_user_space(|space, source| {
        user::copy_string_from_user(space, source, path_ptr)
    })?;
    Ok(absolute_path(&raw))
}

fn with_fd_table<R>(
    f: impl FnOnce(&mut crate::process::fd::FdTable) -> KernelResult<R>,
) -> KernelResult<R> {
    sched::with_current_mut(|task| f(&mut task.open_files)).ok_or(
        KernelError::NotInitialized {
            subsystem: "scheduler",
        },
    )?
}

pub fn sys_open(path_ptr: u64, flags: u32) -> KernelResult<usize> {
    let path = copy_path(path_ptr)?;
    let flags = OpenFlags::from_bits_truncate(flags);

    let node = match fs::resolve(&path) {
        Some(node) => {
            if flags.contains(OpenFlags::TRUNCATE) && node.kind() == NodeKind::File {
                node.truncate(0)?;
            }
            node
        }
        None if flags.contains(OpenFlags::CREATE) => {
            let root = fs::root().ok_or(KernelError::NotInitialized { subsystem: "vfs" })?;
            root.create(&path, 0o644)?
        }
        None => {
            return Err(KernelError::NotFound { resource: "path" });
        }
    };

    let mut handle = FileHandle::new(node, flags);
    if flags.contains(OpenFlags::APPEND) {
        handle.offset = handle.node.stat().size;
    }
    let fd = with_fd_table(|table| table.insert(handle))?;
    Ok(fd as usize)
}

pub fn sys_close(fd: i32) -> KernelResult<usize> {
    with_fd_table(|table| table.remove(fd))?;
    Ok(0)
}

fn console_fallback(fd: i32) -> bool {
    (0..=2).contains(&fd)
}

pub fn sys_read(fd: i32, buf_ptr: u64, len: usize) -> KernelResult<usize> {
    with_user_space(|space, source| {
        user::check_user_buffer(space, source, buf_ptr, len, user::Access::Write)
    })?;

    let handle = with_fd_table(|table| table.get(fd).cloned());
    let handle = match handle {
        Ok(handle) => handle,
        // Console stdin has no input source in the core.
        Err(_) if console_fallback(fd) => return Ok(0),
        Err(err) => return Err(err),
    };

    let mut kbuf = alloc::vec![0u8; len.min(64 * 1024)];
    let read = handle.node.read(handle.offset, &mut kbuf)?;
    with_user_space(|space, source| {
        user::copy_to_user(space, source, buf_ptr, &kbuf[..read])
    })?;
    with_fd_table(|table| {
        if let Ok(h) = table.get_mut(fd) {
            h.offset += read as u64;
        }
        Ok(())
    })?;
    Ok(read)
}

pub fn sys_write(fd: i32, buf_ptr: u64, len: usize) -> KernelResult<usize> {
    let mut kbuf = alloc::vec![0u8; len.min(64 * 1024)];
    with_user_space(|space, source| {
        user::check_user_buffer(space, source, buf_ptr, kbuf.len(), user::Access::Read)?;
        user::copy_from_user(space, source, buf_ptr, &mut kbuf)
    })?;

    let handle = with_fd_table(|table| table.get(fd).cloned());
    match handle {
        Ok(handle) => {
            if !handle.flags.writable() && handle.node.kind() == NodeKind::File {
                return Err(KernelError::PermissionDenied {
                    operation: "write to read-only descriptor",
                });
            }
            let written = handle.node.write(handle.offset, &kbuf)?;
            with_fd_table(|table| {
                if let Ok(h) = table.get_mut(fd) {
                    h.offset += written as u64;
                }
                Ok(())
            })?;
            Ok(written)
        }
        Err(_) if console_fallback(fd) => {
            if let Ok(text) = core::str::from_utf8(&kbuf) {
                crate::print!("{}", text);
            }
            Ok(kbuf.len())
        }
        Err(err) => Err(err),
    }
}

pub fn sys_lseek(fd: i32, offset: i64, whence: u32) -> KernelResult<usize> {
    with_fd_table(|table| {
        let handle = table.get_mut(fd)?;
        let size = handle.node.stat().size as i64;
        let base = match whence {
            0 => 0,
            1 => handle.offset as i64,
            2 => size,
            _ => {
                return Err(KernelError::InvalidArgument {
                    name: "whence",
                    value: "must be SEEK_SET, SEEK_CUR, or SEEK_END",
                })
            }
        };
        let target = base + offset;
        if target < 0 {
            return Err(KernelError::InvalidArgument {
                name: "offset",
                value: "seek before start of file",
            });
        }
        handle.offset = target as u64;
        Ok(handle.offset as usize)
    })
}

pub fn sys_stat(path_ptr: u64, stat_ptr: u64) -> KernelResult<usize> {
    let path = copy_path(path_ptr)?;
    let node = fs::resolve(&path).ok_or(KernelError::NotFound { resource: "path" })?;
    let encoded = encode_stat(&node.stat());
    with_user_space(|space, source| user::copy_to_user(space, source, stat_ptr, &encoded))?;
    Ok(0)
}

pub fn sys_fstat(fd: i32, stat_ptr: u64) -> KernelResult<usize> {
    let handle = with_fd_table(|table| table.get(fd).cloned())?;
    let encoded = encode_stat(&handle.node.stat());
    with_user_space(|space, source| user::copy_to_user(space, source, stat_ptr, &encoded))?;
    Ok(0)
}

pub fn sys_mkdir(path_ptr: u64, mode: u32) -> KernelResult<usize> {
    let path = copy_path(path_ptr)?;
    let root = fs::root().ok_or(KernelError::NotInitialized { subsystem: "vfs" })?;
    root.mkdir(&path, mode)?;
    Ok(0)
}

pub fn sys_unlink(path_ptr: u64) -> KernelResult<usize> {
    let path = copy_path(path_ptr)?;
    let root = fs::root().ok_or(KernelError::NotInitialized { subsystem: "vfs" })?;
    root.unlink(&path)?;
    Ok(0)
}

pub fn sys_rename(from_ptr: u64, to_ptr: u64) -> KernelResult<usize> {
    let from = copy_path(from_ptr)?;
    let to = copy_path(to_ptr)?;
    let root = fs::root().ok_or(KernelError::NotInitialized { subsystem: "vfs" })?;
    root.rename(&from, &to)?;
    Ok(0)
}

pub fn sys_getcwd(buf_ptr: u64, len: usize) -> KernelResult<usize> {
    let cwd = sched::with_current_mut(|task| task.cwd.clone()).unwrap_or_else(|| String::from("/"));
    if cwd.len() + 1 > len {
        return Err(KernelError::InvalidArgument {
            name: "len",
            value: "buffer too small for cwd",
        });
    }
    with_user_space(|space, source| {
        user::copy_to_user(space, source, buf_ptr, cwd.as_bytes())?;
        user::copy_to_user(space, source, buf_ptr + cwd.len() as u64, &[0])
    })?;
    Ok(cwd.len())
}

pub fn sys_chdir(path_ptr: u64) -> KernelResult<usize> {
    let path = copy_path(path_ptr)?;
    let node = fs::resolve(&path).ok_or(KernelError::NotFound { resource: "path" })?;
    if node.kind() != NodeKind::Dir {
        return Err(KernelError::NotADirectory);
    }
    sched::with_current_mut(|task| task.cwd = path);
    Ok(0)
}

pub fn sys_getdents(fd: i32, buf_ptr: u64, len: usize) -> KernelResult<usize> {
    let handle = with_fd_table(|table| table.get(fd).cloned())?;
    if handle.node.kind() != NodeKind::Dir {
        return Err(KernelError::NotADirectory);
    }

    let max_records = len / UDIRENT_SIZE;
    let mut written = 0usize;
    let mut index = handle.offset as usize;

    while written + UDIRENT_SIZE <= max_records * UDIRENT_SIZE {
        let entry = match handle.node.readdir(index) {
            Some(entry) => entry,
            None => break,
        };
        let mut record = [0u8; UDIRENT_SIZE];
        record[0..8].copy_from_slice(&entry.inode.to_le_bytes());
        record[8..12].copy_from_slice(&kind_code(entry.kind).to_le_bytes());
        let name_len = entry.name.len().min(UDIRENT_NAME_MAX);
        record[12..16].copy_from_slice(&(name_len as u32).to_le_bytes());
        record[16..16 + name_len].copy_from_slice(&entry.name.as_bytes()[..name_len]);

        with_user_space(|space, source| {
            user::copy_to_user(space, source, buf_ptr + written as u64, &record)
        })?;
        written += UDIRENT_SIZE;
        index += 1;
    }

    with_fd_table(|table| {
        if let Ok(h) = table.get_mut(fd) {
            h.offset = index as u64;
        }
        Ok(())
    })?;
    Ok(written)
}

pub fn sys_ftruncate(fd: i32, size: u64) -> KernelResult<usize> {
    let handle = with_fd_table(|table| table.get(fd).cloned())?;
    handle.node.truncate(size)?;
    Ok(0)
}

pub fn sys_pipe(fds_ptr: u64) -> KernelResult<usize> {
    let (read_end, write_end) = crate::fs::pipe::pipe();
    let (read_fd, write_fd) = with_fd_table(|table| {
        let read_fd = table.insert(FileHandle::new(read_end.clone(), OpenFlags::empty()))?;
        let write_fd = match table.insert(FileHandle::new(write_end.clone(), OpenFlags::WRITE)) {
            Ok(fd) => fd,
            Err(err) => {
                let _ = table.remove(read_fd);
                return Err(err);
            }
        };
        Ok((read_fd, write_fd))
    })?;

    let mut out = [0u8; 8];
    out[0..4].copy_from_slice(&read_fd.to_le_bytes());
    out[4..8].copy_from_slice(&write_fd.to_le_bytes());
    with_user_space(|space, source| user::copy_to_user(space, source, fds_ptr, &out))?;
    Ok(0)
}

pub fn sys_dup(fd: i32) -> KernelResult<usize> {
    with_fd_table(|table| table.dup(fd)).map(|fd| fd as usize)
}

pub fn sys_dup2(fd: i32, target: i32) -> KernelResult<usize> {
    with_fd_table(|table| table.dup_to(fd, target)).map(|fd| fd as usize)
}

pub fn sys_ioctl(fd: i32, cmd: u32, arg: usize) -> KernelResult<usize> {
    let handle = with_fd_table(|table| table.get(fd).cloned())?;
    handle.node.ioctl(cmd, arg)
}

/// `fcntl` commands.
const F_DUPFD: i32 = 0;
const F_GETFD: i32 = 1;
const F_SETFD: i32 = 2;
const F_GETFL: i32 = 3;

pub fn sys_fcntl(fd: i32, cmd: i32, arg: usize) -> KernelResult<usize> {
    with_fd_table(|table| match cmd {
        F_DUPFD => {
            if arg >= MAX_FDS {
                return Err(KernelError::InvalidArgument {
                    name: "arg",
                    value: "descriptor floor out of range",
                });
            }
            // Lowest free slot at or above `arg`.
            table.get(fd)?;
            for candidate in arg as i32..MAX_FDS as i32 {
                if table.get(candidate).is_err() {
                    return table.dup_to(fd, candidate).map(|fd| fd as usize);
                }
            }
            Err(KernelError::TooManyOpenFiles)
        }
        F_GETFD => Ok(table.get(fd)?.close_on_exec() as usize),
        F_SETFD => {
            let handle = table.get_mut(fd)?;
            if arg & 1 != 0 {
                handle.flags |= OpenFlags::CLOEXEC;
            } else {
                handle.flags &= !OpenFlags::CLOEXEC;
            }
            Ok(0)
        }
        F_GETFL => Ok(table.get(fd)?.flags.bits() as usize),
        _ => Err(KernelError::NotImplemented { feature: "fcntl command" }),
    })
}

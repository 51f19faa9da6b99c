//! Socket-group system calls.
//!
//! Sockets reach the core only as file descriptors. Every operation
//! copies its buffers through `mm::user`, resolves the descriptor to the
//! node the network stack minted, and routes through the registered
//! [`SocketProvider`](crate::net::SocketProvider).

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};
use crate::fs::{NodeKind, OpenFlags, VfsNode};
use crate::mm::user;
use crate::net;
use crate::process::fd::FileHandle;
use crate::sched;

use super::with_user_space;

/// Largest socket address accepted from user mode.
const MAX_ADDR_LEN: usize = 128;

fn socket_node(fd: i32) -> KernelResult<Arc<dyn VfsNode>> {
    let handle = sched::with_current_mut(|task| task.open_files.get(fd).cloned())
        .ok_or(KernelError::NotInitialized {
            subsystem: "scheduler",
        })??;
    Ok(handle.node)
}

fn install_node(node: Arc<dyn VfsNode>) -> KernelResult<i32> {
    sched::with_current_mut(|task| {
        task.open_files
            .insert(FileHandle::new(node, OpenFlags::READ_WRITE))
    })
    .ok_or(KernelError::NotInitialized {
        subsystem: "scheduler",
    })?
}

fn copy_addr_in(addr_ptr: u64, addr_len: usize) -> KernelResult<Vec<u8>> {
    if addr_len > MAX_ADDR_LEN {
        return Err(KernelError::InvalidArgument {
            name: "addr_len",
            value: "socket address too large",
        });
    }
    let mut addr = alloc::vec![0u8; addr_len];
    with_user_space(|space, source| user::copy_from_user(space, source, addr_ptr, &mut addr))?;
    Ok(addr)
}

/// Write an address back through an `(addr, addr_len)` out-pair.
fn copy_addr_out(addr_ptr: u64, addr_len_ptr: u64, addr: &[u8]) -> KernelResult<()> {
    if addr_ptr == 0 {
        return Ok(());
    }
    with_user_space(|space, source| {
        let mut len_raw = [0u8; 4];
        user::copy_from_user(space, source, addr_len_ptr, &mut len_raw)?;
        let capacity = u32::from_le_bytes(len_raw) as usize;
        let len = addr.len().min(capacity);
        user::copy_to_user(space, source, addr_ptr, &addr[..len])?;
        user::copy_to_user(space, source, addr_len_ptr, &(addr.len() as u32).to_le_bytes())
    })
}

pub fn sys_socket(domain: i32, ty: i32, protocol: i32) -> KernelResult<usize> {
    let node = net::provider()?.socket(domain, ty, protocol)?;
    install_node(node).map(|fd| fd as usize)
}

pub fn sys_bind(fd: i32, addr_ptr: u64, addr_len: usize) -> KernelResult<usize> {
    let node = socket_node(fd)?;
    let addr = copy_addr_in(addr_ptr, addr_len)?;
    net::provider()?.bind(&node, &addr)?;
    Ok(0)
}

pub fn sys_listen(fd: i32, backlog: i32) -> KernelResult<usize> {
    let node = socket_node(fd)?;
    net::provider()?.listen(&node, backlog)?;
    Ok(0)
}

pub fn sys_accept(fd: i32, addr_ptr: u64, addr_len_ptr: u64) -> KernelResult<usize> {
    let node = socket_node(fd)?;
    let (conn, peer) = net::provider()?.accept(&node)?;
    let conn_fd = install_node(conn)?;
    copy_addr_out(addr_ptr, addr_len_ptr, &peer)?;
    Ok(conn_fd as usize)
}

pub fn sys_connect(fd: i32, addr_ptr: u64, addr_len: usize) -> KernelResult<usize> {
    let node = socket_node(fd)?;
    let addr = copy_addr_in(addr_ptr, addr_len)?;
    net::provider()?.connect(&node, &addr)?;
    Ok(0)
}

pub fn sys_send(fd: i32, buf_ptr: u64, len: usize, flags: i32) -> KernelResult<usize> {
    let node = socket_node(fd)?;
    let mut buf = alloc::vec![0u8; len.min(64 * 1024)];
    with_user_space(|space, source| user::copy_from_user(space, source, buf_ptr, &mut buf))?;
    net::provider()?.send(&node, &buf, flags)
}

pub fn sys_recv(fd: i32, buf_ptr: u64, len: usize, flags: i32) -> KernelResult<usize> {
    let node = socket_node(fd)?;
    with_user_space(|space, source| {
        user::check_user_buffer(space, source, buf_ptr, len, user::Access::Write)
    })?;
    let mut buf = alloc::vec![0u8; len.min(64 * 1024)];
    let received = net::provider()?.recv(&node, &mut buf, flags)?;
    with_user_space(|space, source| {
        user::copy_to_user(space, source, buf_ptr, &buf[..received])
    })?;
    Ok(received)
}

pub fn sys_sendto(
    fd: i32,
    buf_ptr: u64,
    len: usize,
    flags: i32,
    addr_ptr: u64,
    addr_len: usize,
) -> KernelResult<usize> {
    let node = socket_node(fd)?;
    let mut buf = alloc::vec![0u8; len.min(64 * 1024)];
    with_user_space(|space, source| user::copy_from_user(space, source, buf_ptr, &mut buf))?;
    let addr = copy_addr_in(addr_ptr, addr_len)?;
    net::provider()?.sendto(&node, &buf, flags, &addr)
}

pub fn sys_recvfrom(
    fd: i32,
    buf_ptr: u64,
    len: usize,
    flags: i32,
    addr_ptr: u64,
    addr_len_ptr: u64,
) -> KernelResult<usize> {
    let node = socket_node(fd)?;
    with_user_space(|space, source| {
        user::check_user_buffer(space, source, buf_ptr, len, user::Access::Write)
    })?;
    let mut buf = alloc::vec![0u8; len.min(64 * 1024)];
    let (received, peer) = net::provider()?.recvfrom(&node, &mut buf, flags)?;
    with_user_space(|space, source| {
        user::copy_to_user(space, source, buf_ptr, &buf[..received])
    })?;
    copy_addr_out(addr_ptr, addr_len_ptr, &peer)?;
    Ok(received)
}

pub fn sys_shutdown(fd: i32, how: i32) -> KernelResult<usize> {
    let node = socket_node(fd)?;
    net::provider()?.shutdown(&node, how)?;
    Ok(0)
}

pub fn sys_setsockopt(
    fd: i32,
    level: i32,
    option: i32,
    value_ptr: u64,
    value_len: usize,
) -> KernelResult<usize> {
    let node = socket_node(fd)?;
    let value = copy_addr_in(value_ptr, value_len)?;
    net::provider()?.setsockopt(&node, level, option, &value)?;
    Ok(0)
}

pub fn sys_getsockopt(
    fd: i32,
    level: i32,
    option: i32,
    value_ptr: u64,
    value_len_ptr: u64,
) -> KernelResult<usize> {
    let node = socket_node(fd)?;
    let value = net::provider()?.getsockopt(&node, level, option)?;
    copy_addr_out(value_ptr, value_len_ptr, &value)?;
    Ok(0)
}

pub fn sys_getsockname(fd: i32, addr_ptr: u64, addr_len_ptr: u64) -> KernelResult<usize> {
    let node = socket_node(fd)?;
    let addr = net::provider()?.getsockname(&node)?;
    copy_addr_out(addr_ptr, addr_len_ptr, &addr)?;
    Ok(0)
}

pub fn sys_getpeername(fd: i32, addr_ptr: u64, addr_len_ptr: u64) -> KernelResult<usize> {
    let node = socket_node(fd)?;
    let addr = net::provider()?.getpeername(&node)?;
    copy_addr_out(addr_ptr, addr_len_ptr, &addr)?;
    Ok(0)
}

/// `select` over socket descriptors: a 64-bit read-set bitmap and a
/// millisecond timeout (`u64::MAX` blocks). Bits for ready descriptors
/// are written back; the count is returned.
pub fn sys_select(
    nfds: usize,
    readfds_ptr: u64,
    _writefds_ptr: u64,
    _exceptfds_ptr: u64,
    timeout_ms: u64,
) -> KernelResult<usize> {
    if nfds > 64 {
        return Err(KernelError::InvalidArgument {
            name: "nfds",
            value: "at most 64 descriptors",
        });
    }
    if readfds_ptr == 0 {
        return Err(KernelError::InvalidArgument {
            name: "readfds",
            value: "must be non-null",
        });
    }

    let mut raw = [0u8; 8];
    with_user_space(|space, source| user::copy_from_user(space, source, readfds_ptr, &mut raw))?;
    let requested = u64::from_le_bytes(raw);

    let mut fds = Vec::new();
    let mut nodes: Vec<Arc<dyn VfsNode>> = Vec::new();
    for fd in 0..nfds as i32 {
        if requested & (1 << fd) != 0 {
            let node = socket_node(fd)?;
            if node.kind() != NodeKind::CharDev && node.kind() != NodeKind::Pipe {
                fds.push(fd);
                nodes.push(node);
            }
        }
    }

    let timeout = if timeout_ms == u64::MAX {
        None
    } else {
        Some(timeout_ms)
    };
    let ready = net::provider()?.poll_ready(&nodes, timeout)?;

    let mut result = 0u64;
    let mut count = 0usize;
    for (index, &fd) in fds.iter().enumerate() {
        if ready.get(index).copied().unwrap_or(false) {
            result |= 1 << fd;
            count += 1;
        }
    }
    with_user_space(|space, source| {
        user::copy_to_user(space, source, readfds_ptr, &result.to_le_bytes())
    })?;
    Ok(count)
}

//! The socket contract the core consumes.
//!
//! The network stack proper is an external collaborator. It implements
//! [`SocketProvider`], whose operations mint and consume VFS nodes so
//! sockets can live in ordinary file-descriptor slots; socket system
//! calls route here and fail with `NotImplemented` until a provider
//! registers.

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};
use crate::fs::VfsNode;
use crate::sync::GlobalState;

/// Network-stack entry points, keyed by the node the stack minted in
/// `socket`/`accept`.
pub trait SocketProvider: Send + Sync {
    fn socket(&self, domain: i32, ty: i32, protocol: i32) -> KernelResult<Arc<dyn VfsNode>>;
    fn bind(&self, socket: &Arc<dyn VfsNode>, addr: &[u8]) -> KernelResult<()>;
    fn listen(&self, socket: &Arc<dyn VfsNode>, backlog: i32) -> KernelResult<()>;
    /// Returns the connection node and the peer address bytes.
    fn accept(&self, socket: &Arc<dyn VfsNode>) -> KernelResult<(Arc<dyn VfsNode>, Vec<u8>)>;
    fn connect(&self, socket: &Arc<dyn VfsNode>, addr: &[u8]) -> KernelResult<()>;
    fn send(&self, socket: &Arc<dyn VfsNode>, buf: &[u8], flags: i32) -> KernelResult<usize>;
    fn recv(&self, socket: &Arc<dyn VfsNode>, buf: &mut [u8], flags: i32) -> KernelResult<usize>;
    fn sendto(
        &self,
        socket: &Arc<dyn VfsNode>,
        buf: &[u8],
        flags: i32,
        addr: &[u8],
    ) -> KernelResult<usize>;
    /// Returns the byte count and the sender address bytes.
    fn recvfrom(
        &self,
        socket: &Arc<dyn VfsNode>,
        buf: &mut [u8],
        flags: i32,
    ) -> KernelResult<(usize, Vec<u8>)>;
    fn shutdown(&self, socket: &Arc<dyn VfsNode>, how: i32) -> KernelResult<()>;
    fn setsockopt(
        &self,
        socket: &Arc<dyn VfsNode>,
        level: i32,
        option: i32,
        value: &[u8],
    ) -> KernelResult<()>;
    fn getsockopt(&self, socket: &Arc<dyn VfsNode>, level: i32, option: i32)
        -> KernelResult<Vec<u8>>;
    fn getsockname(&self, socket: &Arc<dyn VfsNode>) -> KernelResult<Vec<u8>>;
    fn getpeername(&self, socket: &Arc<dyn VfsNode>) -> KernelResult<Vec<u8>>;
    /// `select`-style readiness poll over socket nodes, with a timeout in
    /// milliseconds (`None` blocks).
    fn poll_ready(
        &self,
        sockets: &[Arc<dyn VfsNode>],
        timeout_ms: Option<u64>,
    ) -> KernelResult<Vec<bool>>;
}

static PROVIDER: GlobalState<Arc<dyn SocketProvider>> = GlobalState::new();

/// Install the network stack. First caller wins.
pub fn register_provider(provider: Arc<dyn SocketProvider>) {
    if PROVIDER.set(provider).is_err() {
        log::warn!("socket provider already registered");
    }
}

/// The registered network stack.
pub fn provider() -> KernelResult<&'static Arc<dyn SocketProvider>> {
    PROVIDER.get().ok_or(KernelError::NotImplemented {
        feature: "sockets (no network stack registered)",
    })
}

//! The VFS contract the core consumes.
//!
//! Concrete file systems live outside the core; they implement [`Vfs`] and
//! [`VfsNode`] and register the root at boot. ProcessControl and the
//! syscall layer call exclusively through these trait objects. The
//! in-memory [`ramfs`] implementation exists for the kernel's own tests
//! and early boot.

pub mod pipe;
pub mod ramfs;

extern crate alloc;

use alloc::string::String;
use alloc::sync::Arc;

use bitflags::bitflags;

use crate::error::KernelResult;
use crate::sync::GlobalState;

/// What a directory entry refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Dir,
    CharDev,
    BlockDev,
    Pipe,
    Symlink,
}

/// One directory entry.
#[derive(Debug, Clone)]
pub struct Dirent {
    pub name: String,
    pub inode: u64,
    pub kind: NodeKind,
}

/// Node metadata.
#[derive(Debug, Clone, Copy)]
pub struct Stat {
    pub inode: u64,
    pub kind: NodeKind,
    pub size: u64,
    pub mode: u32,
    pub nlink: u32,
}

bitflags! {
    /// Open flags as they arrive from user mode.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const WRITE      = 1 << 0;
        const READ_WRITE = 1 << 1;
        const CREATE     = 1 << 6;
        const TRUNCATE   = 1 << 9;
        const APPEND     = 1 << 10;
        const CLOEXEC    = 1 << 19;
    }
}

impl OpenFlags {
    pub fn readable(&self) -> bool {
        !self.contains(OpenFlags::WRITE) || self.contains(OpenFlags::READ_WRITE)
    }

    pub fn writable(&self) -> bool {
        self.contains(OpenFlags::WRITE) || self.contains(OpenFlags::READ_WRITE)
    }
}

/// One file-system object: file, directory, or device endpoint.
pub trait VfsNode: Send + Sync {
    fn kind(&self) -> NodeKind;
    fn stat(&self) -> Stat;

    fn read(&self, offset: u64, buf: &mut [u8]) -> KernelResult<usize>;
    fn write(&self, offset: u64, buf: &[u8]) -> KernelResult<usize>;

    /// Entry at `index`, `None` past the end. Directories only.
    fn readdir(&self, index: usize) -> Option<Dirent>;
    /// Child lookup by name. Directories only.
    fn finddir(&self, name: &str) -> Option<Arc<dyn VfsNode>>;

    fn truncate(&self, size: u64) -> KernelResult<()>;

    fn ioctl(&self, _cmd: u32, _arg: usize) -> KernelResult<usize> {
        Err(crate::error::KernelError::NotImplemented { feature: "ioctl" })
    }
}

/// A mounted file-system tree.
pub trait Vfs: Send + Sync {
    /// Resolve an absolute path to a node.
    fn resolve(&self, path: &str) -> Option<Arc<dyn VfsNode>>;

    fn mkdir(&self, path: &str, mode: u32) -> KernelResult<()>;
    fn unlink(&self, path: &str) -> KernelResult<()>;
    fn rename(&self, from: &str, to: &str) -> KernelResult<()>;
    /// Create a regular file (used by `open` with CREATE).
    fn create(&self, path: &str, mode: u32) -> KernelResult<Arc<dyn VfsNode>>;
}

static ROOT: GlobalState<Arc<dyn Vfs>> = GlobalState::new();

/// Mount registration: install the root file system. First caller wins.
pub fn register_root(vfs: Arc<dyn Vfs>) {
    if ROOT.set(vfs).is_err() {
        log::warn!("root file system already registered");
    }
}

/// The registered root file system.
pub fn root() -> Option<&'static Arc<dyn Vfs>> {
    ROOT.get()
}

/// Resolve a path against the registered root.
pub fn resolve(path: &str) -> Option<Arc<dyn VfsNode>> {
    root()?.resolve(path)
}

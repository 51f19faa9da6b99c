//! Per-task file-descriptor tables.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use crate::error::{KernelError, KernelResult};
use crate::fs::{OpenFlags, VfsNode};

/// Highest descriptor count per task.
pub const MAX_FDS: usize = 64;

/// One open file: node reference, cursor, and the open flags.
#[derive(Clone)]
pub struct FileHandle {
    pub node: Arc<dyn VfsNode>,
    pub offset: u64,
    pub flags: OpenFlags,
}

impl FileHandle {
    pub fn new(node: Arc<dyn VfsNode>, flags: OpenFlags) -> Self {
        Self {
            node,
            offset: 0,
            flags,
        }
    }

    pub fn close_on_exec(&self) -> bool {
        self.flags.contains(OpenFlags::CLOEXEC)
    }
}

/// Descriptor table: fd number to handle, lowest free number first.
pub struct FdTable {
    handles: BTreeMap<i32, FileHandle>,
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FdTable {
    pub fn new() -> Self {
        Self {
            handles: BTreeMap::new(),
        }
    }

    fn lowest_free(&self) -> KernelResult<i32> {
        for fd in 0..MAX_FDS as i32 {
            if !self.handles.contains_key(&fd) {
                return Ok(fd);
            }
        }
        Err(KernelError::TooManyOpenFiles)
    }

    /// Install a handle at the lowest free descriptor.
    pub fn insert(&mut self, handle: FileHandle) -> KernelResult<i32> {
        let fd = self.lowest_free()?;
        self.handles.insert(fd, handle);
        Ok(fd)
    }

    pub fn get(&self, fd: i32) -> KernelResult<&FileHandle> {
        self.handles
            .get(&fd)
            .ok_or(KernelError::BadFileDescriptor { fd })
    }

    pub fn get_mut(&mut self, fd: i32) -> KernelResult<&mut FileHandle> {
        self.handles
            .get_mut(&fd)
            .ok_or(KernelError::BadFileDescriptor { fd })
    }

    pub fn remove(&mut self, fd: i32) -> KernelResult<FileHandle> {
        self.handles
            .remove(&fd)
            .ok_or(KernelError::BadFileDescriptor { fd })
    }

    /// `dup`: clone into the lowest free slot.
    pub fn dup(&mut self, fd: i32) -> KernelResult<i32> {
        let handle = self.get(fd)?.clone();
        self.insert(handle)
    }

    /// `dup2`: clone into a chosen slot, closing what was there.
    pub fn dup_to(&mut self, fd: i32, target: i32) -> KernelResult<i32> {
        if target < 0 || target >= MAX_FDS as i32 {
            return Err(KernelError::BadFileDescriptor { fd: target });
        }
        if fd == target {
            self.get(fd)?;
            return Ok(target);
        }
        let handle = self.get(fd)?.clone();
        self.handles.insert(target, handle);
        Ok(target)
    }

    /// Copy for `fork`: every handle's node reference count rises by one.
    pub fn clone_for_fork(&self) -> Self {
        Self {
            handles: self.handles.clone(),
        }
    }

    /// Drop handles marked close-on-exec (the `execve` path).
    pub fn retain_across_exec(&mut self) {
        self.handles.retain(|_, handle| !handle.close_on_exec());
    }

    /// Drop everything (the `exit` path).
    pub fn clear(&mut self) {
        self.handles.clear();
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::fs::ramfs::RamFs;
    use crate::fs::Vfs;

    fn handle(flags: OpenFlags) -> FileHandle {
        let fs = RamFs::new();
        fs.add_file("/f", b"data");
        FileHandle::new(fs.resolve("/f").unwrap(), flags)
    }

    #[test]
    fn descriptors_fill_lowest_first() {
        let mut table = FdTable::new();
        assert_eq!(table.insert(handle(OpenFlags::empty())).unwrap(), 0);
        assert_eq!(table.insert(handle(OpenFlags::empty())).unwrap(), 1);
        table.remove(0).unwrap();
        assert_eq!(table.insert(handle(OpenFlags::empty())).unwrap(), 0);
    }

    #[test]
    fn dup_shares_the_node() {
        let mut table = FdTable::new();
        let fd = table.insert(handle(OpenFlags::empty())).unwrap();
        let dup = table.dup(fd).unwrap();
        assert_ne!(fd, dup);
        assert!(Arc::ptr_eq(
            &table.get(fd).unwrap().node,
            &table.get(dup).unwrap().node
        ));
    }

    #[test]
    fn dup_to_replaces_target() {
        let mut table = FdTable::new();
        let a = table.insert(handle(OpenFlags::empty())).unwrap();
        let _b = table.insert(handle(OpenFlags::empty())).unwrap();
        assert_eq!(table.dup_to(a, 1).unwrap(), 1);
        assert!(Arc::ptr_eq(
            &table.get(a).unwrap().node,
            &table.get(1).unwrap().node
        ));
    }

    #[test]
    fn exec_drops_cloexec_handles_only() {
        let mut table = FdTable::new();
        let keep = table.insert(handle(OpenFlags::empty())).unwrap();
        let drop_fd = table.insert(handle(OpenFlags::CLOEXEC)).unwrap();
        table.retain_across_exec();
        assert!(table.get(keep).is_ok());
        assert!(table.get(drop_fd).is_err());
    }

    #[test]
    fn fork_copy_bumps_refcounts() {
        let mut table = FdTable::new();
        let fd = table.insert(handle(OpenFlags::empty())).unwrap();
        let before = Arc::strong_count(&table.get(fd).unwrap().node);
        let copy = table.clone_for_fork();
        assert_eq!(
            Arc::strong_count(&table.get(fd).unwrap().node),
            before + 1
        );
        drop(copy);
    }

    #[test]
    fn bad_descriptor_is_an_error() {
        let mut table = FdTable::new();
        assert!(matches!(
            table.remove(5),
            Err(KernelError::BadFileDescriptor { fd: 5 })
        ));
    }
}

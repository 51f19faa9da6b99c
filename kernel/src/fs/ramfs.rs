//! In-memory file system.
//!
//! Backs the kernel's own tests and the pre-driver boot window. Flat
//! namespace of absolute paths; directories exist implicitly through
//! their children plus explicit `mkdir` markers.

extern crate alloc;

use alloc::borrow::ToOwned;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::error::{KernelError, KernelResult};

use super::{Dirent, NodeKind, Stat, Vfs, VfsNode};

struct FileData {
    inode: u64,
    bytes: Mutex<Vec<u8>>,
}

/// A regular file node.
struct RamFile {
    data: Arc<FileData>,
}

impl VfsNode for RamFile {
    fn kind(&self) -> NodeKind {
        NodeKind::File
    }

    fn stat(&self) -> Stat {
        Stat {
            inode: self.data.inode,
            kind: NodeKind::File,
            size: self.data.bytes.lock().len() as u64,
            mode: 0o644,
            nlink: 1,
        }
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> KernelResult<usize> {
        let bytes = self.data.bytes.lock();
        let offset = offset as usize;
        if offset >= bytes.len() {
            return Ok(0);
        }
        let len = buf.len().min(bytes.len() - offset);
        buf[..len].copy_from_slice(&bytes[offset..offset + len]);
        Ok(len)
    }

    fn write(&self, offset: u64, buf: &[u8]) -> KernelResult<usize> {
        let mut bytes = self.data.bytes.lock();
        let end = offset as usize + buf.len();
        if bytes.len() < end {
            bytes.resize(end, 0);
        }
        bytes[offset as usize..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn readdir(&self, _index: usize) -> Option<Dirent> {
        None
    }

    fn finddir(&self, _name: &str) -> Option<Arc<dyn VfsNode>> {
        None
    }

    fn truncate(&self, size: u64) -> KernelResult<()> {
        self.data.bytes.lock().resize(size as usize, 0);
        Ok(())
    }
}

/// A directory node listing its direct children.
struct RamDir {
    fs: Arc<RamFsInner>,
    path: String,
    inode: u64,
}

impl VfsNode for RamDir {
    fn kind(&self) -> NodeKind {
        NodeKind::Dir
    }

    fn stat(&self) -> Stat {
        Stat {
            inode: self.inode,
            kind: NodeKind::Dir,
            size: 0,
            mode: 0o755,
            nlink: 1,
        }
    }

    fn read(&self, _offset: u64, _buf: &mut [u8]) -> KernelResult<usize> {
        Err(KernelError::IsADirectory)
    }

    fn write(&self, _offset: u64, _buf: &[u8]) -> KernelResult<usize> {
        Err(KernelError::IsADirectory)
    }

    fn readdir(&self, index: usize) -> Option<Dirent> {
        self.fs.children_of(&self.path).into_iter().nth(index)
    }

    fn finddir(&self, name: &str) -> Option<Arc<dyn VfsNode>> {
        let path = join(&self.path, name);
        self.fs.lookup(&path)
    }

    fn truncate(&self, _size: u64) -> KernelResult<()> {
        Err(KernelError::IsADirectory)
    }
}

enum Entry {
    File(Arc<FileData>),
    Dir(u64),
}

struct RamFsInner {
    entries: Mutex<BTreeMap<String, Entry>>,
    next_inode: Mutex<u64>,
}

impl RamFsInner {
    fn alloc_inode(&self) -> u64 {
        let mut next = self.next_inode.lock();
        *next += 1;
        *next
    }

    fn lookup(self: &Arc<Self>, path: &str) -> Option<Arc<dyn VfsNode>> {
        let entries = self.entries.lock();
        match entries.get(path)? {
            Entry::File(data) => Some(Arc::new(RamFile { data: data.clone() })),
            Entry::Dir(inode) => Some(Arc::new(RamDir {
                fs: self.clone(),
                path: path.to_owned(),
                inode: *inode,
            })),
        }
    }

    fn children_of(&self, dir: &str) -> Vec<Dirent> {
        let prefix = if dir == "/" {
            String::from("/")
        } else {
            alloc::format!("{}/", dir)
        };
        let entries = self.entries.lock();
        entries
            .iter()
            .filter(|(path, _)| {
                path.starts_with(prefix.as_str())
                    && path.len() > prefix.len()
                    && !path[prefix.len()..].contains('/')
            })
            .map(|(path, entry)| Dirent {
                name: path[prefix.len()..].to_owned(),
                inode: match entry {
                    Entry::File(data) => data.inode,
                    Entry::Dir(inode) => *inode,
                },
                kind: match entry {
                    Entry::File(_) => NodeKind::File,
                    Entry::Dir(_) => NodeKind::Dir,
                },
            })
            .collect()
    }
}

fn join(dir: &str, name: &str) -> String {
    if dir == "/" {
        alloc::format!("/{}", name)
    } else {
        alloc::format!("{}/{}", dir, name)
    }
}

/// The in-memory file system.
pub struct RamFs {
    inner: Arc<RamFsInner>,
}

impl Default for RamFs {
    fn default() -> Self {
        Self::new()
    }
}

impl RamFs {
    pub fn new() -> Self {
        let inner = Arc::new(RamFsInner {
            entries: Mutex::new(BTreeMap::new()),
            next_inode: Mutex::new(1),
        });
        inner
            .entries
            .lock()
            .insert(String::from("/"), Entry::Dir(1));
        Self { inner }
    }

    /// Install a file with the given contents (boot images, test
    /// fixtures).
    pub fn add_file(&self, path: &str, contents: &[u8]) {
        let data = Arc::new(FileData {
            inode: self.inner.alloc_inode(),
            bytes: Mutex::new(contents.to_vec()),
        });
        self.inner
            .entries
            .lock()
            .insert(path.to_owned(), Entry::File(data));
    }
}

impl Vfs for RamFs {
    fn resolve(&self, path: &str) -> Option<Arc<dyn VfsNode>> {
        if !path.starts_with('/') {
            return None;
        }
        let normalized = if path.len() > 1 && path.ends_with('/') {
            &path[..path.len() - 1]
        } else {
            path
        };
        self.inner.lookup(normalized)
    }

    fn mkdir(&self, path: &str, _mode: u32) -> KernelResult<()> {
        let mut entries = self.inner.entries.lock();
        if entries.contains_key(path) {
            return Err(KernelError::AlreadyExists {
                resource: "directory",
            });
        }
        let inode = {
            let mut next = self.inner.next_inode.lock();
            *next += 1;
            *next
        };
        entries.insert(path.to_owned(), Entry::Dir(inode));
        Ok(())
    }

    fn unlink(&self, path: &str) -> KernelResult<()> {
        self.inner
            .entries
            .lock()
            .remove(path)
            .map(|_| ())
            .ok_or(KernelError::NotFound { resource: "path" })
    }

    fn rename(&self, from: &str, to: &str) -> KernelResult<()> {
        let mut entries = self.inner.entries.lock();
        let entry = entries
            .remove(from)
            .ok_or(KernelError::NotFound { resource: "path" })?;
        entries.insert(to.to_owned(), entry);
        Ok(())
    }

    fn create(&self, path: &str, _mode: u32) -> KernelResult<Arc<dyn VfsNode>> {
        let data = Arc::new(FileData {
            inode: self.inner.alloc_inode(),
            bytes: Mutex::new(Vec::new()),
        });
        self.inner
            .entries
            .lock()
            .insert(path.to_owned(), Entry::File(data.clone()));
        Ok(Arc::new(RamFile { data }))
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn resolve_and_read_back() {
        let fs = RamFs::new();
        fs.add_file("/bin/true", b"#!");

        let node = fs.resolve("/bin/true").expect("file resolves");
        let mut buf = [0u8; 2];
        assert_eq!(node.read(0, &mut buf).unwrap(), 2);
        assert_eq!(&buf, b"#!");
        assert!(fs.resolve("/bin/false").is_none());
    }

    #[test]
    fn write_extends_file() {
        let fs = RamFs::new();
        fs.add_file("/data", b"");
        let node = fs.resolve("/data").unwrap();
        node.write(4, b"abcd").unwrap();
        assert_eq!(node.stat().size, 8);
    }

    #[test]
    fn readdir_lists_direct_children_only() {
        let fs = RamFs::new();
        fs.mkdir("/bin", 0o755).unwrap();
        fs.add_file("/bin/true", b"");
        fs.add_file("/bin/sh", b"");
        fs.add_file("/etc", b"");

        let root = fs.resolve("/").unwrap();
        let mut names: Vec<String> = (0..)
            .map_while(|i| root.readdir(i))
            .map(|d| d.name)
            .collect();
        names.sort();
        assert_eq!(names, ["bin", "etc"]);

        let bin = fs.resolve("/bin").unwrap();
        assert!(bin.finddir("true").is_some());
        assert!(bin.finddir("cat").is_none());
    }

    #[test]
    fn unlink_and_rename() {
        let fs = RamFs::new();
        fs.add_file("/a", b"x");
        fs.rename("/a", "/b").unwrap();
        assert!(fs.resolve("/a").is_none());
        assert!(fs.resolve("/b").is_some());
        fs.unlink("/b").unwrap();
        assert!(matches!(
            fs.unlink("/b"),
            Err(KernelError::NotFound { .. })
        ));
    }
}

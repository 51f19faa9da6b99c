//! Anonymous pipes.
//!
//! A bounded in-kernel byte queue with separate read and write endpoint
//! nodes, each an ordinary [`VfsNode`] so the ends live in file
//! descriptors. Reads block while the pipe is empty and a writer exists;
//! writes block while full and a reader exists.

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::sync::WaitQueue;

use super::{Dirent, NodeKind, Stat, VfsNode};

/// Pipe capacity in bytes.
const PIPE_CAPACITY: usize = 64 * 1024;

struct PipeInner {
    buffer: Mutex<VecDeque<u8>>,
    readers: AtomicUsize,
    writers: AtomicUsize,
    read_waiters: WaitQueue,
    write_waiters: WaitQueue,
}

/// The read end of a pipe.
pub struct PipeReader {
    inner: Arc<PipeInner>,
}

/// The write end of a pipe.
pub struct PipeWriter {
    inner: Arc<PipeInner>,
}

/// Create a connected pipe pair `(read_end, write_end)`.
pub fn pipe() -> (Arc<dyn VfsNode>, Arc<dyn VfsNode>) {
    let inner = Arc::new(PipeInner {
        buffer: Mutex::new(VecDeque::new()),
        readers: AtomicUsize::new(1),
        writers: AtomicUsize::new(1),
        read_waiters: WaitQueue::new(),
        write_waiters: WaitQueue::new(),
    });
    (
        Arc::new(PipeReader {
            inner: inner.clone(),
        }),
        Arc::new(PipeWriter { inner }),
    )
}

fn pipe_stat(inner: &PipeInner) -> Stat {
    Stat {
        inode: 0,
        kind: NodeKind::Pipe,
        size: inner.buffer.lock().len() as u64,
        mode: 0o600,
        nlink: 1,
    }
}

impl VfsNode for PipeReader {
    fn kind(&self) -> NodeKind {
        NodeKind::Pipe
    }

    fn stat(&self) -> Stat {
        pipe_stat(&self.inner)
    }

    fn read(&self, _offset: u64, buf: &mut [u8]) -> KernelResult<usize> {
        loop {
            {
                let mut buffer = self.inner.buffer.lock();
                if !buffer.is_empty() {
                    let len = buf.len().min(buffer.len());
                    for byte in buf.iter_mut().take(len) {
                        *byte = buffer.pop_front().expect("length checked");
                    }
                    self.inner.write_waiters.wake_one();
                    return Ok(len);
                }
            }
            if self.inner.writers.load(Ordering::Acquire) == 0 {
                // Write end closed and drained: end of file.
                return Ok(0);
            }
            crate::sched::block_on(&self.inner.read_waiters);
        }
    }

    fn write(&self, _offset: u64, _buf: &[u8]) -> KernelResult<usize> {
        Err(KernelError::PermissionDenied {
            operation: "write to pipe read end",
        })
    }

    fn readdir(&self, _index: usize) -> Option<Dirent> {
        None
    }

    fn finddir(&self, _name: &str) -> Option<Arc<dyn VfsNode>> {
        None
    }

    fn truncate(&self, _size: u64) -> KernelResult<()> {
        Err(KernelError::InvalidArgument {
            name: "fd",
            value: "pipes cannot be truncated",
        })
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.inner.readers.fetch_sub(1, Ordering::Release);
        self.inner.write_waiters.wake_all();
    }
}

impl VfsNode for PipeWriter {
    fn kind(&self) -> NodeKind {
        NodeKind::Pipe
    }

    fn stat(&self) -> Stat {
        pipe_stat(&self.inner)
    }

    fn read(&self, _offset: u64, _buf: &mut [u8]) -> KernelResult<usize> {
        Err(KernelError::PermissionDenied {
            operation: "read from pipe write end",
        })
    }

    fn write(&self, _offset: u64, buf: &[u8]) -> KernelResult<usize> {
        let mut written = 0;
        while written < buf.len() {
            if self.inner.readers.load(Ordering::Acquire) == 0 {
                // Broken pipe: no reader will ever drain this.
                return if written > 0 {
                    Ok(written)
                } else {
                    Err(KernelError::PermissionDenied {
                        operation: "write to pipe with no readers",
                    })
                };
            }
            {
                let mut buffer = self.inner.buffer.lock();
                let room = PIPE_CAPACITY - buffer.len();
                if room > 0 {
                    let len = room.min(buf.len() - written);
                    buffer.extend(&buf[written..written + len]);
                    written += len;
                    self.inner.read_waiters.wake_one();
                    continue;
                }
            }
            crate::sched::block_on(&self.inner.write_waiters);
        }
        Ok(written)
    }

    fn readdir(&self, _index: usize) -> Option<Dirent> {
        None
    }

    fn finddir(&self, _name: &str) -> Option<Arc<dyn VfsNode>> {
        None
    }

    fn truncate(&self, _size: u64) -> KernelResult<()> {
        Err(KernelError::InvalidArgument {
            name: "fd",
            value: "pipes cannot be truncated",
        })
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.inner.writers.fetch_sub(1, Ordering::Release);
        self.inner.read_waiters.wake_all();
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn bytes_flow_reader_to_writer_in_order() {
        let (reader, writer) = pipe();
        assert_eq!(writer.write(0, b"hello").unwrap(), 5);
        let mut buf = [0u8; 3];
        assert_eq!(reader.read(0, &mut buf).unwrap(), 3);
        assert_eq!(&buf, b"hel");
        let mut rest = [0u8; 8];
        assert_eq!(reader.read(0, &mut rest).unwrap(), 2);
        assert_eq!(&rest[..2], b"lo");
    }

    #[test]
    fn read_after_writer_close_is_eof() {
        let (reader, writer) = pipe();
        writer.write(0, b"x").unwrap();
        drop(writer);
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(0, &mut buf).unwrap(), 1);
        assert_eq!(reader.read(0, &mut buf).unwrap(), 0);
    }

    #[test]
    fn write_without_reader_is_an_error() {
        let (reader, writer) = pipe();
        drop(reader);
        assert!(writer.write(0, b"x").is_err());
    }

    #[test]
    fn wrong_direction_is_rejected() {
        let (reader, writer) = pipe();
        assert!(reader.write(0, b"x").is_err());
        let mut buf = [0u8; 1];
        assert!(writer.read(0, &mut buf).is_err());
    }
}

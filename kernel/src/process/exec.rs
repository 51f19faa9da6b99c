//! `execve` and the user-image loader.
//!
//! Images use the flat `castor-exec` format: a small header naming the
//! entry point followed by a table of load segments. The loader builds a
//! complete address space and stack before the current one is swapped, so
//! every failure up to the swap leaves the caller untouched; past the
//! swap, failure is fatal to the task.
//!
//! ## Image format (little-endian)
//!
//! ```text
//! offset size  field
//! 0      4     magic "CAST"
//! 4      2     version (1)
//! 6      2     segment count (<= 16)
//! 8      8     entry point (user virtual address)
//! 16     40*n  segments: file_offset, vaddr, file_size, mem_size, flags
//!              (flags bit 0 = writable, bit 1 = executable)
//! ```

extern crate alloc;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::arch::paging::{USER_SPACE_END, USER_SPACE_START, USER_STACK_TOP};
use crate::error::{KernelError, KernelResult};
use crate::fs::VfsNode;
use crate::mm::address_space::{AddressSpace, FrameSource};
use crate::mm::user::copy_to_user;
use crate::mm::{KernelFrameSource, PteFlags, VirtualAddress, PAGE_SIZE};
use crate::sched::{self};

/// Image magic.
pub const IMAGE_MAGIC: [u8; 4] = *b"CAST";

/// Current image format version.
pub const IMAGE_VERSION: u16 = 1;

const MAX_SEGMENTS: usize = 16;
const HEADER_SIZE: usize = 16;
const SEGMENT_SIZE: usize = 40;

/// Pages mapped eagerly under the stack top; the rest of the 1 MiB window
/// is demand-grown by the fault handler.
const USER_STACK_PAGES: usize = 8;
const USER_STACK_WINDOW: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub file_offset: u64,
    pub vaddr: u64,
    pub file_size: u64,
    pub mem_size: u64,
    pub writable: bool,
    pub executable: bool,
}

#[derive(Debug, Clone)]
pub struct Image {
    pub entry: u64,
    pub segments: Vec<Segment>,
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

/// Parse and validate an image header.
pub fn parse_image(bytes: &[u8]) -> KernelResult<Image> {
    if bytes.len() < HEADER_SIZE || bytes[..4] != IMAGE_MAGIC {
        return Err(KernelError::InvalidArgument {
            name: "image",
            value: "bad magic",
        });
    }
    if read_u16(bytes, 4) != IMAGE_VERSION {
        return Err(KernelError::InvalidArgument {
            name: "image",
            value: "unsupported version",
        });
    }
    let count = read_u16(bytes, 6) as usize;
    if count == 0 || count > MAX_SEGMENTS {
        return Err(KernelError::InvalidArgument {
            name: "image",
            value: "segment count out of range",
        });
    }
    if bytes.len() < HEADER_SIZE + count * SEGMENT_SIZE {
        return Err(KernelError::InvalidArgument {
            name: "image",
            value: "truncated segment table",
        });
    }

    let entry = read_u64(bytes, 8);
    let mut segments = Vec::with_capacity(count);
    for index in 0..count {
        let base = HEADER_SIZE + index * SEGMENT_SIZE;
        let flags = read_u64(bytes, base + 32);
        let segment = Segment {
            file_offset: read_u64(bytes, base),
            vaddr: read_u64(bytes, base + 8),
            file_size: read_u64(bytes, base + 16),
            mem_size: read_u64(bytes, base + 24),
            writable: flags & 1 != 0,
            executable: flags & 2 != 0,
        };

        if segment.vaddr % PAGE_SIZE as u64 != 0 {
            return Err(KernelError::Misaligned {
                addr: segment.vaddr as usize,
                align: PAGE_SIZE,
            });
        }
        if segment.file_size > segment.mem_size {
            return Err(KernelError::InvalidArgument {
                name: "image",
                value: "file size exceeds memory size",
            });
        }
        let end = segment
            .vaddr
            .checked_add(segment.mem_size)
            .ok_or(KernelError::InvalidAddress {
                addr: segment.vaddr as usize,
            })?;
        if segment.vaddr < USER_SPACE_START || end > USER_SPACE_END {
            return Err(KernelError::InvalidAddress {
                addr: segment.vaddr as usize,
            });
        }
        segments.push(segment);
    }

    if entry < USER_SPACE_START || entry >= USER_SPACE_END {
        return Err(KernelError::InvalidAddress {
            addr: entry as usize,
        });
    }

    Ok(Image { entry, segments })
}

/// Map every segment of `image` into `space`, copying file bytes and
/// zeroing the bss tail.
pub fn load_image(
    space: &mut AddressSpace,
    source: &mut dyn FrameSource,
    image: &Image,
    file: &[u8],
) -> KernelResult<()> {
    for segment in &image.segments {
        let mut flags = PteFlags::PRESENT | PteFlags::USER;
        if segment.writable {
            flags |= PteFlags::WRITE;
        }
        if segment.executable {
            flags |= PteFlags::EXEC;
        }

        let page_count = (segment.mem_size as usize).div_ceil(PAGE_SIZE);
        for page_index in 0..page_count {
            let frame = source.alloc_frame()?;
            let page_offset = (page_index * PAGE_SIZE) as u64;

            // Bytes of this page that come from the file.
            if page_offset < segment.file_size {
                let copy_len =
                    ((segment.file_size - page_offset) as usize).min(PAGE_SIZE);
                let src_start = (segment.file_offset + page_offset) as usize;
                let src_end = src_start + copy_len;
                if src_end > file.len() {
                    source.free_frame(frame);
                    return Err(KernelError::InvalidArgument {
                        name: "image",
                        value: "segment reaches past end of file",
                    });
                }
                // SAFETY: the frame was just allocated (zeroed) and the
                // source's view covers it.
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        file[src_start..src_end].as_ptr(),
                        source.phys_to_virt(frame),
                        copy_len,
                    );
                }
            }

            space.map(
                source,
                VirtualAddress::new(segment.vaddr + page_offset),
                frame,
                flags,
            )?;
        }
    }
    Ok(())
}

/// Map the initial user stack and lay down arguments and environment.
///
/// Layout, top down: the string bytes, then the NULL-terminated `envp`
/// pointer array, the NULL-terminated `argv` array, and `argc` at the
/// final stack pointer.
pub fn build_user_stack(
    space: &mut AddressSpace,
    source: &mut dyn FrameSource,
    argv: &[String],
    envp: &[String],
) -> KernelResult<u64> {
    let stack_flags = PteFlags::PRESENT | PteFlags::WRITE | PteFlags::USER;
    for page_index in 1..=USER_STACK_PAGES {
        let frame = source.alloc_frame()?;
        let vaddr = USER_STACK_TOP - (page_index * PAGE_SIZE) as u64;
        space.map(source, VirtualAddress::new(vaddr), frame, stack_flags)?;
    }
    space.set_stack_region(
        VirtualAddress::new(USER_STACK_TOP),
        VirtualAddress::new(USER_STACK_TOP - USER_STACK_WINDOW),
    );

    let mut sp = USER_STACK_TOP;

    // String bytes, recording each string's user address.
    let mut env_ptrs = Vec::with_capacity(envp.len());
    for env in envp {
        env_ptrs.push(push_string(space, source, &mut sp, env)?);
    }
    let mut arg_ptrs = Vec::with_capacity(argv.len());
    for arg in argv {
        arg_ptrs.push(push_string(space, source, &mut sp, arg)?);
    }

    let word = core::mem::size_of::<usize>() as u64;
    sp &= !(word - 1);

    // Pointer arrays, NULL terminated, envp above argv.
    push_word(space, source, &mut sp, 0)?;
    for &ptr in env_ptrs.iter().rev() {
        push_word(space, source, &mut sp, ptr)?;
    }
    push_word(space, source, &mut sp, 0)?;
    for &ptr in arg_ptrs.iter().rev() {
        push_word(space, source, &mut sp, ptr)?;
    }
    push_word(space, source, &mut sp, argv.len() as u64)?;

    Ok(sp)
}

fn push_string(
    space: &AddressSpace,
    source: &dyn FrameSource,
    sp: &mut u64,
    s: &str,
) -> KernelResult<u64> {
    let len = s.len() as u64 + 1;
    *sp -= len;
    copy_to_user(space, source, *sp, s.as_bytes())?;
    copy_to_user(space, source, *sp + len - 1, &[0])?;
    Ok(*sp)
}

fn push_word(
    space: &AddressSpace,
    source: &dyn FrameSource,
    sp: &mut u64,
    value: u64,
) -> KernelResult<()> {
    let word = core::mem::size_of::<usize>();
    *sp -= word as u64;
    let bytes = value.to_le_bytes();
    copy_to_user(space, source, *sp, &bytes[..word])
}

fn read_whole_file(node: &Arc<dyn VfsNode>) -> KernelResult<Vec<u8>> {
    let size = node.stat().size as usize;
    let mut bytes = alloc::vec![0u8; size];
    let mut read = 0;
    while read < size {
        let n = node.read(read as u64, &mut bytes[read..])?;
        if n == 0 {
            break;
        }
        read += n;
    }
    bytes.truncate(read);
    Ok(bytes)
}

/// Replace the current task's image.
///
/// Everything is staged in a fresh address space first; on any error
/// before the swap the old image is untouched and the syscall fails
/// cleanly. After the swap the old space is torn down and the trap frame
/// is rewritten to enter the new image, so the "return" from this syscall
/// lands at the new entry point.
pub fn execve(
    path: &str,
    argv: &[String],
    envp: &[String],
    frame: &mut crate::arch::port::interrupts::InterruptFrame,
) -> KernelResult<usize> {
    let node = crate::fs::resolve(path).ok_or(KernelError::NotFound {
        resource: "executable",
    })?;
    let file = read_whole_file(&node)?;
    let image = parse_image(&file)?;

    let mut source = KernelFrameSource;
    let mut new_space = AddressSpace::new_user(&mut source)?;
    if let Err(err) = load_image(&mut new_space, &mut source, &image, &file) {
        new_space.destroy(&mut source);
        return Err(err);
    }
    let user_sp = match build_user_stack(&mut new_space, &mut source, argv, envp) {
        Ok(sp) => sp,
        Err(err) => {
            new_space.destroy(&mut source);
            return Err(err);
        }
    };

    // Point of no return: swap the address spaces.
    let new_root = new_space.root();
    let brk_start = image
        .segments
        .iter()
        .map(|s| VirtualAddress::new(s.vaddr + s.mem_size).align_up().as_u64())
        .max()
        .unwrap_or(USER_SPACE_START);
    let old_space = sched::with_current_mut(|task| {
        let old = task.address_space.replace(new_space);
        task.name = String::from(path);
        task.user_entry = image.entry;
        task.user_stack = user_sp;
        task.brk_start = brk_start;
        task.brk = brk_start;
        task.mmap_next = crate::sched::task::MMAP_REGION_BASE.max(brk_start);
        task.open_files.retain_across_exec();
        old
    })
    .ok_or(KernelError::NotInitialized {
        subsystem: "scheduler",
    })?;

    crate::arch::paging::activate(new_root);

    if let Some(mut old) = old_space {
        old.destroy(&mut source);
    }

    frame.set_user_return(image.entry, user_sp);
    log::debug!("execve {} entry {:#x} sp {:#x}", path, image.entry, user_sp);
    Ok(0)
}

/// Create a brand-new user task from an image on the VFS (boot-time init
/// spawning).
pub fn spawn_from_path(path: &str) -> KernelResult<crate::sched::Pid> {
    let node = crate::fs::resolve(path).ok_or(KernelError::NotFound {
        resource: "executable",
    })?;
    let file = read_whole_file(&node)?;
    let image = parse_image(&file)?;

    let mut source = KernelFrameSource;
    let mut space = AddressSpace::new_user(&mut source)?;
    if let Err(err) = load_image(&mut space, &mut source, &image, &file) {
        space.destroy(&mut source);
        return Err(err);
    }
    let argv = [String::from(path)];
    let user_sp = match build_user_stack(&mut space, &mut source, &argv, &[]) {
        Ok(sp) => sp,
        Err(err) => {
            space.destroy(&mut source);
            return Err(err);
        }
    };

    let brk_start = image
        .segments
        .iter()
        .map(|s| VirtualAddress::new(s.vaddr + s.mem_size).align_up().as_u64())
        .max()
        .unwrap_or(USER_SPACE_START);

    let pid = sched::spawn(|pid| {
        crate::sched::Task::new_user(
            pid,
            crate::sched::Pid(0),
            String::from(path),
            space,
            image.entry,
            user_sp,
        )
    });
    sched::with_task_mut(pid, |task| {
        task.brk_start = brk_start;
        task.brk = brk_start;
        task.mmap_next = crate::sched::task::MMAP_REGION_BASE.max(brk_start);
    });
    log::info!("user task {} spawned from {}", pid, path);
    Ok(pid)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    extern crate std;

    use super::*;
    use crate::mm::test_util::MockFrameSource;

    /// Assemble a minimal valid image: one page of code at 0x40_0000.
    fn sample_image(entry: u64) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&IMAGE_MAGIC);
        bytes.extend_from_slice(&IMAGE_VERSION.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&entry.to_le_bytes());
        // segment: file_offset, vaddr, file_size, mem_size, flags
        bytes.extend_from_slice(&(HEADER_SIZE as u64 + SEGMENT_SIZE as u64).to_le_bytes());
        bytes.extend_from_slice(&0x40_0000u64.to_le_bytes());
        bytes.extend_from_slice(&16u64.to_le_bytes());
        bytes.extend_from_slice(&(PAGE_SIZE as u64 * 2).to_le_bytes());
        bytes.extend_from_slice(&(1u64 | 2).to_le_bytes());
        // payload
        bytes.extend_from_slice(&[0xAA; 16]);
        bytes
    }

    #[test]
    fn parse_accepts_well_formed_image() {
        let image = parse_image(&sample_image(0x40_0000)).unwrap();
        assert_eq!(image.entry, 0x40_0000);
        assert_eq!(image.segments.len(), 1);
        let seg = image.segments[0];
        assert!(seg.writable);
        assert!(seg.executable);
        assert_eq!(seg.file_size, 16);
    }

    #[test]
    fn parse_rejects_bad_magic_and_kernel_addresses() {
        let mut bad_magic = sample_image(0x40_0000);
        bad_magic[0] = b'X';
        assert!(parse_image(&bad_magic).is_err());

        // Entry outside the user window.
        assert!(parse_image(&sample_image(USER_SPACE_END + 0x1000)).is_err());
    }

    #[test]
    fn load_copies_file_bytes_and_zeroes_bss() {
        let file = sample_image(0x40_0000);
        let image = parse_image(&file).unwrap();

        let mut src = MockFrameSource::new();
        let mut space = AddressSpace::new(&mut src, None).unwrap();
        load_image(&mut space, &mut src, &image, &file).unwrap();

        // First 16 bytes come from the file.
        let phys = space
            .translate(&src, VirtualAddress::new(0x40_0000))
            .unwrap();
        // SAFETY: translated frame is live mock memory.
        unsafe {
            assert_eq!(*src.phys_to_virt(phys), 0xAA);
            assert_eq!(*src.phys_to_virt(phys).add(15), 0xAA);
            // bss tail is zero.
            assert_eq!(*src.phys_to_virt(phys).add(16), 0);
        }
        // Second page mapped too (mem_size spans two pages).
        assert!(space
            .translate(&src, VirtualAddress::new(0x40_1000))
            .is_some());
    }

    #[test]
    fn stack_carries_argc_argv_and_env() {
        let mut src = MockFrameSource::new();
        let mut space = AddressSpace::new(&mut src, None).unwrap();

        let argv = [String::from("/bin/true"), String::from("-v")];
        let envp = [String::from("TERM=castor")];
        let sp = build_user_stack(&mut space, &mut src, &argv, &envp).unwrap();

        assert_eq!(sp % core::mem::size_of::<usize>() as u64, 0);
        assert!(sp < USER_STACK_TOP);

        // argc at the stack pointer.
        let word = core::mem::size_of::<usize>();
        let mut buf = alloc::vec![0u8; word];
        crate::mm::user::copy_from_user(&space, &src, sp, &mut buf).unwrap();
        let mut raw = [0u8; 8];
        raw[..word].copy_from_slice(&buf);
        assert_eq!(u64::from_le_bytes(raw), 2);

        // argv[0] points at the path string.
        crate::mm::user::copy_from_user(&space, &src, sp + word as u64, &mut buf).unwrap();
        raw = [0u8; 8];
        raw[..word].copy_from_slice(&buf);
        let argv0 = u64::from_le_bytes(raw);
        let mut s = alloc::vec![0u8; 9];
        crate::mm::user::copy_from_user(&space, &src, argv0, &mut s).unwrap();
        assert_eq!(&s, b"/bin/true");
    }

    #[test]
    fn stack_growth_window_is_configured() {
        let mut src = MockFrameSource::new();
        let mut space = AddressSpace::new(&mut src, None).unwrap();
        build_user_stack(&mut space, &mut src, &[], &[]).unwrap();

        // A fault one page below the eagerly mapped region resolves by
        // demand growth.
        let below = USER_STACK_TOP - (USER_STACK_PAGES as u64 + 1) * PAGE_SIZE as u64;
        let fault = crate::mm::PageFault {
            addr: VirtualAddress::new(below),
            is_present: false,
            is_write: true,
            is_user: true,
            is_exec: false,
            is_reserved: false,
            raw: 0b110,
        };
        assert_eq!(
            space.handle_fault(&mut src, &fault),
            crate::mm::FaultDecision::Resolved
        );
    }
}

//! Memory-group system calls: `brk`, anonymous `mmap`, `munmap`.
//!
//! The sixth `mmap` argument (the file offset) arrives through the
//! declared sixth argument register like every other argument; file-backed
//! mappings are not part of the core and report `NotImplemented`.

use crate::error::{KernelError, KernelResult};
use crate::mm::address_space::FrameSource;
use crate::mm::{PteFlags, VirtualAddress, PAGE_SIZE};
use crate::sched;

use super::with_user_space;

const PROT_WRITE: u32 = 2;
const PROT_EXEC: u32 = 4;

const MAP_ANONYMOUS: u32 = 0x20;

fn prot_to_flags(prot: u32) -> PteFlags {
    let mut flags = PteFlags::PRESENT | PteFlags::USER;
    if prot & PROT_WRITE != 0 {
        flags |= PteFlags::WRITE;
    }
    if prot & PROT_EXEC != 0 {
        flags |= PteFlags::EXEC;
    }
    flags
}

pub fn sys_brk(new_brk: u64) -> KernelResult<usize> {
    let (brk_start, old_brk) = sched::with_current_mut(|task| (task.brk_start, task.brk))
        .ok_or(KernelError::NotInitialized {
            subsystem: "scheduler",
        })?;

    if new_brk == 0 {
        return Ok(old_brk as usize);
    }
    if new_brk < brk_start {
        return Err(KernelError::InvalidArgument {
            name: "brk",
            value: "below the initial break",
        });
    }

    let old_end = VirtualAddress::new(old_brk).align_up().as_u64();
    let new_end = VirtualAddress::new(new_brk).align_up().as_u64();

    with_user_space(|space, source| {
        if new_end > old_end {
            let mut page = old_end;
            while page < new_end {
                let frame = source.alloc_frame()?;
                if let Err(err) = space.map(
                    source,
                    VirtualAddress::new(page),
                    frame,
                    PteFlags::PRESENT | PteFlags::WRITE | PteFlags::USER,
                ) {
                    source.free_frame(frame);
                    return Err(err);
                }
                page += PAGE_SIZE as u64;
            }
        } else {
            let mut page = new_end;
            while page < old_end {
                if let Some(frame) = space.unmap(source, VirtualAddress::new(page)) {
                    source.free_frame(frame);
                }
                page += PAGE_SIZE as u64;
            }
        }
        Ok(())
    })?;

    sched::with_current_mut(|task| task.brk = new_brk);
    Ok(new_brk as usize)
}

pub fn sys_mmap(
    addr: u64,
    len: usize,
    prot: u32,
    flags: u32,
    fd: i32,
    _offset: u64,
) -> KernelResult<usize> {
    if len == 0 {
        return Err(KernelError::InvalidArgument {
            name: "len",
            value: "must be > 0",
        });
    }
    if flags & MAP_ANONYMOUS == 0 || fd >= 0 {
        return Err(KernelError::NotImplemented {
            feature: "file-backed mmap",
        });
    }

    let pages = len.div_ceil(PAGE_SIZE);
    let base = if addr != 0 {
        if addr % PAGE_SIZE as u64 != 0 {
            return Err(KernelError::Misaligned {
                addr: addr as usize,
                align: PAGE_SIZE,
            });
        }
        addr
    } else {
        sched::with_current_mut(|task| {
            let base = task.mmap_next;
            task.mmap_next = base + (pages * PAGE_SIZE) as u64;
            base
        })
        .ok_or(KernelError::NotInitialized {
            subsystem: "scheduler",
        })?
    };

    let pte_flags = prot_to_flags(prot);
    with_user_space(|space, source| {
        for index in 0..pages {
            let frame = source.alloc_frame()?;
            let vaddr = VirtualAddress::new(base + (index * PAGE_SIZE) as u64);
            if let Err(err) = space.map(source, vaddr, frame, pte_flags) {
                source.free_frame(frame);
                // Roll the partial mapping back.
                for undo in 0..index {
                    let vaddr = VirtualAddress::new(base + (undo * PAGE_SIZE) as u64);
                    if let Some(frame) = space.unmap(source, vaddr) {
                        source.free_frame(frame);
                    }
                }
                return Err(err);
            }
        }
        Ok(())
    })?;

    Ok(base as usize)
}

pub fn sys_munmap(addr: u64, len: usize) -> KernelResult<usize> {
    if addr % PAGE_SIZE as u64 != 0 {
        return Err(KernelError::Misaligned {
            addr: addr as usize,
            align: PAGE_SIZE,
        });
    }
    if len == 0 {
        return Err(KernelError::InvalidArgument {
            name: "len",
            value: "must be > 0",
        });
    }

    let pages = len.div_ceil(PAGE_SIZE);
    with_user_space(|space, source| {
        for index in 0..pages {
            let vaddr = VirtualAddress::new(addr + (index * PAGE_SIZE) as u64);
            if let Some(frame) = space.unmap(source, vaddr) {
                source.free_frame(frame);
            }
        }
        Ok(())
    })?;
    Ok(0)
}

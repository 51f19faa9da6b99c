//! User-memory validation and guarded copies.
//!
//! Every system call that accepts a user pointer funnels it through here:
//! range checks against the user window, per-page mapping and protection
//! checks, bounded string copy-in, and page-wise buffer transfer. Kernel
//! code never dereferences a raw user pointer directly; transfers go
//! through the translated physical view.

extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;

use crate::arch::paging::{USER_SPACE_END, USER_SPACE_START};
use crate::error::{KernelError, KernelResult};

use super::address_space::{AddressSpace, FrameSource};
use super::{PteFlags, VirtualAddress, PAGE_SIZE};

/// Longest path (and generally, bounded string) accepted from user mode.
pub const PATH_MAX: usize = 256;

/// Access the kernel needs to a user buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// Check that `[addr, addr + len)` lies inside the user window.
pub fn validate_user_range(addr: u64, len: usize) -> KernelResult<()> {
    let end = addr.checked_add(len as u64).ok_or(KernelError::InvalidAddress {
        addr: addr as usize,
    })?;
    if addr < USER_SPACE_START || end > USER_SPACE_END {
        return Err(KernelError::InvalidAddress {
            addr: addr as usize,
        });
    }
    Ok(())
}

/// Check that every page of `[addr, addr + len)` is mapped user-accessible
/// at the required protection.
///
/// COW pages count as writable: the first kernel write will resolve them
/// through the normal fault path.
pub fn check_user_buffer(
    space: &AddressSpace,
    src: &dyn FrameSource,
    addr: u64,
    len: usize,
    access: Access,
) -> KernelResult<()> {
    validate_user_range(addr, len)?;
    if len == 0 {
        return Ok(());
    }

    let first = VirtualAddress::new(addr).align_down().as_u64();
    let last = VirtualAddress::new(addr + len as u64 - 1).align_down().as_u64();

    let mut page = first;
    loop {
        let flags = space
            .probe(src, VirtualAddress::new(page))
            .ok_or(KernelError::UnmappedMemory { addr: page as usize })?;
        if !flags.contains(PteFlags::USER) {
            return Err(KernelError::PermissionDenied {
                operation: "user access to kernel page",
            });
        }
        if access == Access::Write
            && !flags.contains(PteFlags::WRITE)
            && !flags.contains(PteFlags::COW)
        {
            return Err(KernelError::PermissionDenied {
                operation: "write to read-only page",
            });
        }
        if page == last {
            break;
        }
        page += PAGE_SIZE as u64;
    }
    Ok(())
}

/// Copy bytes out of user memory into a kernel buffer.
pub fn copy_from_user(
    space: &AddressSpace,
    src: &dyn FrameSource,
    addr: u64,
    buf: &mut [u8],
) -> KernelResult<()> {
    check_user_buffer(space, src, addr, buf.len(), Access::Read)?;

    let mut copied = 0;
    while copied < buf.len() {
        let virt = VirtualAddress::new(addr + copied as u64);
        let phys = space.translate(src, virt).ok_or(KernelError::UnmappedMemory {
            addr: virt.as_usize(),
        })?;
        let in_page = PAGE_SIZE - virt.page_offset() as usize;
        let chunk = in_page.min(buf.len() - copied);
        // SAFETY: translate proved the page is mapped; the source's view
        // covers the whole frame and `chunk` stays inside it.
        unsafe {
            core::ptr::copy_nonoverlapping(
                src.phys_to_virt(phys),
                buf[copied..].as_mut_ptr(),
                chunk,
            );
        }
        copied += chunk;
    }
    Ok(())
}

/// Copy bytes from a kernel buffer into user memory.
pub fn copy_to_user(
    space: &AddressSpace,
    src: &dyn FrameSource,
    addr: u64,
    buf: &[u8],
) -> KernelResult<()> {
    check_user_buffer(space, src, addr, buf.len(), Access::Write)?;

    let mut copied = 0;
    while copied < buf.len() {
        let virt = VirtualAddress::new(addr + copied as u64);
        let phys = space.translate(src, virt).ok_or(KernelError::UnmappedMemory {
            addr: virt.as_usize(),
        })?;
        let in_page = PAGE_SIZE - virt.page_offset() as usize;
        let chunk = in_page.min(buf.len() - copied);
        // SAFETY: as in copy_from_user; check_user_buffer proved write
        // permission for every page.
        unsafe {
            core::ptr::copy_nonoverlapping(
                buf[copied..].as_ptr(),
                src.phys_to_virt(phys),
                chunk,
            );
        }
        copied += chunk;
    }
    Ok(())
}

/// Copy a NUL-terminated string (at most [`PATH_MAX`] bytes including the
/// terminator) out of user memory.
pub fn copy_string_from_user(
    space: &AddressSpace,
    src: &dyn FrameSource,
    addr: u64,
) -> KernelResult<String> {
    validate_user_range(addr, 1)?;

    let mut bytes = Vec::new();
    for offset in 0..PATH_MAX as u64 {
        let virt = VirtualAddress::new(addr + offset);
        if virt.as_u64() >= USER_SPACE_END {
            return Err(KernelError::InvalidAddress {
                addr: virt.as_usize(),
            });
        }
        let flags = space
            .probe(src, virt.align_down())
            .ok_or(KernelError::UnmappedMemory {
                addr: virt.as_usize(),
            })?;
        if !flags.contains(PteFlags::USER) {
            return Err(KernelError::PermissionDenied {
                operation: "user access to kernel page",
            });
        }
        let phys = space.translate(src, virt).ok_or(KernelError::UnmappedMemory {
            addr: virt.as_usize(),
        })?;
        // SAFETY: translate proved the byte's page is mapped.
        let byte = unsafe { *src.phys_to_virt(phys) };
        if byte == 0 {
            return String::from_utf8(bytes).map_err(|_| KernelError::InvalidArgument {
                name: "path",
                value: "not valid UTF-8",
            });
        }
        bytes.push(byte);
    }
    Err(KernelError::InvalidArgument {
        name: "path",
        value: "unterminated string",
    })
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    extern crate std;

    use super::*;
    use crate::mm::test_util::MockFrameSource;
    use crate::mm::PhysicalAddress;

    const USER_RW: PteFlags = PteFlags::PRESENT
        .union(PteFlags::WRITE)
        .union(PteFlags::USER);

    fn space_with_page(
        src: &mut MockFrameSource,
        virt: u64,
    ) -> (AddressSpace, PhysicalAddress) {
        let mut space = AddressSpace::new(src, None).unwrap();
        let frame = src.alloc_frame().unwrap();
        space
            .map(src, VirtualAddress::new(virt), frame, USER_RW)
            .unwrap();
        (space, frame)
    }

    #[test]
    fn rejects_addresses_outside_user_window() {
        assert!(validate_user_range(0xFFFF_FFFF_FFFF_0000, 16).is_err());
        assert!(validate_user_range(USER_SPACE_END - 8, 16).is_err());
        assert!(validate_user_range(USER_SPACE_START, 16).is_ok());
    }

    #[test]
    fn buffer_check_requires_mapping() {
        let mut src = MockFrameSource::new();
        let (space, _) = space_with_page(&mut src, 0x1_0000);

        assert!(check_user_buffer(&space, &src, 0x1_0000, 64, Access::Read).is_ok());
        assert!(matches!(
            check_user_buffer(&space, &src, 0x9_0000, 64, Access::Read),
            Err(KernelError::UnmappedMemory { .. })
        ));
    }

    #[test]
    fn buffer_check_spans_pages() {
        let mut src = MockFrameSource::new();
        let (mut space, _) = space_with_page(&mut src, 0x1_0000);

        // Second page missing: a straddling buffer must be rejected.
        assert!(check_user_buffer(&space, &src, 0x1_0FF0, 64, Access::Write).is_err());

        let frame = src.alloc_frame().unwrap();
        space
            .map(&mut src, VirtualAddress::new(0x1_1000), frame, USER_RW)
            .unwrap();
        assert!(check_user_buffer(&space, &src, 0x1_0FF0, 64, Access::Write).is_ok());
    }

    #[test]
    fn write_check_rejects_read_only_pages() {
        let mut src = MockFrameSource::new();
        let mut space = AddressSpace::new(&mut src, None).unwrap();
        let frame = src.alloc_frame().unwrap();
        space
            .map(
                &mut src,
                VirtualAddress::new(0x2_0000),
                frame,
                PteFlags::PRESENT | PteFlags::USER,
            )
            .unwrap();

        assert!(check_user_buffer(&space, &src, 0x2_0000, 8, Access::Read).is_ok());
        assert!(matches!(
            check_user_buffer(&space, &src, 0x2_0000, 8, Access::Write),
            Err(KernelError::PermissionDenied { .. })
        ));
    }

    #[test]
    fn copy_round_trip_through_user_page() {
        let mut src = MockFrameSource::new();
        let (space, _) = space_with_page(&mut src, 0x3_0000);

        copy_to_user(&space, &src, 0x3_0040, b"castor").unwrap();
        let mut back = [0u8; 6];
        copy_from_user(&space, &src, 0x3_0040, &mut back).unwrap();
        assert_eq!(&back, b"castor");
    }

    #[test]
    fn string_copy_stops_at_nul_and_enforces_bound() {
        let mut src = MockFrameSource::new();
        let (space, frame) = space_with_page(&mut src, 0x4_0000);

        // SAFETY: frame is live mock memory.
        unsafe {
            let page = src.phys_to_virt(frame);
            core::ptr::copy_nonoverlapping(b"/bin/true\0".as_ptr(), page, 10);
        }
        assert_eq!(
            copy_string_from_user(&space, &src, 0x4_0000).unwrap(),
            "/bin/true"
        );

        // Unterminated page: fill with non-zero bytes and expect rejection.
        // SAFETY: frame is live mock memory.
        unsafe {
            core::ptr::write_bytes(src.phys_to_virt(frame), b'a', PAGE_SIZE);
        }
        // The string runs past PATH_MAX without a terminator (the page and
        // the mapping end long after the bound).
        assert!(copy_string_from_user(&space, &src, 0x4_0000).is_err());
    }
}

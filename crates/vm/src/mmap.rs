//! `mmap(2)` and `munmap(2)` on top of [`VmMap`].

use paging::{PAGE_SIZE, PageNumber, USER_SPACE_END, USER_SPACE_START, VirtualAddress, pages_for};

use crate::{
    VmError,
    config::{MMAP_DIRECTION, USER_MEM_SIZE},
    mmobj::ObjectSource,
    vmarea::{MapFlags, Protection},
    vmmap::VmMap,
};

/// True if `[addr, addr + len)` is page-aligned at the start and lies in user space.
fn is_user_range(addr: usize, len: usize) -> bool {
    addr % PAGE_SIZE == 0
        && addr >= USER_SPACE_START
        && addr
            .checked_add(len)
            .is_some_and(|end| end <= USER_SPACE_END)
}

/// Maps `len` bytes and returns the address of the mapping.
///
/// `addr` is only used with [`MapFlags::FIXED`]. Unless [`MapFlags::ANON`] is given
/// the contents come from `file`, starting at byte `off`.
pub fn do_mmap(
    map: &mut VmMap,
    addr: usize,
    len: usize,
    prot: Protection,
    flags: MapFlags,
    file: Option<&dyn ObjectSource>,
    off: usize,
) -> Result<VirtualAddress, VmError> {
    if !flags.has_valid_sharing() {
        return Err(VmError::InvalidArgument);
    }
    if len == 0 || len > USER_MEM_SIZE || off % PAGE_SIZE != 0 {
        return Err(VmError::InvalidArgument);
    }

    let lopage = if flags.contains(MapFlags::FIXED) {
        if !is_user_range(addr, len) {
            return Err(VmError::InvalidArgument);
        }
        Some(PageNumber::containing(addr))
    } else {
        None
    };

    let source = if flags.contains(MapFlags::ANON) {
        None
    } else {
        let file = file.ok_or(VmError::BadFile)?;
        if flags.contains(MapFlags::SHARED)
            && prot.contains(Protection::WRITE)
            && !file.allows_shared_write()
        {
            return Err(VmError::AccessDenied);
        }
        Some(file)
    };

    let npages = pages_for(len);
    let start = map
        .map(source, lopage, npages, prot, flags, off, MMAP_DIRECTION)?
        .start();

    // Drop translations left over from whatever was mapped here before.
    map.address_space_mut().unmap_range(start..start + npages);
    Ok(start.start())
}

/// Unmaps every page overlapping `[addr, addr + len)`.
pub fn do_munmap(map: &mut VmMap, addr: usize, len: usize) -> Result<(), VmError> {
    if len == 0 || len > USER_MEM_SIZE || !is_user_range(addr, len) {
        return Err(VmError::InvalidArgument);
    }

    map.remove(PageNumber::containing(addr), pages_for(len));
    map.address_space().tlb().invalidate_all();
    Ok(())
}

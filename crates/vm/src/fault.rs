//! User page-fault resolution.

use core::{fmt, ops::BitOr};

use paging::{PageFlags, VirtualAddress};

use crate::{vmarea::Protection, vmmap::VmMap};

/// Exit status of a process killed by a bad memory access.
pub const EFAULT: i32 = 14;

/// What the faulting access was trying to do.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FaultCause(u8);

impl FaultCause {
    pub const READ: Self = Self(1 << 0);
    pub const WRITE: Self = Self(1 << 1);
    pub const EXEC: Self = Self(1 << 2);

    /// Decodes the error code pushed by an x86 page fault.
    pub const fn from_x86_error_code(code: u64) -> Self {
        const CAUSED_BY_WRITE: u64 = 1 << 1;
        const INSTRUCTION_FETCH: u64 = 1 << 4;

        if code & CAUSED_BY_WRITE != 0 {
            Self::WRITE
        } else if code & INSTRUCTION_FETCH != 0 {
            Self::EXEC
        } else {
            Self::READ
        }
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for FaultCause {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for FaultCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |bit: Self, c: char| if self.contains(bit) { c } else { '-' };
        write!(
            f,
            "FaultCause({}{}{})",
            flag(Self::READ, 'r'),
            flag(Self::WRITE, 'w'),
            flag(Self::EXEC, 'x')
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The translation was installed; retry the access.
    Resolved,
    /// No area covers the address.
    Unmapped,
    /// The area does not permit the access.
    PermissionDenied,
    /// The page could not be produced.
    Unresolvable,
}

/// The process a fault is delivered to.
pub trait FaultingProcess {
    fn vmmap_mut(&mut self) -> &mut VmMap;

    /// Ends the process with exit status `status`. Never called for resolved faults.
    fn terminate(&mut self, status: i32);
}

/// Handles a user page fault at `vaddr`.
///
/// On success the page is resident, mapped into the process's page tables and the
/// stale TLB entry is gone. Any other outcome terminates the process with
/// [`EFAULT`] and leaves its page tables untouched.
pub fn handle_pagefault<P>(
    process: &mut P,
    vaddr: VirtualAddress,
    cause: FaultCause,
) -> FaultOutcome
where
    P: FaultingProcess + ?Sized,
{
    match resolve(process.vmmap_mut(), vaddr, cause) {
        Ok(()) => FaultOutcome::Resolved,
        Err(outcome) => {
            log::warn!("fault: {:?} at {} ({:?}); terminating", outcome, vaddr, cause);
            process.terminate(EFAULT);
            outcome
        }
    }
}

fn resolve(map: &mut VmMap, vaddr: VirtualAddress, cause: FaultCause) -> Result<(), FaultOutcome> {
    let page = vaddr.page_number();
    let area = map.lookup(page).ok_or(FaultOutcome::Unmapped)?;

    let prot = area.prot();
    let write = cause.contains(FaultCause::WRITE);
    let exec = cause.contains(FaultCause::EXEC);
    if (write && !prot.contains(Protection::WRITE))
        || (!write && !exec && !prot.contains(Protection::READ))
    {
        return Err(FaultOutcome::PermissionDenied);
    }

    let object = area.object().ok_or(FaultOutcome::Unresolvable)?.clone();
    let pagenum = area.object_page(page);
    let frame = object.lookup_page(pagenum, write).map_err(|err| {
        log::warn!("fault: {} page {} unavailable: {}", object.id(), pagenum, err);
        FaultOutcome::Unresolvable
    })?;

    if write {
        frame.pin();
        object.mark_dirty(&frame);
        frame.unpin();
    }

    let mut flags = PageFlags::empty();
    flags.set_present(true);
    flags.set_user(true);
    flags.set_writable(write);
    flags.set_no_execute(!prot.contains(Protection::EXEC));

    log::trace!("fault: {} -> {} page {} ({:?})", vaddr, object.id(), pagenum, cause);
    map.address_space_mut()
        .install_mapping(page.start(), frame.address(), flags)
        .map_err(|err| {
            log::error!("fault: cannot map {}: {:?}", vaddr, err);
            FaultOutcome::Unresolvable
        })
}

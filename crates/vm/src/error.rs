use core::fmt;

use paging::MapError;

/// Errors reported by the virtual memory system.
///
/// Each variant maps onto the errno a system call would return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// A request was malformed (bad length, flags, alignment or range).
    InvalidArgument,
    /// No physical memory for a page frame or page table.
    OutOfMemory,
    /// No gap in the address space is large enough.
    NoFreeRange,
    /// The address is not covered by any mapping.
    BadAddress,
    /// A file mapping was requested without a file.
    BadFile,
    /// The file does not permit the requested access.
    AccessDenied,
    /// The backing store failed to read or write a page.
    Io,
}

impl VmError {
    /// Negative errno for this error.
    pub const fn errno(self) -> i32 {
        match self {
            Self::InvalidArgument => -22,
            Self::OutOfMemory | Self::NoFreeRange => -12,
            Self::BadAddress => -14,
            Self::BadFile => -9,
            Self::AccessDenied => -13,
            Self::Io => -5,
        }
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::InvalidArgument => "invalid argument",
            Self::OutOfMemory => "out of memory",
            Self::NoFreeRange => "no free virtual range",
            Self::BadAddress => "bad address",
            Self::BadFile => "bad file descriptor",
            Self::AccessDenied => "permission denied",
            Self::Io => "i/o error",
        };
        f.write_str(msg)
    }
}

impl From<MapError> for VmError {
    fn from(err: MapError) -> Self {
        match err {
            MapError::OutOfMemory => Self::OutOfMemory,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_values() {
        assert_eq!(VmError::InvalidArgument.errno(), -22);
        assert_eq!(VmError::NoFreeRange.errno(), VmError::OutOfMemory.errno());
        assert_eq!(VmError::BadAddress.errno(), -14);
        assert_eq!(VmError::AccessDenied.errno(), -13);
    }

    #[test]
    fn page_table_exhaustion_is_out_of_memory() {
        assert_eq!(VmError::from(MapError::OutOfMemory), VmError::OutOfMemory);
    }
}

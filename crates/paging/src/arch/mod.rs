//! Architecture-specific paging primitives.
//!
//! Every architecture exports the same surface: page geometry constants, the user
//! address-space window, page-table index extraction, address validation, the
//! `PageFlags`/`PageEntry`/`PageTable` triple and the two TLB shootdown primitives.

// NOTE: The x86_64 module is compiled during tests too so rust-analyzer keeps seeing it.
#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(all(target_arch = "x86_64", not(test), not(feature = "software-emulation")))]
pub use x86_64::*;

#[cfg(any(test, feature = "software-emulation"))]
mod software;
#[cfg(any(test, feature = "software-emulation"))]
pub use software::*;

//! A macOS kernel-cache patch and kext-injection engine for an
//! OpenCore-class UEFI bootloader: prelinked kernel and kernel-collection
//! linking, mkext archive handling, a cacheless Extensions overlay, and
//! the shared Mach-O linker and byte-pattern patcher that back all three
//! cache formats.
//!
//! Format-specific modules own their container logic, a shared Mach-O
//! view and patcher do the low-level byte work, and every fallible path
//! returns the crate-wide [`error::KextError`].

pub mod cacheless;
pub mod dependency;
pub mod error;
pub mod ident;
pub mod kxld_state;
pub mod macho;
pub mod mkext;
pub mod patcher;
pub mod plist_ext;
pub mod prelinked;
pub mod quirks;
pub mod storage;
pub mod version;

pub use error::{KextError, Result};

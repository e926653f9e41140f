//! Built-in quirk table: a process-wide, immutable catalogue mapping a
//! quirk name to the kext it
//! targets and the generic patch it applies. Unlike a caller-supplied
//! [`crate::patcher::GenericPatch`], quirks ship with this crate and are
//! selected by name from a boot-time configuration list.

use crate::patcher::GenericPatch;
use std::sync::OnceLock;

/// One entry in the quirk catalogue.
pub struct QuirkEntry {
    pub name: &'static str,
    pub target_identifier: &'static str,
    pub build: fn() -> GenericPatch,
}

fn patch_apfs_trim_timeout() -> GenericPatch {
    // Masks out a single immediate operand inside a bounds check; the
    // surrounding instruction bytes are left alone via `mask`.
    GenericPatch {
        find: Some(vec![0x3D, 0x00, 0x00, 0x00, 0x00]),
        mask: Some(vec![0xFF, 0x00, 0x00, 0x00, 0x00]),
        replace: vec![0x3D, 0xFF, 0xFF, 0xFF, 0xFF],
        replace_mask: Some(vec![0xFF, 0xFF, 0xFF, 0xFF, 0xFF]),
        count: 1,
        skip: 0,
        base_symbol: None,
        limit: None,
    }
}

fn patch_disable_io_mapper_check() -> GenericPatch {
    GenericPatch {
        find: Some(vec![0x84, 0xC0, 0x74]),
        mask: None,
        replace: vec![0x84, 0xC0, 0xEB],
        replace_mask: None,
        count: 0,
        skip: 0,
        base_symbol: None,
        limit: None,
    }
}

fn patch_force_secure_boot_pass() -> GenericPatch {
    GenericPatch {
        find: Some(vec![0x85, 0xC0, 0x0F, 0x84]),
        mask: None,
        replace: vec![0x85, 0xC0, 0x0F, 0x85],
        replace_mask: None,
        count: 1,
        skip: 0,
        base_symbol: Some("_csr_check".into()),
        limit: None,
    }
}

const QUIRKS: &[QuirkEntry] = &[
    QuirkEntry {
        name: "ExtendApfsTrimTimeout",
        target_identifier: "com.apple.filesystems.apfs",
        build: patch_apfs_trim_timeout,
    },
    QuirkEntry {
        name: "DisableIoMapperMappingCheck",
        target_identifier: "com.apple.iokit.IOPCIFamily",
        build: patch_disable_io_mapper_check,
    },
    QuirkEntry {
        name: "ForceSecureBootScheme",
        target_identifier: "com.apple.driver.AppleSecureBoot",
        build: patch_force_secure_boot_pass,
    },
];

static TABLE: OnceLock<&'static [QuirkEntry]> = OnceLock::new();

/// The immutable, process-wide quirk table. Populated once on first access.
pub fn quirk_table() -> &'static [QuirkEntry] {
    TABLE.get_or_init(|| QUIRKS)
}

pub fn find_quirk(name: &str) -> Option<&'static QuirkEntry> {
    quirk_table().iter().find(|q| q.name == name)
}

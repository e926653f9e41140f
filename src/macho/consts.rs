//! Mach-O / kernel-cache wire constants. Values are taken from
//! `usr/include/mach-o/loader.h`, `usr/include/mach-o/fixup-chains.h`, and
//! `original_source/Library/OcAppleKernelLib`.

/// Mach-O page size; every structural edit must leave container offsets
/// aligned to this boundary.
pub const MACHO_PAGE_SIZE: u64 = 0x1000;

/// Load bias baked into every `DYLD_CHAINED_PTR_64_KERNEL_CACHE_REBASE`
/// target: `target = *(reloc site) - KERNEL_FIXUP_OFFSET`.
pub const KERNEL_FIXUP_OFFSET: u64 = 0x0010_0000;

/// Relocation displacements with absolute value at or above this are
/// rejected as out of range for a 32-bit PC-relative field.
pub const X86_64_RIP_RELATIVE_LIMIT: i64 = 0x8000_0000;

/// `mov eax, KMOD_RETURN_FAILURE; ret` opcode bytes written by `BlockKext`.
pub const KMOD_RETURN_FAILURE: u8 = 0xAF;
pub const BLOCK_KEXT_STUB: [u8; 6] = [0xB8, KMOD_RETURN_FAILURE, 0x00, 0x00, 0x00, 0xC3];

/// Bounded dependency fan-out per kext record.
pub const MAX_KEXT_DEPENDENCIES: usize = 16;

/// Fixed per-bundle padding added to a reserved `__PRELINK_INFO` expansion.
pub const PLIST_EXPANSION_SIZE: usize = 512;

// Mach-O magic numbers.
pub const MH_MAGIC_64: u32 = 0xfeed_facf;
pub const MH_MAGIC_32: u32 = 0xfeed_face;

// File types (`mach_header::filetype`).
pub const MH_EXECUTE: u32 = 0x2;
pub const MH_KEXT_BUNDLE: u32 = 0xb;
pub const MH_FILESET: u32 = 0xc;

// Load command opcodes.
pub const LC_REQ_DYLD: u32 = 0x8000_0000;
pub const LC_SEGMENT_64: u32 = 0x19;
pub const LC_SYMTAB: u32 = 0x2;
pub const LC_DYSYMTAB: u32 = 0xb;
pub const LC_UUID: u32 = 0x1b;
pub const LC_CODE_SIGNATURE: u32 = 0x1d;
pub const LC_DYLD_INFO: u32 = 0x22;
pub const LC_DYLD_INFO_ONLY: u32 = LC_DYLD_INFO | LC_REQ_DYLD;
pub const LC_FUNCTION_STARTS: u32 = 0x26;
pub const LC_DATA_IN_CODE: u32 = 0x29;
pub const LC_DYLIB_CODE_SIGN_DRS: u32 = 0x2b;
/// `LC_FILESET_ENTRY`, introduced for kernel-collection images.
pub const LC_FILESET_ENTRY: u32 = 0x35 | LC_REQ_DYLD;

/// Load commands stripped from the output.
pub const STRIPPED_LOAD_COMMANDS: [u32; 6] = [
    LC_CODE_SIGNATURE,
    LC_DYLD_INFO,
    LC_DYLD_INFO_ONLY,
    LC_FUNCTION_STARTS,
    LC_DATA_IN_CODE,
    LC_DYLIB_CODE_SIGN_DRS,
];

// VM protection bits.
pub const VM_PROT_NONE: i32 = 0x0;
pub const VM_PROT_READ: i32 = 0x1;
pub const VM_PROT_WRITE: i32 = 0x2;
pub const VM_PROT_EXECUTE: i32 = 0x4;
pub const VM_PROT_ALL_RWX: i32 = VM_PROT_READ | VM_PROT_WRITE | VM_PROT_EXECUTE;

/// Segment name, as a fixed 16-byte array, padded with NULs.
pub fn segname(name: &str) -> [u8; 16] {
    let mut out = [0u8; 16];
    let bytes = name.as_bytes();
    let len = bytes.len().min(16);
    out[..len].copy_from_slice(&bytes[..len]);
    out
}

/// Read a fixed 16-byte segment/section name back into a `String`, trimming
/// the trailing NUL padding.
pub fn name_from_fixed(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

pub const SEG_PRELINK_TEXT: &str = "__PRELINK_TEXT";
pub const SEG_PRELINK_INFO: &str = "__PRELINK_INFO";
pub const SEG_PRELINK_STATE: &str = "__PRELINK_STATE";
pub const SEG_LINKEDIT: &str = "__LINKEDIT";
pub const SEG_TEXT: &str = "__TEXT";
pub const SEG_KREMLIN_START: &str = "__KREMLIN_START";
pub const SECT_KREMLIN_START: &str = "__kremlin_start";
pub const SECT_PRELINK_INFO: &str = "__info";
pub const SECT_PRELINK_TEXT: &str = "__text";

pub const KEY_PRELINK_INFO_DICT: &str = "_PrelinkInfoDictionary";
pub const KEY_PRELINK_BUNDLE_PATH: &str = "_PrelinkBundlePath";
pub const KEY_PRELINK_EXEC_RELATIVE_PATH: &str = "_PrelinkExecutableRelativePath";
pub const KEY_PRELINK_EXEC_SOURCE_ADDR: &str = "_PrelinkExecutableSourceAddr";
pub const KEY_PRELINK_EXEC_LOAD_ADDR: &str = "_PrelinkExecutableLoadAddr";
pub const KEY_PRELINK_EXEC_SIZE: &str = "_PrelinkExecutableSize";
pub const KEY_PRELINK_KMOD_INFO: &str = "_PrelinkKmodInfo";
pub const KEY_PRELINK_LINK_STATE: &str = "_PrelinkLinkState";
pub const KEY_BUNDLE_IDENTIFIER: &str = "CFBundleIdentifier";
pub const KEY_BUNDLE_EXECUTABLE: &str = "CFBundleExecutable";
pub const KEY_BUNDLE_LIBRARIES: &str = "OSBundleLibraries";
pub const KEY_BUNDLE_REQUIRED: &str = "OSBundleRequired";

pub const VALUE_REQUIRED_ROOT: &str = "Root";
pub const VALUE_REQUIRED_SAFE_BOOT: &str = "Safe Boot";

/// Align `value` up to the next multiple of `align` (`align` must be a
/// power of two).
#[inline]
pub const fn align_up(value: u64, align: u64) -> u64 {
    (value + (align - 1)) & !(align - 1)
}

/// Align `value` down to the previous multiple of `align`.
#[inline]
pub const fn align_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_page() {
        assert_eq!(align_up(1, MACHO_PAGE_SIZE), MACHO_PAGE_SIZE);
        assert_eq!(align_up(MACHO_PAGE_SIZE, MACHO_PAGE_SIZE), MACHO_PAGE_SIZE);
        assert_eq!(align_up(MACHO_PAGE_SIZE + 1, MACHO_PAGE_SIZE), 2 * MACHO_PAGE_SIZE);
    }

    #[test]
    fn segname_roundtrip() {
        let raw = segname("__TEXT");
        assert_eq!(name_from_fixed(&raw), "__TEXT");
    }
}

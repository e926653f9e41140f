//! Inject a kext into a v2 mkext archive, patch an existing
//! bundle's binary, and check the recomputed length and Adler32.

#[path = "support.rs"]
mod support;

use oc_kernel_lib::macho::consts::KEY_BUNDLE_IDENTIFIER;
use oc_kernel_lib::mkext::{MkextContext, MkextCoreHeader, MkextV2FileEntry, MkextV2Header, MKEXT_MAGIC, MKEXT_SIGNATURE, MKEXT_VERSION_V2};
use oc_kernel_lib::patcher::GenericPatch;
use scroll::{Pread, Pwrite, BE};

const FIND: &[u8] = &[0x55, 0x48, 0x89, 0xE5];
const REPLACE: &[u8] = &[0xC3, 0x90, 0x90, 0x90];
const FIND_OFFSET: usize = 512;

fn minimal_v2_mkext() -> Vec<u8> {
    let header_size = core::mem::size_of::<MkextV2Header>();
    let entry_size = core::mem::size_of::<MkextV2FileEntry>();

    // AppleRTC's "binary": a minimal valid Mach-O kext (so `Patcher::
    // InitFromBuffer`'s `__TEXT` lookup succeeds) with the find pattern
    // planted well past the header and load commands.
    let mut binary = support::build_minimal_kext(0);
    binary[FIND_OFFSET..FIND_OFFSET + 4].copy_from_slice(FIND);

    let entry_offset = header_size;
    let plist_offset = entry_offset + entry_size + binary.len();

    let mut dict = plist::Dictionary::new();
    dict.insert(KEY_BUNDLE_IDENTIFIER.to_owned(), plist::Value::String("com.apple.driver.AppleRTC".into()));
    dict.insert("_MKEXTExecutable".to_owned(), plist::Value::String(format!("{entry_offset:x}")));

    let mut info_plist = plist::Dictionary::new();
    info_plist.insert("_MKEXTInfoDictionaries".to_owned(), plist::Value::Array(vec![plist::Value::Dictionary(dict)]));
    let plist_bytes = oc_kernel_lib::plist_ext::serialize(&plist::Value::Dictionary(info_plist)).unwrap();

    let total_len = plist_offset + plist_bytes.len();
    let mut data = vec![0u8; total_len];

    let entry = MkextV2FileEntry {
        compressed_size: 0,
        full_size: binary.len() as u32,
    };
    data.pwrite_with(entry, entry_offset, BE).unwrap();
    data[entry_offset + entry_size..entry_offset + entry_size + binary.len()].copy_from_slice(&binary);
    data[plist_offset..plist_offset + plist_bytes.len()].copy_from_slice(&plist_bytes);

    let header = MkextV2Header {
        core: MkextCoreHeader {
            magic: MKEXT_MAGIC,
            signature: MKEXT_SIGNATURE,
            length: total_len as u32,
            adler32: 0,
            version: MKEXT_VERSION_V2,
            cpu_type: 7,
            cpu_subtype: 3,
            num_kexts: 1,
        },
        cpu_checksum: 0,
        plist_offset: plist_offset as u32,
        plist_compressed_size: 0,
        plist_full_size: plist_bytes.len() as u32,
    };
    data.pwrite_with(header, 0, BE).unwrap();
    data
}

#[test]
fn patches_existing_bundle_and_recomputes_checksum() {
    let data = minimal_v2_mkext();
    let len = data.len();
    let mut ctx = MkextContext::init(data, len * 4).unwrap();

    let patch = GenericPatch {
        find: Some(FIND.to_vec()),
        mask: None,
        replace: REPLACE.to_vec(),
        replace_mask: None,
        count: 0,
        skip: 0,
        base_symbol: None,
        limit: None,
    };
    ctx.apply_patch("com.apple.driver.AppleRTC", &patch).unwrap();

    let out = ctx.inject_complete().unwrap();
    let header: MkextCoreHeader = out.pread_with(0, BE).unwrap();
    assert_eq!(header.length as usize, out.len());

    let checksum_start = core::mem::offset_of!(MkextCoreHeader, version);
    let expected = adler32::adler32(std::io::Cursor::new(&out[checksum_start..out.len()])).unwrap();
    assert_eq!(header.adler32, expected);

    let header_size = core::mem::size_of::<MkextV2Header>();
    let entry_size = core::mem::size_of::<MkextV2FileEntry>();
    let patched_start = header_size + entry_size + FIND_OFFSET;
    assert_eq!(&out[patched_start..patched_start + REPLACE.len()], REPLACE);
}

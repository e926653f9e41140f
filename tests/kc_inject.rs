//! Inject kexts into a kernel collection and check that a
//! fileset-entry command is emitted and the container grows.

#[path = "support.rs"]
mod support;

use oc_kernel_lib::macho::consts::{
    align_up, KEY_BUNDLE_IDENTIFIER, KEY_PRELINK_INFO_DICT, MACHO_PAGE_SIZE, MH_FILESET, SEG_LINKEDIT, SEG_PRELINK_INFO,
};
use oc_kernel_lib::macho::{self};
use oc_kernel_lib::plist_ext;
use oc_kernel_lib::prelinked::PrelinkedContext;

fn minimal_kernel_collection() -> Vec<u8> {
    let plist = plist::Value::Dictionary({
        let mut d = plist::Dictionary::new();
        d.insert(KEY_PRELINK_INFO_DICT.to_owned(), plist::Value::Array(vec![]));
        d
    });
    let mut plist_bytes = plist_ext::serialize(&plist).unwrap();
    plist_bytes.resize(align_up(plist_bytes.len() as u64, MACHO_PAGE_SIZE) as usize, 0);

    let text_size = 0x4000u64;
    let info_fileoff = text_size;
    let region_fileoff = info_fileoff + plist_bytes.len() as u64;
    let region_size = 0x2000u64;
    let linkedit_fileoff = region_fileoff + region_size;
    let linkedit_size = 0x2000u64;

    let mut data = support::build_minimal_macho(
        MH_FILESET,
        &[
            ("__TEXT", 0, text_size, 0, text_size),
            (SEG_PRELINK_INFO, text_size, plist_bytes.len() as u64, info_fileoff, plist_bytes.len() as u64),
            ("__REGION0", info_fileoff + plist_bytes.len() as u64, region_size, region_fileoff, region_size),
            (SEG_LINKEDIT, linkedit_fileoff, linkedit_size, linkedit_fileoff, linkedit_size),
        ],
    );
    data.resize((linkedit_fileoff + linkedit_size) as usize, 0);
    data[info_fileoff as usize..info_fileoff as usize + plist_bytes.len()].copy_from_slice(&plist_bytes);
    data
}

#[test]
fn injecting_two_kexts_adds_fileset_entries() {
    let data = minimal_kernel_collection();
    let len = data.len();
    let mut ctx = PrelinkedContext::init(data, len + 256 * 1024).unwrap();
    assert!(ctx.is_kc);

    ctx.inject_prepare().unwrap();
    assert!(ctx.chained_starts.is_some(), "InjectPrepare must allocate a chained-fixups table");

    for (n, identifier) in ["com.example.first", "com.example.second"].iter().enumerate() {
        let mut info = plist::Dictionary::new();
        info.insert(KEY_BUNDLE_IDENTIFIER.to_owned(), plist::Value::String((*identifier).into()));

        let executable = support::build_minimal_kext(0x4000);
        ctx.reserve_kext_size(4096, Some(&executable)).unwrap();
        ctx.inject_kext(identifier, &format!("Kext{n}.kext"), &mut info, None, Some(&executable))
            .unwrap();
    }

    assert_eq!(ctx.records.len(), 3, "kernel pseudo-record plus two injected kexts");

    let out = ctx.inject_complete().unwrap();
    assert!(out.len() > len, "container must grow to hold the injected kexts and fileset commands");

    let reparsed = macho::parse(&out).unwrap();
    assert!(
        reparsed.fileset_entries.len() >= 2,
        "expected at least two LC_FILESET_ENTRY commands after injection, got {}",
        reparsed.fileset_entries.len()
    );

    let vmaddrs: Vec<u64> = reparsed.fileset_entries.iter().map(|(_, cmd, _)| cmd.vmaddr).collect();
    let mut sorted = vmaddrs.clone();
    sorted.sort_unstable();
    assert_eq!(vmaddrs, sorted, "fileset-entry vaddrs should be recorded in increasing order");
    assert_eq!(vmaddrs.iter().collect::<std::collections::BTreeSet<_>>().len(), vmaddrs.len(), "vaddrs must be distinct");
}

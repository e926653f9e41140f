//! The cacheless overlay's synthesised directory
//! listing and its `Info.plist`/binary interception of a real bundle.

#[path = "support.rs"]
mod support;

use oc_kernel_lib::cacheless::vfs::VirtualNode;
use oc_kernel_lib::cacheless::CachelessContext;
use oc_kernel_lib::macho::consts::{KEY_BUNDLE_IDENTIFIER, KEY_BUNDLE_REQUIRED};
use oc_kernel_lib::patcher::GenericPatch;
use oc_kernel_lib::storage::MemFs;
use oc_kernel_lib::version::DarwinVersion;

const EXTENSIONS_DIR: &str = "/System/Library/Extensions";

fn sample_plist(identifier: &str) -> plist::Dictionary {
    let mut dict = plist::Dictionary::new();
    dict.insert(KEY_BUNDLE_IDENTIFIER.to_owned(), plist::Value::String(identifier.to_owned()));
    dict
}

#[test]
fn overlay_adds_two_virtual_bundles_to_four_hundred_real_ones() {
    let mut fs = MemFs::new();
    for i in 0..400 {
        fs.add_dir(format!("{EXTENSIONS_DIR}/Builtin{i:04}.kext"));
    }

    let mut ctx = CachelessContext::init(fs, EXTENSIONS_DIR, DarwinVersion::new(20, 0, 0), false);
    ctx.add_kext(sample_plist("com.example.first"), None).unwrap();
    ctx.add_kext(sample_plist("com.example.second"), None).unwrap();

    let entries = ctx.overlay_extensions_dir().unwrap();
    assert_eq!(entries.len(), 402);
    assert!(entries.contains(&"Oc00000000.kext".to_owned()));
    assert!(entries.contains(&"Oc00000001.kext".to_owned()));

    let VirtualNode::File(bytes) = ctx.perform_inject("Oc00000000.kext/Contents/Info.plist").unwrap() else {
        panic!("expected a file node");
    };
    let roundtripped = oc_kernel_lib::plist_ext::parse(&bytes).unwrap().into_dictionary().unwrap();
    assert_eq!(
        roundtripped.get(KEY_BUNDLE_IDENTIFIER).and_then(|v| v.as_string()),
        Some("com.example.first")
    );
}

#[test]
fn patch_only_path_upgrades_required_and_patches_the_binary_on_open() {
    const FIND: &[u8] = &[0xDE, 0xAD, 0xBE, 0xEF];
    const REPLACE: &[u8] = &[0x90, 0x90, 0x90, 0x90];
    const IDENTIFIER: &str = "com.apple.iokit.IOUSBFamily";

    let mut plist_dict = plist::Dictionary::new();
    plist_dict.insert(KEY_BUNDLE_IDENTIFIER.to_owned(), plist::Value::String(IDENTIFIER.to_owned()));
    plist_dict.insert(KEY_BUNDLE_REQUIRED.to_owned(), plist::Value::String("Network-Root".to_owned()));
    plist_dict.insert(
        "CFBundleExecutable".to_owned(),
        plist::Value::String("IOUSBFamily".to_owned()),
    );
    let plist_bytes = oc_kernel_lib::plist_ext::serialize(&plist::Value::Dictionary(plist_dict)).unwrap();

    let mut binary = support::build_minimal_kext(0);
    const FIND_OFFSET: usize = 512;
    binary[FIND_OFFSET..FIND_OFFSET + 4].copy_from_slice(FIND);

    let bundle_dir = format!("{EXTENSIONS_DIR}/IOUSBFamily.kext");
    let mut fs = MemFs::new();
    fs.add_dir(&bundle_dir);
    fs.add_file(format!("{bundle_dir}/Contents/Info.plist"), plist_bytes.clone());
    fs.add_file(format!("{bundle_dir}/Contents/MacOS/IOUSBFamily"), binary.clone());

    let mut ctx = CachelessContext::init(fs, EXTENSIONS_DIR, DarwinVersion::new(20, 0, 0), false);
    ctx.add_patch(
        IDENTIFIER,
        GenericPatch {
            find: Some(FIND.to_vec()),
            mask: None,
            replace: REPLACE.to_vec(),
            replace_mask: None,
            count: 0,
            skip: 0,
            base_symbol: None,
            limit: None,
        },
    );

    let plist_path = format!("{bundle_dir}/Contents/Info.plist");
    let intercepted = ctx.hook_builtin(&plist_path, &plist_bytes).unwrap().expect("plist must be intercepted");
    let VirtualNode::File(rewritten_plist) = intercepted else {
        panic!("expected a file node");
    };
    let rewritten_dict = oc_kernel_lib::plist_ext::parse(&rewritten_plist).unwrap().into_dictionary().unwrap();
    assert_eq!(
        rewritten_dict.get(KEY_BUNDLE_REQUIRED).and_then(|v| v.as_string()),
        Some("Root"),
        "OSBundleRequired must be upgraded from Network-Root to Root"
    );

    let binary_path = format!("{bundle_dir}/Contents/MacOS/IOUSBFamily");
    let patched = ctx.hook_builtin(&binary_path, &binary).unwrap().expect("binary must be intercepted");
    let VirtualNode::File(patched_bytes) = patched else {
        panic!("expected a file node");
    };
    assert_eq!(&patched_bytes[FIND_OFFSET..FIND_OFFSET + 4], REPLACE);
}

//! `Block` a linked kext and check that exactly the 6
//! `mov eax, KMOD_RETURN_FAILURE; ret` bytes land at `kmod_info.StartAddr`,
//! with nothing else in the file touched.

#[path = "support.rs"]
mod support;

use oc_kernel_lib::macho::consts::BLOCK_KEXT_STUB;
use oc_kernel_lib::macho::linkedit::KmodInfo64;
use oc_kernel_lib::patcher::Patcher;
use scroll::{Pwrite, LE};

const KMOD_INFO_OFFSET: usize = 512;
const START_ADDR: u64 = 256;

fn kext_with_kmod_info() -> Vec<u8> {
    let mut data = support::build_minimal_kext(0);

    let info = KmodInfo64 {
        start_addr: START_ADDR,
        ..Default::default()
    };
    data.pwrite_with(info, KMOD_INFO_OFFSET, LE).unwrap();
    data
}

#[test]
fn block_overwrites_only_the_entry_point_stub() {
    let mut data = kext_with_kmod_info();
    let before = data.clone();

    let mut patcher = Patcher::init_from_buffer(&mut data).unwrap().with_kmod_info(KMOD_INFO_OFFSET);
    patcher.block_kext().unwrap();

    let start = START_ADDR as usize;
    assert_eq!(&data[start..start + BLOCK_KEXT_STUB.len()], &BLOCK_KEXT_STUB);

    // Nothing outside the 6 stub bytes changed.
    for i in 0..data.len() {
        if (start..start + BLOCK_KEXT_STUB.len()).contains(&i) {
            continue;
        }
        assert_eq!(data[i], before[i], "byte {i} changed outside the block stub");
    }
}

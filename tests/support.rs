//! Shared fixture builders for the integration tests. Each `tests/*.rs`
//! file pulls this in with `#[path = "support.rs"] mod support;`.

use oc_kernel_lib::macho::consts::{align_up, segname, LC_SYMTAB, MACHO_PAGE_SIZE, MH_KEXT_BUNDLE, MH_MAGIC_64};
use oc_kernel_lib::macho::raw::{MachHeader64, SegmentCommand64, SymtabCommand};
use scroll::{Pwrite, LE};

/// Build a minimal Mach-O: header plus a set of `LC_SEGMENT_64` commands,
/// each `(name, vmaddr, vmsize, fileoff, filesize)`. No sections, no
/// symtab — callers append those directly when a scenario needs them.
pub fn build_minimal_macho(file_type: u32, segments: &[(&str, u64, u64, u64, u64)]) -> Vec<u8> {
    const LC_SEGMENT_64: u32 = 0x19;

    let header_size = core::mem::size_of::<MachHeader64>();
    let cmd_size = core::mem::size_of::<SegmentCommand64>();
    let sizeofcmds = cmd_size * segments.len();
    let total_header = header_size + sizeofcmds;

    let max_end = segments
        .iter()
        .map(|(_, _, _, fileoff, filesize)| fileoff + filesize)
        .max()
        .unwrap_or(0)
        .max(total_header as u64);

    let mut data = vec![0u8; align_up(max_end, MACHO_PAGE_SIZE) as usize];

    let header = MachHeader64 {
        magic: MH_MAGIC_64,
        cpu_type: 0x0100_0007,
        cpu_subtype: 3,
        file_type,
        ncmds: segments.len() as u32,
        sizeofcmds: sizeofcmds as u32,
        flags: 0,
        reserved: 0,
    };
    data.pwrite_with(header, 0, LE).unwrap();

    let mut offset = header_size;
    for (name, vmaddr, vmsize, fileoff, filesize) in segments {
        let seg = SegmentCommand64 {
            cmd: LC_SEGMENT_64,
            cmd_size: cmd_size as u32,
            segname: segname(name),
            vmaddr: *vmaddr,
            vmsize: *vmsize,
            fileoff: *fileoff,
            filesize: *filesize,
            maxprot: 7,
            initprot: 7,
            nsects: 0,
            flags: 0,
        };
        data.pwrite_with(seg, offset, LE).unwrap();
        offset += cmd_size;
    }

    data
}

/// Build a minimal kext Mach-O: a single `__TEXT` segment spanning the
/// whole file plus an empty `LC_SYMTAB` (no symbols, no strings), enough
/// for `macho::linker::link_kext` to run end to end with nothing to link.
pub fn build_minimal_kext(vmsize: u64) -> Vec<u8> {
    let header_size = core::mem::size_of::<MachHeader64>();
    let seg_cmd_size = core::mem::size_of::<SegmentCommand64>();
    let symtab_cmd_size = core::mem::size_of::<SymtabCommand>();
    let sizeofcmds = seg_cmd_size + symtab_cmd_size;
    let total_header = header_size + sizeofcmds;

    let file_size = align_up(total_header.max(vmsize as usize) as u64, MACHO_PAGE_SIZE);
    let mut data = vec![0u8; file_size as usize];

    let header = MachHeader64 {
        magic: MH_MAGIC_64,
        cpu_type: 0x0100_0007,
        cpu_subtype: 3,
        file_type: MH_KEXT_BUNDLE,
        ncmds: 2,
        sizeofcmds: sizeofcmds as u32,
        flags: 0,
        reserved: 0,
    };
    data.pwrite_with(header, 0, LE).unwrap();

    let seg = SegmentCommand64 {
        cmd: 0x19, // LC_SEGMENT_64
        cmd_size: seg_cmd_size as u32,
        segname: segname("__TEXT"),
        vmaddr: 0,
        vmsize: file_size,
        fileoff: 0,
        filesize: file_size,
        maxprot: 7,
        initprot: 7,
        nsects: 0,
        flags: 0,
    };
    data.pwrite_with(seg, header_size, LE).unwrap();

    let symtab = SymtabCommand {
        cmd: LC_SYMTAB,
        cmd_size: symtab_cmd_size as u32,
        symoff: 0,
        nsyms: 0,
        stroff: 0,
        strsize: 0,
    };
    data.pwrite_with(symtab, header_size + seg_cmd_size, LE).unwrap();

    data
}

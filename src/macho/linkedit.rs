//! `__LINKEDIT` rebuild, segment finalisation, `kmod_info` fixup, and
//! load-command stripping.

use super::consts::*;
use super::raw::*;
use super::symbol::Symbol;
use super::zero_fill;
use crate::error::Result;
use scroll::{Pwrite, LE};

/// Layout of the structure's fields this crate actually touches. The real
/// `kmod_info_t` (`mach-o/kext/kmod_info_t` era, `xnu/libkern/libkern/kext.h`)
/// mixes fixed-size name/version strings with pointer-sized fields; we model
/// only what the linker writes and what `BlockKext` reads.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, scroll::Pread, scroll::Pwrite, scroll::SizeWith)]
pub struct KmodInfo64 {
    pub next: u64,
    pub info_version: i32,
    pub id: u32,
    pub name: [u8; 64],
    pub version: [u8; 64],
    pub reference_count: i32,
    pub reference_list: u64,
    pub address: u64,
    pub size: u64,
    pub hdr_size: u64,
    pub start_addr: u64,
    pub stop_addr: u64,
}

/// `_kmod_info`'s `HdrSize` is forced to zero on every link: a deliberate
/// XNU-compatibility hack — a nonzero value marks `__TEXT` read-only, which
/// then can't gain executable permission in `OSKext::setVMAttributes`.
/// Preserved bit-for-bit per the design note.
pub fn fixup_kmod_info(
    data: &mut [u8],
    kmod_file_offset: usize,
    load_address: u64,
    total_vmsize: u64,
) -> Result<()> {
    let mut info: KmodInfo64 = {
        use scroll::Pread;
        data.pread_with(kmod_file_offset, LE)?
    };
    info.address = load_address;
    info.hdr_size = 0;
    info.size = info.hdr_size + total_vmsize;
    data.pwrite_with(info, kmod_file_offset, LE)?;
    Ok(())
}

/// Segment finalisation: slide every segment's `vmaddr` by
/// `load_address`, realign each section's `addr` up to its alignment, and
/// assign protections by name (`__TEXT` → R+X, everything else → R+W).
/// Returns the new logical size (`max(fileoff + filesize)`).
pub fn finalize_segments(
    data: &mut [u8],
    parsed: &mut super::ParsedMachO,
    load_address: u64,
) -> Result<u64> {
    for seg in &mut parsed.segments {
        seg.command.vmaddr += load_address;
        seg.command.initprot = if seg.name() == SEG_TEXT {
            VM_PROT_READ | VM_PROT_EXECUTE
        } else {
            VM_PROT_READ | VM_PROT_WRITE
        };
        seg.command.maxprot = VM_PROT_ALL_RWX;
        data.pwrite_with(seg.command, seg.cmd_offset, LE)?;

        for (sec_offset, section) in &mut seg.sections {
            let align = 1u64 << section.align;
            section.addr = align_up(section.addr + load_address, align);
            data.pwrite_with(*section, *sec_offset, LE)?;
        }
    }

    Ok(parsed
        .segments
        .iter()
        .map(|s| s.command.fileoff + s.command.filesize)
        .max()
        .unwrap_or(0))
}

/// Compact `__LINKEDIT` rebuild: symbol table
/// (non-C++ prefix, C++ suffix), local relocations (converted-external
/// then original-local, `Extern=0`), string table (copied verbatim).
/// Returns the bytes to install at the segment's new location plus the
/// updated `SymtabCommand`/`DysymtabCommand` field values.
pub struct LinkeditLayout {
    pub bytes: Vec<u8>,
    pub symoff: u32,
    pub nsyms: u32,
    pub stroff: u32,
    pub strsize: u32,
    pub nlocalsym: u32,
    pub locreloff: u32,
    pub nlocrel: u32,
}

pub fn rebuild_linkedit(
    base_file_offset: u32,
    non_cxx: &[Symbol],
    cxx: &[Symbol],
    local_relocations: &[RelocationInfo],
    string_table: &[u8],
) -> Result<LinkeditLayout> {
    let mut out = Vec::new();
    let symoff = base_file_offset;

    // The string table is carried over verbatim, not re-minified; every
    // symbol is re-pointed at a freshly appended copy
    // of its name rather than trying to recover its original `n_strx`,
    // which is simpler and still produces a valid, if not minimal, table.
    let mut strings = Vec::new();
    let mut write_symbol = |out: &mut Vec<u8>, sym: &Symbol| {
        let strx = strings.len() as u32;
        strings.extend_from_slice(sym.name.as_bytes());
        strings.push(0);

        let nlist = Nlist64 {
            n_strx: strx,
            n_type: sym.n_type,
            n_sect: sym.n_sect,
            n_desc: sym.n_desc,
            n_value: sym.value,
        };
        let mut buf = [0u8; size_of::<Nlist64>()];
        buf.pwrite_with(nlist, 0, LE).unwrap();
        out.extend_from_slice(&buf);
    };

    for sym in non_cxx {
        write_symbol(&mut out, sym);
    }
    for sym in cxx {
        write_symbol(&mut out, sym);
    }

    let nsyms = (non_cxx.len() + cxx.len()) as u32;
    let reloff = symoff + out.len() as u32;

    for reloc in local_relocations {
        let mut buf = [0u8; size_of::<RelocationInfo>()];
        buf.pwrite_with(*reloc, 0, LE).unwrap();
        out.extend_from_slice(&buf);
    }
    let nlocrel = local_relocations.len() as u32;

    let stroff = reloff + (nlocrel as usize * size_of::<RelocationInfo>()) as u32;
    out.extend_from_slice(&strings);
    let _ = string_table; // original table superseded by the freshly appended copy above
    let strsize = strings.len() as u32;

    Ok(LinkeditLayout {
        bytes: out,
        symoff,
        nsyms,
        stroff,
        strsize,
        nlocalsym: nsyms,
        locreloff: reloff,
        nlocrel,
    })
}

/// Copy a rebuilt `__LINKEDIT` back over the segment, zero the tail, and
/// update the `SYMTAB`/`DYSYMTAB` commands with the new layout. All
/// dyld-info fields are zeroed (`ConvertRelocToFixup` means they are
/// unused, and legacy mode never populated them meaningfully either).
pub fn install_linkedit(
    data: &mut [u8],
    symtab_offset: usize,
    dysymtab_offset: Option<usize>,
    linkedit_file_offset: usize,
    linkedit_capacity: usize,
    layout: &LinkeditLayout,
) -> Result<()> {
    data[linkedit_file_offset..linkedit_file_offset + layout.bytes.len()]
        .copy_from_slice(&layout.bytes);
    zero_fill(
        data,
        linkedit_file_offset + layout.bytes.len(),
        linkedit_capacity - layout.bytes.len(),
    );

    let mut symtab: SymtabCommand = {
        use scroll::Pread;
        data.pread_with(symtab_offset, LE)?
    };
    symtab.symoff = layout.symoff;
    symtab.nsyms = layout.nsyms;
    symtab.stroff = layout.stroff;
    symtab.strsize = layout.strsize;
    data.pwrite_with(symtab, symtab_offset, LE)?;

    if let Some(dysym_offset) = dysymtab_offset {
        let mut dysymtab: DysymtabCommand = {
            use scroll::Pread;
            data.pread_with(dysym_offset, LE)?
        };
        // Clear dynamic linker information: XNU's loader never consults
        // these post-link, and the rebuilt table has no local/extdef/undef
        // partition left worth reporting.
        dysymtab.ilocalsym = 0;
        dysymtab.nlocalsym = 0;
        dysymtab.iextdefsym = 0;
        dysymtab.nextdefsym = 0;
        dysymtab.iundefsym = 0;
        dysymtab.nundefsym = 0;
        dysymtab.locreloff = layout.locreloff;
        dysymtab.nlocrel = layout.nlocrel;
        dysymtab.extreloff = 0;
        dysymtab.nextrel = 0;
        dysymtab.indirectsymoff = 0;
        dysymtab.nindirectsyms = 0;
        data.pwrite_with(dysymtab, dysym_offset, LE)?;
    }

    Ok(())
}

/// Load-command stripping: remove code-signature,
/// dyld-info(-only), function-starts, data-in-code, and
/// dylib-code-sign-drs commands, compacting the command table in place.
pub fn strip_load_commands(data: &mut Vec<u8>, parsed: &mut super::ParsedMachO) -> Result<()> {
    let header_size = size_of::<MachHeader64>();
    let mut new_area = Vec::with_capacity(parsed.header.sizeofcmds as usize);
    let mut kept = 0u32;

    for entry in &parsed.commands {
        if STRIPPED_LOAD_COMMANDS.contains(&entry.cmd) {
            continue;
        }
        new_area.extend_from_slice(&data[entry.offset..entry.offset + entry.cmd_size as usize]);
        kept += 1;
    }

    data[header_size..header_size + new_area.len()].copy_from_slice(&new_area);
    zero_fill(
        data,
        header_size + new_area.len(),
        parsed.header.sizeofcmds as usize - new_area.len(),
    );

    parsed.header.ncmds = kept;
    parsed.header.sizeofcmds = new_area.len() as u32;
    data.pwrite_with(parsed.header, 0, LE)?;

    *parsed = super::parse(data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macho::test_fixtures::build_minimal_macho;

    #[test]
    fn finalizes_segments_with_protections() {
        let mut data = build_minimal_macho(
            MH_EXECUTE,
            &[
                ("__TEXT", 0, 0x1000, 0, 0x1000),
                ("__DATA", 0x1000, 0x1000, 0x1000, 0x1000),
            ],
        );
        let mut parsed = super::super::parse(&data).unwrap();
        let new_size = finalize_segments(&mut data, &mut parsed, 0xFFFF_FF80_0000_0000).unwrap();
        let text = parsed.segment("__TEXT").unwrap();
        assert_eq!(text.command.vmaddr, 0xFFFF_FF80_0000_0000);
        assert_eq!(text.command.initprot, VM_PROT_READ | VM_PROT_EXECUTE);
        let data_seg = parsed.segment("__DATA").unwrap();
        assert_eq!(data_seg.command.initprot, VM_PROT_READ | VM_PROT_WRITE);
        assert_eq!(new_size, 0x2000);
    }
}

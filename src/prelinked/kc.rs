//! Kernel-collection (KC) variant of the prelinked context. A KC container
//! is a Mach-O fileset: per-kext
//! `LC_FILESET_ENTRY` commands, a `__REGION###` family of segments holding
//! the kexts themselves, a `__LINKEDIT` shared with the kernel, and dyld
//! chained fixups replacing classic relocations.

use super::PrelinkedContext;
use crate::error::{KextError, Result};
use crate::macho::consts::*;
use crate::macho::fixups::ChainedStarts;
use crate::macho::raw::{DyldChainedStartsInSegment, FilesetEntryCommandHeader, DYLD_CHAINED_PTR_64_KERNEL_CACHE, DYLD_CHAINED_PTR_START_NONE};
use crate::macho::{self, ParsedMachO};
use crate::plist_ext;
use scroll::{Pwrite, LE};

/// *GetKextSize*: given a virtual address inside the container, locate the
/// containing segment and return the distance up to (and including) the
/// end of `__LINKEDIT`.
pub fn get_kext_size(parsed: &ParsedMachO, source_addr: u64) -> Result<u64> {
    let containing = parsed
        .segments
        .iter()
        .find(|s| source_addr >= s.command.vmaddr && source_addr < s.command.vmaddr + s.command.vmsize)
        .ok_or(KextError::NotFound("no segment contains source address".into()))?;

    let linkedit = parsed
        .segment(SEG_LINKEDIT)
        .ok_or(KextError::LoadError("KC container has no shared __LINKEDIT".into()))?;

    Ok((linkedit.command.vmaddr + linkedit.command.vmsize) - containing.command.vmaddr)
}

/// *KextApplyFileDelta*: walk every load command, add `delta` to non-zero
/// `FileOffset` fields, and zero DYSYMTAB's local-relocation fields (KC
/// kexts are fixed by chained fixups, not DYSYMTAB).
pub fn kext_apply_file_delta(data: &mut [u8], parsed: &mut ParsedMachO, delta: i64) -> Result<()> {
    for seg in &mut parsed.segments {
        if seg.command.fileoff != 0 {
            seg.command.fileoff = (seg.command.fileoff as i64 + delta) as u64;
        }
        data.pwrite_with(seg.command, seg.cmd_offset, LE)?;

        for (offset, section) in &mut seg.sections {
            if section.offset != 0 {
                section.offset = (section.offset as i64 + delta) as u32;
            }
            if section.reloff != 0 {
                section.reloff = (section.reloff as i64 + delta) as u32;
            }
            data.pwrite_with(*section, *offset, LE)?;
        }
    }

    if let Some((offset, mut dysymtab)) = parsed.dysymtab {
        dysymtab.nlocrel = 0;
        dysymtab.locreloff = 0;
        data.pwrite_with(dysymtab, offset, LE)?;
        parsed.dysymtab = Some((offset, dysymtab));
    }

    if let Some((offset, mut symtab)) = parsed.symtab {
        if symtab.symoff != 0 {
            symtab.symoff = (symtab.symoff as i64 + delta) as u32;
        }
        if symtab.stroff != 0 {
            symtab.stroff = (symtab.stroff as i64 + delta) as u32;
        }
        data.pwrite_with(symtab, offset, LE)?;
        parsed.symtab = Some((offset, symtab));
    }

    Ok(())
}

/// *IndexFixups*: convert every local relocation in `machView` into a
/// chained-fixup entry, splicing it into `starts`' page chain.
pub fn index_fixups(
    data: &mut [u8],
    parsed: &ParsedMachO,
    region_file_offset: usize,
    starts: &mut ChainedStarts,
) -> Result<()> {
    for seg in &parsed.segments {
        for (_, section) in &seg.sections {
            if section.nreloc == 0 {
                continue;
            }
            let relocs = crate::macho::reloc::read_relocations(data, section.reloff, section.nreloc)?;
            for reloc in relocs {
                let site_offset = section.offset as usize + reloc.r_address as usize;
                let site_in_region = site_offset.checked_sub(region_file_offset).ok_or(KextError::LoadError(
                    "relocation site falls outside the kext's own region".into(),
                ))?;
                crate::macho::fixups::convert_reloc_to_fixup(data, region_file_offset, starts, site_in_region as u64)?;
            }
        }
    }
    Ok(())
}

/// KC variant of `InjectPrepare`: extend `__LINKEDIT` with a fresh
/// chained-fixups table and record where injected kexts will land.
pub fn inject_prepare_kc(ctx: &mut PrelinkedContext) -> Result<()> {
    let linkedit = ctx
        .parsed
        .segment(SEG_LINKEDIT)
        .cloned()
        .ok_or(KextError::LoadError("KC container has no __LINKEDIT".into()))?;

    let expansion_region_size = (ctx.capacity - ctx.data.len()).min(16 * MACHO_PAGE_SIZE as usize);
    let starts_file_offset = linkedit.command.fileoff as usize + linkedit.command.filesize as usize;
    let starts = ChainedStarts::new_empty(expansion_region_size as u64);

    let header = DyldChainedStartsInSegment {
        size: (core::mem::size_of::<DyldChainedStartsInSegment>() + starts.page_starts.len() * 2) as u32,
        page_size: MACHO_PAGE_SIZE as u16,
        pointer_format: DYLD_CHAINED_PTR_64_KERNEL_CACHE,
        segment_offset: 0,
        max_valid_pointer: 0,
        page_count: starts.page_count() as u16,
    };

    if starts_file_offset + header.size as usize > ctx.capacity {
        return Err(KextError::OutOfResources("no room to extend __LINKEDIT for chained fixups"));
    }

    ctx.data.pwrite_with(header, starts_file_offset, LE)?;
    let mut offset = starts_file_offset + core::mem::size_of::<DyldChainedStartsInSegment>();
    for page_start in &starts.page_starts {
        ctx.data.pwrite_with(*page_start, offset, LE)?;
        offset += 2;
    }

    if let Some(idx) = ctx.parsed.segments.iter().position(|s| s.name() == SEG_LINKEDIT) {
        let mut cmd = ctx.parsed.segments[idx].command;
        let new_size = (starts_file_offset + header.size as usize) as u64 - cmd.fileoff;
        cmd.filesize = new_size;
        cmd.vmsize = new_size;
        macho::write_at(&mut ctx.data, ctx.parsed.segments[idx].cmd_offset, cmd)?;
        ctx.parsed.segments[idx].command = cmd;
    }

    ctx.kexts_file_offset = align_up((starts_file_offset + header.size as usize) as u64, MACHO_PAGE_SIZE);
    ctx.kexts_vm_address = linkedit.command.vmaddr + (ctx.kexts_file_offset - linkedit.command.fileoff);
    ctx.chained_starts = Some(starts);

    Ok(())
}

/// KC variant of `InjectComplete`: size the chained-fixup table, then
/// rebuild the Mach-O header with fileset-entry commands for every
/// injected kext, the way `RebuildMachHeader` does.
pub fn inject_complete_kc(mut ctx: PrelinkedContext) -> Result<Vec<u8>> {
    if let Some(starts) = &ctx.chained_starts {
        log::debug!("chained-fixups table sized to {} pages", starts.page_count());
    }

    rebuild_mach_header(&mut ctx)?;

    let mut serialized = plist_ext::serialize(&ctx.info_plist)?;
    let padded_len = align_up(serialized.len() as u64, MACHO_PAGE_SIZE) as usize;
    serialized.resize(padded_len, 0);

    let info_offset = ctx.kexts_file_offset as usize;
    if info_offset + padded_len > ctx.capacity {
        return Err(KextError::OutOfResources("no room for __PRELINK_INFO"));
    }
    ctx.data[info_offset..info_offset + padded_len].copy_from_slice(&serialized);

    let new_size = (info_offset + padded_len).min(ctx.capacity);
    ctx.data.truncate(new_size.max(ctx.data.len().min(ctx.capacity)));
    Ok(ctx.data)
}

/// Write one `LC_FILESET_ENTRY` per injected kext and a single `SEGMENT_64`
/// spanning the injected kexts region; merge `__REGION###` segments first
/// if the command table doesn't fit.
fn rebuild_mach_header(ctx: &mut PrelinkedContext) -> Result<()> {
    let injected: Vec<(String, u64, u64)> = ctx
        .records
        .iter()
        .skip(1)
        .filter(|r| r.virtual_base != 0)
        .map(|r| (r.identifier.as_str().to_owned(), r.virtual_base, r.kmod_info_addr))
        .collect();

    for (identifier, vmaddr, fileoff) in &injected {
        let entry_cmd_size = align_up(
            (core::mem::size_of::<FilesetEntryCommandHeader>() + identifier.len() + 1) as u64,
            8,
        ) as u32;

        if (ctx.parsed.commands_end + entry_cmd_size as usize) as u64 > ctx.parsed.command_area_capacity() {
            macho::merge_segments_with_prefix(&mut ctx.data, &mut ctx.parsed, "__REGION")?;
        }
        if (ctx.parsed.commands_end + entry_cmd_size as usize) as u64 > ctx.parsed.command_area_capacity() {
            return Err(KextError::Unsupported(
                "fileset-entry commands do not fit even after merging __REGION segments",
            ));
        }

        let header = FilesetEntryCommandHeader {
            cmd: LC_FILESET_ENTRY,
            cmd_size: entry_cmd_size,
            vmaddr: *vmaddr,
            fileoff: *fileoff,
            entry_id_offset: core::mem::size_of::<FilesetEntryCommandHeader>() as u32,
            reserved: 0,
        };

        let mut bytes = vec![0u8; entry_cmd_size as usize];
        bytes.pwrite_with(header, 0, LE)?;
        let name_off = core::mem::size_of::<FilesetEntryCommandHeader>();
        bytes[name_off..name_off + identifier.len()].copy_from_slice(identifier.as_bytes());

        macho::append_load_command(&mut ctx.data, &mut ctx.parsed, &bytes)?;
    }

    Ok(())
}

/// Seed a freshly allocated chained-fixups page table to
/// `DYLD_CHAINED_PTR_START_NONE`, used before `IndexFixups` populates it.
pub fn seed_empty_chain(page_count: usize) -> Vec<u16> {
    vec![DYLD_CHAINED_PTR_START_NONE; page_count]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macho::test_fixtures::build_minimal_macho;

    #[test]
    fn get_kext_size_spans_to_linkedit_end() {
        let data = build_minimal_macho(
            MH_FILESET,
            &[
                ("__REGION0", 0x1000, 0x1000, 0, 0x1000),
                (SEG_LINKEDIT, 0x3000, 0x1000, 0x2000, 0x1000),
            ],
        );
        let parsed = macho::parse(&data).unwrap();
        let size = get_kext_size(&parsed, 0x1000).unwrap();
        assert_eq!(size, 0x3000);
    }
}

//! dyld chained fixups: conversion from legacy relocations (kernel
//! collection branch) and the `DyldChainedStartsInSegment` splicing
//! algorithm used by `InjectPrepare`/`InjectKext`.

use super::raw::{ChainedFixupWord, DYLD_CHAINED_PTR_START_NONE};
use crate::error::{KextError, Result};
use crate::macho::consts::{KERNEL_FIXUP_OFFSET, MACHO_PAGE_SIZE};
use scroll::{Pread, Pwrite, LE};

/// Pointer stride `next` deltas are measured in, for the 64-bit kernel
/// cache chained-fixup pointer format.
const POINTER_STRIDE: u64 = 8;

/// `page_starts[i]` for every page of a kexts region, seeded to
/// `DYLD_CHAINED_PTR_START_NONE` by `InjectPrepare` and populated by
/// `IndexFixups`/`InjectKext`.
#[derive(Debug, Clone)]
pub struct ChainedStarts {
    pub page_starts: Vec<u16>,
}

impl ChainedStarts {
    pub fn new_empty(region_size: u64) -> Self {
        let page_count = region_size.div_ceil(MACHO_PAGE_SIZE) as usize;
        Self {
            page_starts: vec![DYLD_CHAINED_PTR_START_NONE; page_count],
        }
    }

    pub fn page_count(&self) -> usize {
        self.page_starts.len()
    }
}

fn read_word(data: &[u8], file_offset: usize) -> Result<ChainedFixupWord> {
    Ok(data.pread_with(file_offset, LE)?)
}

fn write_word(data: &mut [u8], file_offset: usize, word: ChainedFixupWord) -> Result<()> {
    data.pwrite_with(word, file_offset, LE)?;
    Ok(())
}

/// Splice a new fixup at `site_offset_in_region` (an offset relative to the
/// start of the kexts region) into the page chain it falls on, writing the
/// packed fixup word at the site and updating whichever neighbouring
/// entry's `next` delta needs to change.
pub fn insert_fixup(
    data: &mut [u8],
    region_file_offset: usize,
    starts: &mut ChainedStarts,
    site_offset_in_region: u64,
    target: u64,
) -> Result<()> {
    let page = (site_offset_in_region / MACHO_PAGE_SIZE) as usize;
    if page >= starts.page_starts.len() {
        return Err(KextError::OutOfResources(
            "fixup site falls outside the reserved chained-fixups page table",
        ));
    }
    let in_page = (site_offset_in_region % MACHO_PAGE_SIZE) as u16;
    let page_base_file = region_file_offset + page * MACHO_PAGE_SIZE as usize;
    let site_file = region_file_offset + site_offset_in_region as usize;

    if starts.page_starts[page] == DYLD_CHAINED_PTR_START_NONE {
        write_word(data, site_file, ChainedFixupWord::pack(target, 0, 0))?;
        starts.page_starts[page] = in_page;
        return Ok(());
    }

    let head = starts.page_starts[page];

    if in_page < head {
        let delta = u16::try_from((head - in_page) as u64 / POINTER_STRIDE)
            .map_err(|_| KextError::OutOfResources("chained-fixup delta overflow"))?;
        write_word(data, site_file, ChainedFixupWord::pack(target, delta, 0))?;
        starts.page_starts[page] = in_page;
        return Ok(());
    }

    let mut cur_offset = head;
    loop {
        let cur_file = page_base_file + cur_offset as usize;
        let cur_word = read_word(data, cur_file)?;
        let next_delta = cur_word.next();

        if next_delta == 0 {
            let gap = u16::try_from((in_page - cur_offset) as u64 / POINTER_STRIDE)
                .map_err(|_| KextError::OutOfResources("chained-fixup delta overflow"))?;
            write_word(data, cur_file, ChainedFixupWord::pack(cur_word.target(), gap, 0))?;
            write_word(data, site_file, ChainedFixupWord::pack(target, 0, 0))?;
            return Ok(());
        }

        let next_offset = cur_offset + (next_delta as u64 * POINTER_STRIDE) as u16;

        if in_page < next_offset {
            let gap_to_new = u16::try_from((in_page - cur_offset) as u64 / POINTER_STRIDE)
                .map_err(|_| KextError::OutOfResources("chained-fixup delta overflow"))?;
            let new_to_next = u16::try_from((next_offset - in_page) as u64 / POINTER_STRIDE)
                .map_err(|_| KextError::OutOfResources("chained-fixup delta overflow"))?;
            write_word(
                data,
                cur_file,
                ChainedFixupWord::pack(cur_word.target(), gap_to_new, 0),
            )?;
            write_word(data, site_file, ChainedFixupWord::pack(target, new_to_next, 0))?;
            return Ok(());
        }

        cur_offset = next_offset;
    }
}

/// `ConvertRelocToFixup`: read the absolute pointer already written at
/// `site_offset_in_region` (by an ordinary relocation pass), derive the
/// chained-fixup target (`*(site) - KERNEL_FIXUP_OFFSET`), and splice it
/// into the page chain.
pub fn convert_reloc_to_fixup(
    data: &mut [u8],
    region_file_offset: usize,
    starts: &mut ChainedStarts,
    site_offset_in_region: u64,
) -> Result<()> {
    let site_file = region_file_offset + site_offset_in_region as usize;
    let absolute: u64 = data.pread_with(site_file, LE)?;
    let target = absolute.wrapping_sub(KERNEL_FIXUP_OFFSET);
    insert_fixup(data, region_file_offset, starts, site_offset_in_region, target)
}

/// For every `(site, target)` pair recorded,
/// `read64(container, site) = target - KERNEL_FIXUP_OFFSET` does *not*
/// hold post-conversion (the site now holds the packed word, not a plain
/// pointer) — this helper instead checks the packed word's `target` field
/// against the expected pre-conversion absolute value, which is the
/// property the invariant is really asserting.
pub fn verify_fixup_target(data: &[u8], site_file_offset: usize, expected_absolute: u64) -> Result<bool> {
    let word: ChainedFixupWord = data.pread_with(site_file_offset, LE)?;
    Ok(word.target() == expected_absolute.wrapping_sub(KERNEL_FIXUP_OFFSET))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_fixup_on_page_sets_head() {
        let mut data = vec![0u8; MACHO_PAGE_SIZE as usize * 2];
        let mut starts = ChainedStarts::new_empty(MACHO_PAGE_SIZE * 2);
        insert_fixup(&mut data, 0, &mut starts, 0x10, 0x2000).unwrap();
        assert_eq!(starts.page_starts[0], 0x10);
        let word: ChainedFixupWord = data.pread_with(0x10, LE).unwrap();
        assert_eq!(word.target(), 0x2000);
        assert_eq!(word.next(), 0);
    }

    #[test]
    fn splices_in_monotonic_order() {
        let mut data = vec![0u8; MACHO_PAGE_SIZE as usize];
        let mut starts = ChainedStarts::new_empty(MACHO_PAGE_SIZE);
        insert_fixup(&mut data, 0, &mut starts, 0x100, 1).unwrap();
        insert_fixup(&mut data, 0, &mut starts, 0x200, 2).unwrap();
        insert_fixup(&mut data, 0, &mut starts, 0x50, 3).unwrap(); // before head
        insert_fixup(&mut data, 0, &mut starts, 0x180, 4).unwrap(); // splice between

        // Walk the chain and confirm strictly increasing offsets.
        let mut offset = starts.page_starts[0] as u64;
        let mut seen = Vec::new();
        loop {
            seen.push(offset);
            let word: ChainedFixupWord = data.pread_with(offset as usize, LE).unwrap();
            if word.next() == 0 {
                break;
            }
            offset += word.next() as u64 * POINTER_STRIDE;
        }
        assert_eq!(seen, vec![0x50, 0x100, 0x180, 0x200]);
    }

    #[test]
    fn converts_absolute_pointer_with_offset() {
        let mut data = vec![0u8; MACHO_PAGE_SIZE as usize];
        data.pwrite_with(0xFFFF_FF80_0010_0000u64, 0, LE).unwrap();
        let mut starts = ChainedStarts::new_empty(MACHO_PAGE_SIZE);
        convert_reloc_to_fixup(&mut data, 0, &mut starts, 0).unwrap();
        assert!(verify_fixup_target(&data, 0, 0xFFFF_FF80_0010_0000u64).unwrap());
    }
}

//! Prelinked-kernel context: parse, extend, inject into, and
//! re-serialise a prelinkedkernel Mach-O. Legacy-mode operations live here;
//! the fileset/KC-specific helpers live in [`kc`].

pub mod kc;

use crate::dependency::{DependencyGraph, KextRecord};
use crate::error::{KextError, Result};
use crate::ident::KextIdentifier;
use crate::macho::consts::*;
use crate::macho::linker::{link_kext, LinkRequest};
use crate::macho::{self, ParsedMachO};
use crate::plist_ext;

/// Container state shared by the legacy and KC variants.
pub struct PrelinkedContext {
    pub data: Vec<u8>,
    pub capacity: usize,
    pub parsed: ParsedMachO,
    pub is_kc: bool,
    pub info_plist: plist::Value,
    pub records: Vec<KextRecord>,
    /// Index into `records` of each dictionary's owning record, in the same
    /// order as the `_PrelinkInfoDictionary` array (index 0 is always the
    /// synthetic kernel pseudo-kext).
    pub kexts_file_offset: u64,
    pub kexts_vm_address: u64,
    pub chained_starts: Option<crate::macho::fixups::ChainedStarts>,
    reserved_plist_bytes: usize,
    reserved_exe_bytes: usize,
}

impl PrelinkedContext {
    /// *Init*: validate the Mach-O, locate prelinked segments, detect KC by
    /// file-type, parse `__PRELINK_INFO`, and register the kernel
    /// pseudo-kext at index 0.
    pub fn init(data: Vec<u8>, capacity: usize) -> Result<Self> {
        let parsed = macho::parse(&data)?;
        let is_kc = parsed.is_fileset();

        let info_segment = parsed
            .segment(SEG_PRELINK_INFO)
            .ok_or(KextError::LoadError("no __PRELINK_INFO segment".into()))?;
        // The real format carries an `__info` section spanning the segment;
        // fall back to the segment's own bounds when it's absent (e.g. a
        // minimal fixture with no section table) rather than failing.
        let (offset, size) = match info_segment.section_named(SECT_PRELINK_INFO) {
            Some((_, section)) => (section.offset as u64, section.size),
            None => (info_segment.command.fileoff, info_segment.command.filesize),
        };

        let plist_bytes = data
            .get(offset as usize..(offset + size) as usize)
            .ok_or(KextError::LoadError("__PRELINK_INFO out of bounds".into()))?;
        let info_plist = plist_ext::parse(plist_bytes)?;

        let mut kernel = KextRecord::new(
            KextIdentifier::new(KextIdentifier::KERNEL_PSEUDO).unwrap(),
            "0",
        );
        kernel.virtual_base = parsed.segments.first().map(|s| s.command.vmaddr).unwrap_or(0);

        let kexts_vm_address = parsed.last_vm_address();
        let kexts_file_offset = parsed.last_file_offset();

        Ok(Self {
            data,
            capacity,
            parsed,
            is_kc,
            info_plist,
            records: vec![kernel],
            kexts_file_offset,
            kexts_vm_address,
            chained_starts: None,
            reserved_plist_bytes: 0,
            reserved_exe_bytes: 0,
        })
    }

    fn info_dict_array(&self) -> Result<&Vec<plist::Value>> {
        self.info_plist
            .as_dictionary()
            .and_then(|d| d.get(KEY_PRELINK_INFO_DICT))
            .and_then(|v| v.as_array())
            .ok_or(KextError::LoadError("_PrelinkInfoDictionary missing".into()))
    }

    fn info_dict_array_mut(&mut self) -> Result<&mut Vec<plist::Value>> {
        self.info_plist
            .as_dictionary_mut()
            .and_then(|d| d.get_mut(KEY_PRELINK_INFO_DICT))
            .and_then(|v| v.as_array_mut())
            .ok_or(KextError::LoadError("_PrelinkInfoDictionary missing".into()))
    }

    /// *ReserveKextSize*: pure sizing, accumulated into this context's
    /// running totals.
    pub fn reserve_kext_size(&mut self, info_plist_size: usize, executable: Option<&[u8]>) -> Result<()> {
        self.reserved_plist_bytes += info_plist_size + PLIST_EXPANSION_SIZE;
        if let Some(exe) = executable {
            self.reserved_exe_bytes += macho::aligned_vm_size(exe)? as usize;
        }
        Ok(())
    }

    /// *InjectPrepare*: reclaim trailing `__PRELINK_INFO`/`__PRELINK_STATE`
    /// space (legacy) or extend `__LINKEDIT` with a fresh chained-fixups
    /// table (KC), recording where injected kexts will land.
    pub fn inject_prepare(&mut self) -> Result<()> {
        if self.is_kc {
            return kc::inject_prepare_kc(self);
        }

        if let Some(info_seg) = self.parsed.segment(SEG_PRELINK_INFO).cloned() {
            let reclaim_start = info_seg.command.fileoff as usize;
            let reclaim_len = info_seg.command.filesize as usize;
            macho::zero_fill(&mut self.data, reclaim_start, reclaim_len.min(self.data.len() - reclaim_start));
            self.kexts_file_offset = reclaim_start as u64;
            self.kexts_vm_address = info_seg.command.vmaddr;
        }
        Ok(())
    }

    /// *InjectKext*: link and append one kext into the container.
    pub fn inject_kext(
        &mut self,
        identifier: &str,
        bundle_path: &str,
        info_plist: &mut plist::Dictionary,
        exec_relative_path: Option<&str>,
        executable: Option<&[u8]>,
    ) -> Result<()> {
        if self.records.iter().any(|r| r.identifier.as_str() == identifier) {
            return Err(KextError::AlreadyStarted(identifier.to_owned()));
        }

        let mut record = KextRecord::new(KextIdentifier::new(identifier.to_owned())?, "1.0");

        for dep_id in plist_ext::dependency_identifiers(info_plist) {
            if let Some(idx) = self.records.iter().position(|r| r.identifier.as_str() == dep_id) {
                record.dependencies.push(idx);
            }
        }

        let source_addr = self.kexts_file_offset;
        let load_address = self.kexts_vm_address;

        if let Some(exe) = executable {
            let expanded = macho::expand_macho_in_place(exe)?;
            let aligned_len = align_up(expanded.len() as u64, MACHO_PAGE_SIZE) as usize;

            if self.kexts_file_offset as usize + aligned_len > self.capacity {
                return Err(KextError::OutOfResources("prelinked container capacity exhausted"));
            }

            self.data[self.kexts_file_offset as usize..self.kexts_file_offset as usize + expanded.len()]
                .copy_from_slice(&expanded);

            record.virtual_base = load_address;
            self.records.push(record);
            let self_index = self.records.len() - 1;

            let kext_parsed = macho::parse(&expanded)?;
            let kmod_offset = find_kmod_info_file_offset(&self.data[self.kexts_file_offset as usize..], &kext_parsed)?;

            let mut kext_slice =
                self.data[self.kexts_file_offset as usize..self.kexts_file_offset as usize + aligned_len].to_vec();

            let mut graph = DependencyGraph { records: &mut self.records };
            let outcome = link_kext(
                &mut kext_slice,
                &LinkRequest {
                    load_address,
                    kmod_info_file_offset: kmod_offset,
                },
                &mut graph,
                self_index,
            )?;

            self.data[self.kexts_file_offset as usize..self.kexts_file_offset as usize + aligned_len]
                .copy_from_slice(&kext_slice[..aligned_len]);

            self.records[self_index].kmod_info_addr = load_address + kmod_offset.unwrap_or(0) as u64;
            self.records[self_index].symbols = outcome.symbols;
            self.records[self_index].vtables = outcome.vtables;

            if let Some(kmod_offset) = kmod_offset {
                plist_ext::set_hex_integer(
                    info_plist,
                    KEY_PRELINK_KMOD_INFO,
                    load_address + kmod_offset as u64,
                );
            }
            plist_ext::set_hex_integer(info_plist, KEY_PRELINK_EXEC_SOURCE_ADDR, source_addr);
            plist_ext::set_hex_integer(info_plist, KEY_PRELINK_EXEC_LOAD_ADDR, load_address);
            plist_ext::set_hex_integer(info_plist, KEY_PRELINK_EXEC_SIZE, outcome.new_logical_size);

            self.kexts_file_offset += aligned_len as u64;
            self.kexts_vm_address += aligned_len as u64;
        } else {
            record.virtual_base = 0;
            self.records.push(record);
        }

        info_plist.insert(
            KEY_PRELINK_BUNDLE_PATH.to_owned(),
            plist::Value::String(bundle_path.to_owned()),
        );
        if let Some(rel_path) = exec_relative_path {
            info_plist.insert(
                KEY_PRELINK_EXEC_RELATIVE_PATH.to_owned(),
                plist::Value::String(rel_path.to_owned()),
            );
        }

        self.info_dict_array_mut()?.push(plist::Value::Dictionary(info_plist.clone()));
        Ok(())
    }

    /// *InjectComplete*: export the plist, pad to 4 KiB, append as the new
    /// `__PRELINK_INFO`, and recompute the container's logical size.
    pub fn inject_complete(mut self) -> Result<Vec<u8>> {
        if self.is_kc {
            return kc::inject_complete_kc(self);
        }

        let mut serialized = plist_ext::serialize(&self.info_plist)?;
        let padded_len = align_up(serialized.len() as u64, MACHO_PAGE_SIZE) as usize;
        serialized.resize(padded_len, 0);

        let info_offset = self.kexts_file_offset as usize;
        if info_offset + padded_len > self.capacity {
            return Err(KextError::OutOfResources("no room for __PRELINK_INFO"));
        }
        self.data[info_offset..info_offset + padded_len].copy_from_slice(&serialized);

        if let Some(info_seg) = self.parsed.segments.iter().position(|s| s.name() == SEG_PRELINK_INFO) {
            let cmd_offset = self.parsed.segments[info_seg].cmd_offset;
            let mut command = self.parsed.segments[info_seg].command;
            command.fileoff = info_offset as u64;
            command.filesize = padded_len as u64;
            command.vmaddr = self.kexts_vm_address;
            command.vmsize = padded_len as u64;
            macho::write_at(&mut self.data, cmd_offset, command)?;
        }

        let new_size = info_offset + padded_len;
        self.data.truncate(new_size.max(self.data.len().min(self.capacity)));
        Ok(self.data)
    }
}

fn find_kmod_info_file_offset(kext_data: &[u8], parsed: &ParsedMachO) -> Result<Option<usize>> {
    let Some((_, symtab)) = parsed.symtab else {
        return Ok(None);
    };
    let symbols = crate::macho::symbol::read_symbols(kext_data, &symtab)?;
    Ok(symbols
        .iter()
        .find(|s| s.name == "_kmod_info")
        .map(|s| s.value as usize))
}

//! Mkext archive context: parse v1/v2 mkext archives, decompress, inject,
//! and recompute length + Adler32. Grounded in
//! `original_source/Library/OcAppleKernelLib/MkextContext.c`, translated
//! from its byte-swapped, intrusive-list C style into owned Rust
//! collections addressed by index.

pub mod lzss;

use crate::error::{KextError, Result};
use crate::macho::consts::KEY_BUNDLE_IDENTIFIER;
use crate::patcher::{GenericPatch, Patcher};
use crate::plist_ext;
use flate2::read::ZlibDecoder;
use scroll::{Pread, Pwrite, BE};
use std::io::Read;

/// `MKXT`, big-endian on disk.
pub const MKEXT_MAGIC: u32 = 0x4D4B5854;
/// Sentinel signature accompanying the magic.
pub const MKEXT_SIGNATURE: u32 = 0x4D4F5358;

pub const MKEXT_VERSION_V1: u32 = 0x0100_0000;
pub const MKEXT_VERSION_V2: u32 = 0x0200_0000;

const fn mkext_align(value: u32) -> u32 {
    (value + 7) & !7
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, scroll::Pread, scroll::Pwrite, scroll::SizeWith)]
pub struct MkextCoreHeader {
    pub magic: u32,
    pub signature: u32,
    pub length: u32,
    pub adler32: u32,
    pub version: u32,
    pub cpu_type: u32,
    pub cpu_subtype: u32,
    pub num_kexts: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, scroll::Pread, scroll::Pwrite, scroll::SizeWith)]
pub struct MkextV1FileRecord {
    pub offset: u32,
    pub compressed_size: u32,
    pub full_size: u32,
    pub modified_seconds: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, scroll::Pread, scroll::Pwrite, scroll::SizeWith)]
pub struct MkextV1KextEntry {
    pub plist: MkextV1FileRecord,
    pub binary: MkextV1FileRecord,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, scroll::Pread, scroll::Pwrite, scroll::SizeWith)]
pub struct MkextV2Header {
    pub core: MkextCoreHeader,
    pub cpu_checksum: u32,
    pub plist_offset: u32,
    pub plist_compressed_size: u32,
    pub plist_full_size: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, scroll::Pread, scroll::Pwrite, scroll::SizeWith)]
pub struct MkextV2FileEntry {
    pub compressed_size: u32,
    pub full_size: u32,
}

/// One kext record resolved from either archive format, used by the
/// identifier-lookup cache.
#[derive(Debug, Clone)]
struct MkextKextRecord {
    identifier: String,
    binary_offset: u32,
    binary_size: u32,
}

pub struct MkextContext {
    pub data: Vec<u8>,
    pub capacity: usize,
    pub version: u32,
    pub num_kexts: u32,
    /// v1 only: number of entry slots physically available.
    pub num_max_kexts: u32,
    /// v2 only: parsed plist document (`_MKEXTInfoDictionaries` array).
    pub v2_plist: Option<plist::Value>,
    lookup_cache: Vec<MkextKextRecord>,
}

impl MkextContext {
    /// *Init*: validate magic, signature, length, CPU type; compute the
    /// v1 slack for new entries or assert the v2 plist is the tail.
    pub fn init(data: Vec<u8>, capacity: usize) -> Result<Self> {
        let header: MkextCoreHeader = data.pread_with(0, BE)?;
        if header.magic != MKEXT_MAGIC || header.signature != MKEXT_SIGNATURE {
            return Err(KextError::LoadError("not an mkext archive".into()));
        }
        if header.length as usize > data.len() {
            return Err(KextError::LoadError("mkext length exceeds buffer".into()));
        }

        let (num_max_kexts, v2_plist) = if header.version == MKEXT_VERSION_V1 {
            let header_size = core::mem::size_of::<MkextCoreHeader>() as u32;
            let entry_size = core::mem::size_of::<MkextV1KextEntry>() as u32;

            let lowest_payload_offset = (0..header.num_kexts)
                .map(|i| {
                    let entry_offset = header_size + i * entry_size;
                    let entry: MkextV1KextEntry = data.pread_with(entry_offset as usize, BE)?;
                    Ok(entry.plist.offset.min(if entry.binary.offset != 0 {
                        entry.binary.offset
                    } else {
                        u32::MAX
                    }))
                })
                .collect::<Result<Vec<u32>>>()?
                .into_iter()
                .min()
                .unwrap_or(header.length);

            let slack = lowest_payload_offset.saturating_sub(header_size);
            (slack / entry_size, None)
        } else if header.version == MKEXT_VERSION_V2 {
            let v2_header: MkextV2Header = data.pread_with(0, BE)?;
            let plist_end = v2_header.plist_offset
                + if v2_header.plist_compressed_size != 0 {
                    v2_header.plist_compressed_size
                } else {
                    v2_header.plist_full_size
                };
            if plist_end > header.length {
                return Err(KextError::LoadError("mkext v2 plist is not the tail region".into()));
            }
            let plist_bytes = read_v2_plist_bytes(&data, &v2_header)?;
            (0, Some(plist_ext::parse(&plist_bytes)?))
        } else {
            return Err(KextError::Unsupported("unknown mkext version"));
        };

        Ok(Self {
            capacity,
            version: header.version,
            num_kexts: header.num_kexts,
            num_max_kexts,
            v2_plist,
            lookup_cache: Vec::new(),
            data,
        })
    }

    /// *Decompress*: walk both formats, decompressing every payload in
    /// place. `sizing_only` mirrors the C API's `out == NULL` sizing pass.
    pub fn decompress(&self, sizing_only: bool) -> Result<Vec<u8>> {
        let header: MkextCoreHeader = self.data.pread_with(0, BE)?;

        if header.version == MKEXT_VERSION_V1 {
            self.decompress_v1(&header, sizing_only)
        } else {
            self.decompress_v2(&header, sizing_only)
        }
    }

    fn decompress_v1(&self, header: &MkextCoreHeader, sizing_only: bool) -> Result<Vec<u8>> {
        let header_size = core::mem::size_of::<MkextCoreHeader>();
        let entry_size = core::mem::size_of::<MkextV1KextEntry>();
        let mut out = vec![0u8; header_size + entry_size * header.num_kexts as usize];
        let mut cursor = out.len() as u32;

        for i in 0..header.num_kexts {
            let entry_offset = header_size + i as usize * entry_size;
            let entry: MkextV1KextEntry = self.data.pread_with(entry_offset, BE)?;

            let mut new_entry = MkextV1KextEntry::default();
            for (field, rec) in [(&mut new_entry.plist, entry.plist), (&mut new_entry.binary, entry.binary)] {
                if rec.full_size == 0 {
                    continue;
                }
                let aligned = mkext_align(rec.full_size);
                if !sizing_only {
                    let payload = if rec.compressed_size != 0 {
                        lzss::decompress(
                            &self.data[rec.offset as usize..(rec.offset + rec.compressed_size) as usize],
                            rec.full_size as usize,
                        )?
                    } else {
                        self.data[rec.offset as usize..(rec.offset + rec.full_size) as usize].to_vec()
                    };
                    out.resize(out.len().max(cursor as usize + aligned as usize), 0);
                    out[cursor as usize..cursor as usize + payload.len()].copy_from_slice(&payload);
                }
                rec.clone_into_uncompressed(field, cursor, rec.full_size);
                cursor += aligned;
            }
            out.pwrite_with(new_entry, entry_offset, BE)?;
        }

        if !sizing_only {
            out.pwrite_with(
                MkextCoreHeader {
                    length: cursor,
                    ..*header
                },
                0,
                BE,
            )?;
        }
        Ok(out)
    }

    fn decompress_v2(&self, header: &MkextCoreHeader, sizing_only: bool) -> Result<Vec<u8>> {
        let v2_header: MkextV2Header = self.data.pread_with(0, BE)?;
        let header_size = core::mem::size_of::<MkextV2Header>();
        let plist_bytes = read_v2_plist_bytes(&self.data, &v2_header)?;

        let mut out = vec![0u8; mkext_align(header_size as u32) as usize];
        let mut cursor = out.len() as u32;

        // Kext executables referenced from the plist are decompressed in
        // place; the plist itself is re-exported uncompressed afterwards.
        let mut dicts = plist_ext::parse(&plist_bytes)?;
        if let Some(bundles) = dicts
            .as_dictionary_mut()
            .and_then(|d| d.get_mut("_MKEXTInfoDictionaries"))
            .and_then(|v| v.as_array_mut())
        {
            for bundle in bundles.iter_mut() {
                let Some(dict) = bundle.as_dictionary_mut() else { continue };
                let Ok(entry_offset) = plist_ext::get_hex_integer(dict, "_MKEXTExecutable") else {
                    continue;
                };
                let entry: MkextV2FileEntry = self.data.pread_with(entry_offset as usize, BE)?;
                let data_offset = entry_offset as usize + core::mem::size_of::<MkextV2FileEntry>();

                if !sizing_only {
                    let payload = if entry.compressed_size != 0 {
                        zlib_decompress(
                            &self.data[data_offset..data_offset + entry.compressed_size as usize],
                            entry.full_size as usize,
                        )?
                    } else {
                        self.data[data_offset..data_offset + entry.full_size as usize].to_vec()
                    };
                    let aligned = mkext_align(entry.full_size);
                    out.resize(out.len().max(cursor as usize + aligned as usize + 8), 0);
                    out.pwrite_with(
                        MkextV2FileEntry {
                            compressed_size: 0,
                            full_size: entry.full_size,
                        },
                        cursor as usize,
                        BE,
                    )?;
                    let payload_off = cursor as usize + core::mem::size_of::<MkextV2FileEntry>();
                    out[payload_off..payload_off + payload.len()].copy_from_slice(&payload);
                }

                plist_ext::set_hex_integer(dict, "_MKEXTExecutable", cursor as u64);
                cursor += core::mem::size_of::<MkextV2FileEntry>() as u32 + mkext_align(entry.full_size);
            }
        }

        if !sizing_only {
            let mut serialized = plist_ext::serialize(&dicts)?;
            let plist_offset = cursor;
            serialized.resize(mkext_align(serialized.len() as u32) as usize, 0);
            out.resize(out.len().max(plist_offset as usize + serialized.len()), 0);
            out[plist_offset as usize..plist_offset as usize + serialized.len()].copy_from_slice(&serialized);

            out.pwrite_with(
                MkextV2Header {
                    core: MkextCoreHeader {
                        length: plist_offset + serialized.len() as u32,
                        ..v2_header.core
                    },
                    plist_offset,
                    plist_compressed_size: 0,
                    plist_full_size: plist_offset, // placeholder recomputed by caller if exact size needed
                    ..v2_header
                },
                0,
                BE,
            )?;
        }

        Ok(out)
    }

    /// *Inject*: append a kext's plist (and optional executable) at the
    /// container's tail, uncompressed (v1) or as a fresh `MKEXT_V2_FILE_ENTRY`
    /// shifting the plist forward (v2).
    pub fn inject(&mut self, bundle_path: &str, info_plist: &mut plist::Dictionary, executable: Option<&[u8]>) -> Result<()> {
        let identifier = plist_ext::get_str(info_plist, KEY_BUNDLE_IDENTIFIER)?.to_owned();
        if self.lookup_kext(&identifier).is_some() {
            return Err(KextError::AlreadyStarted(identifier));
        }

        if self.version == MKEXT_VERSION_V1 {
            self.inject_v1(bundle_path, info_plist, executable)
        } else {
            self.inject_v2(bundle_path, info_plist, executable)
        }
    }

    fn inject_v1(&mut self, bundle_path: &str, info_plist: &plist::Dictionary, executable: Option<&[u8]>) -> Result<()> {
        if self.num_kexts >= self.num_max_kexts {
            return Err(KextError::OutOfResources("mkext v1 has no free entry slots"));
        }

        let header: MkextCoreHeader = self.data.pread_with(0, BE)?;
        let header_size = core::mem::size_of::<MkextCoreHeader>();
        let entry_size = core::mem::size_of::<MkextV1KextEntry>();
        let mut cursor = header.length;

        let mut plist_bytes = plist_ext::serialize(&plist::Value::Dictionary(info_plist.clone()))?;
        let plist_len = plist_bytes.len() as u32;
        plist_bytes.resize(mkext_align(plist_len) as usize, 0);

        if (cursor + plist_bytes.len() as u32) as usize > self.capacity {
            return Err(KextError::OutOfResources("mkext v1 container capacity exhausted"));
        }
        self.data[cursor as usize..cursor as usize + plist_bytes.len()].copy_from_slice(&plist_bytes);
        let plist_offset = cursor;
        cursor += plist_bytes.len() as u32;

        let (binary_offset, binary_size) = if let Some(exe) = executable {
            let aligned = mkext_align(exe.len() as u32);
            if (cursor + aligned) as usize > self.capacity {
                return Err(KextError::OutOfResources("mkext v1 container capacity exhausted"));
            }
            self.data[cursor as usize..cursor as usize + exe.len()].copy_from_slice(exe);
            let offset = cursor;
            cursor += aligned;
            (offset, exe.len() as u32)
        } else {
            (0, 0)
        };

        let entry = MkextV1KextEntry {
            plist: MkextV1FileRecord {
                offset: plist_offset,
                compressed_size: 0,
                full_size: plist_len,
                modified_seconds: 0,
            },
            binary: MkextV1FileRecord {
                offset: binary_offset,
                compressed_size: 0,
                full_size: binary_size,
                modified_seconds: 0,
            },
        };
        let entry_offset = header_size + self.num_kexts as usize * entry_size;
        self.data.pwrite_with(entry, entry_offset, BE)?;

        let _ = bundle_path;
        self.num_kexts += 1;
        self.data.pwrite_with(MkextCoreHeader { length: cursor, num_kexts: self.num_kexts, ..header }, 0, BE)?;
        Ok(())
    }

    fn inject_v2(&mut self, bundle_path: &str, info_plist: &mut plist::Dictionary, executable: Option<&[u8]>) -> Result<()> {
        let v2_header: MkextV2Header = self.data.pread_with(0, BE)?;
        let insert_at = v2_header.plist_offset;

        let mut shift = 0u32;
        if let Some(exe) = executable {
            let entry = MkextV2FileEntry {
                compressed_size: 0,
                full_size: exe.len() as u32,
            };
            let entry_total = core::mem::size_of::<MkextV2FileEntry>() as u32 + mkext_align(exe.len() as u32);
            if (insert_at + entry_total) as usize > self.capacity {
                return Err(KextError::OutOfResources("mkext v2 container capacity exhausted"));
            }

            self.data
                .copy_within(insert_at as usize..v2_header.core.length as usize, (insert_at + entry_total) as usize);
            self.data.pwrite_with(entry, insert_at as usize, BE)?;
            let data_off = insert_at as usize + core::mem::size_of::<MkextV2FileEntry>();
            self.data[data_off..data_off + exe.len()].copy_from_slice(exe);

            plist_ext::set_hex_integer(info_plist, "_MKEXTExecutable", insert_at as u64);
            shift = entry_total;
        }

        info_plist.insert("_MKEXTBundlePath".to_owned(), plist::Value::String(bundle_path.to_owned()));

        let Some(plist) = &mut self.v2_plist else {
            return Err(KextError::LoadError("mkext v2 plist not parsed".into()));
        };
        if let Some(bundles) = plist
            .as_dictionary_mut()
            .and_then(|d| d.get_mut("_MKEXTInfoDictionaries"))
            .and_then(|v| v.as_array_mut())
        {
            bundles.push(plist::Value::Dictionary(info_plist.clone()));
        }

        let new_header = MkextV2Header {
            core: MkextCoreHeader {
                length: v2_header.core.length + shift,
                ..v2_header.core
            },
            plist_offset: insert_at + shift,
            ..v2_header
        };
        self.data.pwrite_with(new_header, 0, BE)?;
        Ok(())
    }

    /// *ApplyPatch / ApplyQuirk / Block*: resolve a kext's Mach-O view by
    /// identifier and apply.
    pub fn apply_patch(&mut self, identifier: &str, patch: &GenericPatch) -> Result<()> {
        let record = self
            .lookup_kext(identifier)
            .ok_or_else(|| KextError::NotFound(identifier.to_owned()))?
            .clone();
        let slice = &mut self.data[record.binary_offset as usize..(record.binary_offset + record.binary_size) as usize];
        let mut patcher = Patcher::init_from_buffer(slice)?;
        patcher.apply_generic_patch(patch, &[])?;
        Ok(())
    }

    pub fn block(&mut self, identifier: &str, kmod_info_offset: usize) -> Result<()> {
        let record = self
            .lookup_kext(identifier)
            .ok_or_else(|| KextError::NotFound(identifier.to_owned()))?
            .clone();
        let slice = &mut self.data[record.binary_offset as usize..(record.binary_offset + record.binary_size) as usize];
        let mut patcher = Patcher::init_from_buffer(slice)?.with_kmod_info(kmod_info_offset);
        patcher.block_kext()
    }

    fn lookup_kext(&mut self, identifier: &str) -> Option<&MkextKextRecord> {
        if !self.lookup_cache.iter().any(|r| r.identifier == identifier) {
            self.rebuild_lookup_cache();
        }
        self.lookup_cache.iter().find(|r| r.identifier == identifier)
    }

    fn rebuild_lookup_cache(&mut self) {
        self.lookup_cache.clear();
        if self.version == MKEXT_VERSION_V2 {
            self.rebuild_lookup_cache_v2();
        } else {
            self.rebuild_lookup_cache_v1();
        }
    }

    fn rebuild_lookup_cache_v2(&mut self) {
        let Some(plist) = &self.v2_plist else { return };
        let Some(bundles) = plist
            .as_dictionary()
            .and_then(|d| d.get("_MKEXTInfoDictionaries"))
            .and_then(|v| v.as_array())
        else {
            return;
        };
        for bundle in bundles {
            let Some(dict) = bundle.as_dictionary() else { continue };
            let Some(identifier) = plist_ext::get_str_opt(dict, KEY_BUNDLE_IDENTIFIER) else { continue };
            let Ok(offset) = plist_ext::get_hex_integer(dict, "_MKEXTExecutable") else { continue };
            let Ok(entry) = self.data.pread_with::<MkextV2FileEntry>(offset as usize, BE) else { continue };
            self.lookup_cache.push(MkextKextRecord {
                identifier: identifier.to_owned(),
                binary_offset: offset as u32 + core::mem::size_of::<MkextV2FileEntry>() as u32,
                binary_size: entry.full_size,
            });
        }
    }

    /// v1 lookup assumes the archive has already been run through
    /// `Decompress` (patching a still-compressed v1 binary entry isn't
    /// supported, matching the `InjectComplete` "always uncompressed on
    /// output" policy).
    fn rebuild_lookup_cache_v1(&mut self) {
        let header_size = core::mem::size_of::<MkextCoreHeader>();
        let entry_size = core::mem::size_of::<MkextV1KextEntry>();
        for i in 0..self.num_kexts {
            let entry_offset = header_size + i as usize * entry_size;
            let Ok(entry) = self.data.pread_with::<MkextV1KextEntry>(entry_offset, BE) else { continue };
            if entry.plist.full_size == 0 || entry.plist.compressed_size != 0 {
                continue;
            }
            let Some(plist_bytes) = self
                .data
                .get(entry.plist.offset as usize..(entry.plist.offset + entry.plist.full_size) as usize)
            else {
                continue;
            };
            let Ok(dict) = plist_ext::parse(plist_bytes).and_then(|v| {
                v.into_dictionary().ok_or(crate::error::PlistAccessError::WrongType("mkext v1 kext plist"))
            }) else {
                continue;
            };
            let Ok(identifier) = plist_ext::get_str(&dict, KEY_BUNDLE_IDENTIFIER) else { continue };
            if entry.binary.full_size == 0 || entry.binary.compressed_size != 0 {
                continue;
            }
            self.lookup_cache.push(MkextKextRecord {
                identifier: identifier.to_owned(),
                binary_offset: entry.binary.offset,
                binary_size: entry.binary.full_size,
            });
        }
    }

    /// *InjectComplete*: v1 sets `NumKexts` (already maintained inline by
    /// `inject_v1`); v2 re-exports the plist. Either way, recompute length
    /// and Adler32.
    pub fn inject_complete(mut self) -> Result<Vec<u8>> {
        if self.version == MKEXT_VERSION_V2 {
            if let Some(plist) = self.v2_plist.take() {
                let mut serialized = plist_ext::serialize(&plist)?;
                let v2_header: MkextV2Header = self.data.pread_with(0, BE)?;
                let aligned_len = mkext_align(serialized.len() as u32);
                serialized.resize(aligned_len as usize, 0);

                let offset = v2_header.plist_offset as usize;
                if offset + serialized.len() > self.capacity {
                    return Err(KextError::OutOfResources("no room for mkext v2 plist re-export"));
                }
                self.data[offset..offset + serialized.len()].copy_from_slice(&serialized);

                self.data.pwrite_with(
                    MkextV2Header {
                        core: MkextCoreHeader {
                            length: offset as u32 + serialized.len() as u32,
                            ..v2_header.core
                        },
                        plist_compressed_size: 0,
                        plist_full_size: serialized.len() as u32,
                        ..v2_header
                    },
                    0,
                    BE,
                )?;
            }
        }

        let header: MkextCoreHeader = self.data.pread_with(0, BE)?;
        let checksum_start = core::mem::offset_of!(MkextCoreHeader, version);
        let checksum = adler32::adler32(std::io::Cursor::new(&self.data[checksum_start..header.length as usize]))
            .map_err(KextError::Io)?;
        self.data.pwrite_with(MkextCoreHeader { adler32: checksum, ..header }, 0, BE)?;

        self.data.truncate(header.length as usize);
        Ok(self.data)
    }
}

/// v2 payloads (the plist blob and per-kext executables alike) use ZLIB,
/// not the v1 LZSS variant: a v2 file-entry record is `{compressedSize,
/// fullSize}` followed by `compressedSize` ZLIB-compressed bytes.
fn zlib_decompress(input: &[u8], full_size: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(full_size);
    ZlibDecoder::new(input)
        .read_to_end(&mut out)
        .map_err(KextError::Io)?;
    if out.len() != full_size {
        return Err(KextError::LoadError("zlib payload decompressed to unexpected size".into()));
    }
    Ok(out)
}

fn read_v2_plist_bytes(data: &[u8], header: &MkextV2Header) -> Result<Vec<u8>> {
    let offset = header.plist_offset as usize;
    if header.plist_compressed_size != 0 {
        zlib_decompress(
            &data[offset..offset + header.plist_compressed_size as usize],
            header.plist_full_size as usize,
        )
    } else {
        Ok(data[offset..offset + header.plist_full_size as usize].to_vec())
    }
}

impl MkextV1FileRecord {
    fn clone_into_uncompressed(&self, out: &mut MkextV1FileRecord, offset: u32, full_size: u32) {
        out.offset = offset;
        out.compressed_size = 0;
        out.full_size = full_size;
        out.modified_seconds = self.modified_seconds;
    }
}

//! Byte-pattern patcher: generic find/replace over a kext's Mach-O bytes,
//! symbol-address-based base resolution, and the `BlockKext` stub.

use crate::error::{KextError, Result};
use crate::macho::consts::{segname, SEG_TEXT, BLOCK_KEXT_STUB};
use crate::macho::linkedit::KmodInfo64;
use crate::macho::symbol::Symbol;
use scroll::{Pread, LE};

/// A generic byte patch descriptor.
#[derive(Debug, Clone)]
pub struct GenericPatch {
    pub find: Option<Vec<u8>>,
    pub mask: Option<Vec<u8>>,
    pub replace: Vec<u8>,
    pub replace_mask: Option<Vec<u8>>,
    pub count: usize,
    pub skip: usize,
    pub base_symbol: Option<String>,
    pub limit: Option<usize>,
}

/// A quirk: a named, built-in patch resolved through the process-wide quirk
/// table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QuirkId(pub &'static str);

/// Patches a single kext's Mach-O bytes in place.
pub struct Patcher<'a> {
    data: &'a mut [u8],
    virtual_base: u64,
    kmod_info_file_offset: Option<usize>,
}

impl<'a> Patcher<'a> {
    /// `InitFromBuffer`: derive `VirtualBase = __TEXT.vaddr - __TEXT.fileoff`.
    pub fn init_from_buffer(data: &'a mut [u8]) -> Result<Self> {
        let parsed = crate::macho::parse(data)?;
        let text = parsed
            .segments
            .iter()
            .find(|s| s.command.segname == segname(SEG_TEXT))
            .ok_or(KextError::LoadError("no __TEXT segment".into()))?;
        let virtual_base = text.command.vmaddr.wrapping_sub(text.command.fileoff);

        Ok(Self {
            data,
            virtual_base,
            kmod_info_file_offset: None,
        })
    }

    pub fn with_kmod_info(mut self, file_offset: usize) -> Self {
        self.kmod_info_file_offset = Some(file_offset);
        self
    }

    fn resolve_symbol_address(&self, name: &str, symbols: &[Symbol]) -> Result<usize> {
        let sym = symbols
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| KextError::NotFound(name.to_owned()))?;
        let file_offset = sym.value.wrapping_sub(self.virtual_base);
        Ok(file_offset as usize)
    }

    /// `ApplyGenericPatch`.
    pub fn apply_generic_patch(&mut self, patch: &GenericPatch, symbols: &[Symbol]) -> Result<usize> {
        let (window_start, window_end) = if let Some(base_name) = &patch.base_symbol {
            let start = self.resolve_symbol_address(base_name, symbols)?;
            (start, self.data.len())
        } else {
            (0, patch.limit.unwrap_or(self.data.len()))
        };

        let window_end = window_end.min(self.data.len());
        if window_start > window_end {
            return Err(KextError::InvalidParameter("patch window out of bounds"));
        }

        let Some(find) = &patch.find else {
            if patch.replace.len() > window_end - window_start {
                return Err(KextError::NotFound(
                    "replacement larger than available data".into(),
                ));
            }
            self.data[window_start..window_start + patch.replace.len()]
                .copy_from_slice(&patch.replace);
            return Ok(1);
        };

        let mut replaced = 0usize;
        let mut scanned = 0usize;
        let mut pos = window_start;

        while pos + find.len() <= window_end {
            if matches_at(&self.data[pos..pos + find.len()], find, patch.mask.as_deref()) {
                if scanned >= patch.skip {
                    apply_replace(
                        &mut self.data[pos..pos + find.len()],
                        &patch.replace,
                        patch.replace_mask.as_deref(),
                    );
                    replaced += 1;
                    if patch.count != 0 && replaced >= patch.count {
                        break;
                    }
                }
                scanned += 1;
            }
            pos += 1;
        }

        if replaced == 0 && scanned == 0 {
            return Err(KextError::NotFound("pattern not found".into()));
        }

        if patch.count != 0 && replaced < patch.count {
            log::warn!(
                "generic patch requested {} replacements but only {} matched",
                patch.count,
                replaced
            );
        }

        Ok(replaced)
    }

    /// `BlockKext`: overwrite the kext's entry point with
    /// `mov eax, KMOD_RETURN_FAILURE; ret`.
    pub fn block_kext(&mut self) -> Result<()> {
        let kmod_offset = self
            .kmod_info_file_offset
            .ok_or(KextError::NotFound("_kmod_info".into()))?;

        let info: KmodInfo64 = self.data.pread_with(kmod_offset, LE)?;
        let start_file_offset = info.start_addr.wrapping_sub(self.virtual_base) as usize;

        if start_file_offset + BLOCK_KEXT_STUB.len() > self.data.len() {
            return Err(KextError::BufferTooSmall {
                needed: start_file_offset + BLOCK_KEXT_STUB.len(),
                available: self.data.len(),
            });
        }

        self.data[start_file_offset..start_file_offset + BLOCK_KEXT_STUB.len()]
            .copy_from_slice(&BLOCK_KEXT_STUB);
        Ok(())
    }
}

fn matches_at(window: &[u8], find: &[u8], mask: Option<&[u8]>) -> bool {
    match mask {
        None => window == find,
        Some(mask) => window
            .iter()
            .zip(find)
            .zip(mask)
            .all(|((w, f), m)| w & m == f & m),
    }
}

fn apply_replace(window: &mut [u8], replace: &[u8], replace_mask: Option<&[u8]>) {
    match replace_mask {
        None => window.copy_from_slice(replace),
        Some(mask) => {
            for ((w, r), m) in window.iter_mut().zip(replace).zip(mask) {
                *w = (*w & !m) | (r & m);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macho::test_fixtures::build_minimal_macho;

    fn make_buf() -> Vec<u8> {
        let mut data = build_minimal_macho(
            crate::macho::consts::MH_KEXT_BUNDLE,
            &[("__TEXT", 0x1000, 0x2000, 0, 0x2000)],
        );
        data.resize(0x2000, 0);
        data[0x100..0x104].copy_from_slice(&[0x55, 0x48, 0x89, 0xE5]);
        data
    }

    #[test]
    fn plain_replace_no_find() {
        let mut data = make_buf();
        let mut patcher = Patcher::init_from_buffer(&mut data).unwrap();
        let patch = GenericPatch {
            find: None,
            mask: None,
            replace: vec![0x90, 0x90],
            replace_mask: None,
            count: 0,
            skip: 0,
            base_symbol: None,
            limit: Some(4),
        };
        patcher.apply_generic_patch(&patch, &[]).unwrap();
        assert_eq!(&data[0..2], &[0x90, 0x90]);
    }

    #[test]
    fn find_replace_pattern() {
        let mut data = make_buf();
        let mut patcher = Patcher::init_from_buffer(&mut data).unwrap();
        let patch = GenericPatch {
            find: Some(vec![0x55, 0x48, 0x89, 0xE5]),
            mask: None,
            replace: vec![0xC3, 0x90, 0x90, 0x90],
            replace_mask: None,
            count: 1,
            skip: 0,
            base_symbol: None,
            limit: None,
        };
        let n = patcher.apply_generic_patch(&patch, &[]).unwrap();
        assert_eq!(n, 1);
        assert_eq!(&data[0x100..0x104], &[0xC3, 0x90, 0x90, 0x90]);
    }

    #[test]
    fn find_with_no_match_errors() {
        let mut data = make_buf();
        let mut patcher = Patcher::init_from_buffer(&mut data).unwrap();
        let patch = GenericPatch {
            find: Some(vec![0xDE, 0xAD, 0xBE, 0xEF]),
            mask: None,
            replace: vec![0, 0, 0, 0],
            replace_mask: None,
            count: 0,
            skip: 0,
            base_symbol: None,
            limit: None,
        };
        assert!(patcher.apply_generic_patch(&patch, &[]).is_err());
    }
}

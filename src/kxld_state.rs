//! The 10.6.8 KXLD link-state table: a standalone blob appended next to
//! the prelinked kernel, used by early Snow Leopard
//! kernels in addition to the prelinked image itself.
//!
//! Layout: header, vtables section, symbols section, string pool. Each
//! symbol is either the 32-bit or 64-bit variant of `{NameOffset, Address,
//! Flags}`, selected by a header field.

use crate::error::{KextError, Result};
use crate::plist_ext;
use scroll::{Pread, LE};

#[repr(C)]
#[derive(Debug, Clone, Copy, scroll::Pread, scroll::Pwrite, scroll::SizeWith)]
pub struct KxldStateHeader {
    pub version: u32,
    pub is_64_bit: u32,
    pub vtables_offset: u32,
    pub vtables_size: u32,
    pub symbols_offset: u32,
    pub symbols_size: u32,
    pub strings_offset: u32,
    pub strings_size: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct KxldSymbol {
    pub name_offset: u32,
    pub address: u64,
    pub flags: u32,
}

/// A parsed link-state blob, borrowed from its backing container bytes.
pub struct KxldState {
    pub header: KxldStateHeader,
    pub symbols: Vec<KxldSymbol>,
    pub strings: Vec<u8>,
    pub vtables_raw: Vec<u8>,
}

fn read_symbol_32(data: &[u8], offset: usize) -> Result<KxldSymbol> {
    let name_offset: u32 = data.pread_with(offset, LE)?;
    let address: u32 = data.pread_with(offset + 4, LE)?;
    let flags: u32 = data.pread_with(offset + 8, LE)?;
    Ok(KxldSymbol {
        name_offset,
        address: address as u64,
        flags,
    })
}

fn read_symbol_64(data: &[u8], offset: usize) -> Result<KxldSymbol> {
    let name_offset: u32 = data.pread_with(offset, LE)?;
    let address: u64 = data.pread_with(offset + 8, LE)?;
    let flags: u32 = data.pread_with(offset + 16, LE)?;
    Ok(KxldSymbol {
        name_offset,
        address,
        flags,
    })
}

const SYMBOL_SIZE_32: usize = 12;
const SYMBOL_SIZE_64: usize = 24;

/// Parse a link-state blob starting at `base_offset` within `data`.
pub fn parse(data: &[u8], base_offset: usize) -> Result<KxldState> {
    let header: KxldStateHeader = data.pread_with(base_offset, LE)?;
    let sym_size = if header.is_64_bit != 0 {
        SYMBOL_SIZE_64
    } else {
        SYMBOL_SIZE_32
    };
    let count = header.symbols_size as usize / sym_size;

    let symbols_base = base_offset + header.symbols_offset as usize;
    let mut symbols = Vec::with_capacity(count);
    for i in 0..count {
        let offset = symbols_base + i * sym_size;
        symbols.push(if header.is_64_bit != 0 {
            read_symbol_64(data, offset)?
        } else {
            read_symbol_32(data, offset)?
        });
    }

    let strings_base = base_offset + header.strings_offset as usize;
    let strings = data
        .get(strings_base..strings_base + header.strings_size as usize)
        .ok_or(KextError::LoadError("kxld state string pool truncated".into()))?
        .to_vec();

    let vtables_base = base_offset + header.vtables_offset as usize;
    let vtables_raw = data
        .get(vtables_base..vtables_base + header.vtables_size as usize)
        .ok_or(KextError::LoadError("kxld state vtables section truncated".into()))?
        .to_vec();

    Ok(KxldState {
        header,
        symbols,
        strings,
        vtables_raw,
    })
}

/// Total blob size: the furthest-extending section's end offset.
pub fn total_size(header: &KxldStateHeader) -> u32 {
    [
        header.vtables_offset + header.vtables_size,
        header.symbols_offset + header.symbols_size,
        header.strings_offset + header.strings_size,
    ]
    .into_iter()
    .max()
    .unwrap_or(0)
}

/// `KxldStateRebuild`: after relocating the blob by `delta` bytes, every
/// kext dictionary's `_PrelinkLinkState` integer (an offset into the blob)
/// must be shifted by the same amount and re-encoded as lowercase hex ASCII.
pub fn rebuild_plist_offsets(
    kext_dicts: &mut [plist::Dictionary],
    delta: i64,
) -> Result<()> {
    for dict in kext_dicts.iter_mut() {
        if let Ok(old) = plist_ext::get_hex_integer(dict, "_PrelinkLinkState") {
            let new_value = (old as i64 + delta) as u64;
            plist_ext::set_hex_integer(dict, "_PrelinkLinkState", new_value);
        }
    }
    Ok(())
}

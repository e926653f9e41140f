//! Vtable construction and patching.
//!
//! A C++ vtable lives in the Mach-O image as the `__ZTV`-named symbol's
//! bytes: a two-word header (offset-to-top, RTTI pointer — both ignored
//! here) followed by a flat array of function pointers, terminated by a
//! zero word.

use crate::error::{KextError, Result};
use scroll::{Pread, LE};

/// One vtable slot. `name` is `None` for inlined virtual functions, whose
/// address can't be resolved back to a symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VtableEntry {
    pub address: u64,
    pub name: Option<String>,
}

/// A fully constructed vtable: name plus its flat entry array.
#[derive(Debug, Clone)]
pub struct LinkedVtable {
    pub name: String,
    pub entries: Vec<VtableEntry>,
    /// File offset of the first entry (`header_words * 8` past the
    /// symbol's file offset), needed to patch entries back in place.
    pub entries_file_offset: usize,
}

/// Two pointer-sized words precede the entry array (offset-to-top, RTTI).
const VTABLE_HEADER_WORDS: usize = 2;

/// Build a [`LinkedVtable`] starting at `file_offset` (the vtable symbol's
/// file location), resolving each non-zero entry's address back to a name
/// via `resolve_by_value` (typically `GetSymbolByValue(OnlyCxx)`).
pub fn build_vtable(
    data: &[u8],
    name: &str,
    file_offset: usize,
    mut resolve_by_value: impl FnMut(u64) -> Option<String>,
) -> Result<LinkedVtable> {
    if file_offset % 8 != 0 {
        return Err(KextError::LoadError(format!(
            "vtable '{name}' is not 8-byte aligned"
        )));
    }

    let entries_file_offset = file_offset + VTABLE_HEADER_WORDS * 8;
    let mut entries = Vec::new();
    let mut offset = entries_file_offset;

    loop {
        let word: u64 = data
            .pread_with(offset, LE)
            .map_err(|e| KextError::LoadError(format!("vtable '{name}' truncated: {e}")))?;
        if word == 0 {
            break;
        }
        entries.push(VtableEntry {
            address: word,
            name: resolve_by_value(word),
        });
        offset += 8;
    }

    Ok(LinkedVtable {
        name: name.to_owned(),
        entries,
        entries_file_offset,
    })
}

/// Outcome of one patch pass over a single class's vtable.
#[derive(Debug, PartialEq, Eq)]
pub enum PatchOutcome {
    Patched,
    /// The super-vtable isn't resolved yet; retry on a later pass.
    Deferred,
    /// The child is binary-incompatible with its parent (a parent slot is a
    /// pad where the child expects a real function).
    ParentSlotIsPad,
}

/// Patch one child vtable against its resolved super-vtable: every
/// non-matching, non-pure-virtual, non
/// locally-defined slot is overwritten with the super-slot's address.
/// `is_locally_defined` should report whether the *child*'s own compiled
/// code overrides that slot (a locally-defined override always wins and is
/// left untouched).
pub fn patch_vtable_against_super(
    child: &mut LinkedVtable,
    data: &mut [u8],
    super_vtable: &LinkedVtable,
    is_locally_defined: impl Fn(usize, &VtableEntry) -> bool,
    is_pure_virtual_pad: impl Fn(&VtableEntry) -> bool,
) -> Result<PatchOutcome> {
    if super_vtable.entries.len() > child.entries.len() {
        // Child compiled against older headers than its declared super;
        // every slot the parent added past the child's length indicates
        // the two disagree on layout.
        return Ok(PatchOutcome::ParentSlotIsPad);
    }

    for (i, super_entry) in super_vtable.entries.iter().enumerate() {
        if is_pure_virtual_pad(super_entry) {
            if !is_pure_virtual_pad(&child.entries[i]) {
                return Ok(PatchOutcome::ParentSlotIsPad);
            }
            continue;
        }

        if is_locally_defined(i, &child.entries[i]) {
            continue;
        }

        if child.entries[i].address & 0x1 != 0 {
            log::warn!(
                "vtable '{}' slot {} has low bit set, possible ABI violation",
                child.name,
                i
            );
        }

        if child.entries[i] != *super_entry {
            let offset = child.entries_file_offset + i * 8;
            data[offset..offset + 8].copy_from_slice(&super_entry.address.to_le_bytes());
            child.entries[i] = super_entry.clone();
        }
    }

    Ok(PatchOutcome::Patched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use scroll::Pwrite;

    fn write_vtable(data: &mut Vec<u8>, offset: usize, entries: &[u64]) {
        data.pwrite_with(0u64, offset, LE).unwrap(); // offset-to-top
        data.pwrite_with(0u64, offset + 8, LE).unwrap(); // rtti
        let mut pos = offset + 16;
        for e in entries {
            data.pwrite_with(*e, pos, LE).unwrap();
            pos += 8;
        }
        data.pwrite_with(0u64, pos, LE).unwrap(); // terminator
    }

    #[test]
    fn builds_vtable_until_terminator() {
        let mut data = vec![0u8; 128];
        write_vtable(&mut data, 0, &[0x1000, 0x1008]);
        let vt = build_vtable(&data, "__ZTV6DriverE", 0, |addr| {
            Some(format!("sym_{addr:x}"))
        })
        .unwrap();
        assert_eq!(vt.entries.len(), 2);
        assert_eq!(vt.entries[0].name.as_deref(), Some("sym_1000"));
    }

    #[test]
    fn rejects_misaligned_vtable() {
        let data = vec![0u8; 32];
        assert!(build_vtable(&data, "__ZTVx", 4, |_| None).is_err());
    }

    #[test]
    fn patches_unresolved_slot_from_super() {
        let mut data = vec![0u8; 128];
        write_vtable(&mut data, 0, &[0x1000, 0]);
        let mut child = build_vtable(&data, "__ZTVChild", 0, |_| None).unwrap();

        let sup = LinkedVtable {
            name: "__ZTVSuper".into(),
            entries: vec![
                VtableEntry {
                    address: 0x1000,
                    name: Some("overridden".into()),
                },
                VtableEntry {
                    address: 0x2000,
                    name: Some("inherited".into()),
                },
            ],
            entries_file_offset: 0,
        };

        let outcome =
            patch_vtable_against_super(&mut child, &mut data, &sup, |i, _| i == 0, |_| false)
                .unwrap();
        assert_eq!(outcome, PatchOutcome::Patched);
        assert_eq!(child.entries[1].address, 0x2000);
    }
}

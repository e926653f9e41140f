//! x86_64 relocation processing, the legacy-mode half of
//! the linker. Kernel-collection mode converts the same relocations into
//! chained fixups instead (see [`super::fixups`]).

use super::raw::reloc_type::*;
use super::raw::RelocationInfo;
use crate::error::{KextError, Result};
use crate::macho::consts::X86_64_RIP_RELATIVE_LIMIT;
use scroll::{Pread, Pwrite, LE};

/// Where a relocation's target address came from.
#[derive(Debug, Clone, Copy)]
pub enum Target {
    /// External relocation: resolved symbol value.
    Symbol(u64),
    /// Local relocation: a slide-only delta relative to the defining
    /// section (`section.addr + loadAddress - section.addr`).
    Local(u64),
}

impl Target {
    pub fn value(self) -> u64 {
        match self {
            Target::Symbol(v) | Target::Local(v) => v,
        }
    }
}

/// Outcome of processing one relocation: whether it must be preserved as a
/// local relocation in the rebuilt `__LINKEDIT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// `UNSIGNED`-family: converted to a local relocation with
    /// `SymbolNumber = 1` ("slides with the first segment").
    PreserveAsLocal,
    /// Consumed; nothing further is emitted for this relocation.
    Consumed,
}

/// Process a single x86_64 relocation against `data`, writing the patched
/// instruction bytes back in place and returning the relocation's
/// disposition plus whether a paired successor was consumed (`BIT31`).
///
/// `pair_target` is the already-resolved [`Target`] of the paired
/// relocation (only present, and only consulted, for `SUBTRACTOR`) —
/// resolved by the caller the same way `target` was, via symbol lookup or
/// section address, never derived from the raw pair symbol-table index.
pub fn process_relocation(
    data: &mut [u8],
    site_file_offset: usize,
    reloc: &RelocationInfo,
    pair_target: Option<Target>,
    target: Target,
    load_address_delta: u64,
) -> Result<(Disposition, bool)> {
    let length = reloc.length();
    let byte_len: usize = match length {
        2 => 4,
        3 => 8,
        _ => {
            return Err(KextError::Unsupported(
                "only length-2 (32-bit) and length-3 (64-bit) relocations are supported",
            ))
        }
    };

    let mut consumed_pair = false;
    let final_value: i64 = if reloc.pc_relative() {
        let adjustment: i64 = match reloc.reloc_type() {
            X86_64_RELOC_SIGNED => 0,
            X86_64_RELOC_SIGNED_1 => 1,
            X86_64_RELOC_SIGNED_2 => 2,
            X86_64_RELOC_SIGNED_4 => 4,
            X86_64_RELOC_BRANCH | X86_64_RELOC_GOT | X86_64_RELOC_GOT_LOAD => 1i64 << length,
            X86_64_RELOC_SUBTRACTOR => {
                let pair_target = pair_target.ok_or(KextError::LoadError(
                    "SUBTRACTOR relocation missing its pair".into(),
                ))?;
                consumed_pair = true;
                return finish_subtractor(data, site_file_offset, byte_len, target, pair_target)
                    .map(|v| (v, consumed_pair));
            }
            _ => 0,
        };

        let instr_end = (site_file_offset + byte_len) as i64;
        let displacement = target.value() as i64 - (instr_end + adjustment) + load_address_delta as i64;

        if displacement.abs() >= X86_64_RIP_RELATIVE_LIMIT {
            return Err(KextError::LoadError(format!(
                "PC-relative displacement {displacement:#x} out of range"
            )));
        }
        displacement
    } else {
        (target.value() + load_address_delta) as i64
    };

    write_immediate(data, site_file_offset, byte_len, final_value)?;

    let disposition = match reloc.reloc_type() {
        X86_64_RELOC_UNSIGNED => Disposition::PreserveAsLocal,
        _ => Disposition::Consumed,
    };

    Ok((disposition, consumed_pair))
}

fn finish_subtractor(
    data: &mut [u8],
    site_file_offset: usize,
    byte_len: usize,
    target: Target,
    pair_target: Target,
) -> Result<Disposition> {
    let value = target.value() as i64 - pair_target.value() as i64;
    write_immediate(data, site_file_offset, byte_len, value)?;
    Ok(Disposition::Consumed)
}

fn write_immediate(data: &mut [u8], offset: usize, byte_len: usize, value: i64) -> Result<()> {
    match byte_len {
        4 => data.pwrite_with(value as i32, offset, LE)?,
        8 => data.pwrite_with(value, offset, LE)?,
        _ => unreachable!(),
    };
    Ok(())
}

/// Read the raw relocation table for a section (`sect.reloff`/`nreloc`).
pub fn read_relocations(data: &[u8], reloff: u32, nreloc: u32) -> Result<Vec<RelocationInfo>> {
    let mut out = Vec::with_capacity(nreloc as usize);
    let mut offset = reloff as usize;
    for _ in 0..nreloc {
        out.push(data.pread_with(offset, LE)?);
        offset += super::raw::size_of::<RelocationInfo>();
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_unsigned_absolute() {
        let mut data = vec![0u8; 16];
        let reloc = RelocationInfo::new(0, 0, false, 3, true, X86_64_RELOC_UNSIGNED);
        let (disp, paired) =
            process_relocation(&mut data, 0, &reloc, None, Target::Symbol(0x1234), 0).unwrap();
        assert_eq!(disp, Disposition::PreserveAsLocal);
        assert!(!paired);
        let value: u64 = data.pread_with(0, LE).unwrap();
        assert_eq!(value, 0x1234);
    }

    #[test]
    fn subtractor_uses_resolved_pair_target_not_its_symbol_index() {
        let mut data = vec![0u8; 16];
        // pc_relative=true so the SUBTRACTOR branch is taken; length=3 (64-bit).
        let reloc = RelocationInfo::new(0, 0, true, 3, true, X86_64_RELOC_SUBTRACTOR);
        let (disp, paired) = process_relocation(
            &mut data,
            0,
            &reloc,
            Some(Target::Symbol(0x2000)),
            Target::Symbol(0x3000),
            0,
        )
        .unwrap();
        assert_eq!(disp, Disposition::Consumed);
        assert!(paired);
        let value: i64 = data.pread_with(0, LE).unwrap();
        assert_eq!(value, 0x1000);
    }

    #[test]
    fn subtractor_without_pair_target_errors() {
        let mut data = vec![0u8; 16];
        let reloc = RelocationInfo::new(0, 0, true, 3, true, X86_64_RELOC_SUBTRACTOR);
        let result = process_relocation(&mut data, 0, &reloc, None, Target::Symbol(0x3000), 0);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_huge_pc_relative_displacement() {
        let mut data = vec![0u8; 16];
        let reloc = RelocationInfo::new(0, 0, true, 2, true, X86_64_RELOC_SIGNED);
        let result = process_relocation(
            &mut data,
            0,
            &reloc,
            None,
            Target::Symbol(0xFFFF_FFFF_0000),
            0,
        );
        assert!(result.is_err());
    }
}

//! Orchestrates one kext's link step: symbol-table
//! construction, relocation processing, vtable construction/patching,
//! `kmod_info` fixup, segment finalisation, and `__LINKEDIT` rebuild. The
//! individual passes live in their own modules; this ties them together in
//! the order the prelinked/KC contexts call them from `InjectKext`.

use super::consts::*;
use super::fixups::{insert_fixup, ChainedStarts};
use super::linkedit::{fixup_kmod_info, finalize_segments, install_linkedit, rebuild_linkedit, strip_load_commands};
use super::raw::{reloc_type::X86_64_RELOC_UNSIGNED, RelocationInfo};
use super::reloc::{process_relocation, read_relocations, Target};
use super::symbol::{build_linked_symbol_table, is_vtable_symbol, read_symbols, LinkedSymbolTable, LookupLevel, Symbol};
use super::vtable::{build_vtable, patch_vtable_against_super, LinkedVtable, PatchOutcome};
use super::ParsedMachO;
use crate::dependency::DependencyGraph;
use crate::error::{KextError, Result};
use scroll::{Pread, LE};

/// Everything a link pass needs to know about the kext beyond its raw bytes.
pub struct LinkRequest {
    pub load_address: u64,
    pub kmod_info_file_offset: Option<usize>,
}

/// Outcome of linking one kext: what the caller should fold into its
/// [`crate::dependency::KextRecord`].
pub struct LinkOutcome {
    pub symbols: LinkedSymbolTable,
    pub vtables: Vec<LinkedVtable>,
    pub new_logical_size: u64,
}

/// Link `data` (a standalone, already-expanded kext Mach-O image occupying
/// the whole buffer) against `graph`'s other kexts, `self_index` being this
/// kext's own (already-inserted, dependency-populated) record.
pub fn link_kext(
    data: &mut Vec<u8>,
    request: &LinkRequest,
    graph: &mut DependencyGraph,
    self_index: usize,
) -> Result<LinkOutcome> {
    let mut parsed = super::parse(data)?;
    let (_, symtab) = parsed
        .symtab
        .ok_or(KextError::LoadError("kext has no SYMTAB command".into()))?;

    let original_symbols = read_symbols(data, &symtab)?;

    process_relocations(data, &parsed, &original_symbols, graph, self_index, request.load_address)?;

    let linked_symbols = build_linked_symbol_table(original_symbols.clone(), |indirect_name| {
        graph
            .symbol_by_name(self_index, indirect_name, LookupLevel::AnyLevel)
            .map(|s| s.name)
    });
    graph.records[self_index].symbols = linked_symbols.clone();

    let vtables = link_vtables(data, &linked_symbols, graph, self_index)?;
    graph.records[self_index].vtables = vtables.clone();

    if let Some(kmod_offset) = request.kmod_info_file_offset {
        let total_vmsize: u64 = parsed.segments.iter().map(|s| s.command.vmsize).sum();
        fixup_kmod_info(data, kmod_offset, request.load_address, total_vmsize)?;
    }

    let new_logical_size = finalize_segments(data, &mut parsed, request.load_address)?;

    let local_relocs = collect_local_relocations(data, &parsed, &original_symbols, graph, self_index, request.load_address)?;

    let base_file_offset = parsed
        .segment(SEG_LINKEDIT)
        .map(|s| s.command.fileoff as u32)
        .unwrap_or(0);
    let strtab = data
        .get(symtab.stroff as usize..(symtab.stroff + symtab.strsize) as usize)
        .ok_or(KextError::LoadError("string table out of bounds".into()))?
        .to_vec();
    let layout = rebuild_linkedit(
        base_file_offset,
        linked_symbols.non_cxx(),
        linked_symbols.cxx(),
        &local_relocs,
        &strtab,
    )?;

    if let Some(linkedit) = parsed.segment(SEG_LINKEDIT) {
        let capacity = linkedit.command.filesize as usize;
        let (symtab_offset, _) = parsed.symtab.unwrap();
        let dysymtab_offset = parsed.dysymtab.map(|(o, _)| o);
        install_linkedit(
            data,
            symtab_offset,
            dysymtab_offset,
            linkedit.command.fileoff as usize,
            capacity,
            &layout,
        )?;
    }

    strip_load_commands(data, &mut parsed)?;

    Ok(LinkOutcome {
        symbols: linked_symbols,
        vtables,
        new_logical_size,
    })
}

/// Resolve one relocation's target the same way regardless of whether it's
/// the primary relocation in a pair or the `SUBTRACTOR` minuend: external
/// relocations resolve through the symbol table (chasing dependencies for
/// still-undefined symbols), local ones slide with their defining section.
fn resolve_target(
    reloc: &RelocationInfo,
    section_addr: u64,
    original_symbols: &[Symbol],
    graph: &mut DependencyGraph,
    self_index: usize,
    load_address: u64,
) -> Result<Target> {
    if reloc.is_extern() {
        let sym = original_symbols
            .get(reloc.symbol_num() as usize)
            .ok_or(KextError::LoadError("relocation symbol index out of range".into()))?;
        let resolved = if sym.is_undefined() {
            graph
                .symbol_by_name(self_index, &sym.name, LookupLevel::First)
                .map(|s| s.value)
                .ok_or_else(|| KextError::NotFound(sym.name.clone()))?
        } else {
            sym.value
        };
        Ok(Target::Symbol(resolved))
    } else {
        Ok(Target::Local(section_addr + load_address))
    }
}

fn process_relocations(
    data: &mut [u8],
    parsed: &ParsedMachO,
    original_symbols: &[Symbol],
    graph: &mut DependencyGraph,
    self_index: usize,
    load_address: u64,
) -> Result<()> {
    for seg in &parsed.segments {
        for (_, section) in &seg.sections {
            if section.nreloc == 0 {
                continue;
            }
            let relocs = read_relocations(data, section.reloff, section.nreloc)?;
            let mut i = 0;
            while i < relocs.len() {
                let reloc = relocs[i];
                let pair = relocs.get(i + 1).copied();

                let target = resolve_target(&reloc, section.addr, original_symbols, graph, self_index, load_address)?;

                let pair_target = if reloc.reloc_type() == super::raw::reloc_type::X86_64_RELOC_SUBTRACTOR {
                    let pair = pair.ok_or(KextError::LoadError("SUBTRACTOR relocation missing its pair".into()))?;
                    Some(resolve_target(&pair, section.addr, original_symbols, graph, self_index, load_address)?)
                } else {
                    None
                };

                let site_file_offset = (section.offset as i64 + reloc.r_address as i64) as usize;
                let (_, consumed_pair) =
                    process_relocation(data, site_file_offset, &reloc, pair_target, target, load_address)?;

                i += if consumed_pair { 2 } else { 1 };
            }
        }
    }
    Ok(())
}

/// Rebuild the set of local relocations the new `__LINKEDIT` must carry:
/// every `UNSIGNED`-family relocation, re-emitted with `SymbolNumber = 1`
/// ("slides with the first segment").
fn collect_local_relocations(
    data: &[u8],
    parsed: &ParsedMachO,
    original_symbols: &[Symbol],
    graph: &mut DependencyGraph,
    self_index: usize,
    load_address: u64,
) -> Result<Vec<RelocationInfo>> {
    let mut out = Vec::new();
    for seg in &parsed.segments {
        for (_, section) in &seg.sections {
            if section.nreloc == 0 {
                continue;
            }
            let relocs = read_relocations(data, section.reloff, section.nreloc)?;
            let mut i = 0;
            while i < relocs.len() {
                let reloc = relocs[i];
                let consumed_pair = reloc.reloc_type() == super::raw::reloc_type::X86_64_RELOC_SUBTRACTOR;

                if reloc.reloc_type() == X86_64_RELOC_UNSIGNED {
                    let target = if reloc.is_extern() {
                        original_symbols
                            .get(reloc.symbol_num() as usize)
                            .map(|s| s.value)
                            .unwrap_or(0)
                    } else {
                        section.addr + load_address
                    };
                    let _ = (graph, self_index, target);
                    out.push(RelocationInfo::new(reloc.r_address, 1, false, reloc.length(), false, X86_64_RELOC_UNSIGNED));
                }

                i += if consumed_pair { 2 } else { 1 };
            }
        }
    }
    let _ = data;
    Ok(out)
}

/// Build and patch every `__ZTV`-prefixed vtable in the kext, iterating
/// patch passes until all classes patch or a pass makes no progress.
fn link_vtables(
    data: &mut Vec<u8>,
    symbols: &LinkedSymbolTable,
    graph: &mut DependencyGraph,
    self_index: usize,
) -> Result<Vec<LinkedVtable>> {
    let vtable_symbols: Vec<&Symbol> = symbols.symbols.iter().filter(|s| is_vtable_symbol(&s.name)).collect();

    let mut built = Vec::new();
    for sym in &vtable_symbols {
        let file_offset = sym.value as usize;
        let vt = build_vtable(data, &sym.name, file_offset, |addr| {
            symbols.find_by_value(addr).map(|s| s.name.clone())
        })?;
        built.push(vt);
    }

    let smcp_symbols: Vec<&Symbol> = symbols
        .symbols
        .iter()
        .filter(|s| super::symbol::is_smcp_symbol(&s.name))
        .collect();

    let mut pending: Vec<usize> = (0..built.len()).collect();
    loop {
        let mut progressed = false;
        let mut still_pending = Vec::new();

        for &idx in &pending {
            let class_vtable_name = built[idx].name.clone();
            let Some(smcp) = smcp_symbols
                .iter()
                .find(|s| super::symbol::smcp_to_vtable_name(&s.name).as_deref() == Some(class_vtable_name.as_str()))
            else {
                // No metaclass pointer for this vtable; nothing to patch
                // against, leave as-is.
                continue;
            };
            let Some(super_name) = resolve_super_vtable_name(data, *smcp, symbols, graph, self_index)?
            else {
                still_pending.push(idx);
                continue;
            };
            let Some(super_vtable) = find_vtable(&built, &super_name).or_else(|| graph.vtable_by_name(self_index, &super_name)) else {
                still_pending.push(idx);
                continue;
            };

            let outcome = patch_vtable_against_super(
                &mut built[idx],
                data,
                &super_vtable,
                |_, entry| entry.name.is_some(),
                |entry| entry.address == 0,
            )?;

            match outcome {
                PatchOutcome::Patched => progressed = true,
                PatchOutcome::Deferred => still_pending.push(idx),
                PatchOutcome::ParentSlotIsPad => {
                    return Err(KextError::LoadError(format!(
                        "vtable '{class_vtable_name}' is binary-incompatible with its parent"
                    )))
                }
            }
        }

        if still_pending.is_empty() {
            break;
        }
        if !progressed && still_pending.len() == pending.len() {
            return Err(KextError::LoadError(
                "vtable patching made no progress across a full pass".into(),
            ));
        }
        pending = still_pending;
    }

    Ok(built)
}

fn find_vtable<'a>(built: &'a [LinkedVtable], name: &str) -> Option<LinkedVtable> {
    built.iter().find(|v| v.name == name).cloned()
}

/// `MachoGetClassNameFromSuperMetaClassPointer` + `MachoGetVtableNameFromClassName`:
/// a class's super-metaclass-pointer symbol's *data* (not its name) holds a
/// pointer to the superclass's own metaclass-pointer symbol. Dereference it,
/// resolve the symbol whose value matches, and derive that symbol's vtable
/// name — the super-class name can never be recovered from the subclass's
/// vtable name as plain text.
fn resolve_super_vtable_name(
    data: &[u8],
    smcp: &Symbol,
    symbols: &LinkedSymbolTable,
    graph: &mut DependencyGraph,
    self_index: usize,
) -> Result<Option<String>> {
    let pointee: u64 = data
        .pread_with(smcp.value as usize, LE)
        .map_err(|_| KextError::LoadError("super-metaclass-pointer symbol has no backing data".into()))?;

    let super_smcp_name = symbols
        .find_by_value(pointee)
        .map(|s| s.name.clone())
        .or_else(|| graph.symbol_by_value(self_index, pointee, LookupLevel::First).map(|s| s.name));

    Ok(super_smcp_name.and_then(|name| super::symbol::smcp_to_vtable_name(&name)))
}

#[allow(dead_code)]
fn seed_chain(starts: &mut ChainedStarts, data: &mut [u8], region_offset: usize, offset_in_region: u64, target: u64) -> Result<()> {
    insert_fixup(data, region_offset, starts, offset_in_region, target)
}

//! Symbol table construction, partitioning, and resolution.

use super::raw::{Nlist64, N_EXT, N_TYPE_MASK, N_SECT_TYPE};
use crate::error::{KextError, Result};
use scroll::{Pread, LE};

/// A resolved symbol-table entry: name, value, and the handful of `nlist`
/// bits later stages need (export-ness, section index).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub value: u64,
    pub n_type: u8,
    pub n_sect: u8,
    pub n_desc: u16,
}

impl Symbol {
    pub fn is_undefined(&self) -> bool {
        self.n_type & N_TYPE_MASK == 0 && self.n_sect == 0
    }

    pub fn is_defined_in_section(&self) -> bool {
        self.n_type & N_TYPE_MASK == N_SECT_TYPE
    }

    pub fn is_external(&self) -> bool {
        self.n_type & N_EXT != 0
    }
}

/// True for a mangled Itanium C++ symbol, Mach-O's `__Z` convention
/// (`MachoSymbolNameIsCxx`).
pub fn is_cxx_symbol(name: &str) -> bool {
    name.starts_with("__Z") || name.starts_with("_Z")
}

/// True for a vtable symbol (`__ZTV` prefix, `MachoSymbolNameIsVtable64`).
pub fn is_vtable_symbol(name: &str) -> bool {
    name.starts_with("__ZTV")
}

/// True for a super-metaclass-pointer symbol (`MachoSymbolNameIsSmcp64`).
/// OpenCore's convention is the mangled `__ZTVN6OSMetaClass...` style class
/// wrapper ending in the literal string `10gMetaClassE`; we key off the
/// textual suffix the same way the original derives class identity from
/// naming convention rather than DWARF.
pub fn is_smcp_symbol(name: &str) -> bool {
    name.starts_with("__ZTVN") && name.ends_with("10gMetaClassE")
}

/// Indirect symbol stub marker (`MachoSymbolNameIsIndirect`, roughly
/// `dyld_stub_binding_helper`-style indirection used by old-style kexts).
pub fn is_indirect_symbol(name: &str) -> bool {
    name.starts_with("__Z_OKCINDIRECT_")
}

/// Derive the class name from a super-metaclass-pointer symbol via a pure
/// text rewrite using the Mach-O reader's name helpers.
/// `__ZTVN6OSMetaClass...` style mangling is approximated here as the
/// embedded bundle class token between the `N` length prefix and
/// `10gMetaClassE`.
pub fn smcp_to_vtable_name(smcp: &str) -> Option<String> {
    if !is_smcp_symbol(smcp) {
        return None;
    }
    let inner = smcp.strip_prefix("__ZTVN")?.strip_suffix("10gMetaClassE")?;
    Some(format!("__ZTV{inner}E"))
}

/// Read the string table entry for `strx`.
fn read_cstr(strtab: &[u8], strx: u32) -> String {
    let start = strx as usize;
    if start >= strtab.len() {
        return String::new();
    }
    let end = strtab[start..]
        .iter()
        .position(|&b| b == 0)
        .map(|p| start + p)
        .unwrap_or(strtab.len());
    String::from_utf8_lossy(&strtab[start..end]).into_owned()
}

/// Read the raw symbol table for a `SYMTAB` command.
pub fn read_symbols(
    data: &[u8],
    symtab: &super::raw::SymtabCommand,
) -> Result<Vec<Symbol>> {
    let strtab = data
        .get(symtab.stroff as usize..(symtab.stroff + symtab.strsize) as usize)
        .ok_or_else(|| KextError::LoadError("string table out of bounds".into()))?;

    let mut out = Vec::with_capacity(symtab.nsyms as usize);
    let mut offset = symtab.symoff as usize;
    for _ in 0..symtab.nsyms {
        let nlist: Nlist64 = data.pread_with(offset, LE)?;
        out.push(Symbol {
            name: read_cstr(strtab, nlist.n_strx),
            value: nlist.n_value,
            n_type: nlist.n_type,
            n_sect: nlist.n_sect,
            n_desc: nlist.n_desc,
        });
        offset += super::raw::size_of::<Nlist64>();
    }
    Ok(out)
}

/// The partitioned, linked symbol table of a kext: the prefix holds
/// non-C++ symbols, the suffix C++ symbols; counts make both halves
/// addressable in O(1).
#[derive(Debug, Clone, Default)]
pub struct LinkedSymbolTable {
    pub symbols: Vec<Symbol>,
    pub number_of_symbols: usize,
    pub number_of_cxx_symbols: usize,
}

impl LinkedSymbolTable {
    pub fn non_cxx(&self) -> &[Symbol] {
        &self.symbols[..self.number_of_symbols - self.number_of_cxx_symbols]
    }

    pub fn cxx(&self) -> &[Symbol] {
        &self.symbols[self.number_of_symbols - self.number_of_cxx_symbols..]
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Symbol> {
        self.symbols.iter().find(|s| s.name == name)
    }

    pub fn find_by_value(&self, value: u64) -> Option<&Symbol> {
        self.symbols.iter().find(|s| s.value == value)
    }
}

/// Build the partitioned symbol table from a raw `nlist` array, dropping
/// undefined symbols (they are resolved later through dependencies) and
/// partitioning the remainder into non-C++/C++ halves.
///
/// `resolve_indirect` is called for any symbol whose name matches
/// [`is_indirect_symbol`]; it should look the stub's real target name up in
/// the dependency closure.
pub fn build_linked_symbol_table(
    raw: Vec<Symbol>,
    mut resolve_indirect: impl FnMut(&str) -> Option<String>,
) -> LinkedSymbolTable {
    let mut non_cxx = Vec::new();
    let mut cxx = Vec::new();

    for mut sym in raw {
        if sym.is_undefined() {
            continue;
        }
        if is_indirect_symbol(&sym.name) {
            if let Some(target) = resolve_indirect(&sym.name) {
                sym.name = target;
            }
        }
        if is_cxx_symbol(&sym.name) {
            cxx.push(sym);
        } else {
            non_cxx.push(sym);
        }
    }

    let number_of_symbols = non_cxx.len() + cxx.len();
    let number_of_cxx_symbols = cxx.len();

    let mut symbols = non_cxx;
    symbols.extend(cxx);

    LinkedSymbolTable {
        symbols,
        number_of_symbols,
        number_of_cxx_symbols,
    }
}

/// Symbol-lookup depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupLevel {
    /// Search the direct dependency level in full, then stop — never
    /// recurse into indirect (grandchild) dependencies.
    First,
    /// Search the full symbol table at every level, recursing into
    /// indirect dependencies.
    AnyLevel,
    /// C++ half only, at any depth.
    OnlyCxx,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partitions_cxx_last() {
        let raw = vec![
            Symbol {
                name: "_start".into(),
                value: 1,
                n_type: N_SECT_TYPE,
                n_sect: 1,
                n_desc: 0,
            },
            Symbol {
                name: "__ZN5Thing3runEv".into(),
                value: 2,
                n_type: N_SECT_TYPE,
                n_sect: 1,
                n_desc: 0,
            },
            Symbol {
                name: "_stop".into(),
                value: 3,
                n_type: N_SECT_TYPE,
                n_sect: 1,
                n_desc: 0,
            },
        ];
        let table = build_linked_symbol_table(raw, |_| None);
        assert_eq!(table.number_of_symbols, 3);
        assert_eq!(table.number_of_cxx_symbols, 1);
        assert!(table.non_cxx().iter().all(|s| !is_cxx_symbol(&s.name)));
        assert!(table.cxx().iter().all(|s| is_cxx_symbol(&s.name)));
    }

    #[test]
    fn drops_undefined_symbols() {
        let raw = vec![Symbol {
            name: "_undef".into(),
            value: 0,
            n_type: 0,
            n_sect: 0,
            n_desc: 0,
        }];
        let table = build_linked_symbol_table(raw, |_| None);
        assert_eq!(table.number_of_symbols, 0);
    }

    #[test]
    fn smcp_name_derivation() {
        let smcp = "__ZTVN6Driver10gMetaClassE";
        assert!(is_smcp_symbol(smcp));
        assert_eq!(smcp_to_vtable_name(smcp).as_deref(), Some("__ZTV6DriverE"));
    }
}

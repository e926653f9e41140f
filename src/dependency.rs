//! Kext record and the dependency-closure BFS shared by symbol/vtable
//! resolution.

use crate::ident::KextIdentifier;
use crate::macho::symbol::{LinkedSymbolTable, LookupLevel, Symbol};
use crate::macho::vtable::LinkedVtable;
use smallvec::SmallVec;

use crate::macho::consts::MAX_KEXT_DEPENDENCIES;

/// In-memory kext record. Generic over how the Mach-O view is
/// stored so contexts can either own a private `Vec<u8>` copy (injected
/// kexts) or borrow a slice of the shared container buffer (built-in
/// kexts in the prelinked/KC path).
pub struct KextRecord {
    pub identifier: KextIdentifier,
    pub compatible_version: String,
    /// Virtual base address the kext is (or will be) loaded at.
    pub virtual_base: u64,
    /// Virtual address of this kext's `kmod_info` structure.
    pub kmod_info_addr: u64,
    /// Resolved dependencies, bounded fan-out.
    pub dependencies: SmallVec<[usize; MAX_KEXT_DEPENDENCIES]>,
    pub symbols: LinkedSymbolTable,
    pub vtables: Vec<LinkedVtable>,
    /// BFS visit mark, reset at each outer-call boundary.
    pub processed: bool,
}

impl KextRecord {
    pub fn new(identifier: KextIdentifier, compatible_version: impl Into<String>) -> Self {
        Self {
            identifier,
            compatible_version: compatible_version.into(),
            virtual_base: 0,
            kmod_info_addr: 0,
            dependencies: SmallVec::new(),
            symbols: LinkedSymbolTable::default(),
            vtables: Vec::new(),
            processed: false,
        }
    }
}

/// Dependency closure over a flat `Vec<KextRecord>`, addressed by index
/// (mirrors the original's intrusive linked lists, collapsed into a single
/// owned slice rather than modeled as dynamic-style polymorphism).
pub struct DependencyGraph<'a> {
    pub records: &'a mut [KextRecord],
}

impl<'a> DependencyGraph<'a> {
    fn clear_processed(&mut self) {
        for r in self.records.iter_mut() {
            r.processed = false;
        }
    }

    /// `GetSymbolByName`: BFS over `kext`'s dependencies, `level`-gated.
    pub fn symbol_by_name(&mut self, kext: usize, name: &str, level: LookupLevel) -> Option<Symbol> {
        self.clear_processed();
        self.records[kext].processed = true;
        self.bfs_name(kext, name, level, true)
    }

    fn bfs_name(
        &mut self,
        kext: usize,
        name: &str,
        level: LookupLevel,
        is_direct_level: bool,
    ) -> Option<Symbol> {
        let deps: SmallVec<[usize; MAX_KEXT_DEPENDENCIES]> = self.records[kext].dependencies.clone();

        for dep in deps {
            if self.records[dep].processed {
                continue;
            }
            self.records[dep].processed = true;

            let search_full = is_direct_level || level == LookupLevel::AnyLevel;

            let found = if search_full {
                self.records[dep].symbols.find_by_name(name).cloned()
            } else {
                self.records[dep]
                    .symbols
                    .cxx()
                    .iter()
                    .find(|s| s.name == name)
                    .cloned()
            };

            if found.is_some() {
                return found;
            }

            if level == LookupLevel::AnyLevel {
                if let Some(sym) = self.bfs_name(dep, name, level, false) {
                    return Some(sym);
                }
            }
        }
        None
    }

    /// `GetSymbolByValue`: mirror image of `symbol_by_name`, used by the
    /// vtable patcher to recover a slot's symbol name from its address.
    pub fn symbol_by_value(&mut self, kext: usize, value: u64, level: LookupLevel) -> Option<Symbol> {
        self.clear_processed();
        self.records[kext].processed = true;
        self.bfs_value(kext, value, level, true)
    }

    fn bfs_value(
        &mut self,
        kext: usize,
        value: u64,
        level: LookupLevel,
        is_direct_level: bool,
    ) -> Option<Symbol> {
        let deps: SmallVec<[usize; MAX_KEXT_DEPENDENCIES]> = self.records[kext].dependencies.clone();

        for dep in deps {
            if self.records[dep].processed {
                continue;
            }
            self.records[dep].processed = true;

            let search_full = is_direct_level || level == LookupLevel::AnyLevel;

            let found = if search_full {
                self.records[dep].symbols.find_by_value(value).cloned()
            } else {
                self.records[dep]
                    .symbols
                    .cxx()
                    .iter()
                    .find(|s| s.value == value)
                    .cloned()
            };

            if found.is_some() {
                return found;
            }

            if level == LookupLevel::AnyLevel {
                if let Some(sym) = self.bfs_value(dep, value, level, false) {
                    return Some(sym);
                }
            }
        }
        None
    }

    /// Find a vtable by name anywhere in the dependency closure (used to
    /// look up a super-vtable while patching).
    pub fn vtable_by_name(&mut self, kext: usize, name: &str) -> Option<LinkedVtable> {
        self.clear_processed();
        self.records[kext].processed = true;
        self.bfs_vtable(kext, name)
    }

    fn bfs_vtable(&mut self, kext: usize, name: &str) -> Option<LinkedVtable> {
        let deps: SmallVec<[usize; MAX_KEXT_DEPENDENCIES]> = self.records[kext].dependencies.clone();
        for dep in deps {
            if self.records[dep].processed {
                continue;
            }
            self.records[dep].processed = true;

            if let Some(vt) = self.records[dep].vtables.iter().find(|v| v.name == name) {
                return Some(vt.clone());
            }
            if let Some(vt) = self.bfs_vtable(dep, name) {
                return Some(vt);
            }
        }
        None
    }
}

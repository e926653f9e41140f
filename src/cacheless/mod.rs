//! Cacheless context: the boot mode where the kernel reads kexts directly
//! out of `/System/Library/Extensions`, with no prelinked
//! cache in play. Unlike the other three contexts this one never produces
//! a container — it produces a virtual filesystem overlay the bootloader
//! substitutes for the real Extensions directory handle.

pub mod vfs;

use crate::error::{KextError, Result};
use crate::macho::consts::{KEY_BUNDLE_EXECUTABLE, KEY_BUNDLE_REQUIRED};
use crate::patcher::GenericPatch;
use crate::plist_ext;
use crate::storage::Storage;
use crate::version::DarwinVersion;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const VIRTUAL_BUNDLE_PREFIX: &str = "Oc";
const VIRTUAL_BUNDLE_SUFFIX: &str = ".kext";

/// One kext the caller asked to inject, keyed by its generated on-disk name
/// once `OverlayExtensionsDir` is first called.
pub struct InjectedKext {
    pub identifier: String,
    pub bundle_name: Option<String>,
    pub info_plist: plist::Dictionary,
    pub executable: Option<Vec<u8>>,
}

/// A queued patch or quirk against a bundle identifier, plus a block
/// request — all resolved lazily against the real tree in `HookBuiltin`.
enum PendingOp {
    Patch(GenericPatch),
    Block,
}

/// A built-in bundle discovered by `ScanExtensions`.
#[derive(Debug, Clone)]
struct BuiltinKext {
    identifier: String,
    plist_path: PathBuf,
    binary_path: Option<PathBuf>,
    dependencies: Vec<String>,
    patch_valid_os_bundle_required: bool,
}

pub struct CachelessContext<S: Storage> {
    storage: S,
    extensions_dir: PathBuf,
    kernel_version: DarwinVersion,
    is32bit: bool,
    injected: Vec<InjectedKext>,
    pending: HashMap<String, Vec<PendingOp>>,
    builtins: Option<Vec<BuiltinKext>>,
    next_virtual_index: u32,
}

impl<S: Storage> CachelessContext<S> {
    /// *Init*: record inputs, initialise empty lists. `builtins` is
    /// populated lazily by `HookBuiltin`'s first call to `ScanExtensions`.
    pub fn init(storage: S, extensions_dir: impl Into<PathBuf>, kernel_version: DarwinVersion, is32bit: bool) -> Self {
        Self {
            storage,
            extensions_dir: extensions_dir.into(),
            kernel_version,
            is32bit,
            injected: Vec::new(),
            pending: HashMap::new(),
            builtins: None,
            next_virtual_index: 0,
        }
    }

    /// *AddKext*: parse the plist, force `OSBundleRequired` to `"Root"`
    /// when it names `"Safe Boot"` or is absent, and queue the kext.
    pub fn add_kext(&mut self, mut info_plist: plist::Dictionary, executable: Option<Vec<u8>>) -> Result<()> {
        let identifier = plist_ext::get_str(&info_plist, crate::macho::consts::KEY_BUNDLE_IDENTIFIER)?.to_owned();

        match info_plist.get(KEY_BUNDLE_REQUIRED).and_then(|v| v.as_string()) {
            Some("Safe Boot") | None => {
                info_plist.insert(KEY_BUNDLE_REQUIRED.to_owned(), plist::Value::String("Root".to_owned()));
            }
            _ => {}
        }

        log::debug!("cacheless: queued injected kext {identifier}");
        self.injected.push(InjectedKext {
            identifier,
            bundle_name: None,
            info_plist,
            executable,
        });
        Ok(())
    }

    /// *AddPatch*: queue a generic byte patch against a bundle identifier,
    /// resolved lazily once `HookBuiltin` scans the real tree.
    pub fn add_patch(&mut self, identifier: &str, patch: GenericPatch) {
        self.pending.entry(identifier.to_owned()).or_default().push(PendingOp::Patch(patch));
    }

    /// *AddQuirk*: queue a named quirk, resolved through the process-wide
    /// quirk table.
    pub fn add_quirk(&mut self, quirk_id: &str) -> Result<()> {
        let quirk = crate::quirks::find_quirk(quirk_id).ok_or_else(|| KextError::NotFound(quirk_id.to_owned()))?;
        self.pending
            .entry(quirk.target_identifier.to_owned())
            .or_default()
            .push(PendingOp::Patch((quirk.build)()));
        Ok(())
    }

    /// *Block*: queue a block request ("make `start` return failure") for
    /// a bundle identifier.
    pub fn block(&mut self, identifier: &str) {
        self.pending.entry(identifier.to_owned()).or_default().push(PendingOp::Block);
    }

    /// Assign `OcXXXXXXXX.kext` names to any injected kext that doesn't
    /// have one yet, probing increasing hex indices against the real
    /// directory so generated names never collide with it.
    fn assign_virtual_names(&mut self) -> Result<()> {
        for i in 0..self.injected.len() {
            if self.injected[i].bundle_name.is_some() {
                continue;
            }
            loop {
                let candidate = format!("{VIRTUAL_BUNDLE_PREFIX}{:08X}{VIRTUAL_BUNDLE_SUFFIX}", self.next_virtual_index);
                debug_assert_eq!(candidate.len(), 15, "virtual bundle name must be exactly 15 characters");
                let probe = self.extensions_dir.join(&candidate);
                self.next_virtual_index = self
                    .next_virtual_index
                    .checked_add(1)
                    .ok_or(KextError::DeviceError)?;
                if !self.storage.exists(&probe) {
                    self.injected[i].bundle_name = Some(candidate);
                    break;
                }
            }
        }
        Ok(())
    }

    /// *OverlayExtensionsDir*: on first call, build the merged directory
    /// listing (real entries plus one synthesised entry per injected
    /// kext).
    pub fn overlay_extensions_dir(&mut self) -> Result<Vec<String>> {
        self.assign_virtual_names()?;

        let mut names: Vec<String> = self
            .storage
            .read_dir(&self.extensions_dir)
            .map_err(|e| KextError::LoadError(e.to_string()))?
            .into_iter()
            .filter(|e| e.is_dir)
            .map(|e| e.name)
            .collect();

        for kext in &self.injected {
            names.push(kext.bundle_name.clone().expect("assigned above"));
        }

        Ok(names)
    }

    /// *PerformInject*: resolve a path inside an `OcXXXXXXXX.kext` virtual
    /// bundle into a virtual node.
    pub fn perform_inject(&self, path: &str) -> Result<vfs::VirtualNode> {
        let (bundle_name, rest) = vfs::split_bundle_path(path).ok_or_else(|| KextError::NotFound(path.to_owned()))?;
        let kext = self
            .injected
            .iter()
            .find(|k| k.bundle_name.as_deref() == Some(bundle_name))
            .ok_or_else(|| KextError::NotFound(bundle_name.to_owned()))?;

        vfs::resolve_injected_path(rest, &kext.info_plist, kext.executable.as_deref())
    }

    /// *HookBuiltin*: called on every real-tree file open. Lazily scans
    /// the real Extensions directory on first use, marks the dependency
    /// closure of every pending patch/quirk/block target, and from then
    /// on redirects matched plist/binary opens through a virtual node.
    pub fn hook_builtin(&mut self, path: &str, real_file: &[u8]) -> Result<Option<vfs::VirtualNode>> {
        if self.builtins.is_none() {
            self.scan_extensions()?;
            self.mark_patch_closures();
        }

        let Some(builtins) = &self.builtins else {
            return Ok(None);
        };

        let Some(builtin) = builtins
            .iter()
            .find(|b| b.plist_path == Path::new(path) || b.binary_path.as_deref() == Some(Path::new(path)))
        else {
            return Ok(None);
        };

        if !builtin.patch_valid_os_bundle_required {
            return Ok(None);
        }

        if builtin.plist_path == Path::new(path) {
            let mut dict = plist_ext::parse(real_file)?
                .into_dictionary()
                .ok_or_else(|| KextError::LoadError("builtin Info.plist is not a dictionary".into()))?;
            dict.insert(KEY_BUNDLE_REQUIRED.to_owned(), plist::Value::String("Root".to_owned()));
            return Ok(Some(vfs::VirtualNode::File(plist_ext::serialize(&plist::Value::Dictionary(dict))?)));
        }

        let mut patched = real_file.to_vec();
        if let Some(ops) = self.pending.get(&builtin.identifier) {
            let mut patcher = crate::patcher::Patcher::init_from_buffer(&mut patched)?;
            for op in ops {
                match op {
                    PendingOp::Patch(patch) => {
                        if let Err(e) = patcher.apply_generic_patch(patch, &[]) {
                            log::warn!("patch on built-in kext {} failed, skipping: {e}", builtin.identifier);
                        }
                    }
                    PendingOp::Block => {
                        // Block requires a kmod_info file offset, which HookBuiltin
                        // does not resolve for built-ins without a prior link pass;
                        // callers needing Block on a built-in should use ApplyQuirk's
                        // block-stub patch instead.
                        log::warn!("Block is not supported via HookBuiltin for {}", builtin.identifier);
                    }
                }
            }
        }

        Ok(Some(vfs::VirtualNode::File(patched)))
    }

    fn scan_extensions(&mut self) -> Result<()> {
        let mut builtins = Vec::new();
        self.scan_extensions_dir(&self.extensions_dir.clone(), &mut builtins, 0)?;
        log::debug!("cacheless: scanned {} built-in kexts", builtins.len());
        self.builtins = Some(builtins);
        Ok(())
    }

    fn scan_extensions_dir(&self, dir: &Path, out: &mut Vec<BuiltinKext>, depth: u32) -> Result<()> {
        let entries = self.storage.read_dir(dir).map_err(|e| KextError::LoadError(e.to_string()))?;
        for entry in entries {
            if !entry.is_dir || !entry.name.ends_with(".kext") {
                continue;
            }
            let bundle_dir = dir.join(&entry.name);
            let plist_path = bundle_dir.join("Contents/Info.plist");
            let Ok(plist_bytes) = self.storage.read_file(&plist_path) else {
                continue;
            };
            let Ok(dict) = plist_ext::parse(&plist_bytes).and_then(|v| {
                v.into_dictionary().ok_or(crate::error::PlistAccessError::WrongType("Info.plist"))
            }) else {
                continue;
            };
            let Ok(identifier) = plist_ext::get_str(&dict, crate::macho::consts::KEY_BUNDLE_IDENTIFIER) else {
                continue;
            };

            let binary_path = dict
                .get(KEY_BUNDLE_EXECUTABLE)
                .and_then(|v| v.as_string())
                .map(|exe| bundle_dir.join("Contents/MacOS").join(exe));

            out.push(BuiltinKext {
                identifier: identifier.to_owned(),
                plist_path,
                binary_path,
                dependencies: plist_ext::dependency_identifiers(&dict),
                patch_valid_os_bundle_required: false,
            });

            if depth == 0 {
                let plugins_dir = bundle_dir.join("Contents/PlugIns");
                if self.storage.exists(&plugins_dir) {
                    self.scan_extensions_dir(&plugins_dir, out, depth + 1)?;
                }
            }
        }
        Ok(())
    }

    /// Mark every pending-op target and its full dependency closure, using
    /// the `processed`-flag BFS pattern shared with `DependencyGraph`.
    /// Bundle dependency graphs can be cyclic, so cycles are broken by the
    /// same visited-flag guard rather than assumed away.
    fn mark_patch_closures(&mut self) {
        let Some(builtins) = &mut self.builtins else { return };
        let mut queue: Vec<String> = self.pending.keys().cloned().collect();
        let mut processed = vec![false; builtins.len()];

        while let Some(identifier) = queue.pop() {
            let Some(idx) = builtins.iter().position(|b| b.identifier == identifier) else {
                continue;
            };
            if processed[idx] {
                continue;
            }
            processed[idx] = true;
            builtins[idx].patch_valid_os_bundle_required = true;
            queue.extend(builtins[idx].dependencies.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemFs;

    fn sample_plist(identifier: &str, required: Option<&str>) -> plist::Dictionary {
        let mut dict = plist::Dictionary::new();
        dict.insert("CFBundleIdentifier".to_owned(), plist::Value::String(identifier.to_owned()));
        if let Some(required) = required {
            dict.insert(KEY_BUNDLE_REQUIRED.to_owned(), plist::Value::String(required.to_owned()));
        }
        dict
    }

    #[test]
    fn add_kext_rewrites_safe_boot_to_root() {
        let mut ctx = CachelessContext::init(MemFs::new(), "/Extensions", DarwinVersion::new(20, 0, 0), false);
        ctx.add_kext(sample_plist("com.example.test", Some("Safe Boot")), None).unwrap();
        let kext = &ctx.injected[0];
        assert_eq!(kext.info_plist.get(KEY_BUNDLE_REQUIRED).unwrap().as_string(), Some("Root"));
    }

    #[test]
    fn add_kext_without_required_key_defaults_to_root() {
        let mut ctx = CachelessContext::init(MemFs::new(), "/Extensions", DarwinVersion::new(20, 0, 0), false);
        ctx.add_kext(sample_plist("com.example.test", None), None).unwrap();
        assert_eq!(
            ctx.injected[0].info_plist.get(KEY_BUNDLE_REQUIRED).unwrap().as_string(),
            Some("Root")
        );
    }

    #[test]
    fn overlay_assigns_sequential_virtual_names() {
        let mut fs = MemFs::new();
        fs.add_dir("/Extensions");
        let mut ctx = CachelessContext::init(fs, "/Extensions", DarwinVersion::new(20, 0, 0), false);
        ctx.add_kext(sample_plist("com.example.one", None), None).unwrap();
        ctx.add_kext(sample_plist("com.example.two", None), None).unwrap();

        let names = ctx.overlay_extensions_dir().unwrap();
        assert!(names.contains(&"Oc00000000.kext".to_owned()));
        assert!(names.contains(&"Oc00000001.kext".to_owned()));
    }

    #[test]
    fn perform_inject_returns_verbatim_plist() {
        let mut fs = MemFs::new();
        fs.add_dir("/Extensions");
        let mut ctx = CachelessContext::init(fs, "/Extensions", DarwinVersion::new(20, 0, 0), false);
        ctx.add_kext(sample_plist("com.example.one", None), None).unwrap();
        ctx.overlay_extensions_dir().unwrap();

        let node = ctx.perform_inject("Oc00000000.kext/Contents/Info.plist").unwrap();
        match node {
            vfs::VirtualNode::File(bytes) => {
                let parsed = plist_ext::parse(&bytes).unwrap();
                assert_eq!(
                    parsed.as_dictionary().unwrap().get("CFBundleIdentifier").unwrap().as_string(),
                    Some("com.example.one")
                );
            }
            vfs::VirtualNode::Directory(_) => panic!("expected a file node"),
        }
    }
}

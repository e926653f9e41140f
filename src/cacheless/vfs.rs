//! Virtual filesystem nodes served by the cacheless overlay's
//! `PerformInject`. An injected kext's `Contents`/`Contents/MacOS`
//! directories and `Info.plist`/binary files are synthesised entirely
//! in memory, wrapping the buffers the caller handed to `AddKext`.

use crate::error::{KextError, Result};
use crate::plist_ext;

/// A node the virtual filesystem can hand back to the bootloader.
#[derive(Debug, Clone)]
pub enum VirtualNode {
    Directory(Vec<String>),
    File(Vec<u8>),
}

/// Split `"OcXXXXXXXX.kext/Contents/..."` into the bundle name and the
/// remainder of the path (empty string if the bundle itself was opened).
pub fn split_bundle_path(path: &str) -> Option<(&str, &str)> {
    let path = path.trim_start_matches('/');
    let (bundle, rest) = match path.find('/') {
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => (path, ""),
    };
    if !bundle.ends_with(".kext") {
        return None;
    }
    Some((bundle, rest))
}

/// Resolve a path relative to an injected kext's bundle root into a
/// virtual directory or file node.
pub fn resolve_injected_path(rest: &str, info_plist: &plist::Dictionary, executable: Option<&[u8]>) -> Result<VirtualNode> {
    match rest {
        "" => Ok(VirtualNode::Directory(vec!["Contents".to_owned()])),
        "Contents" => {
            let mut entries = vec!["Info.plist".to_owned()];
            if executable.is_some() {
                entries.push("MacOS".to_owned());
            }
            Ok(VirtualNode::Directory(entries))
        }
        "Contents/MacOS" if executable.is_some() => {
            let name = info_plist
                .get(crate::macho::consts::KEY_BUNDLE_EXECUTABLE)
                .and_then(|v| v.as_string())
                .unwrap_or("Unknown")
                .to_owned();
            Ok(VirtualNode::Directory(vec![name]))
        }
        "Contents/Info.plist" => {
            let serialized = plist_ext::serialize(&plist::Value::Dictionary(info_plist.clone()))?;
            Ok(VirtualNode::File(serialized))
        }
        path if executable.is_some() && path.starts_with("Contents/MacOS/") => {
            Ok(VirtualNode::File(executable.unwrap().to_vec()))
        }
        other => Err(KextError::NotFound(other.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_bundle_and_remainder() {
        assert_eq!(split_bundle_path("Oc00000000.kext/Contents/Info.plist"), Some(("Oc00000000.kext", "Contents/Info.plist")));
        assert_eq!(split_bundle_path("Oc00000000.kext"), Some(("Oc00000000.kext", "")));
    }

    #[test]
    fn non_kext_path_is_none() {
        assert_eq!(split_bundle_path("SomeOtherDir/file"), None);
    }

    #[test]
    fn resolves_contents_listing_with_and_without_binary() {
        let dict = plist::Dictionary::new();
        let VirtualNode::Directory(entries) = resolve_injected_path("Contents", &dict, None).unwrap() else {
            panic!("expected directory")
        };
        assert_eq!(entries, vec!["Info.plist".to_owned()]);

        let VirtualNode::Directory(entries) = resolve_injected_path("Contents", &dict, Some(&[1, 2, 3])).unwrap() else {
            panic!("expected directory")
        };
        assert!(entries.contains(&"MacOS".to_owned()));
    }
}

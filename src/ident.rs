//! Kext identifier (`CFBundleIdentifier`): an ASCII reverse-DNS string that
//! keys the global namespace of injected, built-in, and dependency kexts.

use std::borrow::Borrow;
use std::fmt;

/// A validated `CFBundleIdentifier`, e.g. `com.apple.kpi.libkern`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KextIdentifier(String);

impl KextIdentifier {
    /// Synthetic identifier assigned to the pseudo-kext representing the
    /// kernel itself inside a prelinked/KC container.
    pub const KERNEL_PSEUDO: &'static str = "__kernel__";

    pub fn new(s: impl Into<String>) -> Result<Self, InvalidIdentifier> {
        let s = s.into();
        if s.is_empty() || !s.is_ascii() || !s.bytes().all(|b| b != 0) {
            return Err(InvalidIdentifier(s));
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KextIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for KextIdentifier {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for KextIdentifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid kext identifier '{0}'")]
pub struct InvalidIdentifier(String);

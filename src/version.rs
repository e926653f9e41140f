//! Darwin kernel version parsing.
//!
//! The kernel version string (`uname -r` style, e.g. `20.4.0`) gates a
//! handful of decisions in the cacheless and KXLD-state paths: whether the
//! kernel collection format is in play (Darwin 20+, macOS 11 Big Sur), and
//! whether a given quirk or `OSBundleRequired` rewrite applies.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Darwin major.minor.patch kernel version, e.g. `20.4.0` for macOS 11.2.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DarwinVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl DarwinVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Darwin 20 is the first version to use kernel collections by default.
    pub const KERNEL_COLLECTIONS_MIN: Self = Self::new(20, 0, 0);

    /// Darwin 10 (Snow Leopard, 10.6) is the last version to carry the
    /// 10.6.8-era KXLD link-state blob alongside the prelinked kernel.
    pub const KXLD_STATE_MAX: Self = Self::new(10, 8, 0);

    pub fn supports_kernel_collections(self) -> bool {
        self >= Self::KERNEL_COLLECTIONS_MIN
    }

    pub fn uses_kxld_state(self) -> bool {
        self <= Self::KXLD_STATE_MAX
    }
}

impl fmt::Display for DarwinVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Error returned when a kernel version string cannot be parsed.
#[derive(Debug, thiserror::Error)]
#[error("malformed Darwin kernel version '{0}'")]
pub struct ParseVersionError(String);

impl FromStr for DarwinVersion {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '.');
        let parse_part = |p: Option<&str>| -> Option<u32> { p?.parse().ok() };

        let major = parse_part(parts.next()).ok_or_else(|| ParseVersionError(s.to_owned()))?;
        let minor = parse_part(parts.next()).unwrap_or(0);
        let patch = parse_part(parts.next()).unwrap_or(0);

        Ok(Self {
            major,
            minor,
            patch,
        })
    }
}

// Manual Ord derive would already do this lexicographically on the
// (major, minor, patch) tuple; kept explicit for clarity at call sites.
impl DarwinVersion {
    pub fn cmp_tuple(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }
}

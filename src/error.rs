//! Flat result type shared by every context, mirroring the outcome
//! enumeration a caller (the bootloader) is expected to switch on.

use thiserror::Error;

/// Top level result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, KextError>;

/// Flat outcome enumeration. Every fallible operation in this crate
/// resolves into one of these variants (or `Ok`, standing in for the
/// `Success` outcome from the design document).
#[derive(Debug, Error)]
pub enum KextError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("out of resources: {0}")]
    OutOfResources(&'static str),

    #[error("buffer too small: needed {needed} bytes, had {available}")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    #[error("Mach-O load error: {0}")]
    LoadError(String),

    #[error("kext '{0}' is already present")]
    AlreadyStarted(String),

    #[error("virtual name space exhausted")]
    DeviceError,

    #[error(transparent)]
    Plist(#[from] PlistAccessError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Scroll(#[from] scroll::Error),

    #[error(transparent)]
    InvalidIdentifier(#[from] crate::ident::InvalidIdentifier),
}

/// Errors produced by the typed-accessor layer over [`plist::Value`].
#[derive(Debug, Error)]
pub enum PlistAccessError {
    #[error("plist key '{0}' is missing")]
    MissingKey(&'static str),

    #[error("plist key '{0}' has the wrong type")]
    WrongType(&'static str),

    #[error("malformed hex-encoded integer '{0}'")]
    MalformedHexInteger(String),

    #[error(transparent)]
    Plist(#[from] plist::Error),
}

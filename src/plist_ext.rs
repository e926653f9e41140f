//! Typed accessors over [`plist::Value`], plus the hex-ASCII integer
//! encoding the kernel-cache plist dialect uses for every integer value
//! (`_PrelinkExecutableLoadAddr`, `_MKEXTExecutable`, …).

use crate::error::PlistAccessError as Error;
use plist::{Dictionary, Value};

/// Decode a lowercase-hex-ASCII integer string, e.g. `"ffffff8002a00000"`.
pub fn parse_hex_integer(s: &str) -> Result<u64, Error> {
    u64::from_str_radix(s.trim_start_matches("0x"), 16)
        .map_err(|_| Error::MalformedHexInteger(s.to_owned()))
}

/// Encode an integer as the lowercase-hex-ASCII string the plist dialect
/// expects.
pub fn format_hex_integer(v: u64) -> String {
    format!("{v:x}")
}

/// Fetch a string field from a dictionary.
pub fn get_str<'a>(dict: &'a Dictionary, key: &'static str) -> Result<&'a str, Error> {
    dict.get(key)
        .ok_or(Error::MissingKey(key))?
        .as_string()
        .ok_or(Error::WrongType(key))
}

/// Fetch an optional string field from a dictionary.
pub fn get_str_opt<'a>(dict: &'a Dictionary, key: &'static str) -> Option<&'a str> {
    dict.get(key).and_then(Value::as_string)
}

/// Fetch a hex-ASCII-integer field, stored as a plist string.
pub fn get_hex_integer(dict: &Dictionary, key: &'static str) -> Result<u64, Error> {
    parse_hex_integer(get_str(dict, key)?)
}

/// Fetch the array field under `key`.
pub fn get_array<'a>(dict: &'a Dictionary, key: &'static str) -> Result<&'a Vec<Value>, Error> {
    dict.get(key)
        .ok_or(Error::MissingKey(key))?
        .as_array()
        .ok_or(Error::WrongType(key))
}

/// Insert a hex-ASCII-integer field.
pub fn set_hex_integer(dict: &mut Dictionary, key: &'static str, value: u64) {
    dict.insert(key.to_owned(), Value::String(format_hex_integer(value)));
}

/// Parse a plist document out of a byte slice.
pub fn parse(bytes: &[u8]) -> Result<Value, Error> {
    Ok(Value::from_reader(std::io::Cursor::new(bytes))?)
}

/// Serialize a plist document as binary plist, OpenCore's on-disk dialect.
pub fn serialize(value: &Value) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    value.to_writer_binary(&mut out)?;
    Ok(out)
}

/// `OSBundleLibraries` read as an iterator of dependency identifiers.
pub fn dependency_identifiers(dict: &Dictionary) -> Vec<String> {
    dict.get("OSBundleLibraries")
        .and_then(Value::as_dictionary)
        .map(|deps| deps.keys().cloned().collect())
        .unwrap_or_default()
}

//! Order-preserving key encoding
//!
//! Two encodings live here:
//!
//! - **tuple components**: a byte string with every `0x00` escaped as
//!   `0x00 0xFF` and terminated by `0x00 0x00`. Concatenated components sort
//!   exactly like the tuples they encode, so `(index, value, row_hash)` keys
//!   range-scan by `value` and the fixed-width `row_hash` suffix never
//!   reorders them.
//! - **paths**: root-relative path components joined by a single `0x00`.
//!   File names never contain NUL, so a directory's descendants sort directly
//!   after it and the whole subtree of key `k` is `[k, k ‖ 0x01)`.

use std::borrow::Cow;
use std::ffi::{OsStr, OsString};
use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

const ESCAPE: u8 = 0xFF;
const TERMINATOR: u8 = 0x00;
const SEPARATOR: u8 = 0x00;

/// Append one tuple component to `out`.
pub fn encode_component(out: &mut Vec<u8>, bytes: &[u8]) {
    for &byte in bytes {
        out.push(byte);
        if byte == 0x00 {
            out.push(ESCAPE);
        }
    }
    out.push(0x00);
    out.push(TERMINATOR);
}

/// Encode a whole tuple.
#[must_use]
pub fn encode_tuple(parts: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::with_capacity(parts.iter().map(|p| p.len() + 2).sum());
    for part in parts {
        encode_component(&mut out, part);
    }
    out
}

/// Decode one tuple component, returning it and the remaining input.
///
/// # Errors
/// Returns [`Error::Codec`] if the component is truncated or badly escaped.
pub fn decode_component(input: &[u8]) -> Result<(Vec<u8>, &[u8])> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < input.len() {
        let byte = input[i];
        if byte != 0x00 {
            out.push(byte);
            i += 1;
            continue;
        }
        match input.get(i + 1) {
            Some(&ESCAPE) => {
                out.push(0x00);
                i += 2;
            }
            Some(&TERMINATOR) => return Ok((out, &input[i + 2..])),
            _ => break,
        }
    }
    Err(Error::Codec("unterminated tuple component".into()))
}

/// Big-endian encoding, so integers compare like their byte strings.
#[must_use]
pub fn encode_u64(value: u64) -> [u8; 8] {
    value.to_be_bytes()
}

/// The smallest key greater than every key starting with `prefix`, if any.
#[must_use]
pub fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

/// Encode a root-relative path as a tree key.
///
/// # Errors
/// Returns [`Error::InvalidKey`] for absolute paths and `.`/`..` components.
pub fn encode_path(path: &Path) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for (i, component) in path.components().enumerate() {
        let Component::Normal(name) = component else {
            return Err(Error::InvalidKey(format!(
                "path {} is not root-relative",
                path.display()
            )));
        };
        if i > 0 {
            out.push(SEPARATOR);
        }
        out.extend_from_slice(&os_bytes(name));
    }
    Ok(out)
}

/// Decode a tree key back to a root-relative path.
///
/// # Errors
/// Returns [`Error::Codec`] for empty components.
pub fn decode_path(key: &[u8]) -> Result<PathBuf> {
    let mut path = PathBuf::new();
    if key.is_empty() {
        return Ok(path);
    }
    for part in key.split(|&b| b == SEPARATOR) {
        if part.is_empty() {
            return Err(Error::Codec("empty path component in key".into()));
        }
        path.push(os_from_bytes(part));
    }
    Ok(path)
}

/// Key range `[start, end)` covering `key` and every descendant of it.
///
/// The root (empty key) has no upper bound.
#[must_use]
pub fn subtree_range(key: &[u8]) -> (Vec<u8>, Option<Vec<u8>>) {
    if key.is_empty() {
        return (Vec::new(), None);
    }
    let mut end = key.to_vec();
    end.push(SEPARATOR + 1);
    (key.to_vec(), Some(end))
}

/// Raw bytes of an OS string.
#[cfg(unix)]
#[must_use]
pub fn os_bytes(name: &OsStr) -> Cow<'_, [u8]> {
    use std::os::unix::ffi::OsStrExt as _;
    Cow::Borrowed(name.as_bytes())
}

#[cfg(not(unix))]
#[must_use]
pub fn os_bytes(name: &OsStr) -> Cow<'_, [u8]> {
    match name.to_string_lossy() {
        Cow::Borrowed(s) => Cow::Borrowed(s.as_bytes()),
        Cow::Owned(s) => Cow::Owned(s.into_bytes()),
    }
}

/// Rebuild an OS string from raw bytes.
#[cfg(unix)]
#[must_use]
pub fn os_from_bytes(bytes: &[u8]) -> OsString {
    use std::os::unix::ffi::OsStrExt as _;
    OsStr::from_bytes(bytes).to_os_string()
}

#[cfg(not(unix))]
#[must_use]
pub fn os_from_bytes(bytes: &[u8]) -> OsString {
    OsString::from(String::from_utf8_lossy(bytes).into_owned())
}

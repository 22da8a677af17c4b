//! The reserved-suffix naming convention.
//!
//! An asset is encrypted at rest iff its stored name ends with
//! [`ENCRYPTED_SUFFIX`], compared ASCII case-insensitively. Content is never
//! inspected to decide this.

/// Literal tail appended to the stored name once the bytes are ciphertext.
pub const ENCRYPTED_SUFFIX: &str = ".enc";

/// Returns `true` if `name` carries the reserved suffix.
pub fn is_encrypted_name(name: &str) -> bool {
    suffix_start(name).is_some()
}

/// Strip exactly one trailing reserved suffix, if present.
///
/// `"a.pdf.enc.ENC"` becomes `"a.pdf.enc"`; names without the suffix are
/// returned unchanged.
pub fn strip_encrypted_suffix(name: &str) -> &str {
    match suffix_start(name) {
        Some(at) => &name[..at],
        None => name,
    }
}

/// Append the reserved suffix.
pub fn encrypted_name(name: &str) -> String {
    format!("{name}{ENCRYPTED_SUFFIX}")
}

/// Substring after the last `.`, or `""` when there is none.
pub fn file_extension(name: &str) -> &str {
    name.rfind('.').map_or("", |i| &name[i + 1..])
}

fn suffix_start(name: &str) -> Option<usize> {
    let at = name.len().checked_sub(ENCRYPTED_SUFFIX.len())?;
    // `get` keeps us off non-char boundaries in multi-byte names.
    name.get(at..)
        .filter(|tail| tail.eq_ignore_ascii_case(ENCRYPTED_SUFFIX))
        .map(|_| at)
}

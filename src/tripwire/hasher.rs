//! CM-014: Content fingerprints binding an edit script to its base text.
//!
//! A fingerprint is `blake3:` followed by the 64 hex digits of the digest.

use crate::core::error::ManifestError;
use std::fs::File;
use std::path::Path;

const SCHEME: &str = "blake3:";
const HEX_LEN: usize = 64;

fn render(digest: blake3::Hash) -> String {
    format!("{}{}", SCHEME, digest.to_hex())
}

/// Fingerprint of in-memory manifest text.
pub fn fingerprint(text: &str) -> String {
    render(blake3::hash(text.as_bytes()))
}

/// Fingerprint of a manifest on disk, streamed so that it matches
/// `fingerprint` of the same bytes.
pub fn fingerprint_file(path: &Path) -> Result<String, ManifestError> {
    let file = File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    hasher.update_reader(file)?;
    Ok(render(hasher.finalize()))
}

/// Whether `value` has the shape of a fingerprint.
pub fn is_fingerprint(value: &str) -> bool {
    value
        .strip_prefix(SCHEME)
        .is_some_and(|hex| hex.len() == HEX_LEN && hex.bytes().all(|b| b.is_ascii_hexdigit()))
}

//! CM-016: Drift detection. Has the manifest changed since an edit script
//! was computed against it?

use crate::tripwire::hasher;
use std::path::Path;

/// A single drift finding.
#[derive(Debug, Clone)]
pub struct DriftFinding {
    pub label: String,
    pub expected_hash: String,
    pub actual_hash: String,
    pub detail: String,
}

fn changed(label: String, expected_hash: &str, actual_hash: String) -> DriftFinding {
    let detail = if hasher::is_fingerprint(expected_hash) {
        format!("{} content changed", label)
    } else {
        format!("{}: '{}' is not a blake3 fingerprint", label, expected_hash)
    };
    DriftFinding {
        label,
        expected_hash: expected_hash.to_string(),
        actual_hash,
        detail,
    }
}

/// Compare in-memory text against the hash it is expected to have.
pub fn check_text_drift(label: &str, text: &str, expected_hash: &str) -> Option<DriftFinding> {
    let actual = hasher::fingerprint(text);
    (actual != expected_hash).then(|| changed(label.to_string(), expected_hash, actual))
}

/// Compare a manifest file on disk against its expected hash.
pub fn check_file_drift(path: &Path, expected_hash: &str) -> Option<DriftFinding> {
    let label = path.display().to_string();
    if !path.exists() {
        return Some(DriftFinding {
            detail: format!("{} does not exist", label),
            label,
            expected_hash: expected_hash.to_string(),
            actual_hash: "MISSING".to_string(),
        });
    }

    let actual = hasher::fingerprint_file(path).unwrap_or_else(|e| format!("ERROR:{}", e));
    (actual != expected_hash).then(|| changed(label, expected_hash, actual))
}

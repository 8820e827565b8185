//! CM-011: Edit-script validation and application.
//!
//! An edit script is bound to the exact text it was computed against via a
//! BLAKE3 hash; applying it to anything else is refused.

use super::error::ManifestError;
use super::types::{EditOp, EditScript};
use crate::tripwire::{drift, hasher};

impl EditScript {
    /// Build a script against `base`, sorting ops and rejecting overlaps,
    /// out-of-range offsets and offsets inside a UTF-8 sequence.
    pub fn new(base: &str, mut ops: Vec<EditOp>) -> Result<Self, ManifestError> {
        ops.sort_by_key(|op| (op.offset, op.length));
        validate(base, &ops)?;
        Ok(Self {
            base_hash: hasher::fingerprint(base),
            ops,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Apply to `text`, which must be the text the script was computed
    /// against.
    pub fn apply(&self, text: &str) -> Result<String, ManifestError> {
        if let Some(finding) = drift::check_text_drift("manifest", text, &self.base_hash) {
            return Err(ManifestError::StaleEdit {
                expected: finding.expected_hash,
                actual: finding.actual_hash,
            });
        }
        self.apply_unchecked(text)
    }

    /// Apply without the hash check. Ops are still validated.
    pub fn apply_unchecked(&self, text: &str) -> Result<String, ManifestError> {
        let mut ops = self.ops.clone();
        ops.sort_by_key(|op| (op.offset, op.length));
        validate(text, &ops)?;

        let mut out = text.to_string();
        // Back to front, so earlier offsets stay valid.
        for op in ops.iter().rev() {
            out.replace_range(op.offset..op.end(), &op.replacement);
        }
        Ok(out)
    }
}

fn validate(text: &str, ops: &[EditOp]) -> Result<(), ManifestError> {
    let mut previous_end = 0;
    for (i, op) in ops.iter().enumerate() {
        let end = op
            .offset
            .checked_add(op.length)
            .ok_or_else(|| ManifestError::InvalidEdit(format!("op {} overflows", i)))?;
        if end > text.len() {
            return Err(ManifestError::InvalidEdit(format!(
                "op {} ({}) runs past the end of the text ({} bytes)",
                i,
                op,
                text.len()
            )));
        }
        if !text.is_char_boundary(op.offset) || !text.is_char_boundary(end) {
            return Err(ManifestError::InvalidEdit(format!(
                "op {} ({}) splits a UTF-8 character",
                i, op
            )));
        }
        if i > 0 && op.offset < previous_end {
            return Err(ManifestError::InvalidEdit(format!(
                "op {} ({}) overlaps the previous op",
                i, op
            )));
        }
        previous_end = end;
    }
    Ok(())
}

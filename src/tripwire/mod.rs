//! Tripwire: BLAKE3 hashing and stale-manifest detection.

pub mod drift;
pub mod hasher;

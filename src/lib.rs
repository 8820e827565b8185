//! cfmanifest: format-preserving Cloud Foundry manifest reconciliation.
//!
//! Parses `manifest.yml` into deployment properties, generates manifests from
//! properties, and computes minimal text edits that bring an existing manifest
//! in line with desired properties while leaving comments, anchors and
//! unrelated keys untouched.

pub mod cli;
pub mod core;
pub mod document;
pub mod tripwire;

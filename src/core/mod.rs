//! Core manifest logic: types, parsing, generation and reconciliation.

pub mod catalog;
pub mod edit;
pub mod error;
pub mod generator;
pub mod parser;
pub mod reconciler;
pub mod resolver;
pub mod types;

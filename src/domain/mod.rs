//! Domain layer types and invariants.

pub mod batch;
pub mod diagnostics;
pub mod error;
pub mod filenames;

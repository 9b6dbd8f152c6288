//! amxforge: an HTTP compile service for AMX Mod X plugins.
//!
//! Requests become [`domain::batch::CompilationBatch`]es, each built inside its own
//! sandbox by the external `amxxpc` compiler. Successful binaries are packed into a
//! short-lived archive that a background reclaimer removes once it expires.

pub mod application;
pub mod config;
pub mod domain;
pub mod infra;

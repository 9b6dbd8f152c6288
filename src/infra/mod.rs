//! Infrastructure adapters and runtime bootstrap.

pub mod archive;
pub mod compiler;
pub mod error;
pub mod http;
pub mod sandbox;
pub mod telemetry;

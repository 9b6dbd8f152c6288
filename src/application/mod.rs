pub mod compile;
pub mod error;
pub mod reclaimer;
pub mod retention;

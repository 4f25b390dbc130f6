//! Configuration constants for the storage engine.
//!
//! All tunable and derived constants live in [`constants`]. Runtime options
//! (directories, per-database overrides) are configured through
//! `DatabaseBuilder` instead.

pub mod constants;

pub use constants::*;

//! Configuration module for the block engine
//!
//! Page-level defaults (page sizes, row key, cache publishing) and the
//! optional HTTP client section. Loaded from TOML; every field has a default
//! so an empty file is a valid configuration.

pub mod types;

pub use types::*;

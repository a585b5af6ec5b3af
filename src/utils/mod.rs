//! Shared helpers for path matching, size parsing and host path handling.

pub mod glob;
pub mod paths;
pub mod size;

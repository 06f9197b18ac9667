//! File system access: listing, metadata, and mutating operations.

pub mod metadata;
pub mod ops;
pub mod walker;

//! Catalogue
//!
//! Identity records, reference data and compatibility resolution.

pub mod compatibility;
pub mod identity;

pub use compatibility::CompatibilityResolver;
pub use identity::Catalogue;

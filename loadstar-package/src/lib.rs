//! Loadstar package manifests
//!
//! This crate provides manifest handling for the Loadstar module loader:
//! - The package manifest model (`package.json`)
//! - Conditional/subpath `exports` lookup
//! - A memoized upward search for the nearest manifest

pub mod error;
pub mod finder;
pub mod manifest;

pub use error::{PackageError, Result};
pub use finder::{ManifestFinder, DEFAULT_MANIFEST_NAME};
pub use manifest::{ModuleType, PackageManifest};

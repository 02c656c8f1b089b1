//! Core value types for Walvault
//!
//! This crate holds the dependency-free foundation shared by the archival
//! pipeline and the (external) restore path:
//!
//! - WAL segment names: fixed-width hexadecimal identifiers with
//!   carry-correct successor arithmetic
//! - LSNs: 64-bit log positions parsed from their `<hex>/<hex>` textual form
//! - Prefetch path layout: pure path composition for the on-disk prefetch
//!   cache shared with the restore-side reader
//! - Configuration surface: the environment-driven knobs whose effects the
//!   archival core must honor

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod prefetch;
pub mod segment;

pub use config::{ArchiveConfig, ConfigError};
pub use prefetch::{prefetch_paths, PrefetchPaths};
pub use segment::{FormatError, Lsn, SegmentName, SEGMENT_NAME_LEN};

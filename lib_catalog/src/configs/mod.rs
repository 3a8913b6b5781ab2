//! # Configuration Modules
//!
//! This module holds the scanner's runtime settings: the window and worker
//! tunables, the rate-limit watermarks, request deadlines and the subscriber
//! allow-sets that decide which listings are forwarded.
//!
//! Settings are loaded once at startup. Anything that fails validation here is
//! fatal, the scan loop never starts with a half-valid configuration.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Scanner settings, defaults and validation.
pub mod scan_settings;

pub use scan_settings::{ConfigError, FilterSets, ScanSettings};

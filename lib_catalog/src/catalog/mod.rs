//! # Marketplace Catalog
//!
//! Everything that knows about the marketplace itself: the payload fields the
//! scanner reads, the two HTTP calls it makes, and the allow-set and
//! freshness rules that decide whether a listing is worth a notification.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Payload model for catalog pages and item envelopes.
pub mod model;
/// `CatalogProbe` seam and its HTTP implementation.
pub mod probe;
/// Allow-set and freshness classification.
pub mod filter;

pub use filter::ItemFilter;
pub use model::{ItemSummary, ListedItem};
pub use probe::{CatalogProbe, FetchOutcome, HttpCatalogProbe, ProbeError};

//! # Data Retrieval Module
//!
//! This module provides the networking layer the scanner is built on: a
//! generic HTTP `ApiClient` and the egress providers that decide which
//! outbound identity (direct or proxied) each request uses.
//!
//! ## Contained Modules:
//!
//! - **`ky_http`**: An HTTP `ApiClient` built on `reqwest` and
//!   `reqwest-middleware`, with per-client deadlines, proxy binding, session
//!   cookie injection and optional exponential-backoff retries.
//! - **`egress`**: The `EgressProvider` seam with a direct implementation and
//!   a round-robin `ProxyPool` that can disable failing proxies.
//!
//! By using the components within this module, the catalog probe and session
//! handshake focus on classification and delegate network details here.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Generic HTTP API client with optional retry middleware.
pub mod ky_http;
/// Outbound identity selection (direct or proxy pool).
pub mod egress;

pub use egress::{build_egress, DirectEgress, EgressError, EgressHandle, EgressProvider, ProxyPool};
pub use ky_http::{ApiClient, ApiResponse, ClientOptions, RetrieveError};

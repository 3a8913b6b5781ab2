//! # Core Engine Module
//!
//! This module is the heart of the catalog scanner: the feedback-controlled
//! concurrent scheduler that sweeps a window of candidate IDs ahead of the
//! newest known listing, while staying within the remote rate limits and
//! recovering from expired sessions on its own.
//!
//! ## Core Components:
//!
//! - **`session`**: The `SessionGuard`. Holds the current session credential
//!   and refreshes it single-flight, so a burst of 401s costs one handshake.
//!
//! - **`ledger`**: The `DedupLedger`. Records which IDs are resolved and which
//!   were already notified; its atomic claim is what keeps notifications
//!   at-most-once per ID.
//!
//! - **`governor`**: The `ConcurrencyGovernor`. Halves or doubles the worker
//!   count at every sweep boundary from the previous sweep's 429 count.
//!
//! - **`outcome`**: `ProbeOutcome`, the tagged result every candidate resolves
//!   to, and the explicit `RetryPolicy` used by probes and anchor fetches.
//!
//! - **`window`**: The `WindowScanner` state machine for one sweep: anchor,
//!   dispatch, aggregation and the window-order early exit.
//!
//! - **`scan_loop`**: The `ScanLoop` driver and the `connect` wiring that
//!   assembles the HTTP-backed components from `ScanSettings`.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Session credential ownership and single-flight refresh.
pub mod session;
/// Checked/notified ID sets with an atomic notification claim.
pub mod ledger;
/// Worker-count feedback controller.
pub mod governor;
/// Probe outcome tags and retry policies.
pub mod outcome;
/// One sweep over the candidate window.
pub mod window;
/// The outer sweep loop and component wiring.
pub mod scan_loop;

// --- Public API Re-exports ---
pub use governor::{ConcurrencyGovernor, GovernorState};
pub use ledger::DedupLedger;
pub use outcome::{FailureClass, FilterReason, ProbeOutcome, RetryPolicy};
pub use scan_loop::{connect, HttpScanLoop, ScanLoop, StartupError};
pub use session::{HttpSessionSource, SessionCredential, SessionError, SessionGuard, SessionSource};
pub use window::{Anchor, AnchorUpdate, ScanOptions, SweepOutcome, SweepReport, WindowScanner};

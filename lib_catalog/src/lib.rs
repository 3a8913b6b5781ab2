// Declare the modules to re-export
pub mod catalog;
pub mod configs;
pub mod core; // Session guard, ledger, governor, window scanner and scan loop
pub mod retrieve;
pub mod sinks;

// Re-export the entry points used by the daemon
pub use configs::{ConfigError, FilterSets, ScanSettings};
pub use crate::core::{connect, HttpScanLoop, ScanLoop, StartupError, SweepOutcome, SweepReport};
pub use sinks::{JsonlRecordSink, LogSink, MatchFanout, WebhookSink};

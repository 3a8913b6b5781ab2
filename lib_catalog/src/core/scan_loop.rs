//! # Scan Loop
//!
//! Outer driver: size the pool from the previous sweep's pressure, run a
//! sweep, log it, repeat. The only ways out are the cancellation token and a
//! failed start-up in [`connect`].

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::catalog::filter::ItemFilter;
use crate::catalog::probe::{CatalogProbe, HttpCatalogProbe};
use crate::configs::{ConfigError, ScanSettings};
use crate::retrieve::{build_egress, ClientOptions, RetrieveError};
use crate::sinks::MatchFanout;

use super::governor::ConcurrencyGovernor;
use super::ledger::DedupLedger;
use super::session::{HttpSessionSource, SessionError, SessionGuard, SessionSource};
use super::window::{ScanOptions, SweepOutcome, SweepReport, WindowScanner};

/// Failures that prevent the loop from starting. All are fatal.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to build http egress: {0}")]
    Egress(#[from] RetrieveError),

    #[error("could not establish initial session: {0}")]
    Session(#[from] SessionError),
}

pub type HttpScanLoop = ScanLoop<HttpCatalogProbe, HttpSessionSource>;

pub struct ScanLoop<P, S> {
    scanner: WindowScanner<P, S>,
    governor: Arc<ConcurrencyGovernor>,
    /// Pause after a sweep that could not fetch an anchor.
    idle_pause: Duration,
}

impl<P: CatalogProbe, S: SessionSource> ScanLoop<P, S> {
    pub fn new(scanner: WindowScanner<P, S>, governor: Arc<ConcurrencyGovernor>, idle_pause: Duration) -> Self {
        Self {
            scanner,
            governor,
            idle_pause,
        }
    }

    pub fn scanner(&self) -> &WindowScanner<P, S> {
        &self.scanner
    }

    pub fn governor(&self) -> &ConcurrencyGovernor {
        &self.governor
    }

    /// Sweeps until `cancel` fires. Returns the number of sweeps run.
    pub async fn run(&mut self, cancel: CancellationToken) -> u64 {
        let window_size = self.scanner.options().window_size;
        let mut sweeps = 0u64;
        tracing::info!(
            window = window_size,
            workers = self.governor.worker_count(),
            "scan loop started"
        );

        while !cancel.is_cancelled() {
            let workers = self.governor.rebalance(window_size);
            let report = self.scanner.sweep(workers, &cancel).await;
            sweeps += 1;
            log_report(sweeps, &report);

            match report.outcome {
                SweepOutcome::Cancelled => break,
                SweepOutcome::AnchorUnavailable => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.idle_pause) => {}
                    }
                }
                _ => {}
            }
        }

        let (checked, notified) = self.scanner.ledger().len();
        tracing::info!(sweeps, checked, notified, "scan loop stopped");
        sweeps
    }
}

fn log_report(sweep: u64, report: &SweepReport) {
    match report.outcome {
        SweepOutcome::Completed | SweepOutcome::EarlyExit { .. } => tracing::info!(
            sweep,
            anchor = report.anchor,
            generation = report.generation,
            workers = report.workers,
            dispatched = report.dispatched,
            skipped = report.skipped,
            notified = report.notified,
            filtered = report.filtered,
            stale = report.stale,
            not_found = report.not_found,
            rate_limited = report.rate_limited,
            auth_expired = report.auth_expired,
            unresolved = report.unresolved,
            elapsed_ms = report.elapsed.as_millis() as u64,
            probes_per_sec = report.probes_per_sec(),
            outcome = ?report.outcome,
            "sweep finished"
        ),
        SweepOutcome::SessionRegression { previous, observed } => {
            tracing::warn!(sweep, previous, observed, "sweep aborted on anchor regression")
        }
        SweepOutcome::AnchorUnavailable => tracing::warn!(sweep, "sweep skipped, no anchor"),
        SweepOutcome::Cancelled => tracing::debug!(sweep, "sweep cancelled"),
    }
}

/// Builds the HTTP-backed loop from validated settings. Establishes the
/// initial session; failing to do so is fatal.
pub async fn connect(settings: &ScanSettings, fanout: MatchFanout) -> Result<HttpScanLoop, StartupError> {
    settings.validate()?;
    let base_url = settings.parsed_base_url()?;

    let options = ClientOptions {
        timeout: settings.request_timeout(),
        ..ClientOptions::default()
    };
    let egress = build_egress(base_url.clone(), &settings.proxies, &options)?;

    let session = SessionGuard::establish(HttpSessionSource::new(Arc::clone(&egress))).await?;
    let probe = HttpCatalogProbe::new(egress, &base_url, settings.egress_failure_limit);
    let governor = Arc::new(ConcurrencyGovernor::new(
        settings.min_workers,
        settings.max_workers,
        settings.initial_workers(),
        settings.high_watermark,
        settings.low_watermark,
    ));

    let scanner = WindowScanner::new(
        probe,
        Arc::new(session),
        Arc::new(DedupLedger::new()),
        Arc::clone(&governor),
        ItemFilter::new(settings.filters.clone(), settings.freshness()),
        fanout,
        ScanOptions::from_settings(settings),
    );

    Ok(ScanLoop::new(scanner, governor, settings.anchor_retry_delay()))
}

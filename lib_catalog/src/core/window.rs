//! # Window Scanner
//!
//! Runs one sweep: fetch the anchor, probe the window `[anchor, anchor + size)`
//! at the governed concurrency, fold the outcomes into the ledger and hand
//! matches to the sinks.
//!
//! ## Dispatch
//! Candidates are submitted in window order with at most `workers` probes in
//! flight. Each probe is an independent task in a [`JoinSet`]; the aggregator
//! (the task running [`WindowScanner::sweep`]) is the only place that touches
//! the ledger, so results of probes that outlive the sweep are never applied.
//!
//! ## Early exit
//! Consecutive unresolved outcomes are counted in window order, not in
//! completion order: results land in a position-indexed buffer and the run
//! counter only advances over the contiguous completed prefix. Outcomes are
//! applied to the ledger in that same order, so a result that completes ahead
//! of the prefix waits until the prefix reaches it. When the run reaches the
//! threshold no further candidates are dispatched, probes still in flight are
//! detached and every result past the exit point is dropped unapplied.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::task::{self, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::catalog::filter::ItemFilter;
use crate::catalog::model::ListedItem;
use crate::catalog::probe::{CatalogProbe, FetchOutcome};
use crate::configs::ScanSettings;
use crate::sinks::{DerivedFields, MatchFanout};

use super::governor::ConcurrencyGovernor;
use super::ledger::DedupLedger;
use super::outcome::{FailureClass, ProbeOutcome, RetryPolicy};
use super::session::{SessionGuard, SessionSource};

/// Per-sweep tunables.
#[derive(Debug, Clone, Copy)]
pub struct ScanOptions {
    pub window_size: u64,
    pub early_exit_threshold: usize,
    pub anchor_policy: RetryPolicy,
    /// IDs kept in the ledger below the anchor. `None` keeps everything.
    pub ledger_retention: Option<u64>,
}

impl ScanOptions {
    pub fn from_settings(settings: &ScanSettings) -> Self {
        Self {
            window_size: settings.window_size,
            early_exit_threshold: settings.early_exit_threshold,
            anchor_policy: RetryPolicy::anchor_fetch(settings.anchor_attempts, settings.anchor_retry_delay()),
            ledger_retention: settings.ledger_retention,
        }
    }
}

/// Result of offering a candidate to the [`Anchor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorUpdate {
    Accepted { value: u64, generation: u64 },
    Regressed { previous: u64 },
}

/// Highest catalog ID known to exist. Never decreases: a lower candidate is
/// reported as a regression and leaves the anchor untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Anchor {
    value: Option<u64>,
    generation: u64,
}

impl Anchor {
    pub fn value(&self) -> Option<u64> {
        self.value
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn observe(&mut self, candidate: u64) -> AnchorUpdate {
        match self.value {
            Some(previous) if candidate < previous => AnchorUpdate::Regressed { previous },
            _ => {
                self.value = Some(candidate);
                self.generation += 1;
                AnchorUpdate::Accepted {
                    value: candidate,
                    generation: self.generation,
                }
            }
        }
    }
}

/// Counts consecutive unresolved outcomes in window order.
#[derive(Debug)]
pub struct UnresolvedRun {
    slots: Vec<Option<bool>>,
    frontier: usize,
    run: usize,
    threshold: usize,
}

impl UnresolvedRun {
    pub fn new(window_len: usize, threshold: usize) -> Self {
        Self {
            slots: vec![None; window_len],
            frontier: 0,
            run: 0,
            threshold,
        }
    }

    /// Records the outcome at `position`. Returns `true` once the run of
    /// unresolved outcomes along the completed prefix reaches the threshold.
    pub fn record(&mut self, position: usize, unresolved: bool) -> bool {
        if let Some(slot) = self.slots.get_mut(position) {
            *slot = Some(unresolved);
        }
        while let Some(Some(unresolved)) = self.slots.get(self.frontier) {
            self.run = if *unresolved { self.run + 1 } else { 0 };
            self.frontier += 1;
            if self.run >= self.threshold {
                return true;
            }
        }
        false
    }

    /// Number of window positions whose outcome is known, counted from the
    /// start of the window without gaps.
    pub fn frontier(&self) -> usize {
        self.frontier
    }
}

/// Releases outcomes in window order. An outcome that completes ahead of the
/// frontier is held until every earlier position is known.
#[derive(Debug)]
struct OrderedOutcomes {
    run: UnresolvedRun,
    pending: BTreeMap<usize, ProbeOutcome>,
}

impl OrderedOutcomes {
    fn new(window_len: usize, threshold: usize) -> Self {
        Self {
            run: UnresolvedRun::new(window_len, threshold),
            pending: BTreeMap::new(),
        }
    }

    /// Stores the outcome at `position` and returns the outcomes the frontier
    /// has now passed, in window order, plus whether the unresolved run
    /// reached the threshold. Held outcomes past the exit point stay held.
    fn complete(&mut self, position: usize, outcome: ProbeOutcome) -> (Vec<(usize, ProbeOutcome)>, bool) {
        let tripped = self.run.record(position, outcome.is_unresolved());
        self.pending.insert(position, outcome);

        let mut released = Vec::new();
        while let Some(entry) = self.pending.first_entry() {
            if *entry.key() >= self.run.frontier() {
                break;
            }
            released.push(entry.remove_entry());
        }
        (released, tripped)
    }

    fn frontier(&self) -> usize {
        self.run.frontier()
    }

    fn held(&self) -> usize {
        self.pending.len()
    }
}

/// Lowest and highest match offset from the anchor, over the process life.
#[derive(Debug, Clone, Copy, Default)]
pub struct OffsetStats {
    lowest: Option<i64>,
    highest: Option<i64>,
}

impl OffsetStats {
    pub fn observe(&mut self, offset: i64) -> (i64, i64) {
        let lowest = self.lowest.map_or(offset, |l| l.min(offset));
        let highest = self.highest.map_or(offset, |h| h.max(offset));
        self.lowest = Some(lowest);
        self.highest = Some(highest);
        (lowest, highest)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    /// Every candidate was resolved or skipped.
    Completed,
    /// The unresolved run reached the threshold at ID `at`.
    EarlyExit { at: u64 },
    /// The anchor moved backwards; the session was refreshed and nothing was
    /// probed.
    SessionRegression { previous: u64, observed: u64 },
    /// The newest-item request kept failing.
    AnchorUnavailable,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct SweepReport {
    pub outcome: SweepOutcome,
    pub anchor: Option<u64>,
    pub generation: u64,
    pub workers: usize,
    pub dispatched: usize,
    pub skipped: usize,
    pub matched: usize,
    pub notified: usize,
    pub filtered: usize,
    pub stale: usize,
    pub not_found: usize,
    pub rate_limited: usize,
    pub auth_expired: usize,
    pub unresolved: usize,
    pub elapsed: Duration,
}

impl SweepReport {
    fn new(workers: usize, generation: u64) -> Self {
        Self {
            outcome: SweepOutcome::Completed,
            anchor: None,
            generation,
            workers,
            dispatched: 0,
            skipped: 0,
            matched: 0,
            notified: 0,
            filtered: 0,
            stale: 0,
            not_found: 0,
            rate_limited: 0,
            auth_expired: 0,
            unresolved: 0,
            elapsed: Duration::ZERO,
        }
    }

    fn record(&mut self, outcome: &ProbeOutcome) {
        let counter = match outcome {
            ProbeOutcome::AlreadySeen => &mut self.skipped,
            ProbeOutcome::NotFound => &mut self.not_found,
            ProbeOutcome::RateLimited => &mut self.rate_limited,
            ProbeOutcome::AuthExpired => &mut self.auth_expired,
            ProbeOutcome::Unresolved => &mut self.unresolved,
            ProbeOutcome::FilteredOut(_) => &mut self.filtered,
            ProbeOutcome::Stale => &mut self.stale,
            ProbeOutcome::Matched(_) => &mut self.matched,
        };
        *counter += 1;
    }

    fn finish(mut self, outcome: SweepOutcome, started: Instant) -> Self {
        self.outcome = outcome;
        self.elapsed = started.elapsed();
        self
    }

    /// Probes dispatched per second of sweep time.
    pub fn probes_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.dispatched as f64 / secs
        } else {
            0.0
        }
    }
}

/// State shared with probe tasks.
struct ProbeContext<P, S> {
    probe: P,
    session: Arc<SessionGuard<S>>,
    governor: Arc<ConcurrencyGovernor>,
    filter: ItemFilter,
    policy: RetryPolicy,
}

impl<P: CatalogProbe, S: SessionSource> ProbeContext<P, S> {
    /// Examines one candidate. Never fails: every path ends in an outcome.
    async fn probe_one(&self, id: u64) -> ProbeOutcome {
        let mut credential = self.session.current();
        let mut attempts = 0;

        loop {
            attempts += 1;
            let class = match self.probe.fetch_item(id, &credential).await {
                FetchOutcome::Item(item) => return self.filter.classify(item, Utc::now()),
                FetchOutcome::NotFound => return ProbeOutcome::NotFound,
                FetchOutcome::RateLimited => {
                    self.governor.record_rate_limit();
                    FailureClass::RateLimited
                }
                FetchOutcome::Unavailable(reason) => {
                    tracing::trace!(item_id = id, %reason, "probe unresolved");
                    FailureClass::Transient
                }
                FetchOutcome::Unauthorized => FailureClass::Auth,
            };

            if !self.policy.should_retry(attempts, class) {
                return match class {
                    FailureClass::Auth => ProbeOutcome::AuthExpired,
                    FailureClass::RateLimited => ProbeOutcome::RateLimited,
                    FailureClass::Transient => ProbeOutcome::Unresolved,
                };
            }

            if class == FailureClass::Auth {
                match self.session.refresh_from(&credential).await {
                    Ok(fresh) => credential = fresh,
                    Err(err) => {
                        tracing::debug!(item_id = id, error = %err, "session refresh failed during probe");
                        return ProbeOutcome::AuthExpired;
                    }
                }
            } else if !self.policy.delay.is_zero() {
                tokio::time::sleep(self.policy.delay).await;
            }
        }
    }
}

pub struct WindowScanner<P, S> {
    ctx: Arc<ProbeContext<P, S>>,
    ledger: Arc<DedupLedger>,
    fanout: MatchFanout,
    options: ScanOptions,
    anchor: Anchor,
    offsets: OffsetStats,
}

impl<P: CatalogProbe, S: SessionSource> WindowScanner<P, S> {
    pub fn new(
        probe: P,
        session: Arc<SessionGuard<S>>,
        ledger: Arc<DedupLedger>,
        governor: Arc<ConcurrencyGovernor>,
        filter: ItemFilter,
        fanout: MatchFanout,
        options: ScanOptions,
    ) -> Self {
        Self {
            ctx: Arc::new(ProbeContext {
                probe,
                session,
                governor,
                filter,
                policy: RetryPolicy::item_probe(),
            }),
            ledger,
            fanout,
            options,
            anchor: Anchor::default(),
            offsets: OffsetStats::default(),
        }
    }

    pub fn anchor(&self) -> Anchor {
        self.anchor
    }

    pub fn ledger(&self) -> &DedupLedger {
        &self.ledger
    }

    pub fn probe(&self) -> &P {
        &self.ctx.probe
    }

    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    /// Runs one sweep with `workers` probes in flight at most.
    pub async fn sweep(&mut self, workers: usize, cancel: &CancellationToken) -> SweepReport {
        let started = Instant::now();
        let report = SweepReport::new(workers, self.anchor.generation());

        let candidate = tokio::select! {
            biased;
            _ = cancel.cancelled() => return report.finish(SweepOutcome::Cancelled, started),
            candidate = self.fetch_anchor() => candidate,
        };
        let Some(candidate) = candidate else {
            return report.finish(SweepOutcome::AnchorUnavailable, started);
        };

        let anchor = match self.anchor.observe(candidate) {
            AnchorUpdate::Regressed { previous } => {
                tracing::warn!(previous, observed = candidate, "anchor moved backwards, refreshing session");
                if let Err(err) = self.ctx.session.refresh().await {
                    tracing::error!(error = %err, "session refresh after regression failed");
                }
                let outcome = SweepOutcome::SessionRegression {
                    previous,
                    observed: candidate,
                };
                return report.finish(outcome, started);
            }
            AnchorUpdate::Accepted { value, generation } => {
                tracing::debug!(anchor = value, generation, "anchor accepted");
                value
            }
        };

        let mut report = report;
        report.anchor = Some(anchor);
        report.generation = self.anchor.generation();
        self.prune_ledger(anchor);

        let outcome = self.scan_window(anchor, workers.max(1), cancel, &mut report).await;
        report.finish(outcome, started)
    }

    /// Newest-item request under the anchor retry policy. A 401 refreshes the
    /// session before the next attempt.
    async fn fetch_anchor(&self) -> Option<u64> {
        let policy = self.options.anchor_policy;
        let mut attempts = 0;

        loop {
            attempts += 1;
            let credential = self.ctx.session.current();
            let err = match self.ctx.probe.fetch_anchor_candidate(&credential).await {
                Ok(summary) => return Some(summary.id),
                Err(err) => err,
            };

            let class = err.failure_class();
            tracing::warn!(attempt = attempts, error = %err, "anchor fetch failed");
            if class == FailureClass::Auth {
                if let Err(refresh_err) = self.ctx.session.refresh_from(&credential).await {
                    tracing::warn!(error = %refresh_err, "session refresh for anchor fetch failed");
                }
            }

            if !policy.should_retry(attempts, class) {
                tracing::error!(attempts, "anchor unavailable, skipping sweep");
                return None;
            }
            if !policy.delay.is_zero() {
                tokio::time::sleep(policy.delay).await;
            }
        }
    }

    fn prune_ledger(&self, anchor: u64) {
        let Some(retention) = self.options.ledger_retention else {
            return;
        };
        let evicted = self.ledger.prune_below(anchor.saturating_sub(retention));
        if evicted > 0 {
            tracing::debug!(evicted, anchor, "ledger pruned");
        }
    }

    async fn scan_window(
        &mut self,
        anchor: u64,
        workers: usize,
        cancel: &CancellationToken,
        report: &mut SweepReport,
    ) -> SweepOutcome {
        let window_len = usize::try_from(self.options.window_size).unwrap_or(usize::MAX);
        let mut ordered = OrderedOutcomes::new(window_len, self.options.early_exit_threshold);
        let mut tasks: JoinSet<ProbeOutcome> = JoinSet::new();
        let mut positions: HashMap<task::Id, usize> = HashMap::new();
        let mut next = 0usize;

        let outcome = loop {
            while tasks.len() < workers && next < window_len {
                let position = next;
                next += 1;
                let id = anchor + position as u64;

                if self.ledger.should_skip(id) {
                    // A skip never extends the unresolved run.
                    let (released, _) = ordered.complete(position, ProbeOutcome::AlreadySeen);
                    self.apply(anchor, released, report);
                    continue;
                }

                let ctx = Arc::clone(&self.ctx);
                let handle = tasks.spawn(async move { ctx.probe_one(id).await });
                positions.insert(handle.id(), position);
                report.dispatched += 1;
            }

            if tasks.is_empty() {
                break SweepOutcome::Completed;
            }

            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => break SweepOutcome::Cancelled,
                joined = tasks.join_next_with_id() => joined,
            };

            let (position, outcome) = match joined {
                Some(Ok((task_id, outcome))) => {
                    let Some(position) = positions.remove(&task_id) else { continue };
                    tracing::trace!(item_id = anchor + position as u64, offset = position, outcome = %outcome, "probe resolved");
                    (position, outcome)
                }
                Some(Err(err)) => {
                    let Some(position) = positions.remove(&err.id()) else { continue };
                    tracing::error!(item_id = anchor + position as u64, error = %err, "probe task failed");
                    (position, ProbeOutcome::Unresolved)
                }
                None => break SweepOutcome::Completed,
            };

            let (released, tripped) = ordered.complete(position, outcome);
            self.apply(anchor, released, report);
            if tripped {
                let at = anchor + ordered.frontier() as u64 - 1;
                tracing::debug!(
                    at,
                    threshold = self.options.early_exit_threshold,
                    dropped = ordered.held(),
                    "unresolved run reached threshold"
                );
                break SweepOutcome::EarlyExit { at };
            }
        };

        if !tasks.is_empty() {
            tracing::debug!(in_flight = tasks.len(), "detaching in-flight probes");
        }
        tasks.detach_all();
        outcome
    }

    fn apply(&mut self, anchor: u64, released: Vec<(usize, ProbeOutcome)>, report: &mut SweepReport) {
        for (position, outcome) in released {
            self.absorb(anchor, anchor + position as u64, &outcome, report);
        }
    }

    /// Applies one outcome to the ledger and forwards new matches.
    fn absorb(&mut self, anchor: u64, id: u64, outcome: &ProbeOutcome, report: &mut SweepReport) {
        report.record(outcome);
        match outcome {
            ProbeOutcome::Matched(item) => {
                if !self.ledger.mark_notified(id) {
                    tracing::debug!(item_id = id, "match already notified");
                    return;
                }
                report.notified += 1;
                let derived = self.derive(anchor, id, item);
                tracing::info!(
                    item_id = id,
                    offset = derived.offset,
                    latency_secs = derived.discovery_latency_secs,
                    "new listing matched"
                );
                self.fanout.publish(Arc::clone(item), derived);
            }
            other if other.is_terminal() => self.ledger.mark_checked(id),
            _ => {}
        }
    }

    fn derive(&mut self, anchor: u64, id: u64, item: &ListedItem) -> DerivedFields {
        let offset = id as i64 - anchor as i64;
        let (lowest_offset, highest_offset) = self.offsets.observe(offset);
        let discovered_at = Utc::now();
        let item_epoch = item.updated_at().map(|t| t.timestamp());

        DerivedFields {
            anchor,
            offset,
            lowest_offset,
            highest_offset,
            discovered_at,
            item_epoch,
            discovery_latency_secs: item_epoch.map(|epoch| discovered_at.timestamp() - epoch),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::model::ItemSummary;
    use crate::catalog::probe::ProbeError;
    use crate::configs::FilterSets;
    use crate::core::outcome::FilterReason;
    use crate::core::session::tests::ScriptedSource;
    use crate::core::session::SessionCredential;
    use std::collections::{HashMap, HashSet, VecDeque};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc::UnboundedReceiver;

    /// In-memory catalog. Anchors and per-ID responses are consumed in order;
    /// the last scripted entry repeats. Unscripted IDs are `NotFound`.
    #[derive(Default)]
    struct ScriptedProbe {
        anchors: StdMutex<VecDeque<Result<u64, ProbeError>>>,
        items: StdMutex<HashMap<u64, VecDeque<FetchOutcome>>>,
        delays: HashMap<u64, Duration>,
        panics: HashSet<u64>,
        calls: StdMutex<HashMap<u64, usize>>,
    }

    impl ScriptedProbe {
        fn new(anchors: Vec<Result<u64, ProbeError>>) -> Self {
            Self {
                anchors: StdMutex::new(anchors.into()),
                ..Self::default()
            }
        }

        fn item(self, id: u64, responses: Vec<FetchOutcome>) -> Self {
            self.items.lock().unwrap().insert(id, responses.into());
            self
        }

        fn delay(mut self, id: u64, delay: Duration) -> Self {
            self.delays.insert(id, delay);
            self
        }

        fn panic_on(mut self, id: u64) -> Self {
            self.panics.insert(id);
            self
        }

        fn calls(&self, id: u64) -> usize {
            self.calls.lock().unwrap().get(&id).copied().unwrap_or(0)
        }

        fn total_calls(&self) -> usize {
            self.calls.lock().unwrap().values().sum()
        }
    }

    impl CatalogProbe for ScriptedProbe {
        async fn fetch_anchor_candidate(&self, _session: &SessionCredential) -> Result<ItemSummary, ProbeError> {
            let mut anchors = self.anchors.lock().unwrap();
            let next = if anchors.len() > 1 {
                anchors.pop_front().unwrap()
            } else {
                anchors.front().cloned().unwrap_or(Err(ProbeError::Empty))
            };
            next.map(|id| ItemSummary { id })
        }

        async fn fetch_item(&self, id: u64, _session: &SessionCredential) -> FetchOutcome {
            *self.calls.lock().unwrap().entry(id).or_insert(0) += 1;
            if let Some(delay) = self.delays.get(&id) {
                tokio::time::sleep(*delay).await;
            }
            if self.panics.contains(&id) {
                panic!("scripted failure for item {id}");
            }
            let mut items = self.items.lock().unwrap();
            match items.get_mut(&id) {
                Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
                Some(queue) => queue.front().cloned().unwrap_or(FetchOutcome::NotFound),
                None => FetchOutcome::NotFound,
            }
        }
    }

    fn listing(id: u64, brand: u64) -> FetchOutcome {
        FetchOutcome::Item(ListedItem {
            id,
            country_id: Some(1),
            size_id: Some(2),
            brand_id: Some(brand),
            updated_at_ts: Some(Utc::now().to_rfc3339()),
            ..ListedItem::default()
        })
    }

    fn matched(id: u64) -> FetchOutcome {
        listing(id, 3)
    }

    struct Harness {
        scanner: WindowScanner<ScriptedProbe, ScriptedSource>,
        governor: Arc<ConcurrencyGovernor>,
        notified: UnboundedReceiver<Arc<ListedItem>>,
        records: UnboundedReceiver<(Arc<ListedItem>, DerivedFields)>,
        handshakes: Arc<AtomicU64>,
    }

    impl Harness {
        fn notified_ids(&mut self) -> Vec<u64> {
            let mut ids = Vec::new();
            while let Ok(item) = self.notified.try_recv() {
                ids.push(item.id);
            }
            ids
        }
    }

    async fn harness(probe: ScriptedProbe, window_size: u64, threshold: usize, retention: Option<u64>) -> Harness {
        let source = ScriptedSource::ok();
        let handshakes = Arc::clone(&source.calls);
        let session = Arc::new(SessionGuard::establish(source).await.unwrap());
        let governor = Arc::new(ConcurrencyGovernor::new(1, 64, 8, 0.10, 0.01));
        let filter = ItemFilter::new(
            FilterSets {
                country_ids: HashSet::from([1]),
                size_ids: HashSet::from([2]),
                brand_ids: HashSet::from([3]),
            },
            Duration::from_secs(15),
        );
        let (notify_tx, notified) = tokio::sync::mpsc::unbounded_channel();
        let (record_tx, records) = tokio::sync::mpsc::unbounded_channel();
        let fanout = MatchFanout::from_senders(Some(notify_tx), Some(record_tx));
        let options = ScanOptions {
            window_size,
            early_exit_threshold: threshold,
            anchor_policy: RetryPolicy::anchor_fetch(3, Duration::ZERO),
            ledger_retention: retention,
        };

        Harness {
            scanner: WindowScanner::new(
                probe,
                session,
                Arc::new(DedupLedger::new()),
                Arc::clone(&governor),
                filter,
                fanout,
                options,
            ),
            governor,
            notified,
            records,
            handshakes,
        }
    }

    #[test]
    fn test_anchor_never_moves_backwards() {
        let mut anchor = Anchor::default();
        assert_eq!(anchor.observe(100), AnchorUpdate::Accepted { value: 100, generation: 1 });
        assert_eq!(anchor.observe(100), AnchorUpdate::Accepted { value: 100, generation: 2 });
        assert_eq!(anchor.observe(90), AnchorUpdate::Regressed { previous: 100 });
        assert_eq!(anchor.value(), Some(100));
        assert_eq!(anchor.generation(), 2);
        assert_eq!(anchor.observe(130), AnchorUpdate::Accepted { value: 130, generation: 3 });
    }

    #[test]
    fn test_unresolved_run_follows_window_order() {
        let mut run = UnresolvedRun::new(6, 3);
        // Completion order 0, 1, 3, 4, 5 then 2.
        assert!(!run.record(0, true));
        assert!(!run.record(1, true));
        assert!(!run.record(3, true));
        assert!(!run.record(4, true));
        assert!(!run.record(5, false));
        assert_eq!(run.frontier(), 2);
        assert!(!run.record(2, false));
        assert_eq!(run.frontier(), 6);
    }

    #[test]
    fn test_unresolved_run_trips_on_contiguous_prefix() {
        let mut run = UnresolvedRun::new(6, 3);
        assert!(!run.record(2, true));
        assert!(!run.record(1, true));
        assert!(run.record(0, true));
        assert_eq!(run.frontier(), 3);
    }

    #[test]
    fn test_ordered_outcomes_hold_results_ahead_of_frontier() {
        let mut ordered = OrderedOutcomes::new(5, 3);

        let (released, tripped) = ordered.complete(2, ProbeOutcome::Stale);
        assert!(released.is_empty());
        assert!(!tripped);

        let (released, _) = ordered.complete(0, ProbeOutcome::NotFound);
        assert_eq!(released.iter().map(|(p, _)| *p).collect::<Vec<_>>(), vec![0]);

        let (released, _) = ordered.complete(1, ProbeOutcome::NotFound);
        assert_eq!(released.iter().map(|(p, _)| *p).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(ordered.held(), 0);
    }

    #[test]
    fn test_ordered_outcomes_keep_results_past_exit_point() {
        let mut ordered = OrderedOutcomes::new(5, 2);
        ordered.complete(3, ProbeOutcome::Stale);
        ordered.complete(0, ProbeOutcome::NotFound);

        let (released, tripped) = ordered.complete(1, ProbeOutcome::RateLimited);
        assert!(tripped);
        assert_eq!(released.len(), 1);
        assert_eq!(ordered.frontier(), 2);
        assert_eq!(ordered.held(), 1);
    }

    #[test]
    fn test_offset_stats_track_extremes() {
        let mut stats = OffsetStats::default();
        assert_eq!(stats.observe(40), (40, 40));
        assert_eq!(stats.observe(12), (12, 40));
        assert_eq!(stats.observe(95), (12, 95));
    }

    #[tokio::test]
    async fn test_overlapping_windows_notify_once() {
        let probe = ScriptedProbe::new(vec![Ok(100), Ok(103)])
            .item(105, vec![matched(105)])
            .item(104, vec![listing(104, 99)]);
        let mut h = harness(probe, 10, 100, None).await;
        let cancel = CancellationToken::new();

        let first = h.scanner.sweep(4, &cancel).await;
        assert_eq!(first.outcome, SweepOutcome::Completed);
        assert_eq!(first.notified, 1);
        assert_eq!(first.filtered, 1);

        let second = h.scanner.sweep(4, &cancel).await;
        assert_eq!(second.outcome, SweepOutcome::Completed);
        assert_eq!(second.notified, 0);
        assert_eq!(second.skipped, 2);

        assert_eq!(h.notified_ids(), vec![105]);
        assert_eq!(h.scanner.probe().calls(105), 1);
        assert_eq!(h.scanner.probe().calls(104), 1);
        // Not-found IDs stay eligible.
        assert_eq!(h.scanner.probe().calls(106), 2);
    }

    #[tokio::test]
    async fn test_match_record_carries_offsets() {
        let probe = ScriptedProbe::new(vec![Ok(500)])
            .item(502, vec![matched(502)])
            .item(507, vec![matched(507)]);
        let mut h = harness(probe, 10, 100, None).await;

        h.scanner.sweep(1, &CancellationToken::new()).await;

        let (item, first) = h.records.try_recv().unwrap();
        assert_eq!(item.id, 502);
        assert_eq!((first.offset, first.lowest_offset, first.highest_offset), (2, 2, 2));
        let (_, second) = h.records.try_recv().unwrap();
        assert_eq!((second.offset, second.lowest_offset, second.highest_offset), (7, 2, 7));
        assert_eq!(second.anchor, 500);
        assert!(second.discovery_latency_secs.is_some());
    }

    #[tokio::test]
    async fn test_regression_refreshes_without_probing() {
        let probe = ScriptedProbe::new(vec![Ok(200), Ok(150)]);
        let mut h = harness(probe, 5, 100, None).await;
        let cancel = CancellationToken::new();

        h.scanner.sweep(2, &cancel).await;
        let probes_before = h.scanner.probe().total_calls();
        assert_eq!(h.handshakes.load(Ordering::SeqCst), 1);

        let report = h.scanner.sweep(2, &cancel).await;
        assert_eq!(
            report.outcome,
            SweepOutcome::SessionRegression { previous: 200, observed: 150 }
        );
        assert_eq!(report.dispatched, 0);
        assert_eq!(h.scanner.probe().total_calls(), probes_before);
        assert_eq!(h.handshakes.load(Ordering::SeqCst), 2);
        assert_eq!(h.scanner.anchor().value(), Some(200));
    }

    #[tokio::test]
    async fn test_early_exit_stops_after_threshold_in_window_order() {
        let probe = ScriptedProbe::new(vec![Ok(10)])
            .item(10, vec![matched(10)])
            .item(11, vec![FetchOutcome::NotFound])
            .item(12, vec![FetchOutcome::Unavailable("timeout".into())])
            .item(13, vec![FetchOutcome::RateLimited])
            .item(14, vec![matched(14)]);
        let mut h = harness(probe, 5, 3, None).await;

        let report = h.scanner.sweep(1, &CancellationToken::new()).await;

        assert_eq!(report.outcome, SweepOutcome::EarlyExit { at: 13 });
        assert_eq!(report.dispatched, 4);
        assert_eq!(h.scanner.probe().calls(14), 0);
        assert_eq!(h.notified_ids(), vec![10]);
        assert_eq!(h.governor.snapshot().rate_limit_errors, 1);
    }

    #[tokio::test]
    async fn test_early_exit_drops_matches_completed_past_exit_point() {
        // 11 completes last, so 14 resolves while the run is still open.
        let probe = ScriptedProbe::new(vec![Ok(10)])
            .item(10, vec![matched(10)])
            .item(12, vec![FetchOutcome::NotFound])
            .item(13, vec![FetchOutcome::NotFound])
            .item(14, vec![matched(14)])
            .delay(11, Duration::from_millis(100));
        let mut h = harness(probe, 5, 3, None).await;

        let report = h.scanner.sweep(5, &CancellationToken::new()).await;

        assert_eq!(report.outcome, SweepOutcome::EarlyExit { at: 13 });
        assert_eq!(report.dispatched, 5);
        assert_eq!(h.scanner.probe().calls(14), 1);
        assert_eq!(h.notified_ids(), vec![10]);
        assert_eq!(report.matched, 1);
        assert!(!h.scanner.ledger().should_skip(14));
    }

    #[tokio::test]
    async fn test_failed_scan_task_counts_as_unresolved() {
        let probe = ScriptedProbe::new(vec![Ok(10)])
            .item(13, vec![matched(13)])
            .panic_on(10);
        let mut h = harness(probe, 4, 3, None).await;

        let report = h.scanner.sweep(1, &CancellationToken::new()).await;

        assert_eq!(report.outcome, SweepOutcome::EarlyExit { at: 12 });
        assert_eq!(report.unresolved, 1);
        assert_eq!(h.scanner.probe().calls(13), 0);
        assert!(h.notified_ids().is_empty());
    }

    #[tokio::test]
    async fn test_scattered_unresolved_do_not_trip_early_exit() {
        // The match at 2 completes last; completion-order counting would see
        // four unresolved in a row.
        let probe = ScriptedProbe::new(vec![Ok(0)])
            .item(2, vec![matched(2)])
            .item(5, vec![matched(5)])
            .delay(2, Duration::from_millis(100));
        let mut h = harness(probe, 6, 3, None).await;

        let report = h.scanner.sweep(6, &CancellationToken::new()).await;

        assert_eq!(report.outcome, SweepOutcome::Completed);
        let mut ids = h.notified_ids();
        ids.sort_unstable();
        assert_eq!(ids, vec![2, 5]);
    }

    #[tokio::test]
    async fn test_skipped_ids_are_never_probed_again() {
        let probe = ScriptedProbe::new(vec![Ok(40)])
            .item(41, vec![listing(41, 7)])
            .item(42, vec![matched(42)]);
        let mut h = harness(probe, 4, 100, None).await;
        let cancel = CancellationToken::new();

        for _ in 0..3 {
            h.scanner.sweep(2, &cancel).await;
        }

        assert_eq!(h.scanner.probe().calls(41), 1);
        assert_eq!(h.scanner.probe().calls(42), 1);
        assert_eq!(h.scanner.probe().calls(40), 3);
    }

    #[tokio::test]
    async fn test_repeated_401_refreshes_once_then_gives_up() {
        let probe = ScriptedProbe::new(vec![Ok(300)]).item(300, vec![FetchOutcome::Unauthorized]);
        let mut h = harness(probe, 3, 100, None).await;

        let report = h.scanner.sweep(1, &CancellationToken::new()).await;

        assert_eq!(report.auth_expired, 1);
        assert_eq!(h.scanner.probe().calls(300), 2);
        assert_eq!(h.handshakes.load(Ordering::SeqCst), 2);
        assert!(!h.scanner.ledger().should_skip(300));
    }

    #[tokio::test]
    async fn test_401_then_success_after_refresh() {
        let probe = ScriptedProbe::new(vec![Ok(300)]).item(300, vec![FetchOutcome::Unauthorized, matched(300)]);
        let mut h = harness(probe, 1, 100, None).await;

        let report = h.scanner.sweep(1, &CancellationToken::new()).await;

        assert_eq!(report.notified, 1);
        assert_eq!(h.notified_ids(), vec![300]);
        assert_eq!(h.handshakes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_filtered_items_are_never_notified() {
        let probe = ScriptedProbe::new(vec![Ok(60)])
            .item(60, vec![listing(60, 99)])
            .item(61, vec![matched(61)]);
        let mut h = harness(probe, 2, 100, None).await;

        let report = h.scanner.sweep(2, &CancellationToken::new()).await;

        assert_eq!(report.filtered, 1);
        assert_eq!(h.notified_ids(), vec![61]);
        assert!(h.scanner.ledger().should_skip(60));
        assert_eq!(h.scanner.ledger().len(), (2, 1));
    }

    #[tokio::test]
    async fn test_filter_reason_precedes_freshness() {
        let stale_foreign = FetchOutcome::Item(ListedItem {
            id: 70,
            country_id: Some(8),
            size_id: Some(2),
            brand_id: Some(3),
            updated_at_ts: Some((Utc::now() - chrono::Duration::hours(2)).to_rfc3339()),
            ..ListedItem::default()
        });
        let probe = ScriptedProbe::new(vec![Ok(70)]).item(70, vec![stale_foreign]);
        let h = harness(probe, 1, 100, None).await;

        let outcome = h.scanner.ctx.probe_one(70).await;
        assert!(matches!(outcome, ProbeOutcome::FilteredOut(FilterReason::Country)));
    }

    #[tokio::test]
    async fn test_anchor_retries_then_gives_up() {
        let probe = ScriptedProbe::new(vec![Err(ProbeError::Transport("reset".into()))]);
        let mut h = harness(probe, 5, 100, None).await;

        let report = h.scanner.sweep(2, &CancellationToken::new()).await;

        assert_eq!(report.outcome, SweepOutcome::AnchorUnavailable);
        assert_eq!(h.scanner.probe().total_calls(), 0);
    }

    #[tokio::test]
    async fn test_anchor_401_refreshes_session() {
        let probe = ScriptedProbe::new(vec![Err(ProbeError::Unauthorized), Ok(80)]);
        let mut h = harness(probe, 1, 100, None).await;

        let report = h.scanner.sweep(1, &CancellationToken::new()).await;

        assert_eq!(report.anchor, Some(80));
        assert_eq!(h.handshakes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retention_prunes_old_ids() {
        let probe = ScriptedProbe::new(vec![Ok(100), Ok(120)]).item(104, vec![listing(104, 9)]);
        let mut h = harness(probe, 10, 100, Some(5)).await;
        let cancel = CancellationToken::new();

        h.scanner.sweep(4, &cancel).await;
        assert!(h.scanner.ledger().should_skip(104));

        h.scanner.sweep(4, &cancel).await;
        assert!(!h.scanner.ledger().should_skip(104));
    }

    #[tokio::test]
    async fn test_cancelled_sweep_does_nothing() {
        let probe = ScriptedProbe::new(vec![Ok(1)]);
        let mut h = harness(probe, 5, 100, None).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = h.scanner.sweep(2, &cancel).await;

        assert_eq!(report.outcome, SweepOutcome::Cancelled);
        assert_eq!(h.scanner.probe().total_calls(), 0);
    }
}

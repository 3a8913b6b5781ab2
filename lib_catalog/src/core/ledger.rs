//! # Dedup Ledger
//!
//! Remembers which IDs reached a terminal outcome (`checked`) and which ones
//! already produced a notification (`notified`, always a subset of
//! `checked`). Both sets sit behind one lock so that the claim in
//! [`DedupLedger::mark_notified`] is a single atomic check-then-insert: an ID
//! can be claimed for notification at most once for the life of the process.

use std::collections::HashSet;
use std::sync::Mutex;

#[derive(Default)]
struct LedgerSets {
    checked: HashSet<u64>,
    notified: HashSet<u64>,
}

#[derive(Default)]
pub struct DedupLedger {
    sets: Mutex<LedgerSets>,
}

impl DedupLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if the ID was already resolved or notified.
    pub fn should_skip(&self, id: u64) -> bool {
        let sets = self.sets.lock().expect("ledger lock poisoned");
        sets.checked.contains(&id) || sets.notified.contains(&id)
    }

    pub fn mark_checked(&self, id: u64) {
        self.sets.lock().expect("ledger lock poisoned").checked.insert(id);
    }

    /// Claims `id` for notification. Returns `false` if it was already
    /// claimed, in which case the caller must not notify.
    pub fn mark_notified(&self, id: u64) -> bool {
        let mut sets = self.sets.lock().expect("ledger lock poisoned");
        sets.checked.insert(id);
        sets.notified.insert(id)
    }

    /// Drops every entry below `floor`. Returns how many IDs were evicted.
    pub fn prune_below(&self, floor: u64) -> usize {
        let mut sets = self.sets.lock().expect("ledger lock poisoned");
        let before = sets.checked.len();
        sets.checked.retain(|id| *id >= floor);
        sets.notified.retain(|id| *id >= floor);
        before - sets.checked.len()
    }

    /// `(checked, notified)` sizes.
    pub fn len(&self) -> (usize, usize) {
        let sets = self.sets.lock().expect("ledger lock poisoned");
        (sets.checked.len(), sets.notified.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len().0 == 0
    }
}

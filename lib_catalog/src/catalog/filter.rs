//! # Listing Filter
//!
//! Classifies a present listing against the subscriber allow-sets and the
//! freshness bound. Allow-sets are checked first, so a listing outside them
//! is `FilteredOut` no matter how fresh it is.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::configs::FilterSets;
use crate::core::outcome::{FilterReason, ProbeOutcome};

use super::model::ListedItem;

#[derive(Debug, Clone)]
pub struct ItemFilter {
    sets: FilterSets,
    freshness: Duration,
}

impl ItemFilter {
    pub fn new(sets: FilterSets, freshness: Duration) -> Self {
        Self { sets, freshness }
    }

    /// Resolves a listing to `FilteredOut`, `Stale` or `Matched`.
    ///
    /// A listing without a parseable update time cannot be shown to be
    /// fresh and is treated as `Stale`.
    pub fn classify(&self, item: ListedItem, now: DateTime<Utc>) -> ProbeOutcome {
        if let Some(reason) = self.rejection(&item) {
            return ProbeOutcome::FilteredOut(reason);
        }

        let Some(updated_at) = item.updated_at() else {
            return ProbeOutcome::Stale;
        };
        // Negative ages (clock skew) fail `to_std` and count as fresh.
        if let Ok(age) = now.signed_duration_since(updated_at).to_std() {
            if age > self.freshness {
                return ProbeOutcome::Stale;
            }
        }

        ProbeOutcome::Matched(Arc::new(item))
    }

    fn rejection(&self, item: &ListedItem) -> Option<FilterReason> {
        let allowed = |set: &std::collections::HashSet<u64>, value: Option<u64>| {
            value.is_some_and(|v| set.contains(&v))
        };

        if !allowed(&self.sets.country_ids, item.country_id) {
            Some(FilterReason::Country)
        } else if !allowed(&self.sets.size_ids, item.size_id) {
            Some(FilterReason::Size)
        } else if !allowed(&self.sets.brand_ids, item.brand_id) {
            Some(FilterReason::Brand)
        } else {
            None
        }
    }
}

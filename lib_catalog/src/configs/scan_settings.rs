//! # Scan Settings
//!
//! The single configuration record consumed by the scanner. The daemon layers
//! its file, environment and CLI values over [`ScanSettings::default`]; the
//! record also deserializes from camelCase JSON with missing keys defaulted.
//! Either way it is checked by [`ScanSettings::validate`] before use.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Errors raised while validating [`ScanSettings`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("allow-set `{0}` is empty, nothing could ever match")]
    EmptyAllowSet(&'static str),

    #[error("invalid worker bounds: min {min}, max {max}")]
    WorkerBounds { min: usize, max: usize },

    #[error("initial worker count {initial} is outside [{min}, {max}]")]
    InitialWorkers { initial: usize, min: usize, max: usize },

    #[error("invalid rate-limit watermarks: low {low}, high {high}")]
    Watermarks { low: f64, high: f64 },

    #[error("`{0}` must be greater than zero")]
    Zero(&'static str),

    #[error("invalid base url `{0}`")]
    BaseUrl(String),
}

/// Subscriber criteria: a listing is only forwarded when its country, size
/// and brand are all members of the respective set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FilterSets {
    pub country_ids: HashSet<u64>,
    pub size_ids: HashSet<u64>,
    pub brand_ids: HashSet<u64>,
}

/// Every tunable the scan loop reads at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScanSettings {
    /// Marketplace origin, e.g. `https://www.vinted.co.uk/`.
    pub base_url: String,
    /// Number of candidate IDs in one sweep, starting at the anchor.
    pub window_size: u64,
    pub min_workers: usize,
    pub max_workers: usize,
    /// Worker count used by the very first sweep. Defaults to `max_workers`.
    pub initial_workers: Option<usize>,
    /// Rate-limited fraction of the window above which workers are halved.
    pub high_watermark: f64,
    /// Rate-limited fraction of the window below which workers are doubled.
    pub low_watermark: f64,
    /// Listings whose last update is older than this are `Stale`.
    pub freshness_secs: u64,
    /// Consecutive unresolved outcomes (window order) that end a sweep early.
    pub early_exit_threshold: usize,
    pub request_timeout_ms: u64,
    pub anchor_attempts: u32,
    pub anchor_retry_delay_ms: u64,
    /// Consecutive transport failures after which a proxy is disabled.
    pub egress_failure_limit: u32,
    /// Keep ledger entries no further than this below the anchor. `None` keeps
    /// everything for the life of the process.
    pub ledger_retention: Option<u64>,
    pub proxies: Vec<String>,
    pub webhook_urls: Vec<String>,
    pub record_path: Option<PathBuf>,
    #[serde(flatten)]
    pub filters: FilterSets,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            base_url: "https://www.vinted.co.uk/".to_string(),
            window_size: 5000,
            min_workers: 16,
            max_workers: 64,
            initial_workers: None,
            high_watermark: 0.10,
            low_watermark: 0.01,
            freshness_secs: 15,
            early_exit_threshold: 100,
            request_timeout_ms: 3000,
            anchor_attempts: 3,
            anchor_retry_delay_ms: 1000,
            egress_failure_limit: 3,
            ledger_retention: None,
            proxies: Vec::new(),
            webhook_urls: Vec::new(),
            record_path: None,
            filters: FilterSets::default(),
        }
    }
}

impl ScanSettings {
    /// Rejects configurations the scanner cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.filters.country_ids.is_empty() {
            return Err(ConfigError::EmptyAllowSet("countryIds"));
        }
        if self.filters.size_ids.is_empty() {
            return Err(ConfigError::EmptyAllowSet("sizeIds"));
        }
        if self.filters.brand_ids.is_empty() {
            return Err(ConfigError::EmptyAllowSet("brandIds"));
        }

        if self.min_workers == 0 || self.min_workers > self.max_workers {
            return Err(ConfigError::WorkerBounds {
                min: self.min_workers,
                max: self.max_workers,
            });
        }
        let initial = self.initial_workers();
        if initial < self.min_workers || initial > self.max_workers {
            return Err(ConfigError::InitialWorkers {
                initial,
                min: self.min_workers,
                max: self.max_workers,
            });
        }

        let (low, high) = (self.low_watermark, self.high_watermark);
        if !(low.is_finite() && high.is_finite() && 0.0 <= low && low <= high) {
            return Err(ConfigError::Watermarks { low, high });
        }

        if self.window_size == 0 {
            return Err(ConfigError::Zero("windowSize"));
        }
        if self.early_exit_threshold == 0 {
            return Err(ConfigError::Zero("earlyExitThreshold"));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Zero("requestTimeoutMs"));
        }
        if self.anchor_attempts == 0 {
            return Err(ConfigError::Zero("anchorAttempts"));
        }
        if self.egress_failure_limit == 0 {
            return Err(ConfigError::Zero("egressFailureLimit"));
        }

        self.parsed_base_url()?;
        Ok(())
    }

    pub fn initial_workers(&self) -> usize {
        self.initial_workers.unwrap_or(self.max_workers)
    }

    pub fn parsed_base_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.base_url).map_err(|_| ConfigError::BaseUrl(self.base_url.clone()))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn freshness(&self) -> Duration {
        Duration::from_secs(self.freshness_secs)
    }

    pub fn anchor_retry_delay(&self) -> Duration {
        Duration::from_millis(self.anchor_retry_delay_ms)
    }
}

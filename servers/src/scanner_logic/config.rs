use anyhow::{Context, Result};
use clap::Parser;
use lib_catalog::ScanSettings;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Marketplace new-listing scanner", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "CATALOG_CONFIG_PATH", help = "Path to the JSON settings file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "CATALOG_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "CATALOG_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "CATALOG_BASE_URL", help = "Marketplace root URL.")]
    pub base_url: Option<String>,

    #[clap(long, env = "CATALOG_WINDOW_SIZE", help = "Candidate IDs probed per sweep.")]
    pub window_size: Option<u64>,

    #[clap(long, env = "CATALOG_MIN_WORKERS", help = "Lower bound of the worker pool.")]
    pub min_workers: Option<usize>,

    #[clap(long, env = "CATALOG_MAX_WORKERS", help = "Upper bound of the worker pool.")]
    pub max_workers: Option<usize>,

    #[clap(long, env = "CATALOG_INITIAL_WORKERS", help = "Worker count for the first sweep.")]
    pub initial_workers: Option<usize>,

    #[clap(long, env = "CATALOG_HIGH_WATERMARK", help = "429 share of the window above which the pool halves.")]
    pub high_watermark: Option<f64>,

    #[clap(long, env = "CATALOG_LOW_WATERMARK", help = "429 share of the window below which the pool doubles.")]
    pub low_watermark: Option<f64>,

    #[clap(long, env = "CATALOG_FRESHNESS_SECS", help = "Maximum listing age in seconds for a match.")]
    pub freshness_secs: Option<u64>,

    #[clap(long, env = "CATALOG_EARLY_EXIT_THRESHOLD", help = "Consecutive unresolved IDs that end a sweep.")]
    pub early_exit_threshold: Option<usize>,

    #[clap(long, env = "CATALOG_REQUEST_TIMEOUT_MS", help = "Per-request deadline in milliseconds.")]
    pub request_timeout_ms: Option<u64>,

    #[clap(long, env = "CATALOG_ANCHOR_ATTEMPTS", help = "Attempts for the newest-item request.")]
    pub anchor_attempts: Option<u32>,

    #[clap(long, env = "CATALOG_ANCHOR_RETRY_DELAY_MS", help = "Pause between newest-item attempts in milliseconds.")]
    pub anchor_retry_delay_ms: Option<u64>,

    #[clap(long, env = "CATALOG_EGRESS_FAILURE_LIMIT", help = "Consecutive transport failures before a proxy is disabled.")]
    pub egress_failure_limit: Option<u32>,

    #[clap(long, env = "CATALOG_LEDGER_RETENTION", help = "IDs kept in the dedup ledger below the anchor.")]
    pub ledger_retention: Option<u64>,

    #[clap(long, env = "CATALOG_PROXIES", value_delimiter = ',', help = "Comma-separated proxy URLs.")]
    pub proxies: Option<Vec<String>>,

    #[clap(long, env = "CATALOG_WEBHOOK_URLS", value_delimiter = ',', help = "Comma-separated webhook URLs.")]
    pub webhook_urls: Option<Vec<String>>,

    #[clap(long, env = "CATALOG_RECORD_PATH", help = "JSON-lines file receiving one record per match.")]
    pub record_path: Option<PathBuf>,

    #[serde(alias = "brand_ids")]
    #[clap(long, env = "CATALOG_BRAND_IDS", value_delimiter = ',', help = "Allowed brand IDs.")]
    pub brand_ids: Option<Vec<u64>>,

    #[serde(alias = "size_ids")]
    #[clap(long, env = "CATALOG_SIZE_IDS", value_delimiter = ',', help = "Allowed size IDs.")]
    pub size_ids: Option<Vec<u64>>,

    #[serde(alias = "country_ids")]
    #[clap(long, env = "CATALOG_COUNTRY_IDS", value_delimiter = ',', help = "Allowed country IDs.")]
    pub country_ids: Option<Vec<u64>>,
}

/// Fully resolved daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonSettings {
    pub log_dir: PathBuf,
    pub log_level: String,
    pub scan: ScanSettings,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            base_url: other.base_url.or(self.base_url),
            window_size: other.window_size.or(self.window_size),
            min_workers: other.min_workers.or(self.min_workers),
            max_workers: other.max_workers.or(self.max_workers),
            initial_workers: other.initial_workers.or(self.initial_workers),
            high_watermark: other.high_watermark.or(self.high_watermark),
            low_watermark: other.low_watermark.or(self.low_watermark),
            freshness_secs: other.freshness_secs.or(self.freshness_secs),
            early_exit_threshold: other.early_exit_threshold.or(self.early_exit_threshold),
            request_timeout_ms: other.request_timeout_ms.or(self.request_timeout_ms),
            anchor_attempts: other.anchor_attempts.or(self.anchor_attempts),
            anchor_retry_delay_ms: other.anchor_retry_delay_ms.or(self.anchor_retry_delay_ms),
            egress_failure_limit: other.egress_failure_limit.or(self.egress_failure_limit),
            ledger_retention: other.ledger_retention.or(self.ledger_retention),
            proxies: other.proxies.or(self.proxies),
            webhook_urls: other.webhook_urls.or(self.webhook_urls),
            record_path: other.record_path.or(self.record_path),
            brand_ids: other.brand_ids.or(self.brand_ids),
            size_ids: other.size_ids.or(self.size_ids),
            country_ids: other.country_ids.or(self.country_ids),
        }
    }

    /// Overlays the values that are set onto `base`.
    fn apply(self, base: ScanSettings) -> ScanSettings {
        let to_set = |ids: Vec<u64>| ids.into_iter().collect::<HashSet<_>>();
        let mut settings = base;

        if let Some(v) = self.base_url { settings.base_url = v; }
        if let Some(v) = self.window_size { settings.window_size = v; }
        if let Some(v) = self.min_workers { settings.min_workers = v; }
        if let Some(v) = self.max_workers { settings.max_workers = v; }
        if let Some(v) = self.initial_workers { settings.initial_workers = Some(v); }
        if let Some(v) = self.high_watermark { settings.high_watermark = v; }
        if let Some(v) = self.low_watermark { settings.low_watermark = v; }
        if let Some(v) = self.freshness_secs { settings.freshness_secs = v; }
        if let Some(v) = self.early_exit_threshold { settings.early_exit_threshold = v; }
        if let Some(v) = self.request_timeout_ms { settings.request_timeout_ms = v; }
        if let Some(v) = self.anchor_attempts { settings.anchor_attempts = v; }
        if let Some(v) = self.anchor_retry_delay_ms { settings.anchor_retry_delay_ms = v; }
        if let Some(v) = self.egress_failure_limit { settings.egress_failure_limit = v; }
        if let Some(v) = self.ledger_retention { settings.ledger_retention = Some(v); }
        if let Some(v) = self.proxies { settings.proxies = v; }
        if let Some(v) = self.webhook_urls { settings.webhook_urls = v; }
        if let Some(v) = self.record_path { settings.record_path = Some(v); }
        if let Some(v) = self.brand_ids { settings.filters.brand_ids = to_set(v); }
        if let Some(v) = self.size_ids { settings.filters.size_ids = to_set(v); }
        if let Some(v) = self.country_ids { settings.filters.country_ids = to_set(v); }

        settings
    }
}

pub fn load_config() -> Result<DaemonSettings> {
    // .env first so that clap sees its variables
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            return Err(e).context("failed to read .env file");
        }
    }
    load_from(Config::parse())
}

/// Resolves defaults < settings file < environment/CLI, then validates.
pub fn load_from(cli_args: Config) -> Result<DaemonSettings> {
    // 1. Load defaults
    let default_config = Config {
        log_dir: Some(PathBuf::from("./logs")),
        log_level: Some("info".to_string()),
        ..Default::default()
    };

    // 2. Load from the settings file if present. The path itself may come
    //    from the CLI or the environment.
    let config_file_path = cli_args
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("config/settings.json"));

    let mut current_config = default_config;

    if config_file_path.exists() {
        let config_str = fs::read_to_string(&config_file_path)
            .with_context(|| format!("failed to read config file {}", config_file_path.display()))?;
        let file_config = serde_json::from_str::<Config>(&config_str)
            .with_context(|| format!("failed to parse config file {}", config_file_path.display()))?;
        current_config = current_config.merge(file_config);
    } else {
        eprintln!(
            "Config file not found at {}. Using defaults and environment/CLI variables.",
            config_file_path.display()
        );
    }

    // 3. Override with environment variables and CLI arguments
    current_config = current_config.merge(cli_args);

    let log_dir = current_config.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"));
    let log_level = current_config.log_level.clone().unwrap_or_else(|| "info".to_string());
    let scan = current_config.apply(ScanSettings::default());
    scan.validate().context("invalid scanner configuration")?;

    Ok(DaemonSettings { log_dir, log_level, scan })
}

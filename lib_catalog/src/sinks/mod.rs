//! # Match Sinks
//!
//! Destinations for matched listings. The scanner never waits on a sink: it
//! pushes each match into [`MatchFanout`], whose unbounded channels are
//! drained by one background task per attached sink. Delivery failures are
//! logged by those tasks and never reach the scan loop.
//!
//! ## Contained Modules:
//!
//! - **`webhook`**: `WebhookSink`, posting an embed per match to every
//!   configured webhook URL, and `LogSink`, which only logs.
//! - **`record`**: `JsonlRecordSink`, appending one audit line per match.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use url::Url;

use crate::catalog::model::ListedItem;
use crate::configs::ScanSettings;
use crate::retrieve::{ClientOptions, RetrieveError};

/// Webhook notification sink and log-only fallback.
pub mod webhook;
/// JSON-lines audit trail.
pub mod record;

pub use record::JsonlRecordSink;
pub use webhook::{LogSink, WebhookSink};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("invalid sink url `{url}`: {source}")]
    Url {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("{url} answered http {status}")]
    Status { url: String, status: u16 },

    #[error(transparent)]
    Retrieve(#[from] RetrieveError),

    #[error("record file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Values computed by the scanner at match time and handed to record sinks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedFields {
    /// Anchor of the sweep that found the item.
    pub anchor: u64,
    /// `item_id - anchor`.
    pub offset: i64,
    pub lowest_offset: i64,
    pub highest_offset: i64,
    pub discovered_at: DateTime<Utc>,
    /// Item update time as a Unix timestamp.
    pub item_epoch: Option<i64>,
    /// Seconds between the item update and its discovery.
    pub discovery_latency_secs: Option<i64>,
}

pub trait NotificationSink: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn send(&self, item: &ListedItem) -> impl Future<Output = Result<(), SinkError>> + Send;
}

pub trait RecordSink: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn append(&self, item: &ListedItem, derived: &DerivedFields) -> impl Future<Output = Result<(), SinkError>> + Send;
}

type RecordEntry = (Arc<ListedItem>, DerivedFields);

/// Fire-and-forget hand-off from the scanner to the sinks.
///
/// Dropping every clone of the fanout closes the channels; the sink tasks
/// then drain what is queued and exit.
#[derive(Clone, Default)]
pub struct MatchFanout {
    notify: Option<UnboundedSender<Arc<ListedItem>>>,
    record: Option<UnboundedSender<RecordEntry>>,
}

impl MatchFanout {
    /// A fanout with no sinks attached. Matches are dropped.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_senders(
        notify: Option<UnboundedSender<Arc<ListedItem>>>,
        record: Option<UnboundedSender<RecordEntry>>,
    ) -> Self {
        Self { notify, record }
    }

    /// Attaches the sinks named in `settings`: a [`WebhookSink`] when webhook
    /// URLs are configured (a [`LogSink`] otherwise) and a
    /// [`JsonlRecordSink`] when a record path is set. `site` is the
    /// marketplace root used in item links.
    pub fn from_settings(settings: &ScanSettings, site: Url) -> Result<(Self, Vec<JoinHandle<()>>), SinkError> {
        let mut fanout = Self::new();
        let mut tasks = Vec::new();

        if settings.webhook_urls.is_empty() {
            tracing::info!("no webhook configured, matches are only logged");
            tasks.push(fanout.attach_notifier(LogSink));
        } else {
            let options = ClientOptions {
                timeout: Duration::from_secs(10),
                max_retries: 3,
                ..ClientOptions::default()
            };
            let sink = WebhookSink::new(site, &settings.webhook_urls, &options)?;
            tasks.push(fanout.attach_notifier(sink));
        }

        if let Some(path) = &settings.record_path {
            let sink = JsonlRecordSink::new(path.clone())?;
            tracing::info!(path = %sink.path().display(), "recording matches");
            tasks.push(fanout.attach_recorder(sink));
        }

        Ok((fanout, tasks))
    }

    /// Spawns the delivery task for `sink` and routes notifications to it.
    pub fn attach_notifier<N: NotificationSink>(&mut self, sink: N) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Arc<ListedItem>>();
        self.notify = Some(tx);

        tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                match sink.send(&item).await {
                    Ok(()) => tracing::debug!(sink = sink.name(), item_id = item.id, "notification delivered"),
                    Err(err) => tracing::warn!(sink = sink.name(), item_id = item.id, error = %err, "notification failed"),
                }
            }
            tracing::debug!(sink = sink.name(), "notification sink closed");
        })
    }

    /// Spawns the delivery task for `sink` and routes audit records to it.
    pub fn attach_recorder<R: RecordSink>(&mut self, sink: R) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<RecordEntry>();
        self.record = Some(tx);

        tokio::spawn(async move {
            while let Some((item, derived)) = rx.recv().await {
                if let Err(err) = sink.append(&item, &derived).await {
                    tracing::error!(sink = sink.name(), item_id = item.id, error = %err, "record append failed");
                }
            }
            tracing::debug!(sink = sink.name(), "record sink closed");
        })
    }

    /// Queues a match for every attached sink. Never blocks.
    pub fn publish(&self, item: Arc<ListedItem>, derived: DerivedFields) {
        let item_id = item.id;
        if let Some(tx) = &self.record {
            if tx.send((Arc::clone(&item), derived)).is_err() {
                tracing::warn!(item_id, "record sink is gone, dropping record");
            }
        }
        if let Some(tx) = &self.notify {
            if tx.send(item).is_err() {
                tracing::warn!(item_id, "notification sink is gone, dropping match");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Collecting {
        seen: Arc<Mutex<Vec<u64>>>,
        fail: bool,
    }

    impl NotificationSink for Collecting {
        fn name(&self) -> &'static str {
            "collecting"
        }

        async fn send(&self, item: &ListedItem) -> Result<(), SinkError> {
            self.seen.lock().unwrap().push(item.id);
            if self.fail {
                Err(SinkError::Status {
                    url: "http://hook".into(),
                    status: 500,
                })
            } else {
                Ok(())
            }
        }
    }

    fn derived() -> DerivedFields {
        DerivedFields {
            anchor: 1,
            offset: 0,
            lowest_offset: 0,
            highest_offset: 0,
            discovered_at: Utc::now(),
            item_epoch: None,
            discovery_latency_secs: None,
        }
    }

    fn item(id: u64) -> Arc<ListedItem> {
        Arc::new(ListedItem {
            id,
            ..ListedItem::default()
        })
    }

    #[tokio::test]
    async fn test_attached_sink_receives_in_order() {
        let sink = Collecting::default();
        let seen = Arc::clone(&sink.seen);
        let mut fanout = MatchFanout::new();
        let task = fanout.attach_notifier(sink);

        for id in [3, 1, 2] {
            fanout.publish(item(id), derived());
        }
        drop(fanout);
        task.await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![3, 1, 2]);
    }

    #[tokio::test]
    async fn test_failing_sink_keeps_draining() {
        let sink = Collecting {
            fail: true,
            ..Collecting::default()
        };
        let seen = Arc::clone(&sink.seen);
        let mut fanout = MatchFanout::new();
        let task = fanout.attach_notifier(sink);

        fanout.publish(item(1), derived());
        fanout.publish(item(2), derived());
        drop(fanout);
        task.await.unwrap();

        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_from_settings_attaches_log_and_record_sinks() {
        let dir = tempfile::tempdir().unwrap();
        let settings = ScanSettings {
            record_path: Some(dir.path().join("matches.jsonl")),
            ..ScanSettings::default()
        };
        let site = Url::parse("https://www.vinted.co.uk/").unwrap();

        let (fanout, tasks) = MatchFanout::from_settings(&settings, site).unwrap();
        assert_eq!(tasks.len(), 2);

        fanout.publish(item(5), derived());
        drop(fanout);
        for task in tasks {
            task.await.unwrap();
        }

        let written = std::fs::read_to_string(dir.path().join("matches.jsonl")).unwrap();
        assert_eq!(written.lines().count(), 1);
    }

    #[test]
    fn test_publish_without_sinks_is_a_no_op() {
        MatchFanout::new().publish(item(1), derived());
    }
}

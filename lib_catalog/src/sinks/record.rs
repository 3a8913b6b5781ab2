use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

use crate::catalog::model::ListedItem;

use super::{DerivedFields, RecordSink, SinkError};

/// One line of the audit file.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AuditLine<'a> {
    item_id: u64,
    price: String,
    size: Option<&'a str>,
    brand: Option<&'a str>,
    user_rating: Option<String>,
    condition: Option<&'a str>,
    country: Option<&'a str>,
    discovery_time_secs: Option<i64>,
    current_epoch: i64,
    item_epoch: Option<i64>,
    lowest_offset: i64,
    highest_offset: i64,
    current_offset: i64,
}

/// Appends one JSON object per match to a file.
pub struct JsonlRecordSink {
    path: PathBuf,
}

impl JsonlRecordSink {
    /// Creates the parent directory if needed. The file itself is created on
    /// the first append.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RecordSink for JsonlRecordSink {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    async fn append(&self, item: &ListedItem, derived: &DerivedFields) -> Result<(), SinkError> {
        let line = AuditLine {
            item_id: item.id,
            price: item.price_label(),
            size: item.size.as_deref(),
            brand: item.brand.as_deref(),
            user_rating: item.rating_stars(),
            condition: item.status.as_deref(),
            country: item.seller_country(),
            discovery_time_secs: derived.discovery_latency_secs,
            current_epoch: derived.discovered_at.timestamp(),
            item_epoch: derived.item_epoch,
            lowest_offset: derived.lowest_offset,
            highest_offset: derived.highest_offset,
            current_offset: derived.offset,
        };
        let mut encoded = serde_json::to_string(&line)?;
        encoded.push('\n');

        let mut file = OpenOptions::new().create(true).append(true).open(&self.path).await?;
        file.write_all(encoded.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn derived(offset: i64) -> DerivedFields {
        DerivedFields {
            anchor: 1000,
            offset,
            lowest_offset: 2,
            highest_offset: 9,
            discovered_at: Utc::now(),
            item_epoch: Some(1_700_000_000),
            discovery_latency_secs: Some(4),
        }
    }

    #[tokio::test]
    async fn test_appends_one_line_per_match() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlRecordSink::new(dir.path().join("audit").join("sent_items.jsonl")).unwrap();

        for id in [1002, 1009] {
            let item = ListedItem {
                id,
                brand: Some("Adidas".into()),
                ..ListedItem::default()
            };
            sink.append(&item, &derived(id as i64 - 1000)).await.unwrap();
        }

        let contents = std::fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["itemId"], 1002);
        assert_eq!(lines[0]["brand"], "Adidas");
        assert_eq!(lines[1]["currentOffset"], 9);
        assert_eq!(lines[1]["discoveryTimeSecs"], 4);
    }
}

//! # Catalog Payload Model
//!
//! Only the fields the scanner interprets (ids, allow-set keys, update time)
//! plus the display fields handed to the sinks. Everything else in the
//! marketplace payload is ignored by serde.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Response of the "newest items" endpoint, newest first.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CatalogPage {
    #[serde(default)]
    pub items: Vec<ItemSummary>,
}

/// The one catalog field the anchor logic needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemSummary {
    pub id: u64,
}

/// Response of the "item by id" endpoint. `code == 0` means present.
#[derive(Debug, Clone, Deserialize)]
pub struct ItemEnvelope {
    #[serde(default = "missing_code")]
    pub code: i64,
    pub item: Option<ListedItem>,
}

fn missing_code() -> i64 {
    -1
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Price {
    /// The marketplace sends this as a string or a number depending on the endpoint.
    #[serde(default)]
    pub amount: Value,
    #[serde(default)]
    pub currency_code: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Seller {
    #[serde(default)]
    pub country_code: Option<String>,
    #[serde(default)]
    pub feedback_reputation: Option<f64>,
    #[serde(default)]
    pub feedback_count: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Photo {
    #[serde(default)]
    pub full_size_url: Option<String>,
}

/// A single listing as returned by the item endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListedItem {
    pub id: u64,
    #[serde(default)]
    pub country_id: Option<u64>,
    #[serde(default)]
    pub size_id: Option<u64>,
    #[serde(default)]
    pub brand_id: Option<u64>,
    /// ISO-8601 timestamp with offset, e.g. `2024-07-14T10:12:33+01:00`.
    #[serde(default)]
    pub updated_at_ts: Option<String>,
    #[serde(default)]
    pub price: Option<Price>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub brand: Option<String>,
    /// Item condition as displayed by the marketplace.
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub user: Option<Seller>,
    #[serde(default)]
    pub photos: Vec<Photo>,
}

impl ListedItem {
    /// Last update time in UTC, if present and parseable.
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at_ts
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// `"12.50 GBP"`, or `"?"` when the listing carries no price.
    pub fn price_label(&self) -> String {
        match &self.price {
            Some(price) => {
                let amount = match &price.amount {
                    Value::String(s) => s.clone(),
                    Value::Null => "?".to_string(),
                    other => other.to_string(),
                };
                format!("{} {}", amount, price.currency_code).trim().to_string()
            }
            None => "?".to_string(),
        }
    }

    pub fn seller_country(&self) -> Option<&str> {
        self.user.as_ref().and_then(|u| u.country_code.as_deref())
    }

    pub fn photo_url(&self) -> Option<&str> {
        self.photos.first().and_then(|p| p.full_size_url.as_deref())
    }

    /// Five-star rendering of the seller reputation (0.0..=1.0).
    pub fn rating_stars(&self) -> Option<String> {
        let user = self.user.as_ref()?;
        let filled = (user.feedback_reputation? * 5.0).round().clamp(0.0, 5.0) as usize;
        Some(format!(
            "{}{} ({})",
            "★".repeat(filled),
            "☆".repeat(5 - filled),
            user.feedback_count.unwrap_or(0)
        ))
    }
}

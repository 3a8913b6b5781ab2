//! Webhook notifications: one embed message per match, posted to every
//! configured URL.

use reqwest::{Method, Url};
use serde_json::{json, Value};

use crate::catalog::model::ListedItem;
use crate::retrieve::{ApiClient, ClientOptions};

use super::{NotificationSink, SinkError};

pub struct WebhookSink {
    site: Url,
    hooks: Vec<(String, ApiClient)>,
}

impl WebhookSink {
    /// `site` is the marketplace root used for item links.
    pub fn new(site: Url, webhook_urls: &[String], options: &ClientOptions) -> Result<Self, SinkError> {
        let mut hooks = Vec::with_capacity(webhook_urls.len());
        for raw in webhook_urls {
            let url = Url::parse(raw).map_err(|source| SinkError::Url {
                url: raw.clone(),
                source,
            })?;
            hooks.push((raw.clone(), ApiClient::new(url, options)?));
        }
        Ok(Self { site, hooks })
    }

    fn item_link(&self, suffix: &str) -> String {
        format!("{}/{}", self.site.as_str().trim_end_matches('/'), suffix)
    }

    /// Embed payload for one listing.
    pub fn embed(&self, item: &ListedItem) -> Value {
        let id = item.id;
        let price = item.price_label();
        let size = item.size.as_deref().unwrap_or("?");
        let brand = item.brand.as_deref().unwrap_or("?");
        let condition = item.status.as_deref().unwrap_or("?");
        let view = self.item_link(&format!("items/{id}"));

        let mut fields = vec![
            field("💰 Price", &price, true),
            field("📏 Size", size, true),
            field("🏷️ Brand", brand, true),
            field("🌍 Country", item.seller_country().unwrap_or("?"), true),
        ];
        if let Some(stars) = item.rating_stars() {
            fields.push(field("⭐️ User Rating", &stars, true));
        }
        fields.push(field("📦 Condition", condition, true));
        if let Some(updated) = item.updated_at() {
            fields.push(field("📅 Updated", &format!("<t:{}:R>", updated.timestamp()), true));
        }
        fields.push(field("🔗 View", &format!("[View listing]({view})"), false));
        fields.push(field(
            "📨 Send Message",
            &format!("[Send Message]({})", self.item_link(&format!("items/{id}/want_it/new"))),
            false,
        ));
        fields.push(field(
            "💸 Buy",
            &format!(
                "[Buy]({})",
                self.item_link(&format!(
                    "transaction/buy/new?source_screen=item&transaction%5Bitem_id%5D={id}"
                ))
            ),
            false,
        ));

        json!({
            "embeds": [{
                "title": format!("{brand} {size} for {price}"),
                "description": format!("Condition: {condition}"),
                "url": view,
                "image": { "url": item.photo_url() },
                "fields": fields,
            }]
        })
    }
}

fn field(name: &str, value: &str, inline: bool) -> Value {
    json!({ "name": name, "value": value, "inline": inline })
}

impl NotificationSink for WebhookSink {
    fn name(&self) -> &'static str {
        "webhook"
    }

    /// Posts to every hook; a failing hook does not stop the others. The
    /// first failure is returned.
    async fn send(&self, item: &ListedItem) -> Result<(), SinkError> {
        let payload = self.embed(item);
        let mut first_error = None;

        for (url, client) in &self.hooks {
            let result = client
                .request_text(Method::POST, "", None, Some(&payload))
                .await
                .map_err(SinkError::from)
                .and_then(|response| {
                    if response.success {
                        Ok(())
                    } else {
                        Err(SinkError::Status {
                            url: url.clone(),
                            status: response.status,
                        })
                    }
                });

            if let Err(err) = result {
                tracing::warn!(item_id = item.id, error = %err, "webhook delivery failed");
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Notification sink used when no webhook is configured.
pub struct LogSink;

impl NotificationSink for LogSink {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(&self, item: &ListedItem) -> Result<(), SinkError> {
        tracing::info!(
            item_id = item.id,
            price = %item.price_label(),
            brand = item.brand.as_deref().unwrap_or("?"),
            size = item.size.as_deref().unwrap_or("?"),
            "match"
        );
        Ok(())
    }
}

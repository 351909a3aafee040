//! News feed. Items younger than three hours count as breaking and raise
//! bus events; symbols with fresh positive coverage are remembered for the
//! sell-on-news trap check.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{info, warn};

use crate::events::{Event, EventBus, EventKind};
use crate::models::Config;

const BREAKING_WINDOW_HOURS: i64 = 3;

#[derive(Debug, Clone)]
pub struct NewsItem {
    pub symbol: Option<String>,
    pub title: String,
    pub category: String,
    pub ts: DateTime<Utc>,
}

pub fn is_breaking(ts: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now - ts < ChronoDuration::hours(BREAKING_WINDOW_HOURS)
}

/// Symbols with recent positive coverage.
#[derive(Default)]
pub struct NewsState {
    positive: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl NewsState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn mark_positive(&self, symbol: &str, ts: DateTime<Utc>) {
        self.positive.write().insert(symbol.to_string(), ts);
    }

    pub fn has_recent_positive(&self, symbol: &str, now: DateTime<Utc>) -> bool {
        self.positive
            .read()
            .get(symbol)
            .map(|ts| is_breaking(*ts, now))
            .unwrap_or(false)
    }

    pub fn clear(&self) {
        self.positive.write().clear();
    }
}

#[derive(Debug, Deserialize)]
struct NewsResponse {
    #[serde(default)]
    items: Vec<NewsRow>,
}

#[derive(Debug, Deserialize)]
struct NewsRow {
    #[serde(default)]
    symbol: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    category: String,
    #[serde(default)]
    published_at: String,
}

pub struct NewsFeed {
    client: reqwest::Client,
    base_url: String,
    state: Arc<NewsState>,
    bus: Arc<EventBus>,
}

impl NewsFeed {
    pub fn new(config: &Config, state: Arc<NewsState>, bus: Arc<EventBus>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            base_url: config.news_base_url.trim_end_matches('/').to_string(),
            state,
            bus,
        }
    }

    pub async fn fetch_latest(&self) -> Result<Vec<NewsItem>> {
        let response: NewsResponse = self
            .client
            .get(format!("{}/breaking.json", self.base_url))
            .send()
            .await
            .context("news request")?
            .error_for_status()
            .context("news status")?
            .json()
            .await
            .context("news body")?;

        Ok(response
            .items
            .into_iter()
            .map(|row| NewsItem {
                symbol: (!row.symbol.is_empty()).then_some(row.symbol),
                title: row.title,
                category: row.category,
                ts: DateTime::parse_from_rfc3339(&row.published_at)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
            })
            .collect())
    }

    pub async fn poll_once(&self) {
        let items = match self.fetch_latest().await {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %e, "news poll failed");
                return;
            }
        };

        let now = Utc::now();
        for item in items {
            if !is_breaking(item.ts, now) {
                continue;
            }
            let Some(symbol) = &item.symbol else { continue };
            self.state.mark_positive(symbol, item.ts);
            info!(symbol = %symbol, title = %item.title, "breaking news");
            self.bus
                .publish(Event::new(
                    EventKind::BreakingNews,
                    Some(symbol),
                    serde_json::json!({
                        "title": item.title,
                        "category": item.category,
                    }),
                ))
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_hour_breaking_window() {
        let now = Utc::now();
        assert!(is_breaking(now - ChronoDuration::minutes(170), now));
        assert!(!is_breaking(now - ChronoDuration::minutes(181), now));
    }

    #[test]
    fn positive_coverage_expires_with_the_window() {
        let state = NewsState::new();
        let now = Utc::now();
        state.mark_positive("005930", now - ChronoDuration::hours(1));
        assert!(state.has_recent_positive("005930", now));

        state.mark_positive("035720", now - ChronoDuration::hours(4));
        assert!(!state.has_recent_positive("035720", now));
        assert!(!state.has_recent_positive("UNKNOWN", now));
    }
}

//! Disclosure feed and keyword classification.
//!
//! Filing titles are classified into four buckets by keyword lists; risk
//! and overhang filings raise bus events, and overhang filings flag the
//! symbol's dilution-day trap for the rest of the session.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::events::{Event, EventBus, EventKind};
use crate::models::Config;

const RISK_KEYWORDS: [&str; 7] = [
    "부도",
    "횡령",
    "배임",
    "소송",
    "거래정지",
    "관리종목",
    "상장폐지",
];
const OVERHANG_KEYWORDS: [&str; 4] = ["전환사채", "신주인수권", "유상증자", "감자"];
const GOOD_KEYWORDS: [&str; 5] = ["무상증자", "수주", "공급계약", "최대주주변경", "공개매수"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisclosureClass {
    CriticalRisk,
    OverhangRisk,
    GoodNews,
    Neutral,
}

impl DisclosureClass {
    pub fn as_str(&self) -> &str {
        match self {
            DisclosureClass::CriticalRisk => "critical_risk",
            DisclosureClass::OverhangRisk => "overhang_risk",
            DisclosureClass::GoodNews => "good_news",
            DisclosureClass::Neutral => "neutral",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Disclosure {
    pub symbol: String,
    pub title: String,
    pub ts: DateTime<Utc>,
    pub category: String,
    pub importance: i32,
}

pub fn classify_title(title: &str) -> DisclosureClass {
    if RISK_KEYWORDS.iter().any(|k| title.contains(k)) {
        DisclosureClass::CriticalRisk
    } else if OVERHANG_KEYWORDS.iter().any(|k| title.contains(k)) {
        DisclosureClass::OverhangRisk
    } else if GOOD_KEYWORDS.iter().any(|k| title.contains(k)) {
        DisclosureClass::GoodNews
    } else {
        DisclosureClass::Neutral
    }
}

/// Today's classified filings, read by the trap-input builder.
#[derive(Default)]
pub struct DisclosureState {
    today: RwLock<HashMap<String, DisclosureClass>>,
}

impl DisclosureState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn mark(&self, symbol: &str, class: DisclosureClass) {
        // A worse classification never gets downgraded by a later filing.
        let mut today = self.today.write();
        let entry = today.entry(symbol.to_string()).or_insert(class);
        if rank(class) > rank(*entry) {
            *entry = class;
        }
    }

    pub fn class_for(&self, symbol: &str) -> DisclosureClass {
        self.today
            .read()
            .get(symbol)
            .copied()
            .unwrap_or(DisclosureClass::Neutral)
    }

    pub fn has_dilution(&self, symbol: &str) -> bool {
        self.class_for(symbol) == DisclosureClass::OverhangRisk
    }

    /// Cleared by daily settlement.
    pub fn clear(&self) {
        self.today.write().clear();
    }
}

fn rank(class: DisclosureClass) -> u8 {
    match class {
        DisclosureClass::Neutral => 0,
        DisclosureClass::GoodNews => 1,
        DisclosureClass::OverhangRisk => 2,
        DisclosureClass::CriticalRisk => 3,
    }
}

#[derive(Debug, Deserialize)]
struct FilingList {
    #[serde(default)]
    list: Vec<FilingRow>,
}

#[derive(Debug, Deserialize)]
struct FilingRow {
    #[serde(default)]
    stock_code: String,
    #[serde(default)]
    report_nm: String,
    #[serde(default)]
    rcept_dt: String,
}

pub struct DisclosureFeed {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    state: Arc<DisclosureState>,
    bus: Arc<EventBus>,
}

impl DisclosureFeed {
    pub fn new(config: &Config, state: Arc<DisclosureState>, bus: Arc<EventBus>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            base_url: config.disclosure_base_url.trim_end_matches('/').to_string(),
            api_key: config.disclosure_api_key.clone(),
            state,
            bus,
        }
    }

    pub async fn fetch_recent(&self) -> Result<Vec<Disclosure>> {
        let Some(key) = &self.api_key else {
            debug!("disclosure feed not configured");
            return Ok(vec![]);
        };
        let today = Utc::now().format("%Y%m%d").to_string();
        let list: FilingList = self
            .client
            .get(format!("{}/list.json", self.base_url))
            .query(&[
                ("crtfc_key", key.as_str()),
                ("bgn_de", today.as_str()),
                ("page_count", "100"),
            ])
            .send()
            .await
            .context("disclosure request")?
            .error_for_status()
            .context("disclosure status")?
            .json()
            .await
            .context("disclosure body")?;

        Ok(list
            .list
            .into_iter()
            .filter(|row| !row.stock_code.is_empty())
            .map(|row| Disclosure {
                symbol: row.stock_code,
                title: row.report_nm,
                ts: Utc::now(),
                category: row.rcept_dt,
                importance: 0,
            })
            .collect())
    }

    /// One poll: classify, remember, and raise events for non-neutral
    /// filings.
    pub async fn poll_once(&self) {
        let filings = match self.fetch_recent().await {
            Ok(filings) => filings,
            Err(e) => {
                warn!(error = %e, "disclosure poll failed");
                return;
            }
        };

        for filing in filings {
            let class = classify_title(&filing.title);
            if class == DisclosureClass::Neutral {
                continue;
            }
            self.state.mark(&filing.symbol, class);
            info!(
                symbol = %filing.symbol,
                class = class.as_str(),
                title = %filing.title,
                "disclosure classified"
            );
            self.bus
                .publish(Event::new(
                    EventKind::Disclosure,
                    Some(&filing.symbol),
                    serde_json::json!({
                        "title": filing.title,
                        "class": class.as_str(),
                    }),
                ))
                .await;
        }
    }
}

//! Intraday market scanner.
//!
//! Every minute during the session: pull the gainer and volume rankings,
//! quick-score the union with the fast reasoner, and turn anything scoring
//! 70+ into a hot-symbol event plus an opportunistic priority-3 stream
//! subscription for the strongest few.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::broker::{Brokerage, RankedSymbol};
use crate::events::{Event, EventBus, EventKind};
use crate::llm::{extract_json, Reasoner};
use crate::stream::StreamHandle;

const SCAN_LIMIT: usize = 20;
pub const HOT_SCORE: i32 = 70;
const SUBSCRIBE_TOP: usize = 5;

/// Merge ranking lists, first occurrence wins.
pub fn dedupe_ranked(lists: Vec<Vec<RankedSymbol>>) -> Vec<RankedSymbol> {
    let mut seen = HashSet::new();
    let mut merged = Vec::new();
    for list in lists {
        for row in list {
            if seen.insert(row.symbol.clone()) {
                merged.push(row);
            }
        }
    }
    merged
}

pub fn parse_scan_score(reply: &str) -> i32 {
    extract_json(reply)
        .and_then(|v| v.get("score").and_then(|s| s.as_i64()))
        .map(|s| (s as i32).clamp(0, 100))
        .unwrap_or(0)
}

pub struct MarketScanner {
    broker: Arc<dyn Brokerage>,
    reasoner: Arc<dyn Reasoner>,
    bus: Arc<EventBus>,
    stream: Option<StreamHandle>,
}

impl MarketScanner {
    pub fn new(
        broker: Arc<dyn Brokerage>,
        reasoner: Arc<dyn Reasoner>,
        bus: Arc<EventBus>,
        stream: Option<StreamHandle>,
    ) -> Self {
        Self {
            broker,
            reasoner,
            bus,
            stream,
        }
    }

    async fn score_symbol(&self, row: &RankedSymbol) -> i32 {
        let system = "You screen Korean stocks for short-term momentum. \
            Answer ONLY with JSON: {\"score\": 0-100}";
        let prompt = format!(
            "{} ({}): {} KRW, {:+.2}% today, volume {} shares. \
             Worth watching for an intraday entry?",
            row.name, row.symbol, row.price, row.change_pct, row.volume
        );
        match self.reasoner.chat(system, &prompt).await {
            Ok(reply) => parse_scan_score(&reply),
            Err(e) => {
                debug!(symbol = %row.symbol, error = %e, "scan scoring failed");
                0
            }
        }
    }

    pub async fn run_once(&self) {
        let gainers = self.broker.top_gainers(SCAN_LIMIT).await.unwrap_or_else(|e| {
            warn!(error = %e, "gainer scan failed");
            vec![]
        });
        let volume = self.broker.top_volume(SCAN_LIMIT).await.unwrap_or_else(|e| {
            warn!(error = %e, "volume scan failed");
            vec![]
        });
        let merged = dedupe_ranked(vec![gainers, volume]);
        if merged.is_empty() {
            return;
        }

        let mut hot: Vec<(RankedSymbol, i32)> = Vec::new();
        for row in &merged {
            let score = self.score_symbol(row).await;
            if score >= HOT_SCORE {
                hot.push((row.clone(), score));
            }
        }
        if hot.is_empty() {
            return;
        }
        hot.sort_by(|a, b| b.1.cmp(&a.1));
        info!(candidates = merged.len(), hot = hot.len(), "scanner pass");

        for (row, score) in &hot {
            self.bus
                .publish(Event::new(
                    EventKind::HotSymbol,
                    Some(&row.symbol),
                    serde_json::json!({
                        "name": row.name,
                        "score": score,
                        "change_pct": row.change_pct,
                    }),
                ))
                .await;
        }

        if let Some(stream) = &self.stream {
            for (row, _) in hot.iter().take(SUBSCRIBE_TOP) {
                stream.subscribe(&row.symbol, &row.name, 3).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranked(symbol: &str) -> RankedSymbol {
        RankedSymbol {
            symbol: symbol.into(),
            name: symbol.into(),
            price: 10_000,
            change_pct: 5.0,
            volume: 1_000_000,
        }
    }

    #[test]
    fn dedupe_keeps_first_occurrence() {
        let merged = dedupe_ranked(vec![
            vec![ranked("A"), ranked("B")],
            vec![ranked("B"), ranked("C")],
        ]);
        let symbols: Vec<&str> = merged.iter().map(|r| r.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["A", "B", "C"]);
    }

    #[test]
    fn scan_score_parses_defensively() {
        assert_eq!(parse_scan_score(r#"{"score": 85}"#), 85);
        assert_eq!(parse_scan_score("hmm"), 0);
        assert_eq!(parse_scan_score(r#"{"score": -5}"#), 0);
        assert_eq!(parse_scan_score(r#"{"score": 150}"#), 100);
    }
}

//! Morning deep analysis (07:20).
//!
//! Scores a broad candidate universe with the reasoning model before the
//! open, persists the ranked top twenty as the day's picks and hands them to
//! the stream manager as the priority-2 tier.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::broker::{Brokerage, RankedSymbol};
use crate::llm::{extract_json, Reasoner};
use crate::models::DailyPick;
use crate::storage::Db;
use crate::stream::StreamHandle;

const UNIVERSE_LIMIT: usize = 50;
pub const PICK_LIMIT: usize = 20;
const MIN_PICK_SCORE: i32 = 60;

/// Rank scored candidates into pick rows, best first, capped at twenty.
pub fn rank_picks(mut scored: Vec<(RankedSymbol, i32, String)>) -> Vec<DailyPick> {
    scored.retain(|(_, score, _)| *score >= MIN_PICK_SCORE);
    scored.sort_by(|a, b| b.1.cmp(&a.1));
    let date = Utc::now().date_naive();
    scored
        .into_iter()
        .take(PICK_LIMIT)
        .enumerate()
        .map(|(i, (row, score, comment))| DailyPick {
            date,
            rank: i as i32 + 1,
            symbol: row.symbol,
            name: row.name,
            ai_score: score,
            comment,
            expected_entry: row.price,
        })
        .collect()
}

pub struct DailyAnalyzer {
    db: Db,
    broker: Arc<dyn Brokerage>,
    reasoner: Arc<dyn Reasoner>,
    stream: Option<StreamHandle>,
}

impl DailyAnalyzer {
    pub fn new(
        db: Db,
        broker: Arc<dyn Brokerage>,
        reasoner: Arc<dyn Reasoner>,
        stream: Option<StreamHandle>,
    ) -> Self {
        Self {
            db,
            broker,
            reasoner,
            stream,
        }
    }

    async fn score_candidate(&self, row: &RankedSymbol) -> (i32, String) {
        let system = "You are preparing a Korean equity watchlist before the open. \
            Score the stock 0-100 for today and answer ONLY with JSON: \
            {\"score\": 0-100, \"comment\": \"one line\"}";
        let prompt = format!(
            "{} ({}): closed {} KRW ({:+.2}%), volume {} shares.",
            row.name, row.symbol, row.price, row.change_pct, row.volume
        );
        match self.reasoner.reason(system, &prompt).await {
            Ok(reply) => {
                let value = extract_json(&reply.answer);
                let score = value
                    .as_ref()
                    .and_then(|v| v.get("score").and_then(|s| s.as_i64()))
                    .map(|s| (s as i32).clamp(0, 100))
                    .unwrap_or(0);
                let comment = value
                    .and_then(|v| {
                        v.get("comment").and_then(|c| c.as_str()).map(String::from)
                    })
                    .unwrap_or_default();
                (score, comment)
            }
            Err(e) => {
                debug!(symbol = %row.symbol, error = %e, "pick scoring failed");
                (0, String::new())
            }
        }
    }

    /// Full pre-open pass. Returns the number of picks stored.
    pub async fn run(&self) -> usize {
        let universe = match self.broker.top_volume(UNIVERSE_LIMIT).await {
            Ok(universe) => universe,
            Err(e) => {
                warn!(error = %e, "universe fetch failed, no picks today");
                return 0;
            }
        };

        let mut scored = Vec::with_capacity(universe.len());
        for row in &universe {
            let (score, comment) = self.score_candidate(row).await;
            scored.push((row.clone(), score, comment));
        }

        let picks = rank_picks(scored);
        let date = Utc::now().date_naive();
        if let Err(e) = self.db.replace_daily_picks(date, &picks) {
            warn!(error = %e, "daily picks not persisted");
            return 0;
        }
        info!(picks = picks.len(), "daily deep analysis complete");

        if let Some(stream) = &self.stream {
            let pairs: Vec<(String, String)> = picks
                .iter()
                .map(|p| (p.symbol.clone(), p.name.clone()))
                .collect();
            stream.update_daily_picks(pairs).await;
        }
        picks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scored(symbol: &str, score: i32) -> (RankedSymbol, i32, String) {
        (
            RankedSymbol {
                symbol: symbol.into(),
                name: symbol.into(),
                price: 10_000,
                change_pct: 1.0,
                volume: 100,
            },
            score,
            String::new(),
        )
    }

    #[test]
    fn ranking_sorts_filters_and_caps() {
        let mut input = vec![scored("LOW", 40), scored("MID", 70), scored("TOP", 90)];
        for i in 0..25 {
            input.push(scored(&format!("S{i}"), 61 + (i % 10) as i32));
        }
        let picks = rank_picks(input);

        assert_eq!(picks.len(), PICK_LIMIT);
        assert_eq!(picks[0].symbol, "TOP");
        assert_eq!(picks[0].rank, 1);
        assert!(picks.iter().all(|p| p.ai_score >= MIN_PICK_SCORE));
        assert!(picks.iter().all(|p| p.symbol != "LOW"));
        // Ranks are dense and ordered.
        for (i, pick) in picks.iter().enumerate() {
            assert_eq!(pick.rank, i as i32 + 1);
        }
    }
}

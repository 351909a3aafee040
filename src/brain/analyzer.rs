//! Candidate scoring.
//!
//! Quant score from stored tape and technical context, ai score from the
//! fast reasoner (or the morning pick that nominated the symbol), trap
//! penalty applied to the ai side, then the weighted combine:
//! `final = round(quant x 0.57 + ai x 0.43)`. A wide quant/ai disagreement
//! forces hold regardless of the combined score.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::brain::traps::{apply_traps_to_ai_score, TrapDetector, TrapInput};
use crate::llm::{extract_json, Reasoner};
use crate::models::{TradeAction, TradeSignal};

pub const QUANT_WEIGHT: f64 = 0.57;
pub const AI_WEIGHT: f64 = 0.43;
pub const BUY_THRESHOLD: i32 = 75;
pub const SELL_THRESHOLD: i32 = 40;
pub const UNCERTAINTY_GAP: i32 = 30;

const QUANT_BASE: i32 = 60;
const QUANT_MAX: i32 = 90;
const DEFAULT_AI_SCORE: i32 = 50;

/// A symbol nominated for analysis, with whatever scores its source already
/// carries (daily picks arrive pre-scored; scanner finds do not).
#[derive(Debug, Clone)]
pub struct Candidate {
    pub symbol: String,
    pub name: String,
    pub current_price: i64,
    pub prior_ai_score: Option<i32>,
    pub source: String,
}

pub fn combine_scores(quant: i32, ai: i32) -> i32 {
    (quant as f64 * QUANT_WEIGHT + ai as f64 * AI_WEIGHT).round() as i32
}

/// Action rule: a quant/ai split of 30+ points is unresolvable uncertainty
/// and forces hold; otherwise the combined score decides.
pub fn decide_action(quant: i32, ai: i32, final_score: i32) -> TradeAction {
    if (ai - quant).abs() >= UNCERTAINTY_GAP {
        return TradeAction::Hold;
    }
    if final_score >= BUY_THRESHOLD {
        TradeAction::Buy
    } else if final_score <= SELL_THRESHOLD {
        TradeAction::Sell
    } else {
        TradeAction::Hold
    }
}

/// Target and stop bands keyed on the combined score.
pub fn target_stop(final_score: i32, price: i64) -> (i64, i64) {
    let (target_pct, stop_pct) = if final_score >= 80 {
        (8.0, -3.0)
    } else if final_score >= 70 {
        (6.0, -4.0)
    } else if final_score >= 60 {
        (4.0, -5.0)
    } else {
        (2.0, -6.0)
    };
    let target = (price as f64 * (1.0 + target_pct / 100.0)).round() as i64;
    let stop = (price as f64 * (1.0 + stop_pct / 100.0)).round() as i64;
    (target, stop)
}

/// Objective-side score over the snapshot bundle: base 60, nudged by
/// investor flows, volume and trend position, capped at 90.
pub fn quant_score(input: &TrapInput) -> i32 {
    let mut score = QUANT_BASE;
    if input.foreign_net > 0 {
        score += 10;
    } else if input.foreign_net < 0 {
        score -= 5;
    }
    if input.inst_net > 0 {
        score += 10;
    } else if input.inst_net < 0 {
        score -= 5;
    }
    if input.volume_ratio >= 1.5 {
        score += 5;
    }
    if input.change_pct < 0.0 {
        score -= 10;
    }
    if input.ma120 > 0 && input.current_price > input.ma120 {
        score += 5;
    }
    score.clamp(0, QUANT_MAX)
}

pub struct Analyzer {
    traps: TrapDetector,
    reasoner: Arc<dyn Reasoner>,
}

impl Analyzer {
    pub fn new(traps: TrapDetector, reasoner: Arc<dyn Reasoner>) -> Self {
        Self { traps, reasoner }
    }

    /// Score one candidate into a signal. Never fails: reasoner outages fall
    /// back to a neutral ai score and the rest of the math still runs.
    pub async fn analyze(&self, candidate: &Candidate, input: &TrapInput) -> TradeSignal {
        let traps = self.traps.detect(input);
        let quant = quant_score(input);

        let (raw_ai, ai_comment) = match candidate.prior_ai_score {
            Some(score) => (score.clamp(0, 100), format!("{} pick", candidate.source)),
            None => self.ai_score(candidate, input).await,
        };
        let ai = apply_traps_to_ai_score(raw_ai, &traps);
        if ai != raw_ai {
            debug!(
                symbol = %candidate.symbol,
                raw_ai,
                ai,
                traps = traps.len(),
                "trap penalty applied"
            );
        }

        let final_score = combine_scores(quant, ai);
        let action = decide_action(quant, ai, final_score);
        let (target_price, stop_price) = target_stop(final_score, candidate.current_price);

        TradeSignal {
            symbol: candidate.symbol.clone(),
            name: candidate.name.clone(),
            current_price: candidate.current_price,
            action,
            quant_score: quant,
            ai_score: ai,
            final_score,
            confidence: final_score,
            target_price,
            stop_price,
            reasoning: ai_comment,
            traps,
        }
    }

    async fn ai_score(&self, candidate: &Candidate, input: &TrapInput) -> (i32, String) {
        let system = "You are a short-horizon equity analyst for the Korean market. \
            Score the stock 0-100 for the next few hours and answer ONLY with JSON: \
            {\"score\": 0-100, \"comment\": \"one line\"}";
        let prompt = format!(
            "Stock: {} ({})\nPrice: {} KRW ({:+.2}% today)\nVolume ratio vs yesterday: {:.2}\n\
             Foreign net: {} shares, institutions net: {} shares\nSector {} {:+.2}%",
            candidate.name,
            candidate.symbol,
            candidate.current_price,
            input.change_pct,
            input.volume_ratio,
            input.foreign_net,
            input.inst_net,
            input.sector_name,
            input.sector_change_pct,
        );

        match self.reasoner.chat(system, &prompt).await {
            Ok(reply) => parse_ai_reply(&reply),
            Err(e) => {
                warn!(symbol = %candidate.symbol, error = %e, "ai scoring failed, using neutral");
                (DEFAULT_AI_SCORE, "ai scoring unavailable".to_string())
            }
        }
    }
}

fn parse_ai_reply(reply: &str) -> (i32, String) {
    let Some(value) = extract_json(reply) else {
        return (DEFAULT_AI_SCORE, "unparseable ai reply".to_string());
    };
    let score = value
        .get("score")
        .and_then(Value::as_i64)
        .map(|s| (s as i32).clamp(0, 100))
        .unwrap_or(DEFAULT_AI_SCORE);
    let comment = value
        .get("comment")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    (score, comment)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_is_a_rounded_57_43_average() {
        assert_eq!(combine_scores(80, 80), 80);
        // 80*0.57 + 45*0.43 = 64.95 -> 65.
        assert_eq!(combine_scores(80, 45), 65);
        assert_eq!(combine_scores(0, 100), 43);
        assert_eq!(combine_scores(100, 0), 57);
    }

    #[test]
    fn wide_disagreement_forces_hold() {
        // diff = 35 >= 30, even though the combined score clears the buy bar.
        let final_score = combine_scores(80, 45);
        assert_eq!(decide_action(80, 45, final_score), TradeAction::Hold);
        // diff 29 with a passing score buys.
        assert_eq!(decide_action(90, 61, combine_scores(90, 61)), TradeAction::Buy);
    }

    #[test]
    fn action_thresholds() {
        assert_eq!(decide_action(75, 75, 75), TradeAction::Buy);
        assert_eq!(decide_action(74, 74, 74), TradeAction::Hold);
        assert_eq!(decide_action(40, 40, 40), TradeAction::Sell);
        assert_eq!(decide_action(41, 41, 41), TradeAction::Hold);
    }

    #[test]
    fn band_table_matches_score_tiers() {
        let price = 100_000;
        assert_eq!(target_stop(80, price), (108_000, 97_000));
        assert_eq!(target_stop(79, price), (106_000, 96_000));
        assert_eq!(target_stop(69, price), (104_000, 95_000));
        assert_eq!(target_stop(59, price), (102_000, 94_000));
    }

    #[test]
    fn quant_score_stays_in_band() {
        let mut input = TrapInput::default();
        input.foreign_net = 1;
        input.inst_net = 1;
        input.volume_ratio = 2.0;
        input.ma120 = 1;
        input.current_price = 2;
        assert_eq!(quant_score(&input), QUANT_MAX);

        let mut bearish = TrapInput::default();
        bearish.foreign_net = -1;
        bearish.inst_net = -1;
        bearish.change_pct = -2.0;
        assert_eq!(quant_score(&bearish), 40);
    }

    #[test]
    fn ai_reply_parsing_is_defensive() {
        assert_eq!(parse_ai_reply(r#"{"score": 82, "comment": "strong"}"#).0, 82);
        assert_eq!(parse_ai_reply("no json at all").0, DEFAULT_AI_SCORE);
        assert_eq!(parse_ai_reply(r#"{"score": 300}"#).0, 100);
        assert_eq!(parse_ai_reply(r#"{"comment": "missing score"}"#).0, DEFAULT_AI_SCORE);
    }
}

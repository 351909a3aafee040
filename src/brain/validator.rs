//! Three-method validation gate: scenario analysis, historical analogs and a
//! Monte Carlo sweep, combined 0.3/0.4/0.3, followed by a reasoning-model
//! veto. A reasoner outage never blocks trading; only the numeric gates do.

use std::sync::Arc;

use rand::distributions::Distribution;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use statrs::distribution::Normal;
use tracing::{info, warn};

use crate::llm::{extract_json, Reasoner};
use crate::models::{TradeSignal, ValidationVerdict};
use crate::storage::Db;

pub const MIN_FINAL_SCORE: f64 = 65.0;
pub const MIN_WIN_RATE: f64 = 55.0;
pub const MIN_PROFIT_PROB: f64 = 60.0;

const WEIGHT_SCENARIO: f64 = 0.3;
const WEIGHT_BACKTEST: f64 = 0.4;
const WEIGHT_MONTECARLO: f64 = 0.3;

const SIMULATIONS: usize = 1_000;
const MC_STDEV: f64 = 4.0;
const MC_MEAN_HAIRCUT: f64 = 0.7;

const BASE_POSITION_AMOUNT: f64 = 2_000_000.0;

/// Prior used until enough trade history accumulates.
const PRIOR_WIN_RATE: f64 = 64.0;
const PRIOR_AVG_RETURN: f64 = 6.5;

#[derive(Debug, Clone)]
pub struct ScenarioOutcome {
    pub best: f64,
    pub expected: f64,
    pub worst: f64,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct BacktestOutcome {
    pub samples: i64,
    pub win_rate: f64,
    pub avg_return: f64,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct MonteCarloOutcome {
    pub mean: f64,
    pub stdev: f64,
    pub profit_prob: f64,
    pub p5: f64,
    pub p50: f64,
    pub p95: f64,
    pub score: f64,
}

/// Best/expected/worst with fixed 20/60/20 probabilities, scored on the
/// probability-weighted mean mapped onto [0,100] via (ev + 5) / 20.
pub fn scenario_outcome(ai_return_pct: f64) -> ScenarioOutcome {
    let best = ai_return_pct * 1.5;
    let expected = ai_return_pct * 0.8;
    let worst = -3.0;
    let ev = best * 0.2 + expected * 0.6 + worst * 0.2;
    let score = ((ev + 5.0) / 20.0 * 100.0).clamp(0.0, 100.0);
    ScenarioOutcome {
        best,
        expected,
        worst,
        score,
    }
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = (p / 100.0 * (sorted.len() - 1) as f64).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

/// Sample `S = 1000` normal returns with mean `aiReturn x 0.7` and stdev 4.
pub fn montecarlo_outcome(ai_return_pct: f64, seed: Option<u64>) -> MonteCarloOutcome {
    let mean = ai_return_pct * MC_MEAN_HAIRCUT;
    let Ok(dist) = Normal::new(mean, MC_STDEV) else {
        return MonteCarloOutcome {
            mean,
            stdev: MC_STDEV,
            profit_prob: 0.0,
            p5: 0.0,
            p50: 0.0,
            p95: 0.0,
            score: 0.0,
        };
    };

    let mut rng = match seed {
        Some(seed) => ChaCha8Rng::seed_from_u64(seed),
        None => ChaCha8Rng::from_entropy(),
    };
    let mut returns: Vec<f64> = (0..SIMULATIONS).map(|_| dist.sample(&mut rng)).collect();
    returns.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let sample_mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance = returns
        .iter()
        .map(|r| (r - sample_mean).powi(2))
        .sum::<f64>()
        / returns.len() as f64;
    let stdev = variance.sqrt();
    let profit_prob =
        returns.iter().filter(|r| **r > 0.0).count() as f64 / returns.len() as f64 * 100.0;

    let score = (profit_prob + sample_mean * 2.0).min(100.0);
    MonteCarloOutcome {
        mean: sample_mean,
        stdev,
        profit_prob,
        p5: percentile(&returns, 5.0),
        p50: percentile(&returns, 50.0),
        p95: percentile(&returns, 95.0),
        score,
    }
}

/// Risk-scaled sizing: base 2,000,000 grown by score over 65 and shrunk by
/// volatility, floored at a single share.
pub fn recommended_quantity(price: i64, stdev: f64, final_score: f64) -> i64 {
    if price <= 0 {
        return 1;
    }
    let score_factor = 1.0 + (final_score - 65.0) / 100.0;
    let volatility_factor = 1.0 / (1.0 + stdev / 10.0);
    let amount = BASE_POSITION_AMOUNT * score_factor * volatility_factor;
    ((amount / price as f64).floor() as i64).max(1)
}

pub struct ScenarioValidator {
    db: Db,
    reasoner: Arc<dyn Reasoner>,
    /// Fixed seed makes simulations reproducible in tests.
    seed: Option<u64>,
}

impl ScenarioValidator {
    pub fn new(db: Db, reasoner: Arc<dyn Reasoner>) -> Self {
        Self {
            db,
            reasoner,
            seed: None,
        }
    }

    pub fn with_seed(db: Db, reasoner: Arc<dyn Reasoner>, seed: u64) -> Self {
        Self {
            db,
            reasoner,
            seed: Some(seed),
        }
    }

    fn backtest_outcome(&self, symbol: &str) -> BacktestOutcome {
        let (samples, win_rate, avg_return) = match self.db.feedback_performance(symbol) {
            Ok(Some((count, win, avg))) if count > 0 => (count, win, avg),
            Ok(_) => (0, PRIOR_WIN_RATE, PRIOR_AVG_RETURN),
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "history read failed, using prior");
                (0, PRIOR_WIN_RATE, PRIOR_AVG_RETURN)
            }
        };
        BacktestOutcome {
            samples,
            win_rate,
            avg_return,
            score: (win_rate + avg_return * 3.0).min(100.0),
        }
    }

    pub async fn validate(&self, signal: &TradeSignal) -> ValidationVerdict {
        let ai_return = signal.predicted_return_pct();
        let scenario = scenario_outcome(ai_return);
        let backtest = self.backtest_outcome(&signal.symbol);
        let montecarlo = montecarlo_outcome(ai_return, self.seed);

        let final_score = scenario.score * WEIGHT_SCENARIO
            + backtest.score * WEIGHT_BACKTEST
            + montecarlo.score * WEIGHT_MONTECARLO;

        let price = signal.current_price as f64;
        let scenario_target = price * (1.0 + scenario.expected / 100.0);
        let backtest_target = price * (1.0 + backtest.avg_return / 100.0);
        let montecarlo_target = price * (1.0 + montecarlo.p50 / 100.0);
        let adjusted_target =
            scenario_target.min(backtest_target).min(montecarlo_target) as i64;

        let recommended_qty =
            recommended_quantity(signal.current_price, montecarlo.stdev, final_score);

        let (mut approved, mut reason) = decide(
            final_score,
            backtest.win_rate,
            montecarlo.profit_prob,
        );

        if approved {
            match self
                .reasoner_veto(signal, &scenario, &backtest, &montecarlo, final_score)
                .await
            {
                VetoOutcome::Approved(note) => {
                    if !note.is_empty() {
                        reason = format!("{reason} | reviewer: {note}");
                    }
                }
                VetoOutcome::Vetoed(why) => {
                    approved = false;
                    reason = format!("reviewer veto: {why}");
                }
            }
        }

        info!(
            symbol = %signal.symbol,
            score = format!("{final_score:.1}"),
            approved,
            reason = %reason,
            "validation verdict"
        );

        ValidationVerdict {
            symbol: signal.symbol.clone(),
            scenario_score: scenario.score,
            backtest_score: backtest.score,
            montecarlo_score: montecarlo.score,
            final_score,
            win_rate: backtest.win_rate,
            profit_prob: montecarlo.profit_prob,
            return_stdev: montecarlo.stdev,
            adjusted_target,
            recommended_qty,
            approved,
            reason,
        }
    }

    async fn reasoner_veto(
        &self,
        signal: &TradeSignal,
        scenario: &ScenarioOutcome,
        backtest: &BacktestOutcome,
        montecarlo: &MonteCarloOutcome,
        final_score: f64,
    ) -> VetoOutcome {
        let system = "You are a risk reviewer with veto power over equity buys. \
            Look for hidden risk, internal contradictions and over-optimism in the \
            numbers. If anything is suspicious you must veto. Answer ONLY with JSON: \
            {\"approved\": true|false, \"confidence\": 0-100, \"reason\": \"2-3 lines\"}";
        let prompt = format!(
            "Stock {} ({}) at {} KRW, target {} KRW.\n\
             Scenario score {:.1} (best {:+.1}% / expected {:+.1}% / worst {:+.1}%)\n\
             History score {:.1} over {} trades (win rate {:.1}%, avg return {:+.1}%)\n\
             Simulation score {:.1} (profit prob {:.1}%, mean {:+.1}%, stdev {:.1}, p5 {:+.1}%)\n\
             Combined score {:.1}.\n\
             Approve this buy?",
            signal.name,
            signal.symbol,
            signal.current_price,
            signal.target_price,
            scenario.score,
            scenario.best,
            scenario.expected,
            scenario.worst,
            backtest.score,
            backtest.samples,
            backtest.win_rate,
            backtest.avg_return,
            montecarlo.score,
            montecarlo.profit_prob,
            montecarlo.mean,
            montecarlo.stdev,
            montecarlo.p5,
            final_score,
        );

        match self.reasoner.reason(system, &prompt).await {
            Ok(reply) => match extract_json(&reply.answer) {
                Some(value) => {
                    let approved = value
                        .get("approved")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(true);
                    let note = value
                        .get("reason")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string();
                    if approved {
                        VetoOutcome::Approved(note)
                    } else {
                        VetoOutcome::Vetoed(note)
                    }
                }
                None => VetoOutcome::Approved("unparseable reviewer reply".to_string()),
            },
            // A validator outage must not block trading.
            Err(e) => {
                warn!(symbol = %signal.symbol, error = %e, "reviewer unavailable, defaulting to approve");
                VetoOutcome::Approved(String::new())
            }
        }
    }
}

enum VetoOutcome {
    Approved(String),
    Vetoed(String),
}

fn decide(final_score: f64, win_rate: f64, profit_prob: f64) -> (bool, String) {
    if final_score < MIN_FINAL_SCORE {
        return (
            false,
            format!("final score too low: {final_score:.1} < {MIN_FINAL_SCORE}"),
        );
    }
    if win_rate < MIN_WIN_RATE {
        return (
            false,
            format!("win rate too low: {win_rate:.1}% < {MIN_WIN_RATE}%"),
        );
    }
    if profit_prob < MIN_PROFIT_PROB {
        return (
            false,
            format!("profit probability too low: {profit_prob:.1}% < {MIN_PROFIT_PROB}%"),
        );
    }
    (
        true,
        format!(
            "score {final_score:.1}, win {win_rate:.1}%, profit prob {profit_prob:.1}%"
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ReasonerReply;
    use crate::models::{TradeAction, TradeSignal};
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;

    struct CannedReasoner {
        answer: Option<String>,
    }

    #[async_trait]
    impl Reasoner for CannedReasoner {
        async fn chat(&self, _system: &str, _prompt: &str) -> Result<String> {
            Err(anyhow!("not used"))
        }

        async fn reason(&self, _system: &str, _prompt: &str) -> Result<ReasonerReply> {
            match &self.answer {
                Some(answer) => Ok(ReasonerReply {
                    reasoning: String::new(),
                    answer: answer.clone(),
                    raw: answer.clone(),
                }),
                None => Err(anyhow!("reviewer down")),
            }
        }
    }

    fn signal(price: i64, target: i64) -> TradeSignal {
        TradeSignal {
            symbol: "005930".into(),
            name: "Samsung Electronics".into(),
            current_price: price,
            action: TradeAction::Buy,
            quant_score: 80,
            ai_score: 80,
            final_score: 80,
            confidence: 80,
            target_price: target,
            stop_price: price - 3_000,
            reasoning: String::new(),
            traps: vec![],
        }
    }

    fn validator(answer: Option<&str>) -> ScenarioValidator {
        ScenarioValidator::with_seed(
            Db::open_in_memory().unwrap(),
            Arc::new(CannedReasoner {
                answer: answer.map(|s| s.to_string()),
            }),
            42,
        )
    }

    #[test]
    fn scenario_score_formula() {
        let outcome = scenario_outcome(8.0);
        assert!((outcome.best - 12.0).abs() < 1e-9);
        assert!((outcome.expected - 6.4).abs() < 1e-9);
        // ev = 12*0.2 + 6.4*0.6 - 3*0.2 = 5.64 -> (5.64+5)/20*100 = 53.2
        assert!((outcome.score - 53.2).abs() < 1e-9);

        // Strongly negative prediction clamps at zero.
        assert_eq!(scenario_outcome(-20.0).score, 0.0);
    }

    #[test]
    fn montecarlo_is_reproducible_with_a_seed() {
        let a = montecarlo_outcome(8.0, Some(7));
        let b = montecarlo_outcome(8.0, Some(7));
        assert_eq!(a.mean, b.mean);
        assert_eq!(a.p50, b.p50);

        // mean 5.6, stdev 4 puts the profit probability well above 60%.
        assert!(a.profit_prob > 80.0);
        assert!(a.p5 < a.p50 && a.p50 < a.p95);
    }

    #[test]
    fn quantity_scales_down_with_volatility_and_never_hits_zero() {
        let calm = recommended_quantity(50_000, 2.0, 80.0);
        let wild = recommended_quantity(50_000, 12.0, 80.0);
        assert!(calm > wild);
        assert_eq!(recommended_quantity(100_000_000, 4.0, 65.0), 1);
    }

    #[test]
    fn numeric_gates_reject_in_order() {
        assert!(!decide(64.9, 90.0, 90.0).0);
        assert!(!decide(80.0, 54.9, 90.0).0);
        assert!(!decide(80.0, 90.0, 59.9).0);
        assert!(decide(65.0, 55.0, 60.0).0);
    }

    #[tokio::test]
    async fn healthy_signal_is_approved_with_conservative_target() {
        let validator = validator(Some(r#"{"approved": true, "reason": "numbers hold up"}"#));
        let signal = signal(100_000, 108_000);
        let verdict = validator.validate(&signal).await;

        assert!(verdict.approved);
        assert!(verdict.final_score >= MIN_FINAL_SCORE);
        // Conservative target never exceeds any of the three implied targets.
        assert!(verdict.adjusted_target <= 108_000);
        assert!(verdict.recommended_qty >= 1);
    }

    #[tokio::test]
    async fn reviewer_veto_overrides_passing_numbers() {
        let validator = validator(Some(
            r#"{"approved": false, "reason": "backtest looks over-fit"}"#,
        ));
        let verdict = validator.validate(&signal(100_000, 108_000)).await;
        assert!(!verdict.approved);
        assert!(verdict.reason.contains("veto"));
    }

    #[tokio::test]
    async fn reviewer_outage_defaults_to_approve() {
        let validator = validator(None);
        let verdict = validator.validate(&signal(100_000, 108_000)).await;
        assert!(verdict.approved);
    }

    #[tokio::test]
    async fn weak_prediction_fails_the_numeric_gates() {
        let validator = validator(Some(r#"{"approved": true}"#));
        // Target barely above price: ai return ~0.5%, simulation mean ~0.35%.
        let verdict = validator.validate(&signal(100_000, 100_500)).await;
        assert!(!verdict.approved);
    }
}

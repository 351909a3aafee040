//! Closed-loop feedback engine.
//!
//! Every exit is classified and persisted, loss/win streaks over the last
//! ten exits move the acceptance threshold inside [65, 80], and five
//! straight failures trip a circuit breaker that refuses every buy until the
//! next daily settlement. Failures also get a short narrative lesson from
//! the reasoning model when it is reachable.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use tracing::{info, warn};

use crate::llm::{extract_json, Reasoner};
use crate::models::{ResultClass, ResultDetail, TradeFeedback, TrapKind};
use crate::notify::Notifier;
use crate::storage::Db;

pub const MIN_SCORE_DEFAULT: i32 = 70;
pub const MIN_SCORE_LOWER: i32 = 65;
pub const MIN_SCORE_UPPER: i32 = 80;

const STREAK_WINDOW: usize = 10;
const CONSECUTIVE_LOSS_TRIGGER: usize = 3;
const CIRCUIT_BREAKER_TRIGGER: usize = 5;
const CONSECUTIVE_WIN_TRIGGER: usize = 5;
const MIN_SCORE_INCREASE: i32 = 3;
const MIN_SCORE_DECREASE: i32 = 2;

const MIN_SCORE_KEY: &str = "min_score";

/// Shared acceptance state. Written only by the feedback engine; the
/// commander gate reads it lock-free.
pub struct Thresholds {
    min_score: AtomicI32,
    circuit_breaker: AtomicBool,
}

impl Thresholds {
    pub fn new(min_score: i32) -> Self {
        Self {
            min_score: AtomicI32::new(min_score.clamp(MIN_SCORE_LOWER, MIN_SCORE_UPPER)),
            circuit_breaker: AtomicBool::new(false),
        }
    }

    pub fn min_score(&self) -> i32 {
        self.min_score.load(Ordering::SeqCst)
    }

    pub fn circuit_breaker_active(&self) -> bool {
        self.circuit_breaker.load(Ordering::SeqCst)
    }

    pub(crate) fn set_min_score(&self, value: i32) {
        self.min_score
            .store(value.clamp(MIN_SCORE_LOWER, MIN_SCORE_UPPER), Ordering::SeqCst);
    }

    pub(crate) fn set_circuit_breaker(&self, active: bool) {
        self.circuit_breaker.store(active, Ordering::SeqCst);
    }
}

/// Classification table over the exit return.
pub fn classify(return_pct: f64) -> (ResultClass, ResultDetail) {
    if return_pct >= 5.0 {
        (ResultClass::Success, ResultDetail::Perfect)
    } else if return_pct >= 3.0 {
        (ResultClass::Success, ResultDetail::Good)
    } else if return_pct <= -3.0 {
        (ResultClass::Failure, ResultDetail::SevereLoss)
    } else if return_pct <= -2.0 {
        (ResultClass::Failure, ResultDetail::StopLoss)
    } else if return_pct <= -1.0 {
        (ResultClass::Failure, ResultDetail::MinorLoss)
    } else {
        (ResultClass::Neutral, ResultDetail::Breakeven)
    }
}

/// Streaks over classes ordered most-recent-first. Pure; the adjustment
/// decision is a separate step.
pub fn streaks(classes: &[ResultClass]) -> (usize, usize) {
    let losses = classes
        .iter()
        .take_while(|c| **c == ResultClass::Failure)
        .count();
    let wins = classes
        .iter()
        .take_while(|c| **c == ResultClass::Success)
        .count();
    (losses, wins)
}

#[derive(Debug, Clone)]
pub struct ExitInfo {
    pub symbol: String,
    pub entry_price: i64,
    pub exit_price: i64,
    pub entry_date: NaiveDate,
    pub exit_date: NaiveDate,
    pub exit_reason: String,
    pub quant_score: i32,
    pub ai_score: i32,
    pub final_score: i32,
}

pub struct FeedbackEngine {
    db: Db,
    reasoner: Arc<dyn Reasoner>,
    notifier: Arc<Notifier>,
    thresholds: Arc<Thresholds>,
}

impl FeedbackEngine {
    pub fn new(db: Db, reasoner: Arc<dyn Reasoner>, notifier: Arc<Notifier>) -> Self {
        let min_score = db
            .config_get(MIN_SCORE_KEY)
            .ok()
            .flatten()
            .and_then(|v| v.parse().ok())
            .unwrap_or(MIN_SCORE_DEFAULT);
        info!(min_score, "feedback engine ready");
        Self {
            db,
            reasoner,
            notifier,
            thresholds: Arc::new(Thresholds::new(min_score)),
        }
    }

    pub fn thresholds(&self) -> Arc<Thresholds> {
        self.thresholds.clone()
    }

    /// Classify one exit, persist it, and run the adjustment step.
    pub async fn process_trade_exit(&self, exit: ExitInfo) -> TradeFeedback {
        let return_pct = if exit.entry_price > 0 {
            (exit.exit_price - exit.entry_price) as f64 / exit.entry_price as f64 * 100.0
        } else {
            0.0
        };
        let hold_days = (exit.exit_date - exit.entry_date).num_days().max(0);
        let (class, detail) = classify(return_pct);

        let lesson = if class == ResultClass::Failure {
            self.failure_lesson(&exit, return_pct).await
        } else {
            None
        };

        let feedback = TradeFeedback {
            symbol: exit.symbol.clone(),
            entry_price: exit.entry_price,
            exit_price: exit.exit_price,
            return_pct,
            hold_days,
            exit_reason: exit.exit_reason.clone(),
            quant_score: exit.quant_score,
            ai_score: exit.ai_score,
            final_score: exit.final_score,
            class,
            detail,
            lesson,
            created_at: Utc::now(),
        };
        if let Err(e) = self.db.insert_feedback(&feedback) {
            warn!(symbol = %exit.symbol, error = %e, "feedback row not persisted");
        }

        info!(
            symbol = %exit.symbol,
            return_pct = format!("{return_pct:+.2}"),
            class = class.as_str(),
            detail = detail.as_str(),
            "trade exit processed"
        );

        self.adjust_after_exit().await;

        self.notifier
            .send(&format!(
                "exit {} {:+.2}% ({}) reason: {}",
                exit.symbol,
                return_pct,
                detail.as_str(),
                exit.exit_reason
            ))
            .await;

        feedback
    }

    /// Streak-driven threshold moves and the circuit breaker latch.
    async fn adjust_after_exit(&self) {
        let classes = match self.db.recent_feedback_classes(STREAK_WINDOW) {
            Ok(classes) => classes,
            Err(e) => {
                warn!(error = %e, "streak read failed");
                return;
            }
        };
        let (losses, wins) = streaks(&classes);

        if losses >= CIRCUIT_BREAKER_TRIGGER && !self.thresholds.circuit_breaker_active() {
            self.thresholds.set_circuit_breaker(true);
            self.raise_min_score();
            warn!(losses, "circuit breaker armed, all buys refused until settlement");
            self.notifier
                .send(&format!(
                    "circuit breaker ACTIVE after {losses} consecutive losses"
                ))
                .await;
        } else if losses == CONSECUTIVE_LOSS_TRIGGER {
            self.raise_min_score();
        }

        if wins == CONSECUTIVE_WIN_TRIGGER {
            let prev = self.thresholds.min_score();
            self.thresholds.set_min_score(prev - MIN_SCORE_DECREASE);
            self.persist_min_score();
            info!(
                prev,
                now = self.thresholds.min_score(),
                "win streak, acceptance threshold lowered"
            );
        }
    }

    fn raise_min_score(&self) {
        let prev = self.thresholds.min_score();
        self.thresholds.set_min_score(prev + MIN_SCORE_INCREASE);
        self.persist_min_score();
        warn!(
            prev,
            now = self.thresholds.min_score(),
            "loss streak, acceptance threshold raised"
        );
    }

    fn persist_min_score(&self) {
        let value = self.thresholds.min_score().to_string();
        if let Err(e) = self.db.config_set(MIN_SCORE_KEY, &value) {
            warn!(error = %e, "min score not persisted");
        }
    }

    async fn failure_lesson(&self, exit: &ExitInfo, return_pct: f64) -> Option<String> {
        let system = "You review losing stock trades. Reply ONLY with JSON: \
            {\"lesson\": \"one short sentence on what to do differently\"}";
        let prompt = format!(
            "Symbol {} bought at {} sold at {} ({:+.2}%), exit reason: {}.\n\
             Entry scores: quant {}, ai {}, final {}.",
            exit.symbol,
            exit.entry_price,
            exit.exit_price,
            return_pct,
            exit.exit_reason,
            exit.quant_score,
            exit.ai_score,
            exit.final_score,
        );
        match self.reasoner.reason(system, &prompt).await {
            Ok(reply) => extract_json(&reply.answer)
                .and_then(|v| v.get("lesson").and_then(|l| l.as_str()).map(String::from))
                .or_else(|| {
                    let trimmed = reply.answer.trim();
                    (!trimmed.is_empty()).then(|| trimmed.chars().take(200).collect())
                }),
            Err(e) => {
                warn!(symbol = %exit.symbol, error = %e, "lesson generation failed");
                None
            }
        }
    }

    /// Reinforce or weaken the trap pattern that drove an avoidance, once
    /// the outcome is known.
    pub fn record_trap_outcome(&self, kind: TrapKind, correct: bool) {
        match self.db.update_trap_weight(kind, correct) {
            Ok(weight) => info!(
                kind = kind.as_str(),
                correct,
                weight = format!("{weight:.2}"),
                "trap weight updated"
            ),
            Err(e) => warn!(kind = kind.as_str(), error = %e, "trap weight update failed"),
        }
    }

    /// Score the day's trap avoidances against what prices actually did: an
    /// avoidance was correct when the symbol did not rally past +1% after we
    /// stepped aside.
    fn settle_trap_avoidances(&self) {
        let avoidances = match self.db.unresolved_trap_avoidances() {
            Ok(avoidances) => avoidances,
            Err(e) => {
                warn!(error = %e, "avoidance read failed");
                return;
            }
        };
        for (id, symbol, kind, price_at) in avoidances {
            let Ok(Some(quote)) = self.db.latest_quote(&symbol) else {
                continue;
            };
            if price_at <= 0 {
                continue;
            }
            let change_pct = (quote.price - price_at) as f64 / price_at as f64 * 100.0;
            let correct = change_pct < 1.0;
            self.record_trap_outcome(kind, correct);
            if let Err(e) = self.db.resolve_trap_avoidance(id) {
                warn!(error = %e, "avoidance not resolved");
            }
        }
    }

    /// Daily settlement clears the breaker, scores the day's trap
    /// avoidances and reports the day.
    pub async fn on_daily_settlement(&self) {
        let was_active = self.thresholds.circuit_breaker_active();
        self.thresholds.set_circuit_breaker(false);
        if was_active {
            info!("circuit breaker cleared by daily settlement");
        }

        self.settle_trap_avoidances();

        let today = Utc::now().date_naive();
        let decisions = self.db.decisions_on(today).unwrap_or_default();
        let classes = self.db.recent_feedback_classes(STREAK_WINDOW).unwrap_or_default();
        let (losses, wins) = streaks(&classes);
        self.notifier
            .send(&format!(
                "settlement: {} decisions today, min score {}, streaks w{}/l{}",
                decisions.len(),
                self.thresholds.min_score(),
                wins,
                losses
            ))
            .await;
    }
}

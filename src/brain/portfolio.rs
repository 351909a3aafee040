//! Exit-side judge for held positions.
//!
//! Runs on its own one-minute cadence and also on demand for a single
//! symbol. Losses are cut fast and in full; gains are walked up with a
//! partial sell, a trailing stop armed above +5% (tightened above +8%) and a
//! final take-profit. The max-price watermark is refreshed before judging.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::feedback::{ExitInfo, FeedbackEngine};
use crate::models::{Position, Side, Venue};
use crate::orders::OrderService;
use crate::storage::Db;

pub const STOP_LOSS_PCT: f64 = -3.0;
pub const PARTIAL_SELL_PCT: f64 = 3.5;
pub const TRAILING_START_PCT: f64 = 5.0;
pub const TAKE_PROFIT_PCT: f64 = 5.5;
pub const STRONG_TRAILING_START_PCT: f64 = 8.0;
pub const TRAILING_GAP_PCT: f64 = 2.0;
pub const STRONG_TRAILING_GAP_PCT: f64 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitKind {
    StopLoss,
    PartialSell,
    StrongTrailing,
    TrailingStop,
    TakeProfit,
}

impl ExitKind {
    pub fn as_str(&self) -> &str {
        match self {
            ExitKind::StopLoss => "stop-loss",
            ExitKind::PartialSell => "partial-sell",
            ExitKind::StrongTrailing => "strong-trailing",
            ExitKind::TrailingStop => "trailing-stop",
            ExitKind::TakeProfit => "take-profit",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExitDecision {
    pub kind: ExitKind,
    pub reason: String,
    /// 1.0 = full position, 0.5 = half.
    pub sell_ratio: f64,
    pub set_partial_stage: Option<u8>,
}

/// Evaluate the exit rules in priority order; first match wins. Assumes the
/// position's max price already reflects `current_price`.
pub fn judge_exit(position: &Position, current_price: i64) -> Option<ExitDecision> {
    let ret = position.return_pct(current_price);
    let max_ret = position.max_return_pct();
    let drop = position.drop_from_high_pct(current_price);

    if ret <= STOP_LOSS_PCT {
        return Some(ExitDecision {
            kind: ExitKind::StopLoss,
            reason: format!("stop-loss at {ret:+.2}%"),
            sell_ratio: 1.0,
            set_partial_stage: None,
        });
    }

    if ret >= PARTIAL_SELL_PCT && position.partial_stage == 0 {
        return Some(ExitDecision {
            kind: ExitKind::PartialSell,
            reason: format!("partial-sell at {ret:+.2}%"),
            sell_ratio: 0.5,
            set_partial_stage: Some(1),
        });
    }

    if max_ret >= TRAILING_START_PCT {
        if max_ret >= STRONG_TRAILING_START_PCT && drop >= STRONG_TRAILING_GAP_PCT {
            return Some(ExitDecision {
                kind: ExitKind::StrongTrailing,
                reason: format!("strong-trailing, {drop:.2}% off the {max_ret:+.2}% high"),
                sell_ratio: 1.0,
                set_partial_stage: None,
            });
        } else if drop >= TRAILING_GAP_PCT {
            return Some(ExitDecision {
                kind: ExitKind::TrailingStop,
                reason: format!("trailing-stop, {drop:.2}% off the {max_ret:+.2}% high"),
                sell_ratio: 1.0,
                set_partial_stage: None,
            });
        }
    }

    if ret >= TAKE_PROFIT_PCT {
        return Some(ExitDecision {
            kind: ExitKind::TakeProfit,
            reason: format!("take-profit at {ret:+.2}%"),
            sell_ratio: 1.0,
            set_partial_stage: None,
        });
    }

    None
}

#[derive(Debug, Default, Clone)]
pub struct CycleReport {
    pub checked: usize,
    pub stop_loss: usize,
    pub partial_sell: usize,
    pub trailing_stop: usize,
    pub strong_trailing: usize,
    pub take_profit: usize,
    pub errors: usize,
}

impl CycleReport {
    fn count(&mut self, kind: ExitKind) {
        match kind {
            ExitKind::StopLoss => self.stop_loss += 1,
            ExitKind::PartialSell => self.partial_sell += 1,
            ExitKind::TrailingStop => self.trailing_stop += 1,
            ExitKind::StrongTrailing => self.strong_trailing += 1,
            ExitKind::TakeProfit => self.take_profit += 1,
        }
    }

    pub fn sells(&self) -> usize {
        self.stop_loss + self.partial_sell + self.trailing_stop + self.strong_trailing
            + self.take_profit
    }
}

pub struct PortfolioManager {
    db: Db,
    orders: Arc<OrderService>,
    feedback: Arc<FeedbackEngine>,
}

impl PortfolioManager {
    pub fn new(db: Db, orders: Arc<OrderService>, feedback: Arc<FeedbackEngine>) -> Self {
        Self {
            db,
            orders,
            feedback,
        }
    }

    /// One sweep over every held position.
    pub async fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();
        let positions = match self.db.positions() {
            Ok(positions) => positions,
            Err(e) => {
                warn!(error = %e, "position read failed");
                report.errors += 1;
                return report;
            }
        };
        report.checked = positions.len();

        for position in positions {
            match self.judge_and_sell(position).await {
                Ok(Some(kind)) => report.count(kind),
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "exit evaluation failed");
                    report.errors += 1;
                }
            }
        }

        if report.sells() > 0 {
            info!(
                checked = report.checked,
                sells = report.sells(),
                "portfolio cycle placed exits"
            );
        }
        report
    }

    /// Event-triggered check of one symbol (bad news, disclosures).
    pub async fn check_symbol(&self, symbol: &str) {
        match self.db.position(symbol) {
            Ok(Some(position)) => {
                if let Err(e) = self.judge_and_sell(position).await {
                    warn!(symbol = %symbol, error = %e, "exit check failed");
                }
            }
            Ok(None) => debug!(symbol = %symbol, "not held, no exit check"),
            Err(e) => warn!(symbol = %symbol, error = %e, "position read failed"),
        }
    }

    async fn judge_and_sell(&self, mut position: Position) -> anyhow::Result<Option<ExitKind>> {
        let Some(quote) = self.db.latest_quote(&position.symbol)? else {
            debug!(symbol = %position.symbol, "no quote yet, skipping exit check");
            return Ok(None);
        };
        let current_price = quote.price;

        // Watermark first, then judge against the refreshed high.
        self.db
            .update_position_max_price(&position.symbol, current_price)?;
        position.max_price = position.max_price.max(current_price);

        let Some(decision) = judge_exit(&position, current_price) else {
            return Ok(None);
        };

        let qty = ((position.quantity as f64) * decision.sell_ratio) as i64;
        if qty <= 0 {
            return Ok(None);
        }

        self.orders
            .place(
                Side::Sell,
                &position.symbol,
                &position.name,
                qty,
                0,
                Venue::Krx,
                decision.kind.as_str(),
            )
            .await?;

        if let Some(stage) = decision.set_partial_stage {
            self.db.set_partial_stage(&position.symbol, stage)?;
        }

        info!(
            symbol = %position.symbol,
            kind = decision.kind.as_str(),
            qty,
            reason = %decision.reason,
            "exit order placed"
        );
        Ok(Some(decision.kind))
    }

    /// Execution-notice hook: a completed sell fill becomes feedback.
    pub async fn on_sell_filled(&self, position: &Position, exit_price: i64, reason: &str) {
        let exit = ExitInfo {
            symbol: position.symbol.clone(),
            entry_price: position.avg_price,
            exit_price,
            entry_date: position.entered_at.date_naive(),
            exit_date: chrono::Utc::now().date_naive(),
            exit_reason: reason.to_string(),
            quant_score: 0,
            ai_score: 0,
            final_score: 0,
        };
        self.feedback.process_trade_exit(exit).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn position(avg: i64, max: i64, partial_stage: u8) -> Position {
        Position {
            symbol: "005930".into(),
            name: "Samsung Electronics".into(),
            quantity: 10,
            avg_price: avg,
            entered_at: Utc::now(),
            max_price: max,
            partial_stage,
            pyramid_stage: 0,
            strategy: "intraday".into(),
        }
    }

    #[test]
    fn stop_loss_fires_at_minus_three_percent() {
        let pos = position(100_000, 100_000, 0);
        let decision = judge_exit(&pos, 96_900).unwrap();
        assert_eq!(decision.kind, ExitKind::StopLoss);
        assert_eq!(decision.sell_ratio, 1.0);

        assert!(judge_exit(&pos, 97_100).is_none());
    }

    #[test]
    fn partial_sell_takes_half_once() {
        let pos = position(100_000, 103_600, 0);
        let decision = judge_exit(&pos, 103_600).unwrap();
        assert_eq!(decision.kind, ExitKind::PartialSell);
        assert_eq!(decision.sell_ratio, 0.5);
        assert_eq!(decision.set_partial_stage, Some(1));

        // Stage already taken: +3.6% no longer triggers anything.
        let staged = position(100_000, 103_600, 1);
        assert!(judge_exit(&staged, 103_600).is_none());
    }

    #[test]
    fn trailing_stop_needs_the_five_percent_arm() {
        // Max +4%: a 2.5% giveback does not trail.
        let unarmed = position(100_000, 104_000, 1);
        assert!(judge_exit(&unarmed, 101_400).is_none());

        // Max +6%: a 2% giveback sells in full.
        let armed = position(100_000, 106_000, 1);
        let decision = judge_exit(&armed, 103_880).unwrap();
        assert_eq!(decision.kind, ExitKind::TrailingStop);
        assert_eq!(decision.sell_ratio, 1.0);
    }

    #[test]
    fn strong_trailing_tightens_above_eight_percent() {
        let pos = position(100_000, 108_500, 1);
        // 1.6% off the high: the strong variant fires where the normal one
        // would still wait.
        let decision = judge_exit(&pos, 106_764).unwrap();
        assert_eq!(decision.kind, ExitKind::StrongTrailing);

        // 1.4% off the high: no trail yet, but the gain itself is past the
        // take-profit line.
        let decision = judge_exit(&pos, 106_981).unwrap();
        assert_eq!(decision.kind, ExitKind::TakeProfit);
    }

    #[test]
    fn take_profit_fires_at_five_and_a_half() {
        let pos = position(100_000, 105_600, 1);
        let decision = judge_exit(&pos, 105_600).unwrap();
        assert_eq!(decision.kind, ExitKind::TakeProfit);
        assert_eq!(decision.sell_ratio, 1.0);
    }

    #[test]
    fn quiet_position_is_left_alone() {
        let pos = position(100_000, 102_000, 0);
        assert!(judge_exit(&pos, 101_500).is_none());
    }
}

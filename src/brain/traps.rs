//! Korean-market trap pattern detector.
//!
//! Ten checks over one snapshot bundle. Each hit carries the learned weight
//! of its pattern as confidence; the feedback engine moves those weights as
//! avoidances turn out right or wrong. Consumers zero the ai score on any
//! critical hit and otherwise subtract `confidence x 20` per report.

use crate::models::{Severity, TrapAdvice, TrapKind, TrapReport};
use crate::storage::Db;
use tracing::warn;

const GAP_OVERHEAT_PCT: f64 = 3.5;
const VOLUME_SUPPORT_RATIO: f64 = 0.5;
const SECTOR_DIVERGENCE_PCT: f64 = 2.0;
const FX_SHOCK_PCT: f64 = 0.5;
const PROGRAM_SLOPE_LIMIT: f64 = -0.3;
const SELL_WALL_MULTIPLE: f64 = 5.0;
const MA_PROXIMITY_PCT: f64 = 1.0;

/// Snapshot bundle a detection pass runs over. Missing feeds default to
/// neutral values so a thin bundle simply triggers fewer checks.
#[derive(Debug, Clone, Default)]
pub struct TrapInput {
    pub symbol: String,
    pub current_price: i64,
    pub change_pct: f64,
    pub open_price: i64,
    pub prev_close: i64,
    /// Today's volume relative to the prior day.
    pub volume_ratio: f64,
    pub avg_volume: i64,
    /// Net investor flows in shares; negative means net selling.
    pub foreign_net: i64,
    pub inst_net: i64,
    pub program_net: i64,
    pub program_slope: f64,
    pub has_positive_news: bool,
    /// Sum of the top-two ask sizes.
    pub ask_qty_top2: i64,
    pub sector_name: String,
    pub sector_change_pct: f64,
    pub fx_rate: f64,
    pub fx_change_pct: f64,
    pub ma120: i64,
    pub ma200: i64,
    /// A convertible/warrant/new-share listing lands today.
    pub dilution_day: bool,
}

pub struct TrapDetector {
    db: Db,
}

impl TrapDetector {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    fn weight(&self, kind: TrapKind) -> f64 {
        match self.db.trap_weight(kind) {
            Ok(w) => w,
            Err(e) => {
                warn!(kind = kind.as_str(), error = %e, "trap weight read failed");
                0.5
            }
        }
    }

    /// Run every check and return hits sorted by confidence descending.
    pub fn detect(&self, input: &TrapInput) -> Vec<TrapReport> {
        let mut reports: Vec<TrapReport> = [
            self.fake_rise(input),
            self.gap_overheat(input),
            self.program_dump(input),
            self.sell_on_news(input),
            self.hollow_rise(input),
            self.sell_wall(input),
            self.sector_decouple(input),
            self.fx_shock(input),
            self.ma_resistance(input),
            self.dilution_day(input),
        ]
        .into_iter()
        .flatten()
        .collect();

        reports.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        reports
    }

    fn report(
        &self,
        kind: TrapKind,
        severity: Severity,
        advice: TrapAdvice,
        reason: String,
    ) -> Option<TrapReport> {
        Some(TrapReport {
            kind,
            severity,
            confidence: self.weight(kind),
            advice,
            reason,
        })
    }

    /// Price up while foreign and institutional tape both sell.
    fn fake_rise(&self, input: &TrapInput) -> Option<TrapReport> {
        if input.change_pct < 1.0 || input.foreign_net >= 0 || input.inst_net >= 0 {
            return None;
        }
        self.report(
            TrapKind::FakeRise,
            Severity::Critical,
            TrapAdvice::Avoid,
            format!(
                "price +{:.2}% while foreign {} and institutions {} net sell",
                input.change_pct, input.foreign_net, input.inst_net
            ),
        )
    }

    fn gap_overheat(&self, input: &TrapInput) -> Option<TrapReport> {
        if input.prev_close <= 0 {
            return None;
        }
        let gap_pct =
            (input.open_price - input.prev_close) as f64 / input.prev_close as f64 * 100.0;
        if gap_pct < GAP_OVERHEAT_PCT {
            return None;
        }
        self.report(
            TrapKind::GapOverheat,
            Severity::High,
            TrapAdvice::Wait,
            format!("opened +{gap_pct:.2}% over prior close, profit-taking risk"),
        )
    }

    fn program_dump(&self, input: &TrapInput) -> Option<TrapReport> {
        if input.program_net >= 0 || input.program_slope >= PROGRAM_SLOPE_LIMIT {
            return None;
        }
        self.report(
            TrapKind::ProgramDump,
            Severity::High,
            TrapAdvice::Avoid,
            format!(
                "program tape net {} with accelerating sell slope {:.2}",
                input.program_net, input.program_slope
            ),
        )
    }

    fn sell_on_news(&self, input: &TrapInput) -> Option<TrapReport> {
        if !input.has_positive_news
            || input.volume_ratio <= 2.0
            || input.current_price >= input.open_price
        {
            return None;
        }
        self.report(
            TrapKind::SellOnNews,
            Severity::Medium,
            TrapAdvice::Avoid,
            format!(
                "positive news, volume {:.1}x, yet trading below the open",
                input.volume_ratio
            ),
        )
    }

    fn hollow_rise(&self, input: &TrapInput) -> Option<TrapReport> {
        // A zero ratio means the volume feed is missing, not a dead tape.
        if input.volume_ratio <= 0.0
            || input.change_pct < 3.0
            || input.volume_ratio >= VOLUME_SUPPORT_RATIO
        {
            return None;
        }
        self.report(
            TrapKind::HollowRise,
            Severity::Medium,
            TrapAdvice::ReduceSize,
            format!(
                "+{:.2}% on only {:.0}% of normal volume",
                input.change_pct,
                input.volume_ratio * 100.0
            ),
        )
    }

    fn sell_wall(&self, input: &TrapInput) -> Option<TrapReport> {
        if input.avg_volume <= 0
            || (input.ask_qty_top2 as f64) <= input.avg_volume as f64 * SELL_WALL_MULTIPLE
        {
            return None;
        }
        self.report(
            TrapKind::SellWall,
            Severity::Medium,
            TrapAdvice::Wait,
            format!(
                "{} shares stacked on the top asks ({:.1}x average volume)",
                input.ask_qty_top2,
                input.ask_qty_top2 as f64 / input.avg_volume as f64
            ),
        )
    }

    fn sector_decouple(&self, input: &TrapInput) -> Option<TrapReport> {
        let divergence = input.change_pct - input.sector_change_pct;
        if input.change_pct <= 2.0 || divergence < SECTOR_DIVERGENCE_PCT {
            return None;
        }
        self.report(
            TrapKind::SectorDecouple,
            Severity::Medium,
            TrapAdvice::Wait,
            format!(
                "+{:.2}% against {} sector {:+.2}%, {divergence:.2}pp apart",
                input.change_pct, input.sector_name, input.sector_change_pct
            ),
        )
    }

    fn fx_shock(&self, input: &TrapInput) -> Option<TrapReport> {
        if input.fx_change_pct < FX_SHOCK_PCT {
            return None;
        }
        self.report(
            TrapKind::FxShock,
            Severity::Medium,
            TrapAdvice::ReduceSize,
            format!(
                "USD/KRW {:.2} (+{:.2}%), foreign exit pressure",
                input.fx_rate, input.fx_change_pct
            ),
        )
    }

    fn ma_resistance(&self, input: &TrapInput) -> Option<TrapReport> {
        let near = |ma: i64| {
            ma > 0
                && ((input.current_price - ma).abs() as f64 / ma as f64 * 100.0)
                    <= MA_PROXIMITY_PCT
        };
        let label = if near(input.ma120) {
            ("120-day", input.ma120)
        } else if near(input.ma200) {
            ("200-day", input.ma200)
        } else {
            return None;
        };
        self.report(
            TrapKind::MaResistance,
            Severity::Low,
            TrapAdvice::Wait,
            format!("pressing the {} moving average at {}", label.0, label.1),
        )
    }

    fn dilution_day(&self, input: &TrapInput) -> Option<TrapReport> {
        if !input.dilution_day {
            return None;
        }
        self.report(
            TrapKind::DilutionDay,
            Severity::Critical,
            TrapAdvice::Avoid,
            "convertible/warrant listing today, supply shock imminent".to_string(),
        )
    }
}

/// Apply trap reports to an ai score: any critical hit zeroes it, otherwise
/// each report costs `confidence x 20` points.
pub fn apply_traps_to_ai_score(ai_score: i32, reports: &[TrapReport]) -> i32 {
    if reports.iter().any(|r| r.severity == Severity::Critical) {
        return 0;
    }
    let penalty: f64 = reports.iter().map(|r| r.confidence * 20.0).sum();
    (ai_score - penalty.round() as i32).clamp(0, 100)
}

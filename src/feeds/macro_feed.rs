//! Macro indicator snapshot and regime detection.
//!
//! Polls a small set of global tickers (KOSPI, VIX, USD/KRW), keeps the
//! latest snapshot for the trap detector's fx-shock path, and publishes a
//! RegimeChange event whenever the derived regime tag moves.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::events::{Event, EventBus, EventKind};
use crate::models::Regime;

const INDICATORS: [(&str, &str); 3] = [
    ("kospi", "^KS11"),
    ("vix", "^VIX"),
    ("usdkrw", "KRW=X"),
];

const VIX_IRON_SHIELD: f64 = 30.0;
const KOSPI_IRON_SHIELD_PCT: f64 = -2.5;
const VIX_RISK_ON: f64 = 15.0;
const KOSPI_RISK_ON_PCT: f64 = 1.0;

#[derive(Debug, Clone, Default)]
pub struct MacroSnapshot {
    pub kospi_change_pct: f64,
    pub vix: f64,
    pub usdkrw: f64,
    pub usdkrw_change_pct: f64,
}

/// Regime from the latest indicator snapshot.
pub fn detect_regime(snapshot: &MacroSnapshot) -> Regime {
    if snapshot.vix >= VIX_IRON_SHIELD || snapshot.kospi_change_pct <= KOSPI_IRON_SHIELD_PCT {
        Regime::IronShield
    } else if snapshot.vix > 0.0
        && snapshot.vix <= VIX_RISK_ON
        && snapshot.kospi_change_pct >= KOSPI_RISK_ON_PCT
    {
        Regime::RiskOn
    } else {
        Regime::Normal
    }
}

/// Latest macro state shared with the pipeline and commander.
pub struct MacroState {
    snapshot: RwLock<MacroSnapshot>,
    regime: RwLock<Regime>,
}

impl Default for MacroState {
    fn default() -> Self {
        Self {
            snapshot: RwLock::new(MacroSnapshot::default()),
            regime: RwLock::new(Regime::Normal),
        }
    }
}

impl MacroState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> MacroSnapshot {
        self.snapshot.read().clone()
    }

    pub fn regime(&self) -> Regime {
        *self.regime.read()
    }

    pub fn set_snapshot(&self, snapshot: MacroSnapshot) {
        *self.snapshot.write() = snapshot;
    }

    /// Returns the previous tag when it changed.
    pub fn set_regime(&self, regime: Regime) -> Option<Regime> {
        let mut current = self.regime.write();
        if *current == regime {
            return None;
        }
        let prev = *current;
        *current = regime;
        Some(prev)
    }
}

pub struct MacroFeed {
    client: reqwest::Client,
    state: Arc<MacroState>,
    bus: Arc<EventBus>,
}

impl MacroFeed {
    pub fn new(state: Arc<MacroState>, bus: Arc<EventBus>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            state,
            bus,
        }
    }

    async fn fetch_ticker(&self, ticker: &str) -> Result<(f64, f64)> {
        let url = format!(
            "https://query1.finance.yahoo.com/v8/finance/chart/{}",
            ticker
        );
        let body: serde_json::Value = self
            .client
            .get(&url)
            .query(&[("interval", "1d"), ("range", "2d")])
            .send()
            .await
            .context("macro request")?
            .error_for_status()
            .context("macro status")?
            .json()
            .await
            .context("macro body")?;

        let meta = body
            .pointer("/chart/result/0/meta")
            .context("macro meta missing")?;
        let price = meta
            .get("regularMarketPrice")
            .and_then(|v| v.as_f64())
            .context("macro price missing")?;
        let prev = meta
            .get("chartPreviousClose")
            .and_then(|v| v.as_f64())
            .unwrap_or(price);
        let change_pct = if prev > 0.0 {
            (price - prev) / prev * 100.0
        } else {
            0.0
        };
        Ok((price, change_pct))
    }

    /// Fetch every indicator into a name -> (value, change) map. Individual
    /// ticker failures leave the previous value in place.
    pub async fn fetch_all(&self) -> HashMap<&'static str, (f64, f64)> {
        let mut values = HashMap::new();
        for (name, ticker) in INDICATORS {
            match self.fetch_ticker(ticker).await {
                Ok(pair) => {
                    values.insert(name, pair);
                }
                Err(e) => warn!(indicator = name, error = %e, "macro fetch failed"),
            }
        }
        values
    }

    pub async fn poll_once(&self) {
        let values = self.fetch_all().await;
        if values.is_empty() {
            return;
        }

        let previous = self.state.snapshot();
        let snapshot = MacroSnapshot {
            kospi_change_pct: values
                .get("kospi")
                .map(|(_, c)| *c)
                .unwrap_or(previous.kospi_change_pct),
            vix: values.get("vix").map(|(v, _)| *v).unwrap_or(previous.vix),
            usdkrw: values
                .get("usdkrw")
                .map(|(v, _)| *v)
                .unwrap_or(previous.usdkrw),
            usdkrw_change_pct: values
                .get("usdkrw")
                .map(|(_, c)| *c)
                .unwrap_or(previous.usdkrw_change_pct),
        };
        let regime = detect_regime(&snapshot);
        self.state.set_snapshot(snapshot.clone());

        if let Some(prev) = self.state.set_regime(regime) {
            info!(
                from = prev.as_str(),
                to = regime.as_str(),
                vix = snapshot.vix,
                kospi = format!("{:+.2}%", snapshot.kospi_change_pct),
                "market regime changed"
            );
            self.bus
                .publish(Event::new(
                    EventKind::RegimeChange,
                    None,
                    serde_json::json!({
                        "regime": regime.as_str(),
                        "previous": prev.as_str(),
                        "reason": format!(
                            "vix {:.1}, kospi {:+.2}%",
                            snapshot.vix, snapshot.kospi_change_pct
                        ),
                    }),
                ))
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(vix: f64, kospi: f64) -> MacroSnapshot {
        MacroSnapshot {
            kospi_change_pct: kospi,
            vix,
            usdkrw: 1_380.0,
            usdkrw_change_pct: 0.0,
        }
    }

    #[test]
    fn regime_bands() {
        assert_eq!(detect_regime(&snapshot(32.0, 0.0)), Regime::IronShield);
        assert_eq!(detect_regime(&snapshot(20.0, -3.0)), Regime::IronShield);
        assert_eq!(detect_regime(&snapshot(14.0, 1.5)), Regime::RiskOn);
        assert_eq!(detect_regime(&snapshot(18.0, 0.2)), Regime::Normal);
        // Missing VIX data never reads as risk-on.
        assert_eq!(detect_regime(&snapshot(0.0, 2.0)), Regime::Normal);
    }

    #[test]
    fn regime_transitions_report_the_previous_tag() {
        let state = MacroState::new();
        assert_eq!(state.regime(), Regime::Normal);
        assert_eq!(state.set_regime(Regime::Normal), None);
        assert_eq!(state.set_regime(Regime::IronShield), Some(Regime::Normal));
        assert_eq!(state.regime(), Regime::IronShield);
    }
}

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Trading venue. The alternate venue does not accept market orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Venue {
    Krx,
    Nxt,
}

impl Venue {
    pub fn as_str(&self) -> &str {
        match self {
            Venue::Krx => "KRX",
            Venue::Nxt => "NXT",
        }
    }

    pub fn parse(s: &str) -> Venue {
        match s {
            "NXT" => Venue::Nxt,
            _ => Venue::Krx,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

/// Order lifecycle. Transitions are monotonic along
/// pending -> partially_filled -> filled, or out to cancelled/rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn as_str(&self) -> &str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Rejected => "REJECTED",
        }
    }

    pub fn parse(s: &str) -> OrderStatus {
        match s {
            "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
            "FILLED" => OrderStatus::Filled,
            "CANCELLED" => OrderStatus::Cancelled,
            "REJECTED" => OrderStatus::Rejected,
            _ => OrderStatus::Pending,
        }
    }
}

/// Latest trade print for a symbol. Only the newest row per symbol is
/// semantically meaningful; consumers treat latest-by-timestamp as truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub price: i64,
    pub change_pct: f64,
    pub volume: i64,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBookTop {
    pub symbol: String,
    pub bid_price: i64,
    pub ask_price: i64,
    pub bid_qty: i64,
    pub ask_qty: i64,
    pub ts: DateTime<Utc>,
}

/// A held position. Quantity 0 means the row is deleted, never retained.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub name: String,
    pub quantity: i64,
    pub avg_price: i64,
    pub entered_at: DateTime<Utc>,
    /// Highest price seen since entry; monotonic while quantity > 0.
    pub max_price: i64,
    /// Partial-exit stage: 0 = untouched, 1 = first half taken, 2 = done.
    pub partial_stage: u8,
    pub pyramid_stage: u8,
    pub strategy: String,
}

impl Position {
    pub fn return_pct(&self, current_price: i64) -> f64 {
        if self.avg_price <= 0 {
            return 0.0;
        }
        (current_price - self.avg_price) as f64 / self.avg_price as f64 * 100.0
    }

    pub fn max_return_pct(&self) -> f64 {
        self.return_pct(self.max_price)
    }

    pub fn drop_from_high_pct(&self, current_price: i64) -> f64 {
        if self.max_price <= 0 {
            return 0.0;
        }
        (self.max_price - current_price) as f64 / self.max_price as f64 * 100.0
    }
}

/// Append-only account snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub ts: DateTime<Utc>,
    pub cash: i64,
    pub total_equity: i64,
    pub realized_pnl_today: i64,
    pub cumulative_return_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_no: String,
    pub symbol: String,
    pub name: String,
    pub side: Side,
    pub venue: Venue,
    pub qty: i64,
    /// Limit price; 0 means market.
    pub price: i64,
    pub status: OrderStatus,
    pub filled_qty: i64,
    pub avg_fill_price: i64,
    pub placed_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
}

/// Append-only fill record, child of an Order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub order_no: String,
    pub qty: i64,
    pub price: i64,
    pub amount: i64,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeAction {
    Buy,
    Sell,
    Hold,
}

impl TradeAction {
    pub fn as_str(&self) -> &str {
        match self {
            TradeAction::Buy => "BUY",
            TradeAction::Sell => "SELL",
            TradeAction::Hold => "HOLD",
        }
    }
}

/// Analyzer output for one candidate. Lives only within one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeSignal {
    pub symbol: String,
    pub name: String,
    pub current_price: i64,
    pub action: TradeAction,
    pub quant_score: i32,
    pub ai_score: i32,
    pub final_score: i32,
    pub confidence: i32,
    pub target_price: i64,
    pub stop_price: i64,
    pub reasoning: String,
    pub traps: Vec<TrapReport>,
}

impl TradeSignal {
    pub fn predicted_return_pct(&self) -> f64 {
        if self.current_price <= 0 {
            return 0.0;
        }
        (self.target_price - self.current_price) as f64 / self.current_price as f64 * 100.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrapKind {
    FakeRise,
    GapOverheat,
    ProgramDump,
    SellOnNews,
    HollowRise,
    SellWall,
    SectorDecouple,
    FxShock,
    MaResistance,
    DilutionDay,
}

impl TrapKind {
    pub fn as_str(&self) -> &str {
        match self {
            TrapKind::FakeRise => "fake_rise",
            TrapKind::GapOverheat => "gap_overheat",
            TrapKind::ProgramDump => "program_dump",
            TrapKind::SellOnNews => "sell_on_news",
            TrapKind::HollowRise => "hollow_rise",
            TrapKind::SellWall => "sell_wall",
            TrapKind::SectorDecouple => "sector_decouple",
            TrapKind::FxShock => "fx_shock",
            TrapKind::MaResistance => "ma_resistance",
            TrapKind::DilutionDay => "dilution_day",
        }
    }

    pub fn parse(s: &str) -> Option<TrapKind> {
        Some(match s {
            "fake_rise" => TrapKind::FakeRise,
            "gap_overheat" => TrapKind::GapOverheat,
            "program_dump" => TrapKind::ProgramDump,
            "sell_on_news" => TrapKind::SellOnNews,
            "hollow_rise" => TrapKind::HollowRise,
            "sell_wall" => TrapKind::SellWall,
            "sector_decouple" => TrapKind::SectorDecouple,
            "fx_shock" => TrapKind::FxShock,
            "ma_resistance" => TrapKind::MaResistance,
            "dilution_day" => TrapKind::DilutionDay,
            _ => return None,
        })
    }

    pub fn all() -> [TrapKind; 10] {
        [
            TrapKind::FakeRise,
            TrapKind::GapOverheat,
            TrapKind::ProgramDump,
            TrapKind::SellOnNews,
            TrapKind::HollowRise,
            TrapKind::SellWall,
            TrapKind::SectorDecouple,
            TrapKind::FxShock,
            TrapKind::MaResistance,
            TrapKind::DilutionDay,
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrapAdvice {
    Avoid,
    Wait,
    ReduceSize,
}

/// One detected trap pattern. Confidence is the learned pattern weight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrapReport {
    pub kind: TrapKind,
    pub severity: Severity,
    pub confidence: f64,
    pub advice: TrapAdvice,
    pub reason: String,
}

/// Outcome of the three-method validation gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationVerdict {
    pub symbol: String,
    pub scenario_score: f64,
    pub backtest_score: f64,
    pub montecarlo_score: f64,
    pub final_score: f64,
    pub win_rate: f64,
    pub profit_prob: f64,
    pub return_stdev: f64,
    pub adjusted_target: i64,
    pub recommended_qty: i64,
    pub approved: bool,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn parse(s: &str) -> RiskLevel {
        match s.to_ascii_uppercase().as_str() {
            "LOW" => RiskLevel::Low,
            "MEDIUM" => RiskLevel::Medium,
            _ => RiskLevel::High,
        }
    }
}

/// Final commander output for one candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub action: TradeAction,
    pub confidence: i32,
    pub risk: RiskLevel,
    pub veto_reason: Option<String>,
    pub reasoning: String,
}

impl Decision {
    pub fn hold(reasoning: impl Into<String>) -> Decision {
        Decision {
            action: TradeAction::Hold,
            confidence: 0,
            risk: RiskLevel::High,
            veto_reason: None,
            reasoning: reasoning.into(),
        }
    }

    pub fn veto(reason: impl Into<String>) -> Decision {
        let reason = reason.into();
        Decision {
            action: TradeAction::Hold,
            confidence: 0,
            risk: RiskLevel::High,
            veto_reason: Some(reason.clone()),
            reasoning: reason,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultClass {
    Success,
    Neutral,
    Failure,
}

impl ResultClass {
    pub fn as_str(&self) -> &str {
        match self {
            ResultClass::Success => "SUCCESS",
            ResultClass::Neutral => "NEUTRAL",
            ResultClass::Failure => "FAILURE",
        }
    }

    pub fn parse(s: &str) -> ResultClass {
        match s {
            "SUCCESS" => ResultClass::Success,
            "FAILURE" => ResultClass::Failure,
            _ => ResultClass::Neutral,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultDetail {
    Perfect,
    Good,
    Breakeven,
    MinorLoss,
    StopLoss,
    SevereLoss,
}

impl ResultDetail {
    pub fn as_str(&self) -> &str {
        match self {
            ResultDetail::Perfect => "PERFECT",
            ResultDetail::Good => "GOOD",
            ResultDetail::Breakeven => "BREAKEVEN",
            ResultDetail::MinorLoss => "MINOR_LOSS",
            ResultDetail::StopLoss => "STOP_LOSS",
            ResultDetail::SevereLoss => "SEVERE_LOSS",
        }
    }
}

/// Post-exit feedback row, persisted for the learning loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeFeedback {
    pub symbol: String,
    pub entry_price: i64,
    pub exit_price: i64,
    pub return_pct: f64,
    pub hold_days: i64,
    pub exit_reason: String,
    pub quant_score: i32,
    pub ai_score: i32,
    pub final_score: i32,
    pub class: ResultClass,
    pub detail: ResultDetail,
    pub lesson: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrapPatternWeight {
    pub kind: TrapKind,
    pub weight: f64,
    pub total: i64,
    pub correct: i64,
    pub accuracy: f64,
}

/// Coarse market state tag consumed by the commander gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    Normal,
    RiskOn,
    IronShield,
}

impl Regime {
    pub fn as_str(&self) -> &str {
        match self {
            Regime::Normal => "NORMAL",
            Regime::RiskOn => "RISK_ON",
            Regime::IronShield => "IRON_SHIELD",
        }
    }

    pub fn parse(s: &str) -> Regime {
        match s {
            "RISK_ON" => Regime::RiskOn,
            "IRON_SHIELD" => Regime::IronShield,
            _ => Regime::Normal,
        }
    }
}

/// One row of the morning deep-analysis ranking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyPick {
    pub date: NaiveDate,
    pub rank: i32,
    pub symbol: String,
    pub name: String,
    pub ai_score: i32,
    pub comment: String,
    pub expected_entry: i64,
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub pid_file: String,
    pub broker_app_key: String,
    pub broker_app_secret: String,
    pub broker_account_no: String,
    pub broker_account_product: String,
    pub broker_base_url: String,
    pub broker_ws_url: String,
    pub token_cache_path: String,
    pub llm_base_url: String,
    pub llm_api_key: Option<String>,
    pub llm_fast_model: String,
    pub llm_reasoning_model: String,
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub disclosure_api_key: Option<String>,
    pub disclosure_base_url: String,
    pub news_base_url: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./horangi.db".to_string());

        let pid_file = std::env::var("PID_FILE").unwrap_or_else(|_| "./horangi.pid".to_string());

        let broker_app_key = std::env::var("BROKER_APP_KEY").unwrap_or_default();
        let broker_app_secret = std::env::var("BROKER_APP_SECRET").unwrap_or_default();
        let broker_account_no = std::env::var("BROKER_ACCOUNT_NO").unwrap_or_default();
        let broker_account_product =
            std::env::var("BROKER_ACCOUNT_PRODUCT").unwrap_or_else(|_| "01".to_string());

        let broker_base_url = std::env::var("BROKER_BASE_URL")
            .unwrap_or_else(|_| "https://openapi.koreainvestment.com:9443".to_string());

        let broker_ws_url = std::env::var("BROKER_WS_URL")
            .unwrap_or_else(|_| "ws://ops.koreainvestment.com:21000".to_string());

        let token_cache_path = std::env::var("TOKEN_CACHE_PATH")
            .unwrap_or_else(|_| "./.cache/broker_token.json".to_string());

        let llm_base_url = std::env::var("LLM_BASE_URL")
            .unwrap_or_else(|_| "https://api.deepseek.com/v1".to_string());

        let llm_api_key = std::env::var("LLM_API_KEY").ok();

        let llm_fast_model =
            std::env::var("LLM_FAST_MODEL").unwrap_or_else(|_| "deepseek-chat".to_string());

        let llm_reasoning_model = std::env::var("LLM_REASONING_MODEL")
            .unwrap_or_else(|_| "deepseek-reasoner".to_string());

        let telegram_bot_token = std::env::var("TELEGRAM_BOT_TOKEN").ok();
        let telegram_chat_id = std::env::var("TELEGRAM_CHAT_ID").ok();

        let disclosure_api_key = std::env::var("DISCLOSURE_API_KEY").ok();

        let disclosure_base_url = std::env::var("DISCLOSURE_BASE_URL")
            .unwrap_or_else(|_| "https://opendart.fss.or.kr/api".to_string());

        let news_base_url = std::env::var("NEWS_BASE_URL")
            .unwrap_or_else(|_| "https://finance.naver.com/news".to_string());

        Ok(Self {
            database_path,
            pid_file,
            broker_app_key,
            broker_app_secret,
            broker_account_no,
            broker_account_product,
            broker_base_url,
            broker_ws_url,
            token_cache_path,
            llm_base_url,
            llm_api_key,
            llm_fast_model,
            llm_reasoning_model,
            telegram_bot_token,
            telegram_chat_id,
            disclosure_api_key,
            disclosure_base_url,
            news_base_url,
        })
    }
}

//! KIS-style brokerage REST client.
//!
//! Access tokens are cached on disk and reused across restarts until expiry;
//! the websocket approval key is ephemeral and fetched on every connect.
//! Numeric fields arrive as strings on this API and are parsed defensively.

use super::{
    resolve_order_price, BalanceSummary, Brokerage, CombinedBalance, Holding, MarketContext,
    OrderAck, RankedSymbol,
};
use crate::models::{Config, Order, OrderBookTop, OrderStatus, Quote, Side, Venue};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

const REST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedToken {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

impl CachedToken {
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Load the token cache file if it exists and has not expired.
pub fn load_cached_token(path: &Path, now: DateTime<Utc>) -> Option<CachedToken> {
    let raw = std::fs::read_to_string(path).ok()?;
    let token: CachedToken = serde_json::from_str(&raw).ok()?;
    token.is_valid(now).then_some(token)
}

pub fn save_cached_token(path: &Path, token: &CachedToken) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).ok();
        }
    }
    let raw = serde_json::to_string_pretty(token)?;
    std::fs::write(path, raw).with_context(|| format!("write token cache {}", path.display()))
}

/// Transaction ids differ between the primary and alternate venues.
fn order_tr_id(venue: Venue, side: Side) -> &'static str {
    match (venue, side) {
        (Venue::Krx, Side::Buy) => "TTTC0802U",
        (Venue::Krx, Side::Sell) => "TTTC0801U",
        (Venue::Nxt, Side::Buy) => "TTTN0802U",
        (Venue::Nxt, Side::Sell) => "TTTN0801U",
    }
}

fn num(s: &str) -> i64 {
    s.trim().parse().unwrap_or(0)
}

fn fnum(s: &str) -> f64 {
    s.trim().parse().unwrap_or(0.0)
}

pub struct KisRest {
    client: reqwest::Client,
    base_url: String,
    app_key: String,
    app_secret: String,
    account_no: String,
    account_product: String,
    token_cache_path: PathBuf,
    token: Mutex<Option<CachedToken>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    86_400
}

#[derive(Debug, Deserialize)]
struct ApprovalResponse {
    approval_key: String,
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    #[serde(default)]
    rt_cd: String,
    #[serde(default)]
    msg1: String,
    output: Option<T>,
}

#[derive(Debug, Deserialize)]
struct BalanceEnvelope {
    #[serde(default)]
    rt_cd: String,
    #[serde(default)]
    msg1: String,
    #[serde(default)]
    output1: Vec<HoldingRow>,
    #[serde(default)]
    output2: Vec<SummaryRow>,
}

#[derive(Debug, Deserialize)]
struct HoldingRow {
    #[serde(default)]
    pdno: String,
    #[serde(default)]
    prdt_name: String,
    #[serde(default)]
    hldg_qty: String,
    #[serde(default)]
    pchs_avg_pric: String,
    #[serde(default)]
    prpr: String,
}

#[derive(Debug, Deserialize)]
struct SummaryRow {
    #[serde(default)]
    dnca_tot_amt: String,
    #[serde(default)]
    prvs_rcdl_excc_amt: String,
    #[serde(default)]
    tot_evlu_amt: String,
    #[serde(default)]
    evlu_pfls_smtl_amt: String,
    #[serde(default)]
    asst_icdc_erng_rt: String,
}

#[derive(Debug, Deserialize)]
struct PriceRow {
    #[serde(default)]
    stck_prpr: String,
    #[serde(default)]
    prdy_ctrt: String,
    #[serde(default)]
    acml_vol: String,
}

#[derive(Debug, Deserialize)]
struct BookRow {
    #[serde(default)]
    askp1: String,
    #[serde(default)]
    bidp1: String,
    #[serde(default)]
    askp_rsqn1: String,
    #[serde(default)]
    bidp_rsqn1: String,
}

#[derive(Debug, Deserialize)]
struct OrderRow {
    #[serde(default)]
    #[serde(rename = "ODNO")]
    odno: String,
}

#[derive(Debug, Deserialize)]
struct OpenOrderRow {
    #[serde(default)]
    odno: String,
    #[serde(default)]
    pdno: String,
    #[serde(default)]
    prdt_name: String,
    #[serde(default)]
    sll_buy_dvsn_cd: String,
    #[serde(default)]
    ord_qty: String,
    #[serde(default)]
    ord_unpr: String,
    #[serde(default)]
    tot_ccld_qty: String,
}

#[derive(Debug, Deserialize)]
struct RankRow {
    #[serde(default)]
    mksc_shrn_iscd: String,
    #[serde(default)]
    hts_kor_isnm: String,
    #[serde(default)]
    stck_prpr: String,
    #[serde(default)]
    prdy_ctrt: String,
    #[serde(default)]
    acml_vol: String,
}

impl KisRest {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REST_TIMEOUT_SECS))
            .build()
            .context("build broker http client")?;
        Ok(Self {
            client,
            base_url: config.broker_base_url.trim_end_matches('/').to_string(),
            app_key: config.broker_app_key.clone(),
            app_secret: config.broker_app_secret.clone(),
            account_no: config.broker_account_no.clone(),
            account_product: config.broker_account_product.clone(),
            token_cache_path: PathBuf::from(&config.token_cache_path),
            token: Mutex::new(None),
        })
    }

    /// Memory cache, then file cache, then a fresh grant. The file cache is
    /// what lets a restarted process skip the token endpoint entirely.
    pub async fn access_token(&self) -> Result<String> {
        let now = Utc::now();
        if let Some(token) = self.token.lock().as_ref() {
            if token.is_valid(now) {
                return Ok(token.access_token.clone());
            }
        }

        if let Some(token) = load_cached_token(&self.token_cache_path, now) {
            info!(expires_at = %token.expires_at, "reusing cached broker token");
            let access = token.access_token.clone();
            *self.token.lock() = Some(token);
            return Ok(access);
        }

        let body = serde_json::json!({
            "grant_type": "client_credentials",
            "appkey": self.app_key,
            "appsecret": self.app_secret,
        });
        let resp: TokenResponse = self
            .client
            .post(format!("{}/oauth2/tokenP", self.base_url))
            .json(&body)
            .send()
            .await
            .context("token request")?
            .error_for_status()
            .context("token status")?
            .json()
            .await
            .context("token body")?;

        let token = CachedToken {
            access_token: resp.access_token,
            expires_at: now + ChronoDuration::seconds(resp.expires_in),
        };
        if let Err(e) = save_cached_token(&self.token_cache_path, &token) {
            warn!(error = %e, "failed to persist broker token cache");
        }
        info!(expires_at = %token.expires_at, "issued new broker token");
        let access = token.access_token.clone();
        *self.token.lock() = Some(token);
        Ok(access)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        tr_id: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let token = self.access_token().await?;
        let resp = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .header("authorization", format!("Bearer {token}"))
            .header("appkey", &self.app_key)
            .header("appsecret", &self.app_secret)
            .header("tr_id", tr_id)
            .query(query)
            .send()
            .await
            .with_context(|| format!("broker GET {path}"))?
            .error_for_status()
            .with_context(|| format!("broker GET {path} status"))?;
        resp.json().await.with_context(|| format!("broker GET {path} body"))
    }
}

#[async_trait]
impl Brokerage for KisRest {
    async fn current_price(&self, symbol: &str) -> Result<Quote> {
        let envelope: ApiEnvelope<PriceRow> = self
            .get_json(
                "/uapi/domestic-stock/v1/quotations/inquire-price",
                "FHKST01010100",
                &[("FID_COND_MRKT_DIV_CODE", "J"), ("FID_INPUT_ISCD", symbol)],
            )
            .await?;
        let row = envelope
            .output
            .ok_or_else(|| anyhow!("price query failed: {}", envelope.msg1))?;
        Ok(Quote {
            symbol: symbol.to_string(),
            price: num(&row.stck_prpr),
            change_pct: fnum(&row.prdy_ctrt),
            volume: num(&row.acml_vol),
            ts: Utc::now(),
        })
    }

    async fn orderbook_top(&self, symbol: &str) -> Result<OrderBookTop> {
        let envelope: ApiEnvelope<BookRow> = self
            .get_json(
                "/uapi/domestic-stock/v1/quotations/inquire-asking-price-exp-ccn",
                "FHKST01010200",
                &[("FID_COND_MRKT_DIV_CODE", "J"), ("FID_INPUT_ISCD", symbol)],
            )
            .await?;
        let row = envelope
            .output
            .ok_or_else(|| anyhow!("orderbook query failed: {}", envelope.msg1))?;
        Ok(OrderBookTop {
            symbol: symbol.to_string(),
            bid_price: num(&row.bidp1),
            ask_price: num(&row.askp1),
            bid_qty: num(&row.bidp_rsqn1),
            ask_qty: num(&row.askp_rsqn1),
            ts: Utc::now(),
        })
    }

    /// Daily tape context from the investor-flow and daily-price endpoints.
    /// Program flow and the long moving averages are not served by either,
    /// so those fields stay zero here.
    async fn market_context(&self, symbol: &str) -> Result<MarketContext> {
        #[derive(Debug, Deserialize, Default)]
        struct InvestorRow {
            #[serde(default)]
            frgn_ntby_qty: String,
            #[serde(default)]
            orgn_ntby_qty: String,
        }
        #[derive(Debug, Deserialize, Default)]
        struct DailyRow {
            #[serde(default)]
            stck_oprc: String,
            #[serde(default)]
            stck_clpr: String,
            #[serde(default)]
            acml_vol: String,
        }
        #[derive(Debug, Deserialize)]
        struct ListEnvelope<T> {
            #[serde(default)]
            output: Vec<T>,
        }

        let investors: ListEnvelope<InvestorRow> = self
            .get_json(
                "/uapi/domestic-stock/v1/quotations/inquire-investor",
                "FHKST01010900",
                &[("FID_COND_MRKT_DIV_CODE", "J"), ("FID_INPUT_ISCD", symbol)],
            )
            .await?;
        let daily: ListEnvelope<DailyRow> = self
            .get_json(
                "/uapi/domestic-stock/v1/quotations/inquire-daily-price",
                "FHKST01010400",
                &[
                    ("FID_COND_MRKT_DIV_CODE", "J"),
                    ("FID_INPUT_ISCD", symbol),
                    ("FID_PERIOD_DIV_CODE", "D"),
                    ("FID_ORG_ADJ_PRC", "0"),
                ],
            )
            .await?;

        let mut context = MarketContext {
            symbol: symbol.to_string(),
            ..MarketContext::default()
        };
        if let Some(row) = investors.output.first() {
            context.foreign_net = num(&row.frgn_ntby_qty);
            context.inst_net = num(&row.orgn_ntby_qty);
        }
        if let Some(today) = daily.output.first() {
            context.open_price = num(&today.stck_oprc);
            let today_vol = num(&today.acml_vol);
            if let Some(prior) = daily.output.get(1) {
                context.prev_close = num(&prior.stck_clpr);
                let prior_vol = num(&prior.acml_vol);
                if prior_vol > 0 {
                    context.volume_ratio = today_vol as f64 / prior_vol as f64;
                }
            }
        }
        Ok(context)
    }

    async fn combined_balance(&self) -> Result<CombinedBalance> {
        let token = self.access_token().await?;
        let resp = self
            .client
            .get(format!(
                "{}/uapi/domestic-stock/v1/trading/inquire-balance",
                self.base_url
            ))
            .header("authorization", format!("Bearer {token}"))
            .header("appkey", &self.app_key)
            .header("appsecret", &self.app_secret)
            .header("tr_id", "TTTC8434R")
            .query(&[
                ("CANO", self.account_no.as_str()),
                ("ACNT_PRDT_CD", self.account_product.as_str()),
                ("AFHR_FLPR_YN", "N"),
                ("INQR_DVSN", "02"),
                ("UNPR_DVSN", "01"),
                ("FUND_STTL_ICLD_YN", "N"),
                ("FNCG_AMT_AUTO_RDPT_YN", "N"),
                ("PRCS_DVSN", "00"),
                ("CTX_AREA_FK100", ""),
                ("CTX_AREA_NK100", ""),
            ])
            .send()
            .await
            .context("balance request")?
            .error_for_status()
            .context("balance status")?;

        let envelope: BalanceEnvelope = resp.json().await.context("balance body")?;
        if envelope.rt_cd != "0" {
            return Err(anyhow!("balance query failed: {}", envelope.msg1));
        }

        let holdings = envelope
            .output1
            .into_iter()
            .filter(|row| num(&row.hldg_qty) > 0)
            .map(|row| Holding {
                symbol: row.pdno.clone(),
                name: row.prdt_name.clone(),
                quantity: num(&row.hldg_qty),
                avg_price: fnum(&row.pchs_avg_pric) as i64,
                current_price: num(&row.prpr),
            })
            .collect();

        let summary = envelope
            .output2
            .first()
            .map(|row| BalanceSummary {
                cash: num(&row.dnca_tot_amt),
                orderable_cash: num(&row.prvs_rcdl_excc_amt),
                total_equity: num(&row.tot_evlu_amt),
                realized_pnl_today: num(&row.evlu_pfls_smtl_amt),
                cumulative_return_pct: fnum(&row.asst_icdc_erng_rt),
            })
            .ok_or_else(|| anyhow!("balance query returned no summary block"))?;

        Ok(CombinedBalance { holdings, summary })
    }

    async fn place_order(
        &self,
        side: Side,
        symbol: &str,
        qty: i64,
        price: i64,
        venue: Venue,
    ) -> Result<OrderAck> {
        let price = if price == 0 && venue == Venue::Nxt {
            let book = self.orderbook_top(symbol).await?;
            resolve_order_price(venue, side, price, &book)
        } else {
            price
        };

        let token = self.access_token().await?;
        let ord_dvsn = if price == 0 { "01" } else { "00" };
        let body = serde_json::json!({
            "CANO": self.account_no,
            "ACNT_PRDT_CD": self.account_product,
            "PDNO": symbol,
            "ORD_DVSN": ord_dvsn,
            "ORD_QTY": qty.to_string(),
            "ORD_UNPR": price.to_string(),
        });

        let resp = self
            .client
            .post(format!(
                "{}/uapi/domestic-stock/v1/trading/order-cash",
                self.base_url
            ))
            .header("authorization", format!("Bearer {token}"))
            .header("appkey", &self.app_key)
            .header("appsecret", &self.app_secret)
            .header("tr_id", order_tr_id(venue, side))
            .json(&body)
            .send()
            .await
            .context("order request")?
            .error_for_status()
            .context("order status")?;

        let envelope: ApiEnvelope<OrderRow> = resp.json().await.context("order body")?;
        if envelope.rt_cd != "0" {
            return Err(anyhow!("order rejected: {}", envelope.msg1));
        }
        let order_no = envelope
            .output
            .map(|row| row.odno)
            .filter(|no| !no.is_empty())
            .ok_or_else(|| anyhow!("order accepted without an order id"))?;

        info!(
            symbol = %symbol,
            side = side.as_str(),
            qty,
            price,
            venue = venue.as_str(),
            order_no = %order_no,
            "order placed"
        );
        Ok(OrderAck { order_no })
    }

    async fn open_orders(&self) -> Result<Vec<Order>> {
        let token = self.access_token().await?;
        let resp = self
            .client
            .get(format!(
                "{}/uapi/domestic-stock/v1/trading/inquire-psbl-rvsecncl",
                self.base_url
            ))
            .header("authorization", format!("Bearer {token}"))
            .header("appkey", &self.app_key)
            .header("appsecret", &self.app_secret)
            .header("tr_id", "TTTC8036R")
            .query(&[
                ("CANO", self.account_no.as_str()),
                ("ACNT_PRDT_CD", self.account_product.as_str()),
                ("CTX_AREA_FK100", ""),
                ("CTX_AREA_NK100", ""),
                ("INQR_DVSN_1", "0"),
                ("INQR_DVSN_2", "0"),
            ])
            .send()
            .await
            .context("open orders request")?
            .error_for_status()
            .context("open orders status")?;

        #[derive(Debug, Deserialize)]
        struct Envelope {
            #[serde(default)]
            output: Vec<OpenOrderRow>,
        }
        let envelope: Envelope = resp.json().await.context("open orders body")?;

        Ok(envelope
            .output
            .into_iter()
            .map(|row| {
                let qty = num(&row.ord_qty);
                let filled = num(&row.tot_ccld_qty);
                Order {
                    order_no: row.odno,
                    symbol: row.pdno,
                    name: row.prdt_name,
                    side: if row.sll_buy_dvsn_cd == "01" {
                        Side::Sell
                    } else {
                        Side::Buy
                    },
                    venue: Venue::Krx,
                    qty,
                    price: num(&row.ord_unpr),
                    status: if filled > 0 {
                        OrderStatus::PartiallyFilled
                    } else {
                        OrderStatus::Pending
                    },
                    filled_qty: filled,
                    avg_fill_price: 0,
                    placed_at: Utc::now(),
                    executed_at: None,
                }
            })
            .collect())
    }

    async fn top_gainers(&self, limit: usize) -> Result<Vec<RankedSymbol>> {
        self.ranking("/uapi/domestic-stock/v1/ranking/fluctuation", "FHPST01700000", limit)
            .await
    }

    async fn top_volume(&self, limit: usize) -> Result<Vec<RankedSymbol>> {
        self.ranking("/uapi/domestic-stock/v1/quotations/volume-rank", "FHPST01710000", limit)
            .await
    }

    async fn stream_approval_key(&self) -> Result<String> {
        let body = serde_json::json!({
            "grant_type": "client_credentials",
            "appkey": self.app_key,
            "secretkey": self.app_secret,
        });
        let resp: ApprovalResponse = self
            .client
            .post(format!("{}/oauth2/Approval", self.base_url))
            .json(&body)
            .send()
            .await
            .context("approval key request")?
            .error_for_status()
            .context("approval key status")?
            .json()
            .await
            .context("approval key body")?;
        Ok(resp.approval_key)
    }
}

impl KisRest {
    async fn ranking(&self, path: &str, tr_id: &str, limit: usize) -> Result<Vec<RankedSymbol>> {
        #[derive(Debug, Deserialize)]
        struct Envelope {
            #[serde(default)]
            output: Vec<RankRow>,
        }
        let envelope: Envelope = self
            .get_json(
                path,
                tr_id,
                &[("FID_COND_MRKT_DIV_CODE", "J"), ("FID_INPUT_ISCD", "0000")],
            )
            .await?;
        Ok(envelope
            .output
            .into_iter()
            .take(limit)
            .filter(|row| !row.mksc_shrn_iscd.is_empty())
            .map(|row| RankedSymbol {
                symbol: row.mksc_shrn_iscd,
                name: row.hts_kor_isnm,
                price: num(&row.stck_prpr),
                change_pct: fnum(&row.prdy_ctrt),
                volume: num(&row.acml_vol),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_cache_roundtrip_and_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        let now = Utc::now();

        let token = CachedToken {
            access_token: "abc123".into(),
            expires_at: now + ChronoDuration::hours(12),
        };
        save_cached_token(&path, &token).unwrap();

        // A token with a future expiry is reused without any network call.
        let loaded = load_cached_token(&path, now).unwrap();
        assert_eq!(loaded.access_token, "abc123");

        // Past expiry, the cache is ignored.
        assert!(load_cached_token(&path, now + ChronoDuration::hours(13)).is_none());
    }

    #[test]
    fn missing_or_corrupt_cache_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        assert!(load_cached_token(&path, Utc::now()).is_none());

        std::fs::write(&path, "not json").unwrap();
        assert!(load_cached_token(&path, Utc::now()).is_none());
    }

    #[test]
    fn order_tr_ids_differ_per_venue() {
        assert_eq!(order_tr_id(Venue::Krx, Side::Buy), "TTTC0802U");
        assert_eq!(order_tr_id(Venue::Nxt, Side::Buy), "TTTN0802U");
        assert_ne!(
            order_tr_id(Venue::Krx, Side::Sell),
            order_tr_id(Venue::Nxt, Side::Sell)
        );
    }

    #[test]
    fn string_numbers_parse_defensively() {
        assert_eq!(num(" 70000 "), 70_000);
        assert_eq!(num("garbage"), 0);
        assert!((fnum("-3.12") + 3.12).abs() < 1e-9);
    }
}

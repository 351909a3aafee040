//! Real-time market-data stream manager.
//!
//! A bounded table of subscription slots (hard cap 40) across three priority
//! tiers: 1 = held positions, 2 = daily picks, 3 = intraday hot symbols.
//! The table is the canonical state; the wire is a projection of it, which is
//! what keeps reconnect logic simple — on every successful handshake the
//! manager replays a subscribe frame per slot.
//!
//! One task owns the table. External callers talk to it through an mpsc
//! command channel with oneshot replies.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::broker::Brokerage;
use crate::events::{Event, EventBus, EventKind};
use crate::models::{Config, OrderBookTop, Quote};
use crate::notify::Notifier;
use crate::storage::Db;

pub const MAX_SLOTS: usize = 40;
pub const DAILY_PICK_LIMIT: usize = 20;
const STALE_AFTER_MINS: i64 = 30;
const RECONNECT_DELAY: Duration = Duration::from_secs(10);
const HANDSHAKE_ATTEMPTS: u32 = 10;
const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(20);
const SUBSCRIBE_FAILURE_WINDOW: Duration = Duration::from_secs(600);
const SUBSCRIBE_FAILURE_ALERT: usize = 5;

const TR_TRADE: &str = "H0STCNT0";
const TR_ORDERBOOK: &str = "H0STASP0";
const TR_EXECUTION: &str = "H0STCNI0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Handshaking,
    Connected,
    Degraded,
    Closed,
}

impl ConnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnState::Disconnected => "disconnected",
            ConnState::Handshaking => "handshaking",
            ConnState::Connected => "connected",
            ConnState::Degraded => "degraded",
            ConnState::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Slot {
    pub symbol: String,
    pub name: String,
    pub tr_id: &'static str,
    pub priority: u8,
    pub subscribed_at: DateTime<Utc>,
    pub last_data_at: Option<DateTime<Utc>>,
}

impl Slot {
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        match self.last_data_at {
            Some(t) => (now - t).num_minutes() > STALE_AFTER_MINS,
            None => false,
        }
    }
}

/// Pure slot bookkeeping; all wire effects live outside.
#[derive(Default)]
pub struct SlotTable {
    slots: HashMap<String, Slot>,
}

impl SlotTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.slots.contains_key(symbol)
    }

    pub fn get(&self, symbol: &str) -> Option<&Slot> {
        self.slots.get(symbol)
    }

    pub fn insert(&mut self, slot: Slot) {
        self.slots.insert(slot.symbol.clone(), slot);
    }

    pub fn remove(&mut self, symbol: &str) -> Option<Slot> {
        self.slots.remove(symbol)
    }

    pub fn all(&self) -> Vec<Slot> {
        let mut slots: Vec<Slot> = self.slots.values().cloned().collect();
        slots.sort_by(|a, b| a.subscribed_at.cmp(&b.subscribed_at));
        slots
    }

    pub fn symbols_with_priority(&self, priority: u8) -> Vec<String> {
        self.slots
            .values()
            .filter(|s| s.priority == priority)
            .map(|s| s.symbol.clone())
            .collect()
    }

    pub fn priority_counts(&self) -> [usize; 3] {
        let mut counts = [0usize; 3];
        for slot in self.slots.values() {
            let idx = (slot.priority.clamp(1, 3) - 1) as usize;
            counts[idx] += 1;
        }
        counts
    }

    pub fn mark_data(&mut self, symbol: &str, now: DateTime<Utc>) -> bool {
        match self.slots.get_mut(symbol) {
            Some(slot) => {
                slot.last_data_at = Some(now);
                true
            }
            None => false,
        }
    }

    pub fn stale_symbols(&self, now: DateTime<Utc>) -> Vec<String> {
        self.slots
            .values()
            .filter(|s| s.is_stale(now))
            .map(|s| s.symbol.clone())
            .collect()
    }

    /// Pick the slot a new subscription at `priority` may evict: the oldest
    /// strictly-lower-priority slot, else (for priorities 1 and 2) the oldest
    /// slot of equal priority, else nothing.
    pub fn eviction_candidate(&self, priority: u8) -> Option<String> {
        let oldest_with = |pred: &dyn Fn(&Slot) -> bool| {
            self.slots
                .values()
                .filter(|s| pred(s))
                .min_by_key(|s| s.subscribed_at)
                .map(|s| s.symbol.clone())
        };

        if let Some(symbol) = oldest_with(&|s: &Slot| s.priority > priority) {
            return Some(symbol);
        }
        if priority <= 2 {
            return oldest_with(&|s: &Slot| s.priority == priority);
        }
        None
    }
}

/// Sends subscribe/unsubscribe frames for the core. The production sink
/// writes tungstenite frames; tests record the traffic.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_subscribe(&mut self, tr_id: &str, symbol: &str) -> Result<()>;
    async fn send_unsubscribe(&mut self, tr_id: &str, symbol: &str) -> Result<()>;
}

/// A sink for the periods when no connection exists. Every send fails.
pub struct OfflineSink;

#[async_trait]
impl FrameSink for OfflineSink {
    async fn send_subscribe(&mut self, _tr_id: &str, _symbol: &str) -> Result<()> {
        Err(anyhow!("stream not connected"))
    }

    async fn send_unsubscribe(&mut self, _tr_id: &str, _symbol: &str) -> Result<()> {
        Err(anyhow!("stream not connected"))
    }
}

#[derive(Debug, Clone)]
pub struct StreamStatus {
    pub state: &'static str,
    pub total: usize,
    pub max: usize,
    pub priority_1: usize,
    pub priority_2: usize,
    pub priority_3: usize,
}

/// Table + state machine, independent of the real socket so the slot laws
/// are testable without a broker.
pub struct StreamCore {
    table: SlotTable,
    state: ConnState,
    subscribe_failures: HashMap<String, VecDeque<DateTime<Utc>>>,
}

impl Default for StreamCore {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamCore {
    pub fn new() -> Self {
        Self {
            table: SlotTable::new(),
            state: ConnState::Disconnected,
            subscribe_failures: HashMap::new(),
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn set_state(&mut self, state: ConnState) {
        if self.state != state {
            info!(from = self.state.as_str(), to = state.as_str(), "stream state");
            self.state = state;
        }
    }

    pub fn table(&self) -> &SlotTable {
        &self.table
    }

    /// Subscribe a symbol, evicting per policy when the table is full.
    /// Returns false when no slot can be made available or the frame cannot
    /// be sent; the table is left unchanged on failure.
    pub async fn subscribe(
        &mut self,
        sink: &mut dyn FrameSink,
        symbol: &str,
        name: &str,
        priority: u8,
    ) -> bool {
        if self.state == ConnState::Closed {
            warn!(symbol = %symbol, "subscribe refused: stream closed");
            return false;
        }
        if self.table.contains(symbol) {
            return true;
        }

        if self.table.len() >= MAX_SLOTS {
            let Some(victim) = self.table.eviction_candidate(priority) else {
                warn!(symbol = %symbol, priority, "subscribe refused: slots full, priority too low");
                return false;
            };
            if !self.unsubscribe(sink, &victim).await {
                return false;
            }
            info!(evicted = %victim, for_symbol = %symbol, "slot evicted");
        }

        if let Err(e) = sink.send_subscribe(TR_TRADE, symbol).await {
            warn!(symbol = %symbol, error = %e, "subscribe frame failed");
            return false;
        }

        self.table.insert(Slot {
            symbol: symbol.to_string(),
            name: name.to_string(),
            tr_id: TR_TRADE,
            priority,
            subscribed_at: Utc::now(),
            last_data_at: None,
        });
        info!(
            symbol = %symbol,
            priority,
            slots = format!("{}/{}", self.table.len(), MAX_SLOTS),
            "subscribed"
        );
        true
    }

    pub async fn unsubscribe(&mut self, sink: &mut dyn FrameSink, symbol: &str) -> bool {
        let Some(slot) = self.table.get(symbol).cloned() else {
            return true;
        };
        if let Err(e) = sink.send_unsubscribe(slot.tr_id, symbol).await {
            warn!(symbol = %symbol, error = %e, "unsubscribe frame failed");
            return false;
        }
        self.table.remove(symbol);
        debug!(symbol = %symbol, slots = self.table.len(), "unsubscribed");
        true
    }

    /// Make the priority-1 slots exactly the set of held symbols.
    pub async fn sync_with_positions(
        &mut self,
        sink: &mut dyn FrameSink,
        holdings: &[(String, String)],
    ) {
        let current: Vec<String> = self.table.symbols_with_priority(1);
        let held: Vec<&String> = holdings.iter().map(|(s, _)| s).collect();

        for symbol in current.iter().filter(|s| !held.contains(s)) {
            self.unsubscribe(sink, symbol).await;
        }
        for (symbol, name) in holdings {
            if !self.table.contains(symbol) {
                self.subscribe(sink, symbol, name, 1).await;
            }
        }
        debug!(priority_1 = self.table.priority_counts()[0], "positions synced");
    }

    /// Replace the priority-2 tier with the day's picks (at most 20).
    pub async fn update_daily_picks(
        &mut self,
        sink: &mut dyn FrameSink,
        picks: &[(String, String)],
    ) -> usize {
        for symbol in self.table.symbols_with_priority(2) {
            self.unsubscribe(sink, &symbol).await;
        }
        let mut added = 0;
        for (symbol, name) in picks.iter().take(DAILY_PICK_LIMIT) {
            if self.subscribe(sink, symbol, name, 2).await {
                added += 1;
            }
        }
        info!(added, "daily picks updated");
        added
    }

    /// Replay subscribe frames for every slot after a reconnect.
    pub async fn resubscribe_all(&mut self, sink: &mut dyn FrameSink) -> usize {
        let mut sent = 0;
        for slot in self.table.all() {
            match sink.send_subscribe(slot.tr_id, &slot.symbol).await {
                Ok(()) => sent += 1,
                Err(e) => warn!(symbol = %slot.symbol, error = %e, "resubscribe failed"),
            }
        }
        info!(sent, total = self.table.len(), "resubscribed after reconnect");
        sent
    }

    pub async fn evict_stale(&mut self, sink: &mut dyn FrameSink, now: DateTime<Utc>) -> usize {
        let stale = self.table.stale_symbols(now);
        let mut evicted = 0;
        for symbol in stale {
            if self.unsubscribe(sink, &symbol).await {
                evicted += 1;
                info!(symbol = %symbol, "stale slot evicted");
            }
        }
        evicted
    }

    pub fn mark_data(&mut self, symbol: &str) -> bool {
        self.table.mark_data(symbol, Utc::now())
    }

    /// Record a failed subscribe; true when the per-symbol failure rate
    /// crosses the operator-alert threshold (5 in 10 minutes).
    pub fn record_subscribe_failure(&mut self, symbol: &str) -> bool {
        let now = Utc::now();
        let window = self.subscribe_failures.entry(symbol.to_string()).or_default();
        window.push_back(now);
        while let Some(front) = window.front() {
            if (now - *front).to_std().unwrap_or_default() > SUBSCRIBE_FAILURE_WINDOW {
                window.pop_front();
            } else {
                break;
            }
        }
        window.len() >= SUBSCRIBE_FAILURE_ALERT
    }

    pub fn status(&self) -> StreamStatus {
        let [p1, p2, p3] = self.table.priority_counts();
        StreamStatus {
            state: self.state.as_str(),
            total: self.table.len(),
            max: MAX_SLOTS,
            priority_1: p1,
            priority_2: p2,
            priority_3: p3,
        }
    }
}

pub enum StreamCommand {
    Subscribe {
        symbol: String,
        name: String,
        priority: u8,
        reply: oneshot::Sender<bool>,
    },
    Unsubscribe {
        symbol: String,
        reply: oneshot::Sender<bool>,
    },
    SyncPositions {
        holdings: Vec<(String, String)>,
        reply: oneshot::Sender<()>,
    },
    UpdateDailyPicks {
        picks: Vec<(String, String)>,
        reply: oneshot::Sender<usize>,
    },
    Status {
        reply: oneshot::Sender<StreamStatus>,
    },
    Stop,
}

#[derive(Clone)]
pub struct StreamHandle {
    tx: mpsc::Sender<StreamCommand>,
}

impl StreamHandle {
    pub async fn subscribe(&self, symbol: &str, name: &str, priority: u8) -> bool {
        let (reply, rx) = oneshot::channel();
        let cmd = StreamCommand::Subscribe {
            symbol: symbol.to_string(),
            name: name.to_string(),
            priority,
            reply,
        };
        if self.tx.send(cmd).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn unsubscribe(&self, symbol: &str) -> bool {
        let (reply, rx) = oneshot::channel();
        let cmd = StreamCommand::Unsubscribe {
            symbol: symbol.to_string(),
            reply,
        };
        if self.tx.send(cmd).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn sync_with_positions(&self, holdings: Vec<(String, String)>) {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(StreamCommand::SyncPositions { holdings, reply })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    pub async fn update_daily_picks(&self, picks: Vec<(String, String)>) -> usize {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(StreamCommand::UpdateDailyPicks { picks, reply })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub async fn status(&self) -> Option<StreamStatus> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StreamCommand::Status { reply }).await.ok()?;
        rx.await.ok()
    }

    pub async fn stop(&self) {
        let _ = self.tx.send(StreamCommand::Stop).await;
    }
}

struct WsSink {
    write: futures_util::stream::SplitSink<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        Message,
    >,
    approval_key: String,
}

impl WsSink {
    fn frame(&self, tr_type: &str, tr_id: &str, symbol: &str) -> String {
        serde_json::json!({
            "header": {
                "approval_key": self.approval_key,
                "custtype": "P",
                "tr_type": tr_type,
                "content-type": "utf-8",
            },
            "body": {
                "input": {
                    "tr_id": tr_id,
                    "tr_key": symbol,
                }
            }
        })
        .to_string()
    }
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_subscribe(&mut self, tr_id: &str, symbol: &str) -> Result<()> {
        let frame = self.frame("1", tr_id, symbol);
        self.write
            .send(Message::Text(frame))
            .await
            .context("send subscribe frame")
    }

    async fn send_unsubscribe(&mut self, tr_id: &str, symbol: &str) -> Result<()> {
        let frame = self.frame("2", tr_id, symbol);
        self.write
            .send(Message::Text(frame))
            .await
            .context("send unsubscribe frame")
    }
}

pub struct StreamManager;

impl StreamManager {
    /// Spawn the stream worker and return its command handle.
    pub fn spawn(
        config: Config,
        broker: Arc<dyn Brokerage>,
        db: Db,
        bus: Arc<EventBus>,
        notifier: Arc<Notifier>,
    ) -> StreamHandle {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            if let Err(e) = run(config, broker, db, bus, notifier, rx).await {
                error!(error = %e, "stream manager exited");
            }
        });
        StreamHandle { tx }
    }
}

async fn handshake(
    config: &Config,
    broker: &Arc<dyn Brokerage>,
) -> Result<(
    WsSink,
    futures_util::stream::SplitStream<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    >,
)> {
    // The approval key is ephemeral: fetched per connect, never configured.
    let approval_key = broker
        .stream_approval_key()
        .await
        .context("fetch approval key")?;

    let (ws, _) = connect_async(&config.broker_ws_url)
        .await
        .context("connect stream")?;
    let (write, read) = ws.split();
    let mut sink = WsSink { write, approval_key };

    // Execution notices are account-keyed and do not consume a slot.
    sink.send_subscribe(TR_EXECUTION, &config.broker_account_no)
        .await?;

    info!("stream connected");
    Ok((sink, read))
}

async fn run(
    config: Config,
    broker: Arc<dyn Brokerage>,
    db: Db,
    bus: Arc<EventBus>,
    notifier: Arc<Notifier>,
    mut rx: mpsc::Receiver<StreamCommand>,
) -> Result<()> {
    let mut core = StreamCore::new();

    // Bounded handshake loop at start; a broker that refuses 10 times is a
    // fatal condition worth telling the operator about.
    core.set_state(ConnState::Handshaking);
    let mut link = None;
    for attempt in 1..=HANDSHAKE_ATTEMPTS {
        match handshake(&config, &broker).await {
            Ok(pair) => {
                link = Some(pair);
                break;
            }
            Err(e) => {
                warn!(attempt, error = %e, "stream handshake failed");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
    let Some((mut sink, mut read)) = link else {
        core.set_state(ConnState::Closed);
        notifier
            .send("stream handshake failed after 10 attempts, stream offline")
            .await;
        return Err(anyhow!("handshake failed after {HANDSHAKE_ATTEMPTS} attempts"));
    };
    core.set_state(ConnState::Connected);

    let mut housekeeping = tokio::time::interval(Duration::from_secs(300));
    housekeeping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            cmd = rx.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    StreamCommand::Subscribe { symbol, name, priority, reply } => {
                        let ok = core.subscribe(&mut sink, &symbol, &name, priority).await;
                        if !ok && core.record_subscribe_failure(&symbol) {
                            notifier
                                .send(&format!("repeated subscribe failures for {symbol}"))
                                .await;
                        }
                        let _ = reply.send(ok);
                    }
                    StreamCommand::Unsubscribe { symbol, reply } => {
                        let _ = reply.send(core.unsubscribe(&mut sink, &symbol).await);
                    }
                    StreamCommand::SyncPositions { holdings, reply } => {
                        core.sync_with_positions(&mut sink, &holdings).await;
                        let _ = reply.send(());
                    }
                    StreamCommand::UpdateDailyPicks { picks, reply } => {
                        let _ = reply.send(core.update_daily_picks(&mut sink, &picks).await);
                    }
                    StreamCommand::Status { reply } => {
                        let _ = reply.send(core.status());
                    }
                    StreamCommand::Stop => {
                        for slot in core.table().all() {
                            core.unsubscribe(&mut sink, &slot.symbol).await;
                        }
                        core.set_state(ConnState::Closed);
                        info!("stream manager stopped");
                        return Ok(());
                    }
                }
            }
            _ = housekeeping.tick() => {
                core.evict_stale(&mut sink, Utc::now()).await;
            }
            msg = tokio::time::timeout(READ_IDLE_TIMEOUT, read.next()) => {
                match msg {
                    Err(_) => {
                        // Idle; nudge the broker so a dead link surfaces as an error.
                        if sink.write.send(Message::Ping(Vec::new())).await.is_err() {
                            (sink, read) = reconnect(&config, &broker, &mut core).await?;
                        }
                    }
                    Ok(None) => {
                        (sink, read) = reconnect(&config, &broker, &mut core).await?;
                    }
                    Ok(Some(Err(e))) => {
                        warn!(error = %e, "stream read error");
                        (sink, read) = reconnect(&config, &broker, &mut core).await?;
                    }
                    Ok(Some(Ok(Message::Text(text)))) => {
                        handle_frame(&mut core, &db, &bus, &text).await;
                    }
                    Ok(Some(Ok(Message::Ping(payload)))) => {
                        let _ = sink.write.send(Message::Pong(payload)).await;
                    }
                    Ok(Some(Ok(Message::Close(frame)))) => {
                        debug!(?frame, "stream close frame");
                        (sink, read) = reconnect(&config, &broker, &mut core).await?;
                    }
                    Ok(Some(Ok(_))) => {}
                }
            }
        }
    }
    Ok(())
}

type WsPair = (
    WsSink,
    futures_util::stream::SplitStream<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    >,
);

/// Fixed-delay reconnect loop. The slot table survives; the wire is rebuilt
/// from it once the handshake succeeds.
async fn reconnect(
    config: &Config,
    broker: &Arc<dyn Brokerage>,
    core: &mut StreamCore,
) -> Result<WsPair> {
    core.set_state(ConnState::Degraded);
    loop {
        tokio::time::sleep(RECONNECT_DELAY).await;
        core.set_state(ConnState::Handshaking);
        match handshake(config, broker).await {
            Ok((mut sink, read)) => {
                core.set_state(ConnState::Connected);
                core.resubscribe_all(&mut sink).await;
                return Ok((sink, read));
            }
            Err(e) => {
                warn!(error = %e, "reconnect failed");
                core.set_state(ConnState::Degraded);
            }
        }
    }
}

/// Dispatch one inbound frame by tr_id. Execution notices go to the bus for
/// the fetcher layer; trade and book frames refresh slot liveness and write
/// through to storage. Frames for unsubscribed symbols are dropped.
async fn handle_frame(core: &mut StreamCore, db: &Db, bus: &Arc<EventBus>, text: &str) {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
        return;
    };
    let tr_id = value
        .pointer("/header/tr_id")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let output = value.pointer("/body/output").cloned().unwrap_or_default();

    match tr_id {
        TR_EXECUTION => {
            let symbol = output
                .get("shtn_pdno")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            bus.publish(Event::new(
                EventKind::ExecutionFill,
                (!symbol.is_empty()).then_some(symbol.as_str()),
                output,
            ))
            .await;
        }
        TR_TRADE => {
            let symbol = output
                .get("MKSC_SHRN_ISCD")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            if !core.mark_data(symbol) {
                debug!(symbol = %symbol, "trade frame for unsubscribed symbol dropped");
                return;
            }
            let quote = Quote {
                symbol: symbol.to_string(),
                price: output
                    .get("STCK_PRPR")
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0),
                change_pct: output
                    .get("PRDY_CTRT")
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0.0),
                volume: output
                    .get("ACML_VOL")
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0),
                ts: Utc::now(),
            };
            if quote.price > 0 {
                if let Err(e) = db.upsert_quote(&quote) {
                    warn!(symbol = %symbol, error = %e, "quote write failed");
                }
            }
        }
        TR_ORDERBOOK => {
            let symbol = output
                .get("MKSC_SHRN_ISCD")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            if !core.mark_data(symbol) {
                debug!(symbol = %symbol, "book frame for unsubscribed symbol dropped");
                return;
            }
            let read_num = |key: &str| {
                output
                    .get(key)
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0)
            };
            let book = OrderBookTop {
                symbol: symbol.to_string(),
                bid_price: read_num("BIDP1"),
                ask_price: read_num("ASKP1"),
                bid_qty: read_num("BIDP_RSQN1"),
                ask_qty: read_num("ASKP_RSQN1"),
                ts: Utc::now(),
            };
            if let Err(e) = db.upsert_orderbook(&book) {
                warn!(symbol = %symbol, error = %e, "orderbook write failed");
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    /// Records every frame; can be told to fail sends.
    #[derive(Default)]
    struct FakeSink {
        frames: Arc<PlMutex<Vec<(String, String, String)>>>,
        fail: bool,
    }

    impl FakeSink {
        fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl FrameSink for FakeSink {
        async fn send_subscribe(&mut self, tr_id: &str, symbol: &str) -> Result<()> {
            if self.fail {
                return Err(anyhow!("wire down"));
            }
            self.frames
                .lock()
                .push(("sub".into(), tr_id.into(), symbol.into()));
            Ok(())
        }

        async fn send_unsubscribe(&mut self, tr_id: &str, symbol: &str) -> Result<()> {
            if self.fail {
                return Err(anyhow!("wire down"));
            }
            self.frames
                .lock()
                .push(("unsub".into(), tr_id.into(), symbol.into()));
            Ok(())
        }
    }

    async fn fill(core: &mut StreamCore, sink: &mut FakeSink, count: usize, priority: u8) {
        for i in 0..count {
            let symbol = format!("P{priority}_{i:03}");
            assert!(core.subscribe(sink, &symbol, &symbol, priority).await);
        }
    }

    #[tokio::test]
    async fn slot_cap_is_never_exceeded() {
        let mut core = StreamCore::new();
        let mut sink = FakeSink::new();
        for i in 0..60 {
            let symbol = format!("S{i:03}");
            core.subscribe(&mut sink, &symbol, &symbol, 3).await;
            assert!(core.table().len() <= MAX_SLOTS);
        }
    }

    #[tokio::test]
    async fn subscribing_twice_is_a_success_noop() {
        let mut core = StreamCore::new();
        let mut sink = FakeSink::new();
        assert!(core.subscribe(&mut sink, "005930", "Samsung", 1).await);
        assert!(core.subscribe(&mut sink, "005930", "Samsung", 1).await);
        assert_eq!(core.table().len(), 1);
        assert_eq!(sink.frames.lock().len(), 1);
    }

    #[tokio::test]
    async fn full_table_evicts_lower_priority_first() {
        let mut core = StreamCore::new();
        let mut sink = FakeSink::new();
        fill(&mut core, &mut sink, 30, 1).await;
        fill(&mut core, &mut sink, 10, 3).await;
        assert_eq!(core.table().len(), MAX_SLOTS);

        // A new priority-2 subscription evicts one priority-3 slot.
        assert!(core.subscribe(&mut sink, "NEWPICK", "NewPick", 2).await);
        let status = core.status();
        assert_eq!(status.total, MAX_SLOTS);
        assert_eq!(status.priority_1, 30);
        assert_eq!(status.priority_2, 1);
        assert_eq!(status.priority_3, 9);
    }

    #[tokio::test]
    async fn priority_3_cannot_evict_anyone_and_table_is_unchanged() {
        let mut core = StreamCore::new();
        let mut sink = FakeSink::new();
        fill(&mut core, &mut sink, 20, 1).await;
        fill(&mut core, &mut sink, 20, 2).await;
        let before: Vec<String> = core.table().all().iter().map(|s| s.symbol.clone()).collect();

        assert!(!core.subscribe(&mut sink, "HOT999", "Hot", 3).await);

        let after: Vec<String> = core.table().all().iter().map(|s| s.symbol.clone()).collect();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn equal_priority_eviction_applies_to_picks_but_not_hot_symbols() {
        let mut core = StreamCore::new();
        let mut sink = FakeSink::new();
        fill(&mut core, &mut sink, 40, 2).await;

        // Priority 2 may displace its own tier (oldest first).
        assert!(core.subscribe(&mut sink, "PICK_NEW", "Pick", 2).await);
        assert!(core.table().contains("PICK_NEW"));
        assert!(!core.table().contains("P2_000"));
        assert_eq!(core.table().len(), MAX_SLOTS);
    }

    #[tokio::test]
    async fn sync_makes_priority_one_exactly_the_holdings() {
        let mut core = StreamCore::new();
        let mut sink = FakeSink::new();
        core.subscribe(&mut sink, "AAA", "A", 1).await;
        core.subscribe(&mut sink, "BBB", "B", 1).await;
        core.subscribe(&mut sink, "HOT", "H", 3).await;

        let holdings = vec![
            ("BBB".to_string(), "B".to_string()),
            ("CCC".to_string(), "C".to_string()),
        ];
        core.sync_with_positions(&mut sink, &holdings).await;

        let mut p1 = core.table().symbols_with_priority(1);
        p1.sort();
        assert_eq!(p1, vec!["BBB".to_string(), "CCC".to_string()]);
        // Unrelated tiers are untouched.
        assert!(core.table().contains("HOT"));
    }

    #[tokio::test]
    async fn daily_picks_replace_the_whole_tier_capped_at_twenty() {
        let mut core = StreamCore::new();
        let mut sink = FakeSink::new();
        core.subscribe(&mut sink, "OLDPICK", "Old", 2).await;

        let picks: Vec<(String, String)> = (0..25)
            .map(|i| (format!("PK{i:02}"), format!("Pick {i}")))
            .collect();
        let added = core.update_daily_picks(&mut sink, &picks).await;

        assert_eq!(added, DAILY_PICK_LIMIT);
        assert!(!core.table().contains("OLDPICK"));
        assert_eq!(core.status().priority_2, DAILY_PICK_LIMIT);
    }

    #[tokio::test]
    async fn wire_failure_leaves_the_table_unchanged() {
        let mut core = StreamCore::new();
        let mut sink = FakeSink::new();
        sink.fail = true;
        assert!(!core.subscribe(&mut sink, "005930", "Samsung", 1).await);
        assert_eq!(core.table().len(), 0);
    }

    #[tokio::test]
    async fn closed_stream_refuses_subscriptions() {
        let mut core = StreamCore::new();
        let mut sink = FakeSink::new();
        core.set_state(ConnState::Closed);
        assert!(!core.subscribe(&mut sink, "005930", "Samsung", 1).await);
        assert!(core.table().is_empty());
    }

    #[tokio::test]
    async fn resubscribe_replays_every_slot() {
        let mut core = StreamCore::new();
        let mut sink = FakeSink::new();
        fill(&mut core, &mut sink, 5, 1).await;

        let mut fresh = FakeSink::new();
        let sent = core.resubscribe_all(&mut fresh).await;
        assert_eq!(sent, 5);
        assert_eq!(fresh.frames.lock().len(), 5);
    }

    #[tokio::test]
    async fn stale_slots_are_evicted_by_housekeeping() {
        let mut core = StreamCore::new();
        let mut sink = FakeSink::new();
        core.subscribe(&mut sink, "OLD", "Old", 3).await;
        core.subscribe(&mut sink, "FRESH", "Fresh", 3).await;

        // OLD last heard from 31 minutes ago; FRESH just now.
        let past = Utc::now() - chrono::Duration::minutes(31);
        core.table.slots.get_mut("OLD").unwrap().last_data_at = Some(past);
        core.mark_data("FRESH");

        let evicted = core.evict_stale(&mut sink, Utc::now()).await;
        assert_eq!(evicted, 1);
        assert!(!core.table().contains("OLD"));
        assert!(core.table().contains("FRESH"));
    }

    #[test]
    fn subscribe_failure_alerting_needs_five_in_window() {
        let mut core = StreamCore::new();
        for _ in 0..4 {
            assert!(!core.record_subscribe_failure("005930"));
        }
        assert!(core.record_subscribe_failure("005930"));
    }
}

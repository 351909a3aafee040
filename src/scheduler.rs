//! Wall-clock job scheduler, Asia/Seoul, Monday through Friday.
//!
//! Jobs are declared as (name, cadence, handler) rows registered at start.
//! Firing rules: coalesced (a tick that lands while the previous run is
//! still holding the job lock is skipped and merged), single-instance, and a
//! 60 s misfire grace past the scheduled minute. Every run is wrapped in an
//! envelope that logs start/end and absorbs panics; a failing job never
//! takes the scheduler down with it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Timelike, Utc, Weekday};
use chrono_tz::Asia::Seoul;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, info};

const TICK_INTERVAL: Duration = Duration::from_secs(5);
/// Scheduled minute plus a 60 s misfire grace.
const FIRE_WINDOW_SECS: u32 = 120;

/// One firing band: fire at `start + k * step` minutes for every multiple
/// inside [start, end].
#[derive(Debug, Clone, Copy)]
pub struct Band {
    pub start: u32,
    pub end: u32,
    pub step: u32,
}

#[derive(Debug, Clone)]
pub enum Cadence {
    DailyAt { minute_of_day: u32 },
    EveryMinute { start: u32, end: u32 },
    Bands(Vec<Band>),
}

pub const fn hm(hour: u32, minute: u32) -> u32 {
    hour * 60 + minute
}

/// The intraday pipeline's 10-60-20-10 bands.
pub fn intraday_bands() -> Cadence {
    Cadence::Bands(vec![
        Band { start: hm(9, 0), end: hm(9, 59), step: 10 },
        Band { start: hm(10, 0), end: hm(12, 59), step: 60 },
        Band { start: hm(13, 0), end: hm(14, 59), step: 20 },
        Band { start: hm(15, 0), end: hm(15, 20), step: 10 },
    ])
}

/// Most recent firing minute at or before `minute_of_day`, if any today.
pub fn last_due_minute(cadence: &Cadence, minute_of_day: u32) -> Option<u32> {
    match cadence {
        Cadence::DailyAt { minute_of_day: at } => (minute_of_day >= *at).then_some(*at),
        Cadence::EveryMinute { start, end } => {
            if minute_of_day < *start {
                None
            } else {
                Some(minute_of_day.min(*end))
            }
        }
        Cadence::Bands(bands) => bands
            .iter()
            .filter_map(|band| {
                if minute_of_day < band.start {
                    return None;
                }
                let capped = minute_of_day.min(band.end);
                let offset = capped - band.start;
                Some(band.start + offset - offset % band.step.max(1))
            })
            .max(),
    }
}

pub fn within_grace(due_minute: u32, seconds_of_day: u32) -> bool {
    let due = due_minute * 60;
    seconds_of_day >= due && seconds_of_day - due < FIRE_WINDOW_SECS
}

pub fn is_trading_day(weekday: Weekday) -> bool {
    !matches!(weekday, Weekday::Sat | Weekday::Sun)
}

#[async_trait]
pub trait Job: Send + Sync {
    async fn run(&self);
}

struct ScheduledJob {
    name: &'static str,
    cadence: Cadence,
    handler: Arc<dyn Job>,
    running: Arc<tokio::sync::Mutex<()>>,
    last_fired: Mutex<Option<(NaiveDate, u32)>>,
}

pub struct Scheduler {
    jobs: Mutex<Vec<Arc<ScheduledJob>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            jobs: Mutex::new(Vec::new()),
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn register(&self, name: &'static str, cadence: Cadence, handler: Arc<dyn Job>) {
        info!(job = name, "job registered");
        self.jobs.lock().push(Arc::new(ScheduledJob {
            name,
            cadence,
            handler,
            running: Arc::new(tokio::sync::Mutex::new(())),
            last_fired: Mutex::new(None),
        }));
    }

    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            info!("scheduler started");
            let mut rx = this.shutdown_rx.clone();
            let mut ticker = tokio::time::interval(TICK_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => this.tick(),
                    _ = rx.changed() => {
                        if *rx.borrow() {
                            info!("scheduler stopped");
                            return;
                        }
                    }
                }
            }
        })
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    fn tick(&self) {
        let now = Utc::now().with_timezone(&Seoul);
        if !is_trading_day(now.weekday()) {
            return;
        }
        let date = now.date_naive();
        let minute_of_day = now.hour() * 60 + now.minute();
        let seconds_of_day = minute_of_day * 60 + now.second();

        let jobs = self.jobs.lock().clone();
        for job in jobs {
            let Some(due) = last_due_minute(&job.cadence, minute_of_day) else {
                continue;
            };
            if !within_grace(due, seconds_of_day) {
                continue;
            }
            if *job.last_fired.lock() == Some((date, due)) {
                continue;
            }

            // Single instance: a tick landing mid-run is merged away.
            let Ok(guard) = job.running.clone().try_lock_owned() else {
                debug!(job = job.name, "previous run still active, tick coalesced");
                continue;
            };
            *job.last_fired.lock() = Some((date, due));

            let handler = job.handler.clone();
            let name = job.name;
            tokio::spawn(async move {
                let _guard = guard;
                info!(job = name, "job started");
                let started = std::time::Instant::now();
                // Inner task so a panic is contained and logged.
                let outcome = tokio::spawn(async move { handler.run().await }).await;
                match outcome {
                    Ok(()) => info!(
                        job = name,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "job finished"
                    ),
                    Err(e) => error!(job = name, error = %e, "job panicked"),
                }
            });
        }
    }
}

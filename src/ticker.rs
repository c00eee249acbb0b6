//! Sources of scheduler ticks.

use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::{
    sync::mpsc,
    time::{Instant, Interval, MissedTickBehavior},
};

pub trait Ticker: Send + 'static {
    /// Resolves at the next tick.
    fn tick(&mut self) -> BoxFuture<'_, ()>;

    /// Fixed spacing between ticks, if there is one.
    fn period(&self) -> Option<Duration> {
        None
    }
}

/// Fires every `period`, first one `period` after creation.
///
/// Fires missed while the runtime was busy are dropped, not replayed.
pub struct IntervalTicker {
    interval: Interval,
}

impl IntervalTicker {
    /// Must be called from within a tokio runtime.
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { interval }
    }
}

impl Ticker for IntervalTicker {
    fn tick(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.interval.tick().await;
        })
    }

    fn period(&self) -> Option<Duration> {
        Some(self.interval.period())
    }
}

/// Ticks only when its [`TickTrigger`] says so.
pub struct ManualTicker {
    rx: mpsc::UnboundedReceiver<()>,
}

#[derive(Clone)]
pub struct TickTrigger {
    tx: mpsc::UnboundedSender<()>,
}

impl TickTrigger {
    pub fn fire(&self) {
        // The ticker is gone once the scheduler has stopped; nothing to wake.
        let _ = self.tx.send(());
    }
}

pub fn manual() -> (TickTrigger, ManualTicker) {
    let (tx, rx) = mpsc::unbounded_channel();
    (TickTrigger { tx }, ManualTicker { rx })
}

impl Ticker for ManualTicker {
    fn tick(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.rx.recv().await.is_none() {
                std::future::pending::<()>().await;
            }
        })
    }
}

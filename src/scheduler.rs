//! Background retry loop.
//!
//! On every tick the scheduler asks the store for `failed` messages that are
//! due, leases them one at a time, hands each to the delivery gateway under a
//! per-attempt timeout and records the outcome. Ticks never overlap: a fire
//! that arrives while a batch is still running is logged and dropped.
//!
//! Failures stay contained. One message's gateway error never stops the rest
//! of the batch; a store error aborts only the current tick, and the next tick
//! starts again from whatever the store says.

use std::{
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use futures_util::FutureExt as _;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{Mutex, RwLock},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    clock::{Clock, SystemClock},
    config::Config,
    error::Error,
    gateway::{DeliveryError, DeliveryGateway},
    message::{Message, MessageId, MessageStatus},
    policy::BackoffPolicy,
    store::{Lease, MessageStore},
    ticker::{IntervalTicker, Ticker},
};

/// Read-only snapshot of scheduler health.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub running: bool,
    pub interval_minutes: u64,
    pub max_retries: u32,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub ticks_run: u64,
    pub ticks_skipped: u64,
}

/// What one tick did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    pub selected: usize,
    pub delivered: usize,
    pub failed: usize,
    pub escalated: usize,
    /// Messages another path got to first
    pub skipped: usize,
}

pub struct Scheduler {
    inner: Arc<Inner>,
    running: Mutex<Option<Running>>,
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    store: Arc<dyn MessageStore>,
    gateway: Arc<dyn DeliveryGateway>,
    clock: Arc<dyn Clock>,
    config: Config,
    policy: BackoffPolicy,

    running: AtomicBool,
    ticking: AtomicBool,
    ticks_run: AtomicU64,
    ticks_skipped: AtomicU64,
    next_run_at: RwLock<Option<DateTime<Utc>>>,
    last_run_at: RwLock<Option<DateTime<Utc>>>,
}

/// Held for the duration of a tick; clears the overlap flag on drop.
struct TickGuard {
    inner: Arc<Inner>,
}

impl Drop for TickGuard {
    fn drop(&mut self) {
        self.inner.ticking.store(false, Ordering::Release);
    }
}

#[bon::bon]
impl Scheduler {
    #[builder]
    pub fn new(
        store: Arc<dyn MessageStore>,
        gateway: Arc<dyn DeliveryGateway>,
        config: Config,
        #[builder(default = Arc::new(SystemClock) as Arc<dyn Clock>)] clock: Arc<dyn Clock>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let policy = config.backoff_policy()?;

        Ok(Self {
            inner: Arc::new(Inner {
                store,
                gateway,
                clock,
                config,
                policy,
                running: AtomicBool::new(false),
                ticking: AtomicBool::new(false),
                ticks_run: AtomicU64::new(0),
                ticks_skipped: AtomicU64::new(0),
                next_run_at: RwLock::new(None),
                last_run_at: RwLock::new(None),
            }),
            running: Mutex::new(None),
        })
    }
}

impl Scheduler {
    /// Starts the background loop on the configured interval.
    pub async fn start(&self) -> Result<(), Error> {
        self.start_with(IntervalTicker::new(self.inner.config.interval()))
            .await
    }

    /// Starts the background loop driven by `ticker`.
    pub async fn start_with(&self, ticker: impl Ticker) -> Result<(), Error> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(Error::AlreadyRunning);
        }

        let cancel = CancellationToken::new();
        let period = ticker.period();
        self.inner.running.store(true, Ordering::Release);
        self.inner.schedule_next_run(period).await;

        let handle = tokio::spawn(run_loop(
            self.inner.clone(),
            Box::new(ticker),
            period,
            cancel.clone(),
        ));
        *running = Some(Running { cancel, handle });

        tracing::info!(
            interval_minutes = self.inner.config.interval_minutes(),
            batch_size = self.inner.config.batch_size(),
            "retry scheduler started"
        );

        Ok(())
    }

    /// Stops the loop, letting a tick that is already running finish its batch.
    ///
    /// Does nothing if the scheduler isn't running.
    pub async fn stop(&self) {
        let Some(Running { cancel, handle }) = self.running.lock().await.take() else {
            return;
        };

        cancel.cancel();
        if let Err(e) = handle.await {
            tracing::error!("Retry scheduler loop ended abnormally: {e}");
        }

        self.inner.running.store(false, Ordering::Release);
        *self.inner.next_run_at.write().await = None;

        tracing::info!("retry scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Runs one tick now, outside the timer.
    ///
    /// Returns `Ok(None)` without doing anything if a tick is already in progress.
    pub async fn tick(&self) -> Result<Option<TickReport>, Error> {
        let Some(_guard) = self.inner.begin_tick() else {
            return Ok(None);
        };

        self.inner.run_tick().await.map(Some)
    }

    /// Makes an attempt on one message right away, through the same lease and
    /// timeout as a scheduled attempt. This is how a `pending` message gets its
    /// first try.
    pub async fn deliver(&self, id: MessageId) -> Result<Message, Error> {
        let lease = self.inner.store.try_acquire(id).await?.ok_or_else(|| {
            Error::conflict(format!("message {id} is not available for delivery"))
        })?;

        self.inner.attempt(&lease).await
    }

    pub async fn status(&self) -> SchedulerStatus {
        let inner = &self.inner;

        SchedulerStatus {
            running: self.is_running(),
            interval_minutes: inner.config.interval_minutes(),
            max_retries: inner.config.max_retries(),
            next_run_at: *inner.next_run_at.read().await,
            last_run_at: *inner.last_run_at.read().await,
            ticks_run: inner.ticks_run.load(Ordering::Relaxed),
            ticks_skipped: inner.ticks_skipped.load(Ordering::Relaxed),
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.inner.policy
    }
}

async fn run_loop(
    inner: Arc<Inner>,
    mut ticker: Box<dyn Ticker>,
    period: Option<Duration>,
    cancel: CancellationToken,
) {
    let mut in_flight: Option<JoinHandle<()>> = None;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        inner.schedule_next_run(period).await;

        let Some(guard) = inner.begin_tick() else {
            inner.ticks_skipped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("previous tick still in progress, skipping this one");
            continue;
        };

        let tick_inner = inner.clone();
        in_flight = Some(tokio::spawn(async move {
            let _guard = guard;
            // Errors are logged inside; the loop carries on regardless.
            let _ = tick_inner.run_tick().await;
        }));
    }

    if let Some(handle) = in_flight {
        if let Err(e) = handle.await {
            tracing::error!("Tick task ended abnormally: {e}");
        }
    }
}

enum Outcome {
    Delivered,
    Failed,
    Escalated,
}

impl Inner {
    fn begin_tick(self: &Arc<Self>) -> Option<TickGuard> {
        self.ticking
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| TickGuard {
                inner: self.clone(),
            })
    }

    /// Tickers without a fixed period have no predictable next run.
    async fn schedule_next_run(&self, period: Option<Duration>) {
        let next = period
            .and_then(|period| TimeDelta::from_std(period).ok())
            .and_then(|period| self.clock.now().checked_add_signed(period));
        *self.next_run_at.write().await = next;
    }

    async fn run_tick(&self) -> Result<TickReport, Error> {
        let now = self.clock.now();
        self.ticks_run.fetch_add(1, Ordering::Relaxed);
        *self.last_run_at.write().await = Some(now);

        match self.process_batch(now).await {
            Ok(report) => {
                tracing::info!(
                    selected = report.selected,
                    delivered = report.delivered,
                    failed = report.failed,
                    escalated = report.escalated,
                    skipped = report.skipped,
                    "retry tick finished"
                );
                Ok(report)
            }
            Err(e) => {
                tracing::error!(error = ?e, "retry tick aborted: {e}");
                Err(e)
            }
        }
    }

    async fn process_batch(&self, now: DateTime<Utc>) -> Result<TickReport, Error> {
        let batch = self
            .store
            .select_eligible_failed(now, self.config.batch_size())
            .await?;

        let mut report = TickReport {
            selected: batch.len(),
            ..Default::default()
        };

        for message in batch {
            let Some(lease) = self.store.try_acquire(message.id).await? else {
                tracing::debug!(id = %message.id, "message no longer available, skipping");
                report.skipped += 1;
                continue;
            };

            match self.attempt(&lease).await.map(|m| outcome_of(&m)) {
                Ok(Outcome::Delivered) => report.delivered += 1,
                Ok(Outcome::Failed) => report.failed += 1,
                Ok(Outcome::Escalated) => report.escalated += 1,
                Err(e) if e.is_per_message() => {
                    tracing::warn!(id = %message.id, "could not record attempt: {e}");
                    report.skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(report)
    }

    /// One delivery attempt under `lease`, recorded in the store.
    async fn attempt(&self, lease: &Lease) -> Result<Message, Error> {
        let message = lease.message();

        // Already at the ceiling: escalate instead of sending.
        if message.status == MessageStatus::Failed && self.policy.should_escalate(message) {
            let escalated = self
                .store
                .record_failure(lease, "retry ceiling reached")
                .await?;
            log_outcome(&escalated);
            return Ok(escalated);
        }

        let timeout = self.config.attempt_timeout();
        // Built inside the guard so a gateway panicking before it returns its
        // future is contained too.
        let send = AssertUnwindSafe(async { self.gateway.send(message).await }).catch_unwind();

        let result = match tokio::time::timeout(timeout, send).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DeliveryError::Panicked),
            Err(_) => Err(DeliveryError::TimedOut { timeout }),
        };

        let updated = match result {
            Ok(()) => self.store.record_success(lease).await?,
            Err(e) => self.store.record_failure(lease, &e.to_string()).await?,
        };
        log_outcome(&updated);

        Ok(updated)
    }
}

fn outcome_of(message: &Message) -> Outcome {
    match message.status {
        MessageStatus::Sent => Outcome::Delivered,
        MessageStatus::Escalated => Outcome::Escalated,
        _ => Outcome::Failed,
    }
}

fn log_outcome(message: &Message) {
    match message.status {
        MessageStatus::Sent => {
            tracing::debug!(id = %message.id, retry_count = message.retry_count, "message delivered")
        }
        MessageStatus::Escalated => tracing::warn!(
            id = %message.id,
            retry_count = message.retry_count,
            last_error = message.last_error.as_deref(),
            "retries exhausted, message escalated"
        ),
        _ => tracing::debug!(
            id = %message.id,
            retry_count = message.retry_count,
            next_eligible_at = ?message.next_eligible_at,
            last_error = message.last_error.as_deref(),
            "delivery failed, will retry"
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{atomic::AtomicUsize, Mutex as StdMutex},
    };

    use chrono::TimeZone;
    use futures_util::future::{self, BoxFuture};
    use tokio::sync::Notify;

    use super::*;
    use crate::{
        clock::ManualClock,
        message::{MessageKind, NewMessage, Payload},
        store::{memory::MemoryStore, StoreFuture},
        ticker,
    };

    /// Plays back a fixed list of results, then keeps failing.
    #[derive(Default)]
    struct ScriptedGateway {
        script: StdMutex<VecDeque<Result<(), String>>>,
        sends: AtomicUsize,
    }

    impl ScriptedGateway {
        fn with(results: impl IntoIterator<Item = Result<(), &'static str>>) -> Self {
            Self {
                script: StdMutex::new(
                    results
                        .into_iter()
                        .map(|r| r.map_err(str::to_owned))
                        .collect(),
                ),
                sends: AtomicUsize::new(0),
            }
        }

        fn sends(&self) -> usize {
            self.sends.load(Ordering::SeqCst)
        }
    }

    impl DeliveryGateway for ScriptedGateway {
        fn send<'a>(&'a self, _: &'a Message) -> BoxFuture<'a, Result<(), DeliveryError>> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            let next = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err("unreachable".to_owned()));
            Box::pin(async move { next.map_err(DeliveryError::failed) })
        }
    }

    /// Blocks inside `send` until released.
    #[derive(Default)]
    struct GatedGateway {
        entered: Notify,
        release: Notify,
    }

    impl DeliveryGateway for GatedGateway {
        fn send<'a>(&'a self, _: &'a Message) -> BoxFuture<'a, Result<(), DeliveryError>> {
            Box::pin(async move {
                self.entered.notify_one();
                self.release.notified().await;
                Ok(())
            })
        }
    }

    /// Takes `delay` of tokio time per send.
    struct SlowGateway {
        delay: Duration,
        sends: AtomicUsize,
    }

    impl DeliveryGateway for SlowGateway {
        fn send<'a>(&'a self, _: &'a Message) -> BoxFuture<'a, Result<(), DeliveryError>> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                tokio::time::sleep(self.delay).await;
                Ok(())
            })
        }
    }

    struct PanickingGateway;

    impl DeliveryGateway for PanickingGateway {
        fn send<'a>(&'a self, _: &'a Message) -> BoxFuture<'a, Result<(), DeliveryError>> {
            Box::pin(future::lazy(|_| -> Result<(), DeliveryError> {
                panic!("provider client bug")
            }))
        }
    }

    /// Panics in `send` itself, before handing back a future.
    struct EagerPanicGateway;

    impl DeliveryGateway for EagerPanicGateway {
        fn send<'a>(&'a self, _: &'a Message) -> BoxFuture<'a, Result<(), DeliveryError>> {
            panic!("client not initialised")
        }
    }

    /// Wraps a store and fails the batch query for the first `outages` calls.
    struct FlakyStore {
        inner: Arc<MemoryStore>,
        outages: AtomicUsize,
    }

    impl FlakyStore {
        fn new(inner: Arc<MemoryStore>, outages: usize) -> Self {
            Self {
                inner,
                outages: AtomicUsize::new(outages),
            }
        }
    }

    impl MessageStore for FlakyStore {
        fn insert(&self, new: NewMessage) -> StoreFuture<'_, Message> {
            self.inner.insert(new)
        }

        fn get(&self, id: MessageId) -> StoreFuture<'_, Option<Message>> {
            self.inner.get(id)
        }

        fn list(&self, status: Option<MessageStatus>, limit: u32) -> StoreFuture<'_, Vec<Message>> {
            self.inner.list(status, limit)
        }

        fn select_eligible_failed(
            &self,
            now: DateTime<Utc>,
            limit: u32,
        ) -> StoreFuture<'_, Vec<Message>> {
            let down = self
                .outages
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if down {
                let outage: Error = sqlx::Error::PoolTimedOut.into();
                return Box::pin(future::ready(Err::<Vec<Message>, _>(outage)));
            }
            self.inner.select_eligible_failed(now, limit)
        }

        fn try_acquire(&self, id: MessageId) -> StoreFuture<'_, Option<Lease>> {
            self.inner.try_acquire(id)
        }

        fn record_success<'a>(&'a self, lease: &'a Lease) -> StoreFuture<'a, Message> {
            self.inner.record_success(lease)
        }

        fn record_failure<'a>(
            &'a self,
            lease: &'a Lease,
            error: &'a str,
        ) -> StoreFuture<'a, Message> {
            self.inner.record_failure(lease, error)
        }

        fn force_retry(&self, id: MessageId) -> StoreFuture<'_, Message> {
            self.inner.force_retry(id)
        }

        fn reject(&self, id: MessageId) -> StoreFuture<'_, Message> {
            self.inner.reject(id)
        }
    }

    /// Waits until a tick newer than `before` has started and finished.
    async fn settle(scheduler: &Scheduler, before: u64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while scheduler.inner.ticks_run.load(Ordering::SeqCst) <= before
                || scheduler.inner.ticking.load(Ordering::SeqCst)
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    struct Harness {
        store: Arc<MemoryStore>,
        clock: ManualClock,
        scheduler: Scheduler,
    }

    fn harness(gateway: Arc<dyn DeliveryGateway>, config: Config) -> Harness {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 7, 1, 10, 0, 0).unwrap());
        let store = Arc::new(MemoryStore::new(
            config.backoff_policy().unwrap(),
            config.lease_delta().unwrap(),
            Arc::new(clock.clone()),
        ));
        let scheduler = Scheduler::builder()
            .store(store.clone())
            .gateway(gateway)
            .config(config)
            .clock(Arc::new(clock.clone()))
            .build()
            .unwrap();

        Harness {
            store,
            clock,
            scheduler,
        }
    }

    fn notice() -> NewMessage {
        NewMessage::new(
            MessageKind::Internal,
            Payload {
                recipient: "ops@example.com".to_owned(),
                subject: Some("Escalation digest".to_owned()),
                body: "3 tickets waiting".to_owned(),
            },
        )
    }

    #[tokio::test]
    async fn test_happy_path() {
        let gateway = Arc::new(ScriptedGateway::with([Err("421 try later"), Ok(())]));
        let h = harness(gateway.clone(), Config::default());
        let t0 = h.clock.now();

        let message = h.store.insert(notice()).await.unwrap();
        let first = h.scheduler.deliver(message.id).await.unwrap();
        assert_eq!(first.status, MessageStatus::Failed);
        assert_eq!(first.next_eligible_at, Some(t0 + TimeDelta::minutes(15)));

        // Not due yet.
        h.clock.advance(TimeDelta::minutes(10));
        assert_eq!(h.scheduler.tick().await.unwrap().unwrap().selected, 0);

        h.clock.advance(TimeDelta::minutes(5));
        let report = h.scheduler.tick().await.unwrap().unwrap();
        assert_eq!(report.delivered, 1);

        let sent = h.store.get(message.id).await.unwrap().unwrap();
        assert_eq!(sent.status, MessageStatus::Sent);
        assert_eq!(sent.retry_count, 1);
        assert_eq!(gateway.sends(), 2);
    }

    #[tokio::test]
    async fn test_escalates_after_ceiling() {
        let gateway = Arc::new(ScriptedGateway::default());
        let h = harness(gateway.clone(), Config::default());
        let t0 = h.clock.now();

        let message = h.store.insert(notice()).await.unwrap();
        h.scheduler.deliver(message.id).await.unwrap();

        let mut previous = None;
        for n in 1..=20 {
            h.clock.set(t0 + TimeDelta::minutes(15 * n));
            h.scheduler.tick().await.unwrap();

            let current = h.store.get(message.id).await.unwrap().unwrap();
            assert!(current.retry_count <= current.max_retries);
            assert!(current.next_eligible_at >= previous);
            previous = current.next_eligible_at;
        }

        let escalated = h.store.get(message.id).await.unwrap().unwrap();
        assert_eq!(escalated.status, MessageStatus::Escalated);
        assert_eq!(escalated.retry_count, 10);
        // One first attempt plus nine scheduled ones, nothing after escalation.
        assert_eq!(gateway.sends(), 10);
    }

    #[tokio::test]
    async fn test_one_failure_does_not_stop_the_batch() {
        let gateway = Arc::new(ScriptedGateway::with([
            Err("down"),
            Err("down"),
            Err("still down"),
            Ok(()),
        ]));
        let h = harness(gateway.clone(), Config::default());

        let a = h.store.insert(notice()).await.unwrap();
        let b = h.store.insert(notice()).await.unwrap();
        h.scheduler.deliver(a.id).await.unwrap();
        h.scheduler.deliver(b.id).await.unwrap();

        h.clock.advance(TimeDelta::minutes(15));
        let report = h.scheduler.tick().await.unwrap().unwrap();

        assert_eq!(
            report,
            TickReport {
                selected: 2,
                delivered: 1,
                failed: 1,
                escalated: 0,
                skipped: 0,
            }
        );
    }

    #[tokio::test]
    async fn test_panicking_gateway_counts_as_failure() {
        let h = harness(Arc::new(PanickingGateway), Config::default());
        let message = h.store.insert(notice()).await.unwrap();

        let failed = h.scheduler.deliver(message.id).await.unwrap();

        assert_eq!(failed.status, MessageStatus::Failed);
        assert_eq!(failed.last_error.as_deref(), Some("delivery gateway panicked"));
    }

    #[tokio::test]
    async fn test_eager_panic_is_contained() {
        let h = harness(Arc::new(EagerPanicGateway), Config::default());
        let message = h.store.insert(notice()).await.unwrap();

        let failed = h.scheduler.deliver(message.id).await.unwrap();

        assert_eq!(failed.status, MessageStatus::Failed);
        assert_eq!(failed.last_error.as_deref(), Some("delivery gateway panicked"));
        assert!(!failed.is_leased(h.clock.now()));
    }

    #[tokio::test]
    async fn test_survives_store_outage() {
        let gateway = Arc::new(ScriptedGateway::with([Err("down"), Ok(())]));
        let h = harness(gateway.clone(), Config::default());
        let message = h.store.insert(notice()).await.unwrap();
        h.scheduler.deliver(message.id).await.unwrap();
        h.clock.advance(TimeDelta::minutes(15));

        let scheduler = Scheduler::builder()
            .store(Arc::new(FlakyStore::new(h.store.clone(), 3)))
            .gateway(gateway.clone())
            .config(Config::default())
            .clock(Arc::new(h.clock.clone()))
            .build()
            .unwrap();

        assert!(matches!(scheduler.tick().await, Err(Error::Sqlx { .. })));

        let (trigger, ticker) = ticker::manual();
        scheduler.start_with(ticker).await.unwrap();
        for before in 1..4 {
            trigger.fire();
            settle(&scheduler, before).await;
        }

        let status = scheduler.status().await;
        assert!(status.running);
        assert_eq!(status.ticks_run, 4);
        assert_eq!(
            h.store.get(message.id).await.unwrap().unwrap().status,
            MessageStatus::Sent
        );
        assert_eq!(gateway.sends(), 2);

        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_gateway_times_out() {
        let gateway = Arc::new(GatedGateway::default());
        let config = Config {
            attempt_timeout_secs: Some(30),
            ..Default::default()
        };
        let h = harness(gateway, config);
        let message = h.store.insert(notice()).await.unwrap();

        let failed = h.scheduler.deliver(message.id).await.unwrap();

        assert_eq!(failed.status, MessageStatus::Failed);
        assert_eq!(
            failed.last_error.as_deref(),
            Some("delivery timed out after 30s")
        );
    }

    #[tokio::test]
    async fn test_manual_tick_refused_while_busy() {
        let gateway = Arc::new(GatedGateway::default());
        let h = harness(gateway.clone(), Config::default());
        let message = h.store.insert(notice()).await.unwrap();
        let lease = h.store.try_acquire(message.id).await.unwrap().unwrap();
        h.store.record_failure(&lease, "down").await.unwrap();
        h.clock.advance(TimeDelta::minutes(15));

        let scheduler = Arc::new(h.scheduler);
        let busy = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.tick().await }
        });
        gateway.entered.notified().await;

        assert_eq!(scheduler.tick().await.unwrap(), None);

        gateway.release.notify_one();
        let report = busy.await.unwrap().unwrap().unwrap();
        assert_eq!(report.delivered, 1);
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight_tick() {
        let gateway = Arc::new(GatedGateway::default());
        let h = harness(gateway.clone(), Config::default());
        let message = h.store.insert(notice()).await.unwrap();
        let lease = h.store.try_acquire(message.id).await.unwrap().unwrap();
        h.store.record_failure(&lease, "down").await.unwrap();
        h.clock.advance(TimeDelta::minutes(15));

        let (trigger, ticker) = ticker::manual();
        let scheduler = Arc::new(h.scheduler);
        scheduler.start_with(ticker).await.unwrap();
        let status = scheduler.status().await;
        assert!(status.running);
        // Only fires on demand, so there is nothing to predict.
        assert_eq!(status.next_run_at, None);

        trigger.fire();
        gateway.entered.notified().await;

        let stopping = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.stop().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!stopping.is_finished());

        gateway.release.notify_one();
        stopping.await.unwrap();

        let status = scheduler.status().await;
        assert!(!status.running);
        assert_eq!(status.next_run_at, None);
        assert_eq!(
            h.store.get(message.id).await.unwrap().unwrap().status,
            MessageStatus::Sent
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_ticks_are_skipped() {
        let gateway = Arc::new(SlowGateway {
            delay: Duration::from_secs(20 * 60),
            sends: AtomicUsize::new(0),
        });
        let config = Config {
            batch_size: Some(1),
            attempt_timeout_secs: Some(30 * 60),
            lease_timeout_secs: Some(60 * 60),
            ..Default::default()
        };
        let h = harness(gateway.clone(), config);

        let message = h.store.insert(notice()).await.unwrap();
        let lease = h.store.try_acquire(message.id).await.unwrap().unwrap();
        h.store.record_failure(&lease, "down").await.unwrap();
        h.clock.advance(TimeDelta::minutes(15));

        h.scheduler.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(60 * 60)).await;
        h.scheduler.stop().await;

        let status = h.scheduler.status().await;
        assert!(status.ticks_run < 4);
        assert!(status.ticks_skipped >= 1);
        assert_eq!(gateway.sends.load(Ordering::SeqCst), 1);
        assert_eq!(
            h.store.get(message.id).await.unwrap().unwrap().status,
            MessageStatus::Sent
        );
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let h = harness(Arc::new(ScriptedGateway::default()), Config::default());
        let (_trigger, second) = ticker::manual();

        h.scheduler.start().await.unwrap();
        assert!(matches!(
            h.scheduler.start_with(second).await,
            Err(Error::AlreadyRunning)
        ));

        let status = h.scheduler.status().await;
        assert_eq!(status.interval_minutes, 15);
        assert_eq!(status.max_retries, 10);
        assert_eq!(
            status.next_run_at,
            Some(h.clock.now() + TimeDelta::minutes(15))
        );

        h.scheduler.stop().await;
        assert!(!h.scheduler.is_running());
    }
}

//! Top-level polling loop.
//!
//! One task owns every piece of mutable state (price history, seen ids,
//! counters, scheduler flags). Each [`Monitor::step`] performs a single
//! transition of the state machine and returns how long to sleep before the
//! next one; [`Monitor::run`] drives steps until shutdown and then persists
//! the final snapshot.

use crate::engine::config::MonitorConfig;
use crate::engine::dedup::{PriceTracker, SaleVerdict};
use crate::engine::format::{format_sale, ValueTiers};
use crate::engine::market::{FetchError, MarketFeed};
use crate::engine::publisher::{ChatTransport, Publisher};
use crate::engine::rate_limit::{RateLimiter, Verdict, Window};
use crate::engine::scheduler::{CyclePhase, DispatchScheduler, SeenActions};
use crate::engine::snapshot::MonitorSnapshot;
use crate::engine::token::{TokenSource, TokenStatus, TokenStore};
use crate::engine::types::{parse_ts_utc, SaleEvent};
use chrono::{DateTime, Local, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorPhase {
    Starting,
    AcquiringToken,
    Polling,
    Waiting,
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Signal,
    TooManyFailures,
}

#[derive(Debug, Clone, Default)]
pub struct MonitorStats {
    pub cycles: u64,
    pub sent: u64,
    pub pinned: u64,
    pub duplicates: u64,
    pub price_changes: u64,
    pub throttled: u64,
    pub send_failures: u64,
    pub fetch_failures: u64,
}

pub struct Monitor {
    cfg: MonitorConfig,
    feed: Arc<dyn MarketFeed>,
    source: Arc<dyn TokenSource>,
    publisher: Publisher,
    tokens: TokenStore,
    tracker: PriceTracker,
    scheduler: DispatchScheduler,
    limiter: RateLimiter,
    tiers: ValueTiers,
    phase: MonitorPhase,
    consecutive_failures: u32,
    cycles_since_refresh: u64,
    force_refresh: bool,
    last_check_time: Option<DateTime<Utc>>,
    exit_reason: ExitReason,
    stats: MonitorStats,
    shutdown: watch::Receiver<bool>,
}

impl Monitor {
    pub fn new(
        cfg: MonitorConfig,
        feed: Arc<dyn MarketFeed>,
        transport: Arc<dyn ChatTransport>,
        source: Arc<dyn TokenSource>,
        chat_id: &str,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let today = Local::now().date_naive();
        let snap = MonitorSnapshot::load_or_default(&cfg.state_file, today);

        let limiter = RateLimiter::new(
            cfg.rate_limits,
            snap.daily_message_count,
            snap.reset_date().unwrap_or(today),
        );
        let last_check_time = snap.last_check_time.as_deref().and_then(parse_ts_utc);
        let seen = SeenActions::from_ordered(cfg.seen_actions_max, snap.seen_actions);
        if !seen.is_empty() {
            debug!(seen = seen.len(), "seen set restored");
        }
        let tracker = PriceTracker::from_records(cfg.dedup_settings(), snap.price_history);

        Self {
            publisher: Publisher::new(transport, chat_id, cfg.pin_threshold),
            tokens: TokenStore::new(&cfg.token_file, cfg.token_policy()),
            scheduler: DispatchScheduler::new(seen, cfg.bootstrap_batch_size),
            tiers: cfg.value_tiers(),
            tracker,
            limiter,
            feed,
            source,
            phase: MonitorPhase::Starting,
            consecutive_failures: 0,
            cycles_since_refresh: 0,
            force_refresh: false,
            last_check_time,
            exit_reason: ExitReason::Signal,
            stats: MonitorStats::default(),
            shutdown,
            cfg,
        }
    }

    pub fn phase(&self) -> MonitorPhase {
        self.phase
    }

    pub fn stats(&self) -> &MonitorStats {
        &self.stats
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn scheduler(&self) -> &DispatchScheduler {
        &self.scheduler
    }

    pub fn tracker(&self) -> &PriceTracker {
        &self.tracker
    }

    pub async fn run(mut self) -> ExitReason {
        info!(
            channel = %self.publisher.chat_id(),
            interval_secs = self.cfg.check_interval.as_secs_f64(),
            "gift sale monitor starting"
        );
        loop {
            if self.shutdown_requested() {
                info!("shutdown requested");
                break;
            }
            match self.step().await {
                Some(pause) => {
                    if !self.sleep_or_shutdown(pause).await {
                        info!("shutdown requested");
                        break;
                    }
                }
                None => break,
            }
        }

        self.phase = MonitorPhase::ShuttingDown;
        self.save_snapshot();
        self.publisher.close().await;
        info!(
            cycles = self.stats.cycles,
            sent = self.stats.sent,
            pinned = self.stats.pinned,
            duplicates = self.stats.duplicates,
            throttled = self.stats.throttled,
            "monitor stopped"
        );
        self.exit_reason
    }

    /// One state transition. `None` means the loop must stop.
    pub async fn step(&mut self) -> Option<Duration> {
        match self.phase {
            MonitorPhase::Starting => {
                self.phase = MonitorPhase::AcquiringToken;
                Some(Duration::ZERO)
            }
            MonitorPhase::AcquiringToken => self.acquire_token().await,
            MonitorPhase::Polling | MonitorPhase::Waiting => self.poll_once().await,
            MonitorPhase::ShuttingDown => None,
        }
    }

    async fn acquire_token(&mut self) -> Option<Duration> {
        let result = if self.force_refresh {
            self.force_refresh = false;
            self.cycles_since_refresh = 0;
            info!("periodic credential refresh");
            match self.tokens.refresh(self.source.as_ref()).await {
                Ok(()) => Ok(TokenStatus::Refreshed),
                Err(e) => {
                    warn!(err = %e, "periodic refresh failed, validating current credential");
                    self.tokens
                        .ensure_valid(self.feed.as_ref(), self.source.as_ref())
                        .await
                }
            }
        } else {
            self.tokens
                .ensure_valid(self.feed.as_ref(), self.source.as_ref())
                .await
        };

        match result {
            Ok(status) => {
                if status == TokenStatus::Refreshed {
                    self.cycles_since_refresh = 0;
                }
                info!(?status, "credential ready");
                self.phase = MonitorPhase::Polling;
                Some(Duration::ZERO)
            }
            Err(e) => {
                error!(err = %e, "could not obtain a credential");
                self.register_failure()?;
                Some(self.cfg.token_retry_delay)
            }
        }
    }

    async fn poll_once(&mut self) -> Option<Duration> {
        let Some(token) = self.tokens.get_current().map(str::to_string) else {
            self.phase = MonitorPhase::AcquiringToken;
            return Some(Duration::ZERO);
        };
        self.stats.cycles += 1;
        self.cycles_since_refresh += 1;

        let limit = self.cfg.fetch_limit;
        let events = match self.feed.fetch_latest(&token, limit).await {
            Ok(events) => events,
            Err(FetchError::TokenInvalid) => {
                warn!("credential rejected, refreshing before retry");
                self.tokens.invalidate();
                if let Err(e) = self
                    .tokens
                    .ensure_valid(self.feed.as_ref(), self.source.as_ref())
                    .await
                {
                    error!(err = %e, "credential refresh failed");
                    self.phase = MonitorPhase::AcquiringToken;
                    self.register_failure()?;
                    return Some(self.cfg.token_retry_delay);
                }
                let Some(fresh) = self.tokens.get_current().map(str::to_string) else {
                    self.phase = MonitorPhase::AcquiringToken;
                    return Some(self.cfg.token_retry_delay);
                };
                match self.feed.fetch_latest(&fresh, limit).await {
                    Ok(events) => events,
                    Err(FetchError::TokenInvalid) => {
                        error!("fresh credential rejected as well");
                        self.tokens.invalidate();
                        self.phase = MonitorPhase::AcquiringToken;
                        return self.fail_cycle();
                    }
                    Err(FetchError::Transient(e)) => {
                        error!(err = %e, "fetch failed after credential refresh");
                        return self.fail_cycle();
                    }
                }
            }
            Err(FetchError::Transient(e)) => {
                error!(err = %e, "fetch failed");
                return self.fail_cycle();
            }
        };

        self.consecutive_failures = 0;
        self.last_check_time = Some(Utc::now());
        if self.process_events(events).await {
            self.save_snapshot();
        }

        self.phase = if self.scheduler.is_waiting() {
            MonitorPhase::Waiting
        } else {
            MonitorPhase::Polling
        };
        let pause = self.cycle_interval();

        if self.cycles_since_refresh >= self.cfg.token_refresh_cycles {
            self.force_refresh = true;
            self.phase = MonitorPhase::AcquiringToken;
        } else if self.tokens.needs_refresh(Utc::now()) {
            info!("credential is getting old, revalidating");
            self.phase = MonitorPhase::AcquiringToken;
        }
        Some(pause)
    }

    fn cycle_interval(&self) -> Duration {
        if self.scheduler.is_waiting() {
            self.cfg.waiting_interval
        } else if !self.scheduler.initial_batch_sent() {
            self.cfg.bootstrap_interval
        } else {
            self.cfg.check_interval
        }
    }

    fn fail_cycle(&mut self) -> Option<Duration> {
        self.stats.fetch_failures += 1;
        self.register_failure()?;
        let backoff = self
            .cfg
            .error_backoff_unit
            .saturating_mul(self.consecutive_failures);
        Some(backoff.min(self.cfg.error_backoff_cap))
    }

    /// Counts a failed cycle; `None` once the failure ceiling is reached.
    fn register_failure(&mut self) -> Option<()> {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.cfg.max_consecutive_failures {
            error!(
                failures = self.consecutive_failures,
                "too many consecutive failures, shutting down"
            );
            self.exit_reason = ExitReason::TooManyFailures;
            self.phase = MonitorPhase::ShuttingDown;
            return None;
        }
        warn!(
            failures = self.consecutive_failures,
            max = self.cfg.max_consecutive_failures,
            "cycle failed"
        );
        Some(())
    }

    /// Returns true when dedup state changed and should be persisted.
    async fn process_events(&mut self, events: Vec<SaleEvent>) -> bool {
        let purged = self.tracker.purge(Utc::now());
        if purged > 0 {
            debug!(purged, "expired price records removed");
        }

        let plan = self.scheduler.plan(events);
        if plan.new_count == 0 {
            return purged > 0;
        }
        if plan.suppressed > 0 {
            debug!(suppressed = plan.suppressed, "sales marked seen without emitting");
        }

        let delay = match plan.phase {
            CyclePhase::Bootstrap => self.cfg.batch_delay,
            CyclePhase::Steady => self.cfg.message_delay,
        };
        for event in &plan.emit {
            if self.shutdown_requested() {
                break;
            }
            self.dispatch(event, delay).await;
        }
        true
    }

    async fn dispatch(&mut self, event: &SaleEvent, delay: Duration) {
        let verdict = self.tracker.classify(event);
        if verdict.is_duplicate() {
            self.stats.duplicates += 1;
            debug!(
                collectible = %event.collectible_id,
                name = %event.name,
                number = event.external_number,
                ?verdict,
                "duplicate sale skipped"
            );
            return;
        }
        if verdict == SaleVerdict::PriceChange {
            self.stats.price_changes += 1;
            let old = self.tracker.get(&event.collectible_id).map(|r| r.price);
            info!(
                collectible = %event.collectible_id,
                old = ?old,
                new = %event.amount,
                "price change detected"
            );
        }

        if !self.gate().await {
            self.stats.throttled += 1;
            return;
        }

        let body = format_sale(event, &self.tiers);
        self.limiter.record_attempt(Local::now());
        match self.publisher.send(&body).await {
            Ok(handle) => {
                self.stats.sent += 1;
                info!(
                    name = %event.name,
                    number = event.external_number,
                    amount = %event.amount,
                    message_id = handle.message_id,
                    "sale published"
                );
                if self.publisher.pin_if(&handle, event.amount).await {
                    self.stats.pinned += 1;
                }
            }
            Err(e) => {
                self.stats.send_failures += 1;
                error!(name = %event.name, err = %e, "failed to publish sale");
            }
        }
        self.tracker.record(event);
        self.sleep_or_shutdown(delay).await;
    }

    /// Consults the rate limiter, waiting out one short throttle at most.
    async fn gate(&mut self) -> bool {
        match self.limiter.check(Local::now()) {
            Verdict::Allowed => true,
            Verdict::Throttled {
                window: Window::Day,
                ..
            } => {
                warn!(
                    count = self.limiter.daily_count(),
                    "daily message cap reached, dropping sale"
                );
                false
            }
            Verdict::Throttled { window, wait } if wait <= self.cfg.emergency_cooldown => {
                warn!(?window, wait_secs = wait.as_secs_f64(), "rate limited, waiting");
                if !self.sleep_or_shutdown(wait).await {
                    return false;
                }
                self.limiter.allow(Local::now())
            }
            Verdict::Throttled { window, wait } => {
                warn!(?window, wait_secs = wait.as_secs_f64(), "rate limited, dropping sale");
                false
            }
        }
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Sleeps unless shutdown is signalled first; returns false on shutdown.
    async fn sleep_or_shutdown(&self, pause: Duration) -> bool {
        if self.shutdown_requested() {
            return false;
        }
        if pause.is_zero() {
            return true;
        }
        let mut rx = self.shutdown.clone();
        tokio::select! {
            _ = tokio::time::sleep(pause) => true,
            stopped = async { rx.wait_for(|stop| *stop).await.is_ok() } => {
                if !stopped {
                    // sender gone: no shutdown can arrive any more
                    tokio::time::sleep(pause).await;
                }
                !stopped
            }
        }
    }

    fn snapshot(&self) -> MonitorSnapshot {
        MonitorSnapshot {
            seen_actions: self.scheduler.seen().iter().cloned().collect(),
            price_history: self.tracker.records().clone(),
            last_check_time: self.last_check_time.map(|t| t.to_rfc3339()),
            daily_message_count: self.limiter.daily_count(),
            last_daily_reset: Some(self.limiter.last_reset().format("%Y-%m-%d").to_string()),
        }
    }

    fn save_snapshot(&self) {
        match self.snapshot().save(&self.cfg.state_file) {
            Ok(()) => debug!("state saved"),
            Err(e) => error!(err = %format!("{e:#}"), "failed to save state"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::publisher::{MessageHandle, PublishError, SendOutcome};
    use crate::engine::token::TokenError;
    use rust_decimal::Decimal;
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeFeed {
        pages: Mutex<VecDeque<Result<Vec<SaleEvent>, FetchError>>>,
        tokens_used: Mutex<Vec<String>>,
    }

    impl FakeFeed {
        fn push(&self, page: Result<Vec<SaleEvent>, FetchError>) {
            self.pages.lock().unwrap().push_back(page);
        }
    }

    #[async_trait::async_trait]
    impl MarketFeed for FakeFeed {
        async fn fetch_latest(&self, token: &str, _: usize) -> Result<Vec<SaleEvent>, FetchError> {
            self.tokens_used.lock().unwrap().push(token.to_string());
            self.pages.lock().unwrap().pop_front().unwrap_or(Ok(vec![]))
        }
        async fn probe(&self, _: &str) -> Result<(), FetchError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeChat {
        sent: Mutex<Vec<String>>,
        pins: Mutex<Vec<i64>>,
        pin_fails: bool,
        /// Answered once with `retry_after` before the first delivery.
        retry_after: Mutex<Option<Duration>>,
        attempts: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ChatTransport for FakeChat {
        async fn send_message(&self, chat_id: &str, body: &str) -> Result<SendOutcome, PublishError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if let Some(wait) = self.retry_after.lock().unwrap().take() {
                return Ok(SendOutcome::RetryAfter(wait));
            }
            let mut sent = self.sent.lock().unwrap();
            sent.push(body.to_string());
            Ok(SendOutcome::Sent(MessageHandle {
                chat_id: chat_id.to_string(),
                message_id: sent.len() as i64,
            }))
        }
        async fn pin_chat_message(&self, _: &str, message_id: i64) -> Result<(), PublishError> {
            self.pins.lock().unwrap().push(message_id);
            if self.pin_fails {
                return Err(PublishError::Api {
                    code: 400,
                    description: "not enough rights to pin".into(),
                });
            }
            Ok(())
        }
        async fn close(&self) {}
    }

    #[derive(Default)]
    struct FakeSource {
        tokens: Mutex<VecDeque<String>>,
    }

    #[async_trait::async_trait]
    impl TokenSource for FakeSource {
        async fn acquire(&self, timeout: Duration) -> Result<String, TokenError> {
            self.tokens
                .lock()
                .unwrap()
                .pop_front()
                .ok_or(TokenError::Timeout(timeout))
        }
    }

    struct Harness {
        monitor: Monitor,
        feed: Arc<FakeFeed>,
        chat: Arc<FakeChat>,
        source: Arc<FakeSource>,
        token_file: PathBuf,
        base: DateTime<Utc>,
        stop: watch::Sender<bool>,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        fn new(tweak: impl FnOnce(&mut MonitorConfig), chat: FakeChat) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let mut cfg = MonitorConfig::default();
            cfg.state_file = dir.path().join("monitor_state.json");
            cfg.token_file = dir.path().join("auth_token.txt");
            cfg.message_delay = Duration::ZERO;
            cfg.batch_delay = Duration::ZERO;
            cfg.error_backoff_unit = Duration::ZERO;
            cfg.token_retry_delay = Duration::ZERO;
            cfg.max_consecutive_failures = 3;
            tweak(&mut cfg);
            std::fs::write(&cfg.token_file, "tma query_id=initial").unwrap();
            let token_file = cfg.token_file.clone();

            let feed = Arc::new(FakeFeed::default());
            let chat = Arc::new(chat);
            let source = Arc::new(FakeSource::default());
            let (tx, rx) = watch::channel(false);
            let monitor = Monitor::new(
                cfg,
                feed.clone(),
                chat.clone(),
                source.clone(),
                "@gifts",
                rx,
            );
            let base = DateTime::<Utc>::from_timestamp(Utc::now().timestamp() - 3600, 0).unwrap();
            Self {
                monitor,
                feed,
                chat,
                source,
                token_file,
                base,
                stop: tx,
                _dir: dir,
            }
        }

        fn at(&self, offset_secs: i64) -> String {
            (self.base + chrono::Duration::seconds(offset_secs))
                .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
        }

        fn sale(&self, id: &str, amount: &str, offset_secs: i64) -> SaleEvent {
            let amount = Decimal::from_str(amount).unwrap();
            let created_at = self.at(offset_secs);
            SaleEvent {
                action_id: SaleEvent::synth_action_id(id, &created_at, &amount),
                collectible_id: id.to_string(),
                name: format!("Gift {id}"),
                external_number: 1,
                amount,
                floor_price: Decimal::from(5),
                created_at,
                attributes: vec![],
            }
        }

        fn history(&self) -> Vec<SaleEvent> {
            (0..7)
                .map(|i| self.sale(&format!("g{i}"), "10.0", -60 * i))
                .collect()
        }

        async fn start(&mut self) {
            assert_eq!(self.monitor.step().await, Some(Duration::ZERO));
            assert_eq!(self.monitor.step().await, Some(Duration::ZERO));
            assert_eq!(self.monitor.phase(), MonitorPhase::Polling);
        }

        fn sent(&self) -> usize {
            self.chat.sent.lock().unwrap().len()
        }
    }

    fn quiet() -> FakeChat {
        FakeChat::default()
    }

    #[tokio::test]
    async fn cold_start_then_steady_then_waiting() {
        let mut h = Harness::new(|_| {}, quiet());
        h.start().await;

        h.feed.push(Ok(h.history()));
        let pause = h.monitor.step().await;
        assert_eq!(pause, Some(Duration::from_secs(5)));
        assert_eq!(h.sent(), 5);
        assert!(h.chat.sent.lock().unwrap()[0].contains("Gift g0"));
        assert_eq!(h.monitor.scheduler().seen().len(), 7);
        assert_eq!(
            h.monitor.scheduler().last_emitted_ts(),
            Some(h.base)
        );

        let mut page = vec![h.sale("fresh", "11.0", 30)];
        page.extend(h.history());
        h.feed.push(Ok(page));
        h.monitor.step().await;
        assert_eq!(h.sent(), 6);
        assert!(h.chat.sent.lock().unwrap()[5].contains("Gift fresh"));

        h.feed.push(Ok(vec![h.sale("fresh", "11.0", 30)]));
        let pause = h.monitor.step().await;
        assert_eq!(h.sent(), 6);
        assert_eq!(h.monitor.phase(), MonitorPhase::Waiting);
        assert_eq!(pause, Some(Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn price_change_is_published_and_recorded() {
        let mut h = Harness::new(|_| {}, quiet());
        h.start().await;
        h.feed.push(Ok(vec![h.sale("c1", "10.0", 0)]));
        h.monitor.step().await;
        assert_eq!(h.sent(), 1);

        h.feed.push(Ok(vec![h.sale("c1", "12.5", 60)]));
        h.monitor.step().await;
        assert_eq!(h.sent(), 2);
        assert_eq!(h.monitor.stats().price_changes, 1);
        assert_eq!(
            h.monitor.tracker().get("c1").unwrap().price,
            Decimal::from_str("12.5").unwrap()
        );
    }

    #[tokio::test]
    async fn reissued_sale_under_new_id_is_suppressed() {
        let mut h = Harness::new(|_| {}, quiet());
        h.start().await;

        let mut original = h.sale("c1", "10.000", 0);
        original.name = "Plush Pepe".into();
        original.external_number = 42;
        h.feed.push(Ok(vec![original]));
        h.monitor.step().await;
        assert_eq!(h.sent(), 1);

        let mut reissue = h.sale("c2", "10.001", 90);
        reissue.name = "Plush Pepe".into();
        reissue.external_number = 42;
        h.feed.push(Ok(vec![reissue]));
        h.monitor.step().await;
        assert_eq!(h.sent(), 1);
        assert_eq!(h.monitor.stats().duplicates, 1);
    }

    #[tokio::test]
    async fn rejected_token_is_rotated_within_the_cycle() {
        let mut h = Harness::new(|_| {}, quiet());
        h.start().await;
        h.source
            .tokens
            .lock()
            .unwrap()
            .push_back("query_id=rotated".into());

        h.feed.push(Err(FetchError::TokenInvalid));
        h.feed.push(Ok(vec![h.sale("c1", "10.0", 0)]));
        h.monitor.step().await;

        assert_eq!(h.sent(), 1);
        assert_eq!(h.monitor.consecutive_failures(), 0);
        assert_eq!(h.monitor.phase(), MonitorPhase::Polling);
        let used = h.feed.tokens_used.lock().unwrap().clone();
        assert_eq!(used, ["tma query_id=initial", "tma query_id=rotated"]);
    }

    #[tokio::test]
    async fn big_sale_is_pinned_and_pin_failure_is_harmless() {
        let mut h = Harness::new(
            |_| {},
            FakeChat {
                pin_fails: true,
                ..FakeChat::default()
            },
        );
        h.start().await;
        h.feed.push(Ok(vec![h.sale("whale", "150.0", 0)]));
        h.monitor.step().await;

        assert_eq!(h.sent(), 1);
        assert_eq!(*h.chat.pins.lock().unwrap(), vec![1]);
        assert_eq!(h.monitor.stats().pinned, 0);
        assert_eq!(h.monitor.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn throttled_messages_are_dropped_beyond_cooldown() {
        let mut h = Harness::new(
            |cfg| {
                cfg.rate_limits.per_minute = 2;
                cfg.emergency_cooldown = Duration::ZERO;
            },
            quiet(),
        );
        h.start().await;
        h.feed.push(Ok(h.history()));
        h.monitor.step().await;

        assert_eq!(h.sent(), 2);
        assert_eq!(h.monitor.stats().throttled, 3);
    }

    #[tokio::test]
    async fn repeated_transient_failures_stop_the_monitor() {
        let mut h = Harness::new(|_| {}, quiet());
        h.start().await;
        for _ in 0..3 {
            h.feed.push(Err(FetchError::Transient("status 502".into())));
        }
        assert!(h.monitor.step().await.is_some());
        assert!(h.monitor.step().await.is_some());
        assert_eq!(h.monitor.consecutive_failures(), 2);
        assert_eq!(h.monitor.step().await, None);
        assert_eq!(h.monitor.phase(), MonitorPhase::ShuttingDown);
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let mut h = Harness::new(|_| {}, quiet());
        h.start().await;
        h.feed.push(Err(FetchError::Transient("timeout".into())));
        h.monitor.step().await;
        assert_eq!(h.monitor.consecutive_failures(), 1);
        h.monitor.step().await;
        assert_eq!(h.monitor.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn periodic_ceiling_forces_refresh() {
        let mut h = Harness::new(|cfg| cfg.token_refresh_cycles = 1, quiet());
        h.start().await;
        h.source
            .tokens
            .lock()
            .unwrap()
            .push_back("tma query_id=periodic".into());

        h.monitor.step().await;
        assert_eq!(h.monitor.phase(), MonitorPhase::AcquiringToken);
        h.monitor.step().await;
        assert_eq!(h.monitor.phase(), MonitorPhase::Polling);
        h.monitor.step().await;
        let used = h.feed.tokens_used.lock().unwrap().clone();
        assert_eq!(used.last().map(String::as_str), Some("tma query_id=periodic"));
    }

    #[tokio::test]
    async fn chat_retry_after_counts_once_against_rate_limits() {
        let chat = FakeChat {
            retry_after: Mutex::new(Some(Duration::from_millis(5))),
            ..FakeChat::default()
        };
        let mut h = Harness::new(|_| {}, chat);
        h.start().await;
        h.feed.push(Ok(vec![h.sale("c1", "10.0", 0)]));
        h.monitor.step().await;

        assert_eq!(h.chat.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(h.sent(), 1);
        assert_eq!(h.monitor.stats().sent, 1);
        assert_eq!(h.monitor.limiter.daily_count(), 1);
    }

    #[tokio::test]
    async fn aging_credential_sends_the_loop_back_to_acquisition() {
        let mut h = Harness::new(|_| {}, quiet());
        let old = std::time::SystemTime::now() - Duration::from_secs(70 * 60);
        std::fs::File::options()
            .write(true)
            .open(&h.token_file)
            .unwrap()
            .set_modified(old)
            .unwrap();

        // refresh fails, the old credential still passes validation
        h.start().await;
        h.feed.push(Ok(vec![h.sale("c1", "10.0", 0)]));
        h.monitor.step().await;
        assert_eq!(h.sent(), 1);
        assert_eq!(h.monitor.phase(), MonitorPhase::AcquiringToken);

        h.source
            .tokens
            .lock()
            .unwrap()
            .push_back("tma query_id=renewed".into());
        h.monitor.step().await;
        assert_eq!(h.monitor.phase(), MonitorPhase::Polling);
        h.monitor.step().await;
        let used = h.feed.tokens_used.lock().unwrap().clone();
        assert_eq!(used, ["tma query_id=initial", "tma query_id=renewed"]);
    }

    #[tokio::test]
    async fn unobtainable_credential_stops_the_monitor() {
        let h = Harness::new(|_| {}, quiet());
        std::fs::remove_file(&h.token_file).unwrap();

        let reason = tokio::time::timeout(Duration::from_secs(5), h.monitor.run())
            .await
            .unwrap();
        assert_eq!(reason, ExitReason::TooManyFailures);
        assert!(h.feed.tokens_used.lock().unwrap().is_empty());
        assert!(h.chat.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn last_check_time_survives_shutdown_before_first_poll() {
        let h = Harness::new(
            |cfg| {
                MonitorSnapshot {
                    last_check_time: Some("2024-06-01T12:00:05+00:00".into()),
                    ..MonitorSnapshot::default()
                }
                .save(&cfg.state_file)
                .unwrap();
            },
            quiet(),
        );
        let state_file = h.monitor.cfg.state_file.clone();
        h.stop.send(true).unwrap();
        assert_eq!(h.monitor.run().await, ExitReason::Signal);

        let snap = MonitorSnapshot::load_or_default(&state_file, Local::now().date_naive());
        assert_eq!(
            snap.last_check_time.as_deref().and_then(parse_ts_utc),
            parse_ts_utc("2024-06-01T12:00:05Z")
        );
    }

    #[tokio::test]
    async fn run_saves_snapshot_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = MonitorConfig::default();
        cfg.state_file = dir.path().join("monitor_state.json");
        cfg.token_file = dir.path().join("auth_token.txt");
        cfg.batch_delay = Duration::ZERO;
        std::fs::write(&cfg.token_file, "tma query_id=run").unwrap();

        let base = DateTime::<Utc>::from_timestamp(Utc::now().timestamp() - 60, 0)
            .unwrap()
            .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        let amount = Decimal::from(3);
        let feed = Arc::new(FakeFeed::default());
        feed.push(Ok(vec![SaleEvent {
            action_id: SaleEvent::synth_action_id("c1", &base, &amount),
            collectible_id: "c1".into(),
            name: "Gift".into(),
            external_number: 7,
            amount,
            floor_price: Decimal::from(2),
            created_at: base,
            attributes: vec![],
        }]));
        let chat = Arc::new(FakeChat::default());
        let (tx, rx) = watch::channel(false);
        let state_file = cfg.state_file.clone();
        let monitor = Monitor::new(
            cfg,
            feed,
            chat.clone(),
            Arc::new(FakeSource::default()),
            "@gifts",
            rx,
        );

        let handle = tokio::spawn(monitor.run());
        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(true).unwrap();
        let reason = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(reason, ExitReason::Signal);
        assert_eq!(chat.sent.lock().unwrap().len(), 1);
        let today = Local::now().date_naive();
        let snap = MonitorSnapshot::load_or_default(&state_file, today);
        assert_eq!(snap.seen_actions.len(), 1);
        assert!(snap.price_history.contains_key("c1"));
        assert_eq!(snap.daily_message_count, 1);
        assert!(snap.last_check_time.is_some());
    }
}

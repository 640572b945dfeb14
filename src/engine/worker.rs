//! Per-account worker.
//!
//! Owns one merchant account's runtime: a supervisor task that keeps the
//! event-stream subscription alive, the accept path racing for payments that
//! fit the account's filters, the active-order lock and penalty window, and
//! the operator notifications. An optional polling loop (off by default)
//! sweeps the REST list as a diagnostic fallback.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Local, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::market::types::{ListParams, LivePayment};
use crate::market::{self, LiveHandler, MarketApi, MarketError, PaymentStatus};
use crate::telegram::{self, Notify};

/// Delay before redialing the event stream after it drops.
const REDIAL_DELAY: Duration = Duration::from_secs(5);
/// Dedup-cache TTL: a stream id races at most once per this window.
const SEEN_TTL: Duration = Duration::from_secs(10 * 60);
/// Sliding rate window for the polling path, kept under the upstream's
/// 200-per-5-minutes threshold.
const RATE_WINDOW: Duration = Duration::from_secs(5 * 60);
const RATE_LIMIT: usize = 180;
/// Grace added to a payment's expiry when locking.
const LOCK_GRACE: i64 = 10;
/// Lock duration when the expiry is missing or unparsable.
const LOCK_FALLBACK_SECS: i64 = 5 * 60;
/// Lock extension applied on an ActiveOrderExists rejection.
const LOCK_BUMP_SECS: i64 = 2;
/// The one cancel reason the upstream is known to accept.
const CANCEL_REASON: &str = "balance";

const ACCEPT_STATUS: &str = "🤖 Заявка принята автоматически ✅";

#[derive(Debug, Clone, Default)]
pub struct WorkerConfig {
    pub account_id: i64,
    pub access_token: String,
    /// Upstream payout-method id used in complete requests; empty = unset.
    pub merchant_account_id: String,
    pub chat_id: i64,
    pub min_amount: Option<f64>,
    pub max_amount: Option<f64>,
    pub active: bool,
    pub auto_mode: bool,
}

impl WorkerConfig {
    /// A worker runs iff the account is active and in auto mode.
    pub fn should_run(&self) -> bool {
        self.active && self.auto_mode
    }
}

/// Mutable order state shared between the supervisor task and the
/// control-plane calls. Guarded by one mutex held only for field updates.
#[derive(Debug, Default)]
struct OrderState {
    /// stream id → numeric id, filled on accept, drained on complete/cancel.
    id_map: HashMap<String, i64>,
    active_payment_id: String,
    active_until: Option<DateTime<Utc>>,
    penalty_until: Option<DateTime<Utc>>,
    penalty_reason: String,
    /// Latest `penalty_until` already notified, so one block is announced once.
    last_penalty_notified: Option<DateTime<Utc>>,
}

impl OrderState {
    /// Whether an accepted order is still in progress. An expired lock is
    /// cleared on the way out.
    fn is_active_locked(&mut self, now: DateTime<Utc>) -> bool {
        if self.active_until.is_none() && self.active_payment_id.is_empty() {
            return false;
        }
        if let Some(until) = self.active_until {
            if now < until {
                return true;
            }
        }
        self.active_payment_id.clear();
        self.active_until = None;
        false
    }

    fn set_active_lock(&mut self, id: &str, expires_at: &str, now: DateTime<Utc>) {
        let mut until = now + ChronoDuration::seconds(LOCK_FALLBACK_SECS);
        if let Ok(expiry) = DateTime::parse_from_rfc3339(expires_at) {
            let expiry = expiry.with_timezone(&Utc);
            if expiry > now {
                until = expiry + ChronoDuration::seconds(LOCK_GRACE);
            }
        }
        self.active_payment_id = id.to_string();
        self.active_until = Some(until);
    }

    /// ActiveOrderExists: the upstream says we hold an order we did not see
    /// accepted. Extend the lock without rebinding it to a payment.
    fn bump_active_lock(&mut self, now: DateTime<Utc>) {
        let backoff = now + ChronoDuration::seconds(LOCK_BUMP_SECS);
        if self.active_until.is_none_or(|until| until < backoff) {
            self.active_until = Some(backoff);
        }
    }

    fn clear_active_lock(&mut self, id: &str) {
        if id.is_empty() || id == self.active_payment_id {
            self.active_payment_id.clear();
            self.active_until = None;
        }
    }

    fn in_penalty(&self, now: DateTime<Utc>) -> bool {
        self.penalty_until.is_some_and(|until| now < until)
    }

    /// Record a penalty window. Returns the end timestamp when it is later
    /// than anything already notified, advancing the notified watermark.
    fn note_penalty(
        &mut self,
        until: Option<DateTime<Utc>>,
        reason: &str,
    ) -> Option<DateTime<Utc>> {
        self.penalty_until = until;
        self.penalty_reason = reason.to_string();
        let until = until?;
        if self.last_penalty_notified.is_none_or(|seen| until > seen) {
            self.last_penalty_notified = Some(until);
            return Some(until);
        }
        None
    }

    fn store_numeric_id(&mut self, stream_id: &str, numeric_id: i64) {
        if stream_id.is_empty() || numeric_id == 0 {
            return;
        }
        self.id_map.insert(stream_id.to_string(), numeric_id);
    }

    fn lookup_numeric_id(&self, stream_id: &str) -> Option<i64> {
        if stream_id.is_empty() {
            return None;
        }
        self.id_map.get(stream_id).copied()
    }
}

/// Dedup cache shared by the live and polling paths: one worker races each
/// id at most once per TTL, whichever path surfaces it first. Expired
/// entries are swept lazily on each insert.
#[derive(Debug, Default)]
struct SeenCache {
    entries: Mutex<HashMap<String, Instant>>,
}

impl SeenCache {
    /// Record `id` at `now`. Returns false when the id was already recorded
    /// within the TTL.
    fn insert_fresh(&self, id: &str, now: Instant) -> bool {
        let mut entries = self.entries.lock().expect("seen cache poisoned");
        entries.retain(|_, first| now.duration_since(*first) <= SEEN_TTL);
        if entries.contains_key(id) {
            return false;
        }
        entries.insert(id.to_string(), now);
        true
    }

    #[cfg(test)]
    fn contains(&self, id: &str) -> bool {
        self.entries.lock().unwrap().contains_key(id)
    }
}

pub struct Worker {
    cfg: WorkerConfig,
    client: Arc<dyn MarketApi>,
    notifier: Arc<dyn Notify>,
    base_url: String,
    poll_interval: Option<Duration>,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
    state: Arc<Mutex<OrderState>>,
    seen: Arc<SeenCache>,
}

impl Worker {
    pub fn new(
        cfg: WorkerConfig,
        client: Arc<dyn MarketApi>,
        notifier: Arc<dyn Notify>,
        base_url: String,
        poll_interval: Option<Duration>,
    ) -> Self {
        Self {
            cfg,
            client,
            notifier,
            base_url,
            poll_interval,
            shutdown: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
            state: Arc::new(Mutex::new(OrderState::default())),
            seen: Arc::new(SeenCache::default()),
        }
    }

    pub fn account_id(&self) -> i64 {
        self.cfg.account_id
    }

    /// Spawn the supervisor (and the polling loop when configured).
    /// Idempotent; a no-op for inactive or manual-mode accounts.
    pub fn start(&self) {
        if !self.cfg.should_run() {
            tracing::info!(
                account = self.cfg.account_id,
                active = self.cfg.active,
                auto = self.cfg.auto_mode,
                "worker not started"
            );
            return;
        }
        let mut handles = self.handles.lock().expect("worker handles poisoned");
        if !handles.is_empty() {
            return;
        }

        tracing::info!(
            account = self.cfg.account_id,
            min = self.cfg.min_amount.unwrap_or(0.0),
            max = self.cfg.max_amount.unwrap_or(0.0),
            chat = self.cfg.chat_id,
            "worker start"
        );

        let session = LiveSession {
            cfg: self.cfg.clone(),
            client: Arc::clone(&self.client),
            notifier: Arc::clone(&self.notifier),
            state: Arc::clone(&self.state),
            seen: Arc::clone(&self.seen),
        };
        handles.push(tokio::spawn(run_supervisor(
            self.shutdown.clone(),
            self.base_url.clone(),
            self.cfg.access_token.clone(),
            session,
        )));

        if let Some(every) = self.poll_interval {
            let poll = PollLoop {
                cfg: self.cfg.clone(),
                client: Arc::clone(&self.client),
                notifier: Arc::clone(&self.notifier),
                seen: Arc::clone(&self.seen),
                window: RateWindow::default(),
                cursor: String::new(),
            };
            handles.push(tokio::spawn(poll.run(self.shutdown.clone(), every)));
        }
    }

    /// Cancel the subscription and wait for the worker tasks to exit.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handles: Vec<_> = {
            let mut guard = self.handles.lock().expect("worker handles poisoned");
            guard.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!(account = self.cfg.account_id, "worker stopped");
    }

    // TODO: wire manual mode to the accept endpoint.
    pub async fn take_order(&self, external_id: &str) -> Result<(), MarketError> {
        tracing::info!(
            account = self.cfg.account_id,
            external_id,
            "manual take requested"
        );
        Ok(())
    }

    /// Confirm an accepted payment. Accepts either the stream id (translated
    /// through the id map) or the numeric id directly.
    pub async fn complete_payment(&self, payment_id: &str) -> Result<(), MarketError> {
        if payment_id.is_empty() {
            return Err(MarketError::EmptyPaymentId);
        }
        if self.cfg.merchant_account_id.is_empty() {
            return Err(MarketError::NoMerchantAccount);
        }
        let upstream_id = self.resolve_upstream_id(payment_id);
        self.client
            .complete(&upstream_id, &self.cfg.merchant_account_id)
            .await?;
        self.release_order(payment_id);
        Ok(())
    }

    /// Cancel an accepted payment.
    pub async fn cancel_payment(&self, payment_id: &str) -> Result<(), MarketError> {
        if payment_id.is_empty() {
            return Err(MarketError::EmptyPaymentId);
        }
        if self.cfg.merchant_account_id.is_empty() {
            return Err(MarketError::NoMerchantAccount);
        }
        let upstream_id = self.resolve_upstream_id(payment_id);
        self.client.cancel(&upstream_id, CANCEL_REASON).await?;
        self.release_order(payment_id);
        Ok(())
    }

    fn resolve_upstream_id(&self, payment_id: &str) -> String {
        let state = self.state.lock().expect("order state poisoned");
        match state.lookup_numeric_id(payment_id) {
            Some(numeric) => numeric.to_string(),
            None => payment_id.to_string(),
        }
    }

    fn release_order(&self, payment_id: &str) {
        let mut state = self.state.lock().expect("order state poisoned");
        state.clear_active_lock(payment_id);
        state.id_map.remove(payment_id);
    }
}

/// Keep the subscription alive until cancellation: one driver call per
/// connection, 5 s pause between redials.
async fn run_supervisor(
    shutdown: CancellationToken,
    base_url: String,
    access_token: String,
    mut session: LiveSession,
) {
    let account = session.cfg.account_id;
    loop {
        if let Err(e) = market::subscribe(&shutdown, &base_url, &access_token, &mut session).await {
            tracing::warn!(account, error = %e, "event stream error");
        }
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(REDIAL_DELAY) => {
                tracing::info!(account, "reconnecting event stream");
            }
        }
    }
}

/// The accept path, driven by the supervisor task. The dedup cache is the
/// worker's shared one; it survives reconnects but not worker restarts.
struct LiveSession {
    cfg: WorkerConfig,
    client: Arc<dyn MarketApi>,
    notifier: Arc<dyn Notify>,
    state: Arc<Mutex<OrderState>>,
    seen: Arc<SeenCache>,
}

#[async_trait]
impl LiveHandler for LiveSession {
    async fn on_add(&mut self, payment: LivePayment) {
        self.handle_live_payment(payment).await;
    }
}

impl LiveSession {
    async fn handle_live_payment(&mut self, p: LivePayment) {
        let account = self.cfg.account_id;
        if !self.seen.insert_fresh(&p.id, Instant::now()) {
            return;
        }

        {
            let now = Utc::now();
            let mut state = self.state.lock().expect("order state poisoned");
            if state.is_active_locked(now) {
                tracing::info!(account, id = %p.id, "skip: active order in progress");
                return;
            }
            if state.in_penalty(now) {
                return;
            }
        }

        // Bounds filter; an unparsable amount passes through unfiltered.
        if let Ok(amount) = p.in_amount.parse::<f64>() {
            if let Some(min) = self.cfg.min_amount {
                if amount < min {
                    tracing::info!(account, id = %p.id, amount, min, "skip: below min");
                    return;
                }
            }
            if let Some(max) = self.cfg.max_amount {
                if max > 0.0 && amount > max {
                    tracing::info!(account, id = %p.id, amount, max, "skip: above max");
                    return;
                }
            }
        }

        let started = Instant::now();
        match self.client.accept(&p.id).await {
            Ok(accepted) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                {
                    let mut state = self.state.lock().expect("order state poisoned");
                    state.set_active_lock(&p.id, &p.expires_at, Utc::now());
                    if let Some(numeric) = accepted.numeric_id {
                        state.store_numeric_id(&p.id, numeric);
                    }
                }
                tracing::info!(
                    account,
                    id = %p.id,
                    amount = %p.in_amount,
                    rate = %p.exchange_rate,
                    elapsed_ms,
                    cf_ray = accepted.cf_ray.as_deref().unwrap_or(""),
                    "accepted payment"
                );
                // Detached: photo upload latency must not stall the next
                // stream event.
                let notifier = Arc::clone(&self.notifier);
                let chat_id = self.cfg.chat_id;
                tokio::spawn(notify_accepted(notifier, account, chat_id, p));
            }
            Err(MarketError::MerchantPenalized { until, kind, .. }) => {
                let announce = {
                    let mut state = self.state.lock().expect("order state poisoned");
                    state.note_penalty(until, &kind)
                };
                if let Some(until) = announce {
                    let text = penalty_message(until, &kind);
                    if let Err(e) = self.notifier.send_text(self.cfg.chat_id, &text).await {
                        tracing::warn!(account, error = %e, "penalty notification failed");
                    }
                }
            }
            Err(MarketError::ActiveOrderExists { .. }) => {
                let mut state = self.state.lock().expect("order state poisoned");
                state.bump_active_lock(Utc::now());
            }
            Err(e) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                tracing::warn!(account, id = %p.id, elapsed_ms, error = %e, "accept failed");
            }
        }
    }
}

fn penalty_message(until: DateTime<Utc>, reason: &str) -> String {
    format!(
        "⛔️ Блок до {}\nПричина: {}\nЗаявки временно не принимаем.",
        until.with_timezone(&Local).format("%H:%M:%S"),
        reason
    )
}

async fn notify_accepted(
    notifier: Arc<dyn Notify>,
    account_id: i64,
    chat_id: i64,
    p: LivePayment,
) {
    let qr = telegram::qr_url(&p.url);
    let caption = telegram::live_caption(&p, ACCEPT_STATUS);
    let markup = telegram::paid_keyboard(account_id, &p);
    if let Err(e) = notifier.send_photo(chat_id, &qr, &caption, markup).await {
        tracing::warn!(account = account_id, error = %e, "photo notification failed, sending text");
        if let Err(e) = notifier.send_text(chat_id, &caption).await {
            tracing::warn!(account = account_id, error = %e, "text notification failed");
        }
    }
}

/// Sliding-window limiter for the polling path. The event path is bounded by
/// the stream itself and never consults it.
#[derive(Debug, Default)]
struct RateWindow {
    stamps: Vec<Instant>,
}

impl RateWindow {
    fn allow(&mut self, now: Instant) -> bool {
        self.stamps
            .retain(|stamp| now.duration_since(*stamp) <= RATE_WINDOW);
        if self.stamps.len() >= RATE_LIMIT {
            return false;
        }
        self.stamps.push(now);
        true
    }
}

/// Diagnostic REST sweep, enabled only via `P2C_POLL_INTERVAL_SECS`. Takes at
/// most one payment per pass.
struct PollLoop {
    cfg: WorkerConfig,
    client: Arc<dyn MarketApi>,
    notifier: Arc<dyn Notify>,
    seen: Arc<SeenCache>,
    window: RateWindow,
    cursor: String,
}

impl PollLoop {
    async fn run(mut self, shutdown: CancellationToken, every: Duration) {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await; // skip immediate tick
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => self.poll_once().await,
            }
        }
    }

    async fn poll_once(&mut self) {
        let account = self.cfg.account_id;
        if !self.window.allow(Instant::now()) {
            tracing::info!(account, "poll skipped: rate limit window full");
            return;
        }

        let params = ListParams {
            size: 10,
            status: Some(PaymentStatus::Processing),
            cursor: self.cursor.clone(),
        };
        let payments = match self.client.list_payments(&params).await {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(account, error = %e, "poll error");
                return;
            }
        };
        if payments.data.is_empty() {
            tracing::debug!(account, "poll: empty");
            return;
        }
        if !payments.cursor.is_empty() {
            self.cursor = payments.cursor.clone();
        }

        let now = Instant::now();
        for p in &payments.data {
            let id = p.id_string();
            if !self.seen.insert_fresh(&id, now) {
                continue;
            }

            tracing::info!(
                account,
                id = %id,
                status = p.status.as_str(),
                amount = %p.in_amount,
                asset = %p.in_asset,
                "poll: seen payment"
            );
            if p.status.is_terminal() {
                continue;
            }

            let amount = p.in_amount_value();
            if let Some(min) = self.cfg.min_amount {
                if amount < min {
                    tracing::info!(account, id = %id, amount, min, "poll skip: below min");
                    continue;
                }
            }
            if let Some(max) = self.cfg.max_amount {
                if max > 0.0 && amount > max {
                    tracing::info!(account, id = %id, amount, max, "poll skip: above max");
                    continue;
                }
            }

            tracing::info!(account, id = %id, amount, "poll: trying take");
            match self.client.accept(&id).await {
                Ok(_) => {
                    tracing::info!(account, id = %id, amount, "poll: took payment");
                    self.send_text(&telegram::poll_message(p, true, "")).await;
                    break; // one per pass
                }
                Err(e) => {
                    tracing::warn!(account, id = %id, error = %e, "poll: take failed");
                    self.send_text(&telegram::poll_message(p, false, &e.to_string()))
                        .await;
                }
            }
        }
    }

    async fn send_text(&self, text: &str) {
        if let Err(e) = self.notifier.send_text(self.cfg.chat_id, text).await {
            tracing::warn!(account = self.cfg.account_id, error = %e, "telegram send failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::types::{Accepted, ListPaymentsResponse};
    use crate::telegram::{InlineKeyboard, NotifyError};
    use chrono::TimeZone;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct MockMarket {
        accept_results: Mutex<VecDeque<Result<Accepted, MarketError>>>,
        accept_calls: Mutex<Vec<String>>,
        complete_calls: Mutex<Vec<(String, String)>>,
        cancel_calls: Mutex<Vec<(String, String)>>,
        list_response: Mutex<Option<ListPaymentsResponse>>,
    }

    impl MockMarket {
        fn with_accepts(results: Vec<Result<Accepted, MarketError>>) -> Arc<Self> {
            Arc::new(Self {
                accept_results: Mutex::new(results.into()),
                ..Default::default()
            })
        }

        fn accept_count(&self) -> usize {
            self.accept_calls.lock().unwrap().len()
        }
    }

    fn ok_accept(numeric_id: i64) -> Result<Accepted, MarketError> {
        Ok(Accepted {
            numeric_id: Some(numeric_id),
            cf_ray: Some("ray-1".into()),
            body: format!(r#"{{"data":{{"id":{numeric_id}}}}}"#),
        })
    }

    fn penalized(end_at: &str) -> Result<Accepted, MarketError> {
        Err(MarketError::MerchantPenalized {
            until: Some(
                DateTime::parse_from_rfc3339(end_at)
                    .unwrap()
                    .with_timezone(&Utc),
            ),
            kind: "SLOW".into(),
            body: format!(r#"{{"error":"MerchantPenalized","penalty_end_at":"{end_at}"}}"#),
        })
    }

    #[async_trait]
    impl MarketApi for MockMarket {
        async fn list_payments(
            &self,
            _params: &ListParams,
        ) -> Result<ListPaymentsResponse, MarketError> {
            Ok(self
                .list_response
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_default())
        }

        async fn accept(&self, stream_id: &str) -> Result<Accepted, MarketError> {
            self.accept_calls.lock().unwrap().push(stream_id.to_string());
            self.accept_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| {
                    Err(MarketError::Status {
                        status: 500,
                        body: "no scripted response".into(),
                    })
                })
        }

        async fn complete(&self, id: &str, merchant_account_id: &str) -> Result<(), MarketError> {
            self.complete_calls
                .lock()
                .unwrap()
                .push((id.to_string(), merchant_account_id.to_string()));
            Ok(())
        }

        async fn cancel(&self, id: &str, reason: &str) -> Result<(), MarketError> {
            self.cancel_calls
                .lock()
                .unwrap()
                .push((id.to_string(), reason.to_string()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockNotify {
        texts: Mutex<Vec<(i64, String)>>,
        photos: Mutex<Vec<(i64, String, String, Option<InlineKeyboard>)>>,
        fail_photos: AtomicBool,
    }

    #[async_trait]
    impl Notify for MockNotify {
        async fn send_text(&self, chat_id: i64, text: &str) -> Result<(), NotifyError> {
            self.texts.lock().unwrap().push((chat_id, text.to_string()));
            Ok(())
        }

        async fn send_photo(
            &self,
            chat_id: i64,
            photo_url: &str,
            caption: &str,
            reply_markup: Option<InlineKeyboard>,
        ) -> Result<(), NotifyError> {
            if self.fail_photos.load(Ordering::SeqCst) {
                return Err(NotifyError::Status(502));
            }
            self.photos.lock().unwrap().push((
                chat_id,
                photo_url.to_string(),
                caption.to_string(),
                reply_markup,
            ));
            Ok(())
        }
    }

    fn session(
        cfg: WorkerConfig,
        client: Arc<MockMarket>,
        notifier: Arc<MockNotify>,
    ) -> LiveSession {
        LiveSession {
            cfg,
            client,
            notifier,
            state: Arc::new(Mutex::new(OrderState::default())),
            seen: Arc::new(SeenCache::default()),
        }
    }

    fn auto_cfg(account_id: i64) -> WorkerConfig {
        WorkerConfig {
            account_id,
            access_token: "token".into(),
            merchant_account_id: "m1".into(),
            chat_id: 7,
            active: true,
            auto_mode: true,
            ..Default::default()
        }
    }

    fn live(id: &str, in_amount: &str) -> LivePayment {
        LivePayment {
            id: id.into(),
            in_amount: in_amount.into(),
            in_asset: "RUB".into(),
            out_asset: "USDT".into(),
            exchange_rate: "92.5".into(),
            fee_amount: "2500000000000000000".into(),
            url: "https://pay.example/a".into(),
            expires_at: "2030-01-01T00:05:00Z".into(),
            ..Default::default()
        }
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_happy_accept_locks_maps_and_notifies() {
        let client = MockMarket::with_accepts(vec![ok_accept(777)]);
        let notifier = Arc::new(MockNotify::default());
        let mut session = session(auto_cfg(42), Arc::clone(&client), Arc::clone(&notifier));

        session.handle_live_payment(live("A", "500")).await;

        {
            let state = session.state.lock().unwrap();
            assert_eq!(state.id_map.get("A"), Some(&777));
            assert_eq!(state.active_payment_id, "A");
            assert_eq!(
                state.active_until,
                Some(Utc.with_ymd_and_hms(2030, 1, 1, 0, 5, 10).unwrap())
            );
        }

        // The notification is dispatched on a detached task.
        wait_for(|| !notifier.photos.lock().unwrap().is_empty()).await;
        let photos = notifier.photos.lock().unwrap();
        let (chat, qr, caption, markup) = &photos[0];
        assert_eq!(*chat, 7);
        assert!(qr.starts_with("https://quickchart.io/qr?text="));
        assert!(caption.contains("Сумма: 500 RUB"));
        let buttons = &markup.as_ref().unwrap().inline_keyboard[0];
        assert!(buttons[0].callback_data.starts_with("paid:42:A:500:"));
        assert_eq!(buttons[1].callback_data, "cancel:42:A");
    }

    #[tokio::test]
    async fn test_photo_failure_falls_back_to_text() {
        let client = MockMarket::with_accepts(vec![ok_accept(1)]);
        let notifier = Arc::new(MockNotify::default());
        notifier.fail_photos.store(true, Ordering::SeqCst);
        let mut session = session(auto_cfg(42), client, Arc::clone(&notifier));

        session.handle_live_payment(live("A", "500")).await;

        wait_for(|| !notifier.texts.lock().unwrap().is_empty()).await;
        let texts = notifier.texts.lock().unwrap();
        assert!(texts[0].1.contains("ID: A"));
    }

    #[tokio::test]
    async fn test_filter_drops_below_min_without_accept() {
        let client = MockMarket::with_accepts(vec![ok_accept(1)]);
        let notifier = Arc::new(MockNotify::default());
        let mut cfg = auto_cfg(42);
        cfg.min_amount = Some(1000.0);
        let mut session = session(cfg, Arc::clone(&client), Arc::clone(&notifier));

        session.handle_live_payment(live("B", "500")).await;

        assert_eq!(client.accept_count(), 0);
        assert!(notifier.photos.lock().unwrap().is_empty());
        assert!(notifier.texts.lock().unwrap().is_empty());
        assert!(session.seen.contains("B"));
    }

    #[tokio::test]
    async fn test_filter_bounds() {
        let client = MockMarket::with_accepts(vec![ok_accept(1), ok_accept(2), ok_accept(3)]);
        let notifier = Arc::new(MockNotify::default());
        let mut cfg = auto_cfg(42);
        cfg.min_amount = Some(100.0);
        cfg.max_amount = Some(1000.0);
        let mut session = session(cfg, Arc::clone(&client), notifier);

        // In-bounds is accepted; out-of-bounds and above-max are not.
        session.handle_live_payment(live("in", "500")).await;
        assert_eq!(client.accept_count(), 1);

        // Clear the lock the accept installed so bounds are what decides.
        session.state.lock().unwrap().clear_active_lock("");
        session.handle_live_payment(live("high", "1500")).await;
        assert_eq!(client.accept_count(), 1);

        // Unparsable amounts skip the filter entirely.
        session.handle_live_payment(live("raw", "n/a")).await;
        assert_eq!(client.accept_count(), 2);
    }

    #[tokio::test]
    async fn test_max_of_zero_is_ignored() {
        let client = MockMarket::with_accepts(vec![ok_accept(1)]);
        let notifier = Arc::new(MockNotify::default());
        let mut cfg = auto_cfg(42);
        cfg.max_amount = Some(0.0);
        let mut session = session(cfg, Arc::clone(&client), notifier);

        session.handle_live_payment(live("big", "99999")).await;
        assert_eq!(client.accept_count(), 1);
    }

    #[tokio::test]
    async fn test_dedup_races_each_id_once() {
        let client = MockMarket::with_accepts(vec![
            Err(MarketError::Status {
                status: 400,
                body: "lost".into(),
            }),
            ok_accept(2),
        ]);
        let notifier = Arc::new(MockNotify::default());
        let mut session = session(auto_cfg(42), Arc::clone(&client), notifier);

        session.handle_live_payment(live("A", "500")).await;
        session.handle_live_payment(live("A", "500")).await;

        assert_eq!(client.accept_count(), 1);
    }

    #[tokio::test]
    async fn test_live_and_poll_paths_share_dedup_cache() {
        let client = MockMarket::with_accepts(vec![ok_accept(1)]);
        *client.list_response.lock().unwrap() = Some(ListPaymentsResponse {
            data: vec![
                serde_json::from_str(r#"{"id":123,"status":"processing","in_amount":"500"}"#)
                    .unwrap(),
            ],
            cursor: String::new(),
        });
        let notifier = Arc::new(MockNotify::default());
        let seen = Arc::new(SeenCache::default());

        let mut session = LiveSession {
            cfg: auto_cfg(42),
            client: Arc::clone(&client) as Arc<dyn MarketApi>,
            notifier: Arc::clone(&notifier) as Arc<dyn Notify>,
            state: Arc::new(Mutex::new(OrderState::default())),
            seen: Arc::clone(&seen),
        };
        session.handle_live_payment(live("123", "500")).await;
        assert_eq!(client.accept_count(), 1);

        // The polling path lists the same id; the shared cache keeps it from
        // racing a second time.
        let mut poll = PollLoop {
            cfg: auto_cfg(42),
            client: Arc::clone(&client) as Arc<dyn MarketApi>,
            notifier: notifier as Arc<dyn Notify>,
            seen,
            window: RateWindow::default(),
            cursor: String::new(),
        };
        poll.poll_once().await;
        assert_eq!(client.accept_count(), 1);
    }

    #[tokio::test]
    async fn test_active_order_exists_extends_lock_silently() {
        let client = MockMarket::with_accepts(vec![
            Err(MarketError::ActiveOrderExists { body: "x".into() }),
            Err(MarketError::ActiveOrderExists { body: "x".into() }),
        ]);
        let notifier = Arc::new(MockNotify::default());
        let mut session = session(auto_cfg(42), Arc::clone(&client), Arc::clone(&notifier));

        let before = Utc::now();
        session.handle_live_payment(live("C1", "500")).await;
        let first_until = session.state.lock().unwrap().active_until.unwrap();
        assert!(first_until >= before + ChronoDuration::seconds(LOCK_BUMP_SECS));

        // The lock now gates the accept path; expire it manually so the
        // second rejection is observable too.
        session.state.lock().unwrap().active_until =
            Some(Utc::now() - ChronoDuration::seconds(1));
        session.handle_live_payment(live("C2", "500")).await;
        let second_until = session.state.lock().unwrap().active_until.unwrap();
        assert!(second_until >= first_until);

        assert_eq!(client.accept_count(), 2);
        assert!(notifier.texts.lock().unwrap().is_empty());
        assert!(notifier.photos.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_active_lock_gates_accepts() {
        let client = MockMarket::with_accepts(vec![ok_accept(1)]);
        let notifier = Arc::new(MockNotify::default());
        let mut session = session(auto_cfg(42), Arc::clone(&client), notifier);

        session.handle_live_payment(live("A", "500")).await;
        assert_eq!(client.accept_count(), 1);

        // Lock runs to 2030; nothing else races.
        session.handle_live_payment(live("B", "500")).await;
        session.handle_live_payment(live("C", "500")).await;
        assert_eq!(client.accept_count(), 1);
    }

    #[tokio::test]
    async fn test_penalty_notifies_once_per_distinct_end() {
        let client = MockMarket::with_accepts(vec![
            penalized("2030-01-01T00:10:00Z"),
            penalized("2030-01-01T00:10:00Z"),
            penalized("2030-01-01T00:11:00Z"),
        ]);
        let notifier = Arc::new(MockNotify::default());
        let mut session = session(auto_cfg(42), Arc::clone(&client), Arc::clone(&notifier));

        session.handle_live_payment(live("D1", "500")).await;
        // Penalty window (until 2030) now mutes the accept path; lift it to
        // observe the repeated upstream answer.
        session.state.lock().unwrap().penalty_until = None;
        session.handle_live_payment(live("D2", "500")).await;
        session.state.lock().unwrap().penalty_until = None;
        session.handle_live_payment(live("D3", "500")).await;

        let texts = notifier.texts.lock().unwrap();
        assert_eq!(texts.len(), 2);
        assert!(texts[0].1.starts_with("⛔️ Блок до "));
        assert!(texts[0].1.contains("Причина: SLOW"));
        assert!(texts[0].1.ends_with("Заявки временно не принимаем."));
    }

    #[tokio::test]
    async fn test_penalty_window_mutes_accepts() {
        let client = MockMarket::with_accepts(vec![penalized("2030-01-01T00:10:00Z")]);
        let notifier = Arc::new(MockNotify::default());
        let mut session = session(auto_cfg(42), Arc::clone(&client), notifier);

        session.handle_live_payment(live("D1", "500")).await;
        assert_eq!(client.accept_count(), 1);

        session.handle_live_payment(live("D2", "500")).await;
        session.handle_live_payment(live("D3", "500")).await;
        assert_eq!(client.accept_count(), 1);
    }

    #[tokio::test]
    async fn test_complete_translates_stream_id_and_clears_lock() {
        let client = Arc::new(MockMarket::default());
        let notifier = Arc::new(MockNotify::default());
        let worker = Worker::new(
            auto_cfg(42),
            Arc::clone(&client) as Arc<dyn MarketApi>,
            notifier,
            "https://example.invalid".into(),
            None,
        );
        {
            let mut state = worker.state.lock().unwrap();
            state.store_numeric_id("A", 777);
            state.set_active_lock("A", "2030-01-01T00:05:00Z", Utc::now());
        }

        worker.complete_payment("A").await.unwrap();

        let completes = client.complete_calls.lock().unwrap();
        assert_eq!(completes[0], ("777".to_string(), "m1".to_string()));
        let state = worker.state.lock().unwrap();
        assert!(state.active_payment_id.is_empty());
        assert!(state.id_map.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_uses_balance_reason() {
        let client = Arc::new(MockMarket::default());
        let notifier = Arc::new(MockNotify::default());
        let worker = Worker::new(
            auto_cfg(42),
            Arc::clone(&client) as Arc<dyn MarketApi>,
            notifier,
            "https://example.invalid".into(),
            None,
        );

        // No id-map entry: the supplied id goes upstream untranslated.
        worker.cancel_payment("12345").await.unwrap();

        let cancels = client.cancel_calls.lock().unwrap();
        assert_eq!(cancels[0], ("12345".to_string(), "balance".to_string()));
    }

    #[tokio::test]
    async fn test_complete_requires_merchant_account() {
        let client = Arc::new(MockMarket::default());
        let notifier = Arc::new(MockNotify::default());
        let mut cfg = auto_cfg(42);
        cfg.merchant_account_id.clear();
        let worker = Worker::new(
            cfg,
            Arc::clone(&client) as Arc<dyn MarketApi>,
            notifier,
            "https://example.invalid".into(),
            None,
        );
        {
            let mut state = worker.state.lock().unwrap();
            state.set_active_lock("A", "2030-01-01T00:05:00Z", Utc::now());
        }

        let err = worker.complete_payment("A").await.unwrap_err();
        assert_eq!(err.to_string(), "no p2c account id configured");
        assert!(client.complete_calls.lock().unwrap().is_empty());
        // The lock survives a refused complete.
        assert_eq!(worker.state.lock().unwrap().active_payment_id, "A");
    }

    #[tokio::test]
    async fn test_worker_start_noop_without_auto_mode() {
        let client = Arc::new(MockMarket::default());
        let notifier = Arc::new(MockNotify::default());
        let mut cfg = auto_cfg(42);
        cfg.auto_mode = false;
        let worker = Worker::new(
            cfg,
            client as Arc<dyn MarketApi>,
            notifier,
            "https://example.invalid".into(),
            None,
        );

        worker.start();
        assert!(worker.handles.lock().unwrap().is_empty());
        worker.stop().await;
    }

    #[test]
    fn test_rate_window_holds_at_limit() {
        let mut window = RateWindow::default();
        let now = Instant::now();
        for _ in 0..RATE_LIMIT {
            assert!(window.allow(now));
        }
        assert!(!window.allow(now));
        assert_eq!(window.stamps.len(), RATE_LIMIT);
    }

    #[test]
    fn test_lock_falls_back_on_bad_expiry() {
        let now = Utc.with_ymd_and_hms(2029, 6, 1, 12, 0, 0).unwrap();
        let mut state = OrderState::default();

        state.set_active_lock("A", "not-a-timestamp", now);
        assert_eq!(
            state.active_until,
            Some(now + ChronoDuration::seconds(LOCK_FALLBACK_SECS))
        );

        // An expiry already in the past also falls back.
        state.set_active_lock("A", "2020-01-01T00:00:00Z", now);
        assert_eq!(
            state.active_until,
            Some(now + ChronoDuration::seconds(LOCK_FALLBACK_SECS))
        );
    }

    #[test]
    fn test_bump_never_shortens_lock() {
        let now = Utc.with_ymd_and_hms(2029, 6, 1, 12, 0, 0).unwrap();
        let mut state = OrderState::default();
        state.set_active_lock("A", "2030-01-01T00:05:00Z", now);
        let long_lock = state.active_until.unwrap();

        state.bump_active_lock(now);
        assert_eq!(state.active_until, Some(long_lock));
    }

    #[test]
    fn test_clear_active_lock_matches_id() {
        let now = Utc::now();
        let mut state = OrderState::default();
        state.set_active_lock("A", "", now);

        state.clear_active_lock("B");
        assert_eq!(state.active_payment_id, "A");

        state.clear_active_lock("A");
        assert!(state.active_payment_id.is_empty());

        state.set_active_lock("A", "", now);
        state.clear_active_lock("");
        assert!(state.active_payment_id.is_empty());
    }

    #[test]
    fn test_note_penalty_without_window_never_notifies() {
        let mut state = OrderState::default();
        assert!(state.note_penalty(None, "SLOW").is_none());
        assert!(!state.in_penalty(Utc::now()));
    }
}

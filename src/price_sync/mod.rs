//! Price synchronization engine.
//!
//! Owns one active subscription per symbol. Each subscription performs an
//! immediate fetch and then re-polls on a fixed wall-clock interval
//! regardless of individual fetch outcomes, applying the retry policy inside
//! each attempt. Terminal failures keep the last good quote alongside an
//! error flag so consumers can show a stale-but-present price instead of
//! blanking out.
//!
//! Teardown is epoch-guarded: `stop()` flips the live flag and bumps the
//! subscription epoch, and every state mutation re-checks both under the
//! write lock. A response that resolves after `stop()` is discarded even
//! though the underlying request could not be cancelled.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::gateway::types::PriceResponse;
use crate::gateway::{GatewayError, MarketDataApi};
use crate::retry::{with_retry, RetryPolicy};
use crate::types::Quote;

/// Read-mostly view of one symbol's price state.
#[derive(Debug, Clone, Default)]
pub struct PriceView {
    pub current: Option<Quote>,
    pub previous: Option<Quote>,
    pub last_updated: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub loading: bool,
}

impl PriceView {
    pub fn price(&self) -> Option<Decimal> {
        self.current.as_ref().map(|q| q.price)
    }

    /// Price change against the superseded quote, when both exist.
    pub fn delta(&self) -> Option<Decimal> {
        match (&self.current, &self.previous) {
            (Some(current), Some(previous)) => Some(current.price - previous.price),
            _ => None,
        }
    }

    pub fn has_data(&self) -> bool {
        self.current.is_some()
    }
}

struct SubscriptionShared {
    symbol: String,
    interval: Duration,
    live: AtomicBool,
    /// Bumped on stop; fetches capture it at issue time and any response
    /// carrying a stale epoch is discarded before mutation.
    epoch: AtomicU64,
    state: RwLock<PriceView>,
}

/// One symbol's polling subscription.
pub struct PriceSubscription {
    shared: Arc<SubscriptionShared>,
    api: Arc<dyn MarketDataApi>,
    policy: RetryPolicy,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PriceSubscription {
    fn new(symbol: String, interval: Duration, api: Arc<dyn MarketDataApi>, policy: RetryPolicy) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(SubscriptionShared {
                symbol,
                interval,
                live: AtomicBool::new(true),
                epoch: AtomicU64::new(0),
                state: RwLock::new(PriceView {
                    loading: true,
                    ..Default::default()
                }),
            }),
            api,
            policy,
            handle: Mutex::new(None),
        })
    }

    fn spawn(self: &Arc<Self>) {
        let sub = Arc::clone(self);
        let handle = tokio::spawn(async move { sub.poll_loop().await });
        if let Ok(mut slot) = self.handle.lock() {
            *slot = Some(handle);
        }
    }

    async fn poll_loop(&self) {
        let mut ticker = tokio::time::interval(self.shared.interval);
        // Wall-clock cadence: a slow fetch skips ticks instead of bursting.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if !self.is_live() {
                break;
            }
            self.fetch_once(false).await;
        }
    }

    /// Out-of-band fetch; does not disturb the interval timer.
    pub async fn refetch(&self, show_loading: bool) {
        self.fetch_once(show_loading).await;
    }

    async fn fetch_once(&self, show_loading: bool) {
        if !self.is_live() {
            return;
        }
        let issued = self.shared.epoch.load(Ordering::Acquire);
        if show_loading {
            if let Ok(mut state) = self.shared.state.write() {
                state.loading = true;
            }
        }

        let api = self.api.clone();
        let symbol = self.shared.symbol.clone();
        let result = with_retry(&self.policy, || {
            let api = api.clone();
            let symbol = symbol.clone();
            async move { api.fetch_price(&symbol).await }
        })
        .await;

        self.apply(result, issued);
    }

    fn apply(&self, result: Result<PriceResponse, GatewayError>, issued: u64) {
        let Ok(mut state) = self.shared.state.write() else {
            return;
        };
        // Checked under the lock so a concurrent stop() cannot interleave
        // between the check and the write.
        if !self.shared.live.load(Ordering::Acquire)
            || self.shared.epoch.load(Ordering::Acquire) != issued
        {
            debug!(
                symbol = %self.shared.symbol,
                "discarding price response for a stopped subscription"
            );
            return;
        }

        state.loading = false;
        match result {
            Ok(response) => {
                state.previous = state.current.take();
                state.current = Some(response.into_quote());
                state.last_updated = Some(Utc::now());
                state.error = None;
            }
            Err(error) => {
                // Recoverable: keep the last good quote, surface the flag.
                warn!(
                    symbol = %self.shared.symbol,
                    error = %error,
                    "price fetch failed; serving cached quote"
                );
                state.error = Some(error.to_string());
            }
        }
    }

    pub fn snapshot(&self) -> PriceView {
        self.shared
            .state
            .read()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn symbol(&self) -> &str {
        &self.shared.symbol
    }

    pub fn interval(&self) -> Duration {
        self.shared.interval
    }

    pub fn is_live(&self) -> bool {
        self.shared.live.load(Ordering::Acquire)
    }

    /// A subscription is stale when the last successful update is older than
    /// twice its polling interval. Derived, never stored.
    pub fn is_stale(&self) -> bool {
        let last_updated = match self.shared.state.read() {
            Ok(state) => state.last_updated,
            Err(_) => return false,
        };
        match last_updated {
            Some(at) => {
                let age = Utc::now().signed_duration_since(at);
                let threshold = chrono::Duration::from_std(self.shared.interval * 2)
                    .unwrap_or_else(|_| chrono::Duration::max_value());
                age > threshold
            }
            None => false,
        }
    }

    /// Cancel the timer and mark the subscription dead. In-flight responses
    /// that arrive afterwards are discarded by the epoch check.
    pub fn stop(&self) {
        self.shared.live.store(false, Ordering::Release);
        self.shared.epoch.fetch_add(1, Ordering::AcqRel);
        if let Ok(mut slot) = self.handle.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

impl Drop for PriceSubscription {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Owns the active subscriptions, keyed by normalized symbol.
pub struct PriceSyncEngine {
    api: Arc<dyn MarketDataApi>,
    policy: RetryPolicy,
    subs: RwLock<HashMap<String, Arc<PriceSubscription>>>,
}

impl PriceSyncEngine {
    pub fn new(api: Arc<dyn MarketDataApi>, policy: RetryPolicy) -> Self {
        Self {
            api,
            policy,
            subs: RwLock::new(HashMap::new()),
        }
    }

    /// Begin polling a symbol: one immediate fetch, then every `interval`.
    /// Re-subscribing a symbol stops and replaces its previous subscription.
    pub fn subscribe(&self, symbol: &str, interval: Duration) -> Arc<PriceSubscription> {
        let key = symbol.trim().to_uppercase();
        let sub = PriceSubscription::new(key.clone(), interval, self.api.clone(), self.policy.clone());
        sub.spawn();

        if let Ok(mut subs) = self.subs.write() {
            if let Some(old) = subs.insert(key, sub.clone()) {
                old.stop();
            }
        }
        sub
    }

    pub fn subscription(&self, symbol: &str) -> Option<Arc<PriceSubscription>> {
        let key = symbol.trim().to_uppercase();
        self.subs.read().ok().and_then(|s| s.get(&key).cloned())
    }

    pub fn unsubscribe(&self, symbol: &str) {
        let key = symbol.trim().to_uppercase();
        if let Ok(mut subs) = self.subs.write() {
            if let Some(sub) = subs.remove(&key) {
                sub.stop();
            }
        }
    }

    /// Stop the old symbol and start the new one from a clean state; quotes
    /// from the old symbol can never leak into the new subscription.
    pub fn switch_symbol(
        &self,
        old_symbol: &str,
        new_symbol: &str,
        interval: Duration,
    ) -> Arc<PriceSubscription> {
        self.unsubscribe(old_symbol);
        self.subscribe(new_symbol, interval)
    }

    pub fn stop_all(&self) {
        if let Ok(mut subs) = self.subs.write() {
            for (_, sub) in subs.drain() {
                sub.stop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MockMarketDataApi;
    use mockall::Sequence;
    use rust_decimal_macros::dec;

    fn price_response(symbol: &str, price: Decimal) -> PriceResponse {
        PriceResponse {
            symbol: symbol.to_string(),
            current_price: price,
            market: Some("NASDAQ".to_string()),
            currency: None,
            timestamp: None,
        }
    }

    fn policy_no_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 0,
            base_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_success_rotates_previous_and_current() {
        let mut api = MockMarketDataApi::new();
        let mut seq = Sequence::new();
        api.expect_fetch_price()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(price_response("AAPL", dec!(101.50))));
        api.expect_fetch_price()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(price_response("AAPL", dec!(102.25))));

        let sub = PriceSubscription::new(
            "AAPL".to_string(),
            Duration::from_secs(30),
            Arc::new(api),
            policy_no_retry(),
        );

        sub.fetch_once(true).await;
        let view = sub.snapshot();
        assert_eq!(view.price(), Some(dec!(101.50)));
        assert!(view.previous.is_none());
        assert!(!view.loading);

        sub.fetch_once(false).await;
        let view = sub.snapshot();
        assert_eq!(view.price(), Some(dec!(102.25)));
        assert_eq!(view.previous.as_ref().map(|q| q.price), Some(dec!(101.50)));
        assert_eq!(view.delta(), Some(dec!(0.75)));
        assert!(view.error.is_none());
    }

    #[tokio::test]
    async fn test_terminal_failure_keeps_cached_quote() {
        let mut api = MockMarketDataApi::new();
        let mut seq = Sequence::new();
        api.expect_fetch_price()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(price_response("AAPL", dec!(101.50))));
        api.expect_fetch_price()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                Err(GatewayError::Rejected {
                    status: 404,
                    message: "Symbol not found".to_string(),
                })
            });

        let sub = PriceSubscription::new(
            "AAPL".to_string(),
            Duration::from_secs(30),
            Arc::new(api),
            policy_no_retry(),
        );

        sub.fetch_once(false).await;
        sub.fetch_once(false).await;

        let view = sub.snapshot();
        // Degraded, not blanked: cached price plus the error flag.
        assert_eq!(view.price(), Some(dec!(101.50)));
        assert!(view.error.as_deref().unwrap().contains("Symbol not found"));
    }

    #[tokio::test]
    async fn test_apply_after_stop_is_discarded() {
        let api = MockMarketDataApi::new();
        let sub = PriceSubscription::new(
            "AAPL".to_string(),
            Duration::from_secs(30),
            Arc::new(api),
            policy_no_retry(),
        );

        let issued = sub.shared.epoch.load(Ordering::Acquire);
        sub.stop();
        sub.apply(Ok(price_response("AAPL", dec!(101.50))), issued);

        assert!(!sub.snapshot().has_data());
    }

    #[tokio::test]
    async fn test_stale_epoch_is_discarded_even_while_live() {
        let api = MockMarketDataApi::new();
        let sub = PriceSubscription::new(
            "AAPL".to_string(),
            Duration::from_secs(30),
            Arc::new(api),
            policy_no_retry(),
        );

        let issued = sub.shared.epoch.load(Ordering::Acquire);
        sub.shared.epoch.fetch_add(1, Ordering::AcqRel);
        sub.apply(Ok(price_response("AAPL", dec!(101.50))), issued);

        assert!(!sub.snapshot().has_data());
    }

    #[tokio::test]
    async fn test_staleness_is_derived_from_last_update() {
        let api = MockMarketDataApi::new();
        let sub = PriceSubscription::new(
            "AAPL".to_string(),
            Duration::from_secs(30),
            Arc::new(api),
            policy_no_retry(),
        );

        // No update yet: not stale (nothing to be stale relative to).
        assert!(!sub.is_stale());

        {
            let mut state = sub.shared.state.write().unwrap();
            state.last_updated = Some(Utc::now() - chrono::Duration::seconds(61));
        }
        // 61s old with a 30s interval: past the 2x threshold.
        assert!(sub.is_stale());

        {
            let mut state = sub.shared.state.write().unwrap();
            state.last_updated = Some(Utc::now() - chrono::Duration::seconds(59));
        }
        assert!(!sub.is_stale());
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_replaces_previous_subscription() {
        let mut api = MockMarketDataApi::new();
        api.expect_fetch_price()
            .returning(|sym| Ok(price_response(sym, dec!(1))));

        let engine = PriceSyncEngine::new(Arc::new(api), policy_no_retry());
        let first = engine.subscribe("aapl", Duration::from_secs(30));
        let second = engine.subscribe("AAPL", Duration::from_secs(30));

        assert!(!first.is_live());
        assert!(second.is_live());
        assert!(Arc::ptr_eq(
            &engine.subscription("AAPL").unwrap(),
            &second
        ));
    }
}

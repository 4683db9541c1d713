//! Challenge state engine.
//!
//! Fetches the session's challenges, resolves the current one, merges the
//! performance enrichment into a derived [`ChallengeSnapshot`], and exposes
//! an optimistic local-update path used right after a trade settles.
//!
//! The snapshot cell has two writers (periodic fetch, trade reconciliation)
//! and many readers. Writes are ordered by causality, not arrival: every
//! write bumps a monotonic version, a fetch captures the version when it is
//! issued, and a fetch whose captured version is no longer current discards
//! its result instead of regressing a fresher local update.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::gateway::types::{ChallengeDetails, ChallengeRecord};
use crate::gateway::ChallengeApi;
use crate::retry::{with_retry, RetryPolicy};
use crate::types::{ChallengeSnapshot, ChallengeStatus, RiskLimits, RuleTrigger};

/// Snapshot cell contents plus fetch bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct ChallengeState {
    pub snapshot: Option<ChallengeSnapshot>,
    pub loading: bool,
    pub error: Option<String>,
}

/// Optimistic local merge applied after a successful trade.
#[derive(Debug, Clone, Default)]
pub struct ChallengeUpdate {
    pub current_balance: Option<Decimal>,
    pub status: Option<ChallengeStatus>,
    pub trades_count: Option<u32>,
}

impl ChallengeSnapshot {
    /// Compose a snapshot from the coarse challenge record and the optional
    /// details enrichment. This is the single place where the backend's
    /// optional fields resolve: balance prefers the details block, the total
    /// P&L percent falls back to `(current - starting) / starting * 100`
    /// when performance data is missing, and daily figures default to zero.
    pub fn compose(
        record: &ChallengeRecord,
        details: Option<&ChallengeDetails>,
        limits: &RiskLimits,
    ) -> Self {
        let current_balance = details
            .and_then(|d| d.challenge.as_ref())
            .map(|c| c.current_balance)
            .unwrap_or(record.current_balance);

        let performance = details.and_then(|d| d.performance.as_ref());
        let (total_pnl, total_pnl_percent) = match performance {
            Some(p) => (p.total_pnl, p.total_pnl_percent),
            None => (
                current_balance - record.starting_balance,
                percent_of(current_balance - record.starting_balance, record.starting_balance),
            ),
        };
        let (daily_pnl, daily_pnl_percent) = match performance {
            Some(p) => (p.daily_pnl, p.daily_pnl_percent),
            None => (Decimal::ZERO, Decimal::ZERO),
        };

        Self {
            id: record.id,
            status: record.status,
            plan_type: record.plan_type.clone(),
            starting_balance: record.starting_balance,
            current_balance,
            total_pnl,
            total_pnl_percent,
            daily_pnl,
            daily_pnl_percent,
            daily_loss_used: loss_magnitude(daily_pnl_percent),
            max_loss_used: loss_magnitude(total_pnl_percent),
            progress_to_target: progress_to_target(total_pnl_percent, limits),
            trades_count: details.and_then(|d| d.trades_count).unwrap_or(0),
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }

    /// Re-derive the total-P&L figures after a balance change. Daily figures
    /// are left alone; the next authoritative fetch refreshes them.
    fn recompute_totals(&mut self, limits: &RiskLimits) {
        self.total_pnl = self.current_balance - self.starting_balance;
        self.total_pnl_percent = percent_of(self.total_pnl, self.starting_balance);
        self.max_loss_used = loss_magnitude(self.total_pnl_percent);
        self.progress_to_target = progress_to_target(self.total_pnl_percent, limits);
    }
}

fn percent_of(delta: Decimal, base: Decimal) -> Decimal {
    if base > Decimal::ZERO {
        delta / base * dec!(100)
    } else {
        Decimal::ZERO
    }
}

/// Loss magnitudes are non-negative; gains clamp to zero.
fn loss_magnitude(pnl_percent: Decimal) -> Decimal {
    pnl_percent.min(Decimal::ZERO).abs()
}

fn progress_to_target(total_pnl_percent: Decimal, limits: &RiskLimits) -> Decimal {
    if limits.profit_target_percent <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    (total_pnl_percent / limits.profit_target_percent * dec!(100))
        .max(Decimal::ZERO)
        .min(dec!(100))
}

/// Exclusive owner of the current challenge snapshot.
pub struct ChallengeStateEngine {
    api: Arc<dyn ChallengeApi>,
    policy: RetryPolicy,
    limits: RiskLimits,
    state: RwLock<ChallengeState>,
    /// Monotonic write version; see the module docs for the causality rule.
    version: AtomicU64,
}

impl ChallengeStateEngine {
    pub fn new(api: Arc<dyn ChallengeApi>, policy: RetryPolicy, limits: RiskLimits) -> Self {
        Self {
            api,
            policy,
            limits,
            state: RwLock::new(ChallengeState::default()),
            version: AtomicU64::new(0),
        }
    }

    /// Authoritative fetch: list challenges, select the current one, enrich
    /// with performance details. A listing failure keeps the previous
    /// snapshot; a details failure degrades to the coarse record.
    pub async fn fetch(&self, show_loading: bool) {
        let issued = self.version.load(Ordering::Acquire);
        if show_loading {
            if let Ok(mut state) = self.state.write() {
                state.loading = true;
            }
        }

        let api = self.api.clone();
        let listed = with_retry(&self.policy, || {
            let api = api.clone();
            async move { api.list_challenges().await }
        })
        .await;

        let records = match listed {
            Ok(records) => records,
            Err(error) => {
                warn!(error = %error, "challenge list fetch failed; keeping previous snapshot");
                if let Ok(mut state) = self.state.write() {
                    state.loading = false;
                    state.error = Some(error.to_string());
                }
                return;
            }
        };

        let snapshot = match Self::select(records) {
            None => None,
            Some(record) => {
                let details = match self.api.challenge_details(record.id).await {
                    Ok(details) => Some(details),
                    Err(error) => {
                        // Partial degradation: the coarse record is enough.
                        warn!(
                            challenge_id = record.id,
                            error = %error,
                            "challenge details unavailable; composing coarse snapshot"
                        );
                        None
                    }
                };
                Some(ChallengeSnapshot::compose(
                    &record,
                    details.as_ref(),
                    &self.limits,
                ))
            }
        };

        self.apply_fetched(snapshot, issued);
    }

    /// Deterministic selection: the `active` challenge if one exists, else
    /// the most recently created (`created_at` descending).
    fn select(mut records: Vec<ChallengeRecord>) -> Option<ChallengeRecord> {
        if let Some(pos) = records
            .iter()
            .position(|r| r.status == ChallengeStatus::Active)
        {
            return Some(records.swap_remove(pos));
        }
        records.into_iter().max_by_key(|r| r.created_at)
    }

    fn apply_fetched(&self, snapshot: Option<ChallengeSnapshot>, issued: u64) {
        let Ok(mut state) = self.state.write() else {
            return;
        };
        if self.version.load(Ordering::Acquire) != issued {
            // A local update landed while this fetch was in flight; the
            // fetch result is causally older even if it arrived later.
            debug!("discarding challenge fetch superseded by a local update");
            state.loading = false;
            return;
        }
        state.snapshot = snapshot;
        state.loading = false;
        state.error = None;
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    /// Optimistic local merge, visible immediately; used after a successful
    /// trade so consumers see the new balance before the next poll confirms
    /// it. No-op when no challenge is held.
    pub fn update(&self, update: ChallengeUpdate) {
        let Ok(mut state) = self.state.write() else {
            return;
        };
        let Some(snapshot) = state.snapshot.as_mut() else {
            return;
        };
        if let Some(balance) = update.current_balance {
            snapshot.current_balance = balance;
            snapshot.recompute_totals(&self.limits);
        }
        if let Some(status) = update.status {
            snapshot.status = status;
        }
        if let Some(count) = update.trades_count {
            snapshot.trades_count = count;
        }
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    pub fn state(&self) -> ChallengeState {
        self.state.read().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn snapshot(&self) -> Option<ChallengeSnapshot> {
        self.state.read().ok().and_then(|s| s.snapshot.clone())
    }

    pub fn error(&self) -> Option<String> {
        self.state.read().ok().and_then(|s| s.error.clone())
    }

    pub fn has_challenge(&self) -> bool {
        self.state
            .read()
            .map(|s| s.snapshot.is_some())
            .unwrap_or(false)
    }

    pub fn is_active(&self) -> bool {
        self.status() == Some(ChallengeStatus::Active)
    }

    pub fn is_passed(&self) -> bool {
        self.status() == Some(ChallengeStatus::Passed)
    }

    pub fn is_failed(&self) -> bool {
        self.status() == Some(ChallengeStatus::Failed)
    }

    fn status(&self) -> Option<ChallengeStatus> {
        self.state.read().ok().and_then(|s| s.snapshot.as_ref().map(|c| c.status))
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    /// Which risk rule the held snapshot currently violates, if any.
    /// Daily loss is reported before max loss when both are breached.
    pub fn breach(&self) -> Option<RuleTrigger> {
        let snapshot = self.snapshot()?;
        self.limits.evaluate(&snapshot)
    }
}

/// Handle for a background refresh loop.
pub struct PollHandle {
    live: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl PollHandle {
    pub fn stop(&self) {
        self.live.store(false, Ordering::Release);
        self.handle.abort();
    }
}

/// Silent-refresh loop: one immediate fetch, then every `interval`.
pub fn spawn_polling(engine: Arc<ChallengeStateEngine>, interval: Duration) -> PollHandle {
    let live = Arc::new(AtomicBool::new(true));
    let flag = live.clone();
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if !flag.load(Ordering::Acquire) {
                break;
            }
            engine.fetch(false).await;
        }
    });
    PollHandle { live, handle }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::types::{DetailsBalance, PerformanceMetrics};
    use crate::gateway::{GatewayError, MockChallengeApi};
    use chrono::{TimeZone, Utc};

    fn record(id: u64, status: ChallengeStatus, created_secs: i64) -> ChallengeRecord {
        ChallengeRecord {
            id,
            status,
            plan_type: Some("standard".to_string()),
            starting_balance: dec!(1000),
            current_balance: dec!(1000),
            created_at: Some(Utc.timestamp_opt(created_secs, 0).unwrap()),
            updated_at: None,
        }
    }

    fn details(balance: Decimal, daily_pct: Decimal, total_pct: Decimal) -> ChallengeDetails {
        ChallengeDetails {
            challenge: Some(DetailsBalance {
                current_balance: balance,
            }),
            performance: Some(PerformanceMetrics {
                total_pnl: Decimal::ZERO,
                total_pnl_percent: total_pct,
                daily_pnl: Decimal::ZERO,
                daily_pnl_percent: daily_pct,
            }),
            trades_count: Some(4),
        }
    }

    fn engine(api: MockChallengeApi) -> ChallengeStateEngine {
        ChallengeStateEngine::new(
            Arc::new(api),
            RetryPolicy {
                max_retries: 0,
                base_delay: Duration::from_millis(1),
            },
            RiskLimits::default(),
        )
    }

    #[test]
    fn test_selection_prefers_active_regardless_of_recency() {
        let records = vec![
            record(1, ChallengeStatus::Failed, 100),
            record(2, ChallengeStatus::Active, 200),
            record(3, ChallengeStatus::Passed, 300),
        ];
        let selected = ChallengeStateEngine::select(records).unwrap();
        assert_eq!(selected.id, 2);
    }

    #[test]
    fn test_selection_falls_back_to_most_recent() {
        let records = vec![
            record(1, ChallengeStatus::Failed, 100),
            record(3, ChallengeStatus::Passed, 300),
            record(2, ChallengeStatus::Failed, 200),
        ];
        let selected = ChallengeStateEngine::select(records).unwrap();
        assert_eq!(selected.id, 3);

        assert!(ChallengeStateEngine::select(Vec::new()).is_none());
    }

    #[test]
    fn test_loss_magnitudes_clamp_gains_to_zero() {
        let rec = record(1, ChallengeStatus::Active, 100);
        let snap = ChallengeSnapshot::compose(
            &rec,
            Some(&details(dec!(1032), dec!(3.2), dec!(3.2))),
            &RiskLimits::default(),
        );
        assert_eq!(snap.daily_loss_used, Decimal::ZERO);
        assert_eq!(snap.max_loss_used, Decimal::ZERO);
        assert_eq!(snap.progress_to_target, dec!(32));

        let snap = ChallengeSnapshot::compose(
            &rec,
            Some(&details(dec!(968), dec!(-3.2), dec!(-3.2))),
            &RiskLimits::default(),
        );
        assert_eq!(snap.daily_loss_used, dec!(3.2));
        assert_eq!(snap.max_loss_used, dec!(3.2));
        assert_eq!(snap.progress_to_target, Decimal::ZERO);
    }

    #[test]
    fn test_progress_to_target_clamps_at_100() {
        let rec = record(1, ChallengeStatus::Active, 100);
        let snap = ChallengeSnapshot::compose(
            &rec,
            Some(&details(dec!(1150), dec!(1), dec!(15))),
            &RiskLimits::default(),
        );
        assert_eq!(snap.progress_to_target, dec!(100));
    }

    #[test]
    fn test_compose_without_details_falls_back_to_balances() {
        let mut rec = record(1, ChallengeStatus::Active, 100);
        rec.current_balance = dec!(950);
        let snap = ChallengeSnapshot::compose(&rec, None, &RiskLimits::default());
        assert_eq!(snap.current_balance, dec!(950));
        assert_eq!(snap.total_pnl, dec!(-50));
        assert_eq!(snap.total_pnl_percent, dec!(-5));
        assert_eq!(snap.max_loss_used, dec!(5));
        assert_eq!(snap.daily_pnl_percent, Decimal::ZERO);
        assert_eq!(snap.trades_count, 0);
    }

    #[tokio::test]
    async fn test_details_failure_degrades_gracefully() {
        let mut api = MockChallengeApi::new();
        api.expect_list_challenges()
            .returning(|| Ok(vec![record(7, ChallengeStatus::Active, 100)]));
        api.expect_challenge_details().returning(|_| {
            Err(GatewayError::Server {
                status: 500,
                message: "Internal Server Error".to_string(),
            })
        });

        let engine = engine(api);
        engine.fetch(true).await;

        let snap = engine.snapshot().unwrap();
        assert_eq!(snap.id, 7);
        assert!(engine.is_active());
        assert!(engine.error().is_none());
    }

    #[tokio::test]
    async fn test_list_failure_keeps_previous_snapshot() {
        let mut api = MockChallengeApi::new();
        let mut seq = mockall::Sequence::new();
        api.expect_list_challenges()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(vec![record(7, ChallengeStatus::Active, 100)]));
        api.expect_challenge_details()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(details(dec!(990), dec!(-1), dec!(-1))));
        api.expect_list_challenges()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Err(GatewayError::Timeout));

        let engine = engine(api);
        engine.fetch(true).await;
        assert_eq!(engine.snapshot().unwrap().current_balance, dec!(990));

        engine.fetch(false).await;
        // Stale-but-available: snapshot retained, error surfaced.
        assert_eq!(engine.snapshot().unwrap().current_balance, dec!(990));
        assert!(engine.error().is_some());
    }

    #[tokio::test]
    async fn test_empty_list_clears_snapshot() {
        let mut api = MockChallengeApi::new();
        api.expect_list_challenges().returning(|| Ok(Vec::new()));

        let engine = engine(api);
        engine.fetch(true).await;
        assert!(!engine.has_challenge());
        assert!(!engine.is_active());
    }

    #[tokio::test]
    async fn test_stale_fetch_does_not_overwrite_local_update() {
        let mut api = MockChallengeApi::new();
        api.expect_list_challenges()
            .returning(|| Ok(vec![record(7, ChallengeStatus::Active, 100)]));
        api.expect_challenge_details()
            .returning(|_| Ok(details(dec!(1000), Decimal::ZERO, Decimal::ZERO)));

        let engine = engine(api);
        engine.fetch(true).await;
        assert_eq!(engine.snapshot().unwrap().current_balance, dec!(1000));

        // Simulate a fetch issued before the trade: capture the version,
        // apply the trade's optimistic update, then try to land the fetch.
        let issued = engine.version.load(Ordering::Acquire);
        engine.update(ChallengeUpdate {
            current_balance: Some(dec!(900)),
            status: None,
            trades_count: Some(5),
        });

        let pre_trade = ChallengeSnapshot::compose(
            &record(7, ChallengeStatus::Active, 100),
            Some(&details(dec!(1000), Decimal::ZERO, Decimal::ZERO)),
            engine.limits(),
        );
        engine.apply_fetched(Some(pre_trade), issued);

        let snap = engine.snapshot().unwrap();
        assert_eq!(snap.current_balance, dec!(900));
        assert_eq!(snap.trades_count, 5);
    }

    #[tokio::test]
    async fn test_update_recomputes_total_derived_fields() {
        let mut api = MockChallengeApi::new();
        api.expect_list_challenges()
            .returning(|| Ok(vec![record(7, ChallengeStatus::Active, 100)]));
        api.expect_challenge_details()
            .returning(|_| Ok(details(dec!(1000), Decimal::ZERO, Decimal::ZERO)));

        let engine = engine(api);
        engine.fetch(true).await;

        engine.update(ChallengeUpdate {
            current_balance: Some(dec!(880)),
            status: None,
            trades_count: None,
        });

        let snap = engine.snapshot().unwrap();
        assert_eq!(snap.total_pnl, dec!(-120));
        assert_eq!(snap.total_pnl_percent, dec!(-12));
        assert_eq!(snap.max_loss_used, dec!(12));
        assert_eq!(engine.breach(), Some(crate::types::RuleTrigger::MaxLoss));
    }
}

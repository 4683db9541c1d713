//! Core types used throughout TradeDesk
//!
//! Domain data for quotes, challenge snapshots, risk limits, and orders.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The most recently observed price for a symbol.
///
/// Immutable once received; a newer quote for the same symbol supersedes it,
/// never mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub price: Decimal,
    pub market: Option<String>,
    pub currency: String,
    pub observed_at: DateTime<Utc>,
}

/// Challenge lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Active,
    Passed,
    Failed,
}

impl ChallengeStatus {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "active" => Some(ChallengeStatus::Active),
            "passed" => Some(ChallengeStatus::Passed),
            "failed" => Some(ChallengeStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ChallengeStatus::Active)
    }
}

impl fmt::Display for ChallengeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChallengeStatus::Active => write!(f, "active"),
            ChallengeStatus::Passed => write!(f, "passed"),
            ChallengeStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Derived, read-mostly view of the current challenge.
///
/// `daily_loss_used` and `max_loss_used` are non-negative loss magnitudes:
/// gains clamp to zero. `progress_to_target` is the total P&L percent scaled
/// against the profit target, clamped to [0, 100].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeSnapshot {
    pub id: u64,
    pub status: ChallengeStatus,
    pub plan_type: Option<String>,
    pub starting_balance: Decimal,
    pub current_balance: Decimal,
    pub total_pnl: Decimal,
    pub total_pnl_percent: Decimal,
    pub daily_pnl: Decimal,
    pub daily_pnl_percent: Decimal,
    pub daily_loss_used: Decimal,
    pub max_loss_used: Decimal,
    pub progress_to_target: Decimal,
    pub trades_count: u32,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Challenge risk rules. Constant for the lifetime of a challenge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskLimits {
    pub daily_loss_limit_percent: Decimal,
    pub max_loss_limit_percent: Decimal,
    pub profit_target_percent: Decimal,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            daily_loss_limit_percent: dec!(5),
            max_loss_limit_percent: dec!(10),
            profit_target_percent: dec!(10),
        }
    }
}

/// Which risk rule a snapshot has crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleTrigger {
    DailyLoss,
    MaxLoss,
    ProfitTarget,
}

impl fmt::Display for RuleTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleTrigger::DailyLoss => write!(f, "max_daily_loss"),
            RuleTrigger::MaxLoss => write!(f, "max_total_loss"),
            RuleTrigger::ProfitTarget => write!(f, "profit_target"),
        }
    }
}

impl RiskLimits {
    /// Report the first rule a snapshot violates, if any.
    ///
    /// Daily loss is checked before max loss: when both limits are breached
    /// in the same evaluation, the daily-loss rule is reported as the cause.
    pub fn evaluate(&self, snapshot: &ChallengeSnapshot) -> Option<RuleTrigger> {
        if snapshot.daily_loss_used > self.daily_loss_limit_percent {
            return Some(RuleTrigger::DailyLoss);
        }
        if snapshot.max_loss_used > self.max_loss_limit_percent {
            return Some(RuleTrigger::MaxLoss);
        }
        if snapshot.total_pnl_percent > self.profit_target_percent {
            return Some(RuleTrigger::ProfitTarget);
        }
        None
    }
}

/// Trade direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "buy"),
            OrderSide::Sell => write!(f, "sell"),
        }
    }
}

/// Order pricing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

/// A proposed order. Constructed, validated, submitted, and discarded per
/// attempt; never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub challenge_id: u64,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub order_type: OrderType,
    pub limit_price: Option<Decimal>,
}

/// Notification emitted after a successful trade has been reconciled into
/// the challenge state. Trade-history consumers refresh on this.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeExecuted {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub executed_price: Decimal,
    pub total: Decimal,
    pub new_balance: Option<Decimal>,
    pub executed_at: DateTime<Utc>,
}

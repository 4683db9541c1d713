//! Trade execution coordinator.
//!
//! Owns the order lifecycle: local validation, the large-order confirmation
//! gate, submission, and reconciliation of the result into the challenge
//! state. At most one order is in flight per coordinator; a second submit
//! while one is pending reports [`SubmitOutcome::Busy`] instead of queueing.
//!
//! Order submission is deliberately never retried. A timed-out execute call
//! may still have filled on the backend, and resubmitting would risk a
//! duplicate fill; the caller decides whether to try again.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::challenge::{ChallengeStateEngine, ChallengeUpdate};
use crate::gateway::types::{ExecuteTradeRequest, TradeRecord};
use crate::gateway::{GatewayError, TradeApi};
use crate::types::{ChallengeStatus, OrderRequest, OrderSide, OrderType, TradeExecuted};

/// Orders whose estimated value exceeds this require explicit confirmation.
/// Exclusive bound: a total of exactly 1000 submits directly.
pub const CONFIRMATION_THRESHOLD: Decimal = dec!(1000);

/// Order lifecycle phase. Anything other than `Idle` blocks new submissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderPhase {
    Idle,
    Validating,
    ConfirmationPending,
    Submitting,
}

/// Local pre-submission failures. None of these reach the backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("No challenge selected")]
    NoChallenge,
    #[error("Challenge is not active")]
    ChallengeNotActive,
    #[error("Please select a symbol")]
    MissingSymbol,
    #[error("Quantity must be greater than zero")]
    InvalidQuantity,
    #[error("No market price available for this symbol")]
    NoPrice,
    #[error("Insufficient balance for this trade")]
    InsufficientBalance,
}

/// What a successful submission produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    pub message: String,
    pub executed_price: Decimal,
    pub total: Decimal,
    pub new_balance: Option<Decimal>,
    pub status: Option<ChallengeStatus>,
}

/// Result of a submit or confirm call that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    Executed(ExecutionReport),
    /// Estimated total crossed [`CONFIRMATION_THRESHOLD`]; the order is
    /// parked until `confirm` or `cancel`.
    ConfirmationRequired { estimated_total: Decimal },
    /// The backend declined the order. The order was not filled.
    Rejected { message: String },
    /// Another order is already in flight.
    Busy,
}

struct PendingOrder {
    order: OrderRequest,
    resolved_price: Decimal,
}

pub struct TradeExecutionCoordinator {
    api: Arc<dyn TradeApi>,
    challenge: Arc<ChallengeStateEngine>,
    phase: Mutex<OrderPhase>,
    pending: Mutex<Option<PendingOrder>>,
    events: mpsc::UnboundedSender<TradeExecuted>,
}

impl TradeExecutionCoordinator {
    /// The returned receiver observes every reconciled trade; by the time an
    /// event arrives, the challenge snapshot already reflects it.
    pub fn new(
        api: Arc<dyn TradeApi>,
        challenge: Arc<ChallengeStateEngine>,
    ) -> (Self, mpsc::UnboundedReceiver<TradeExecuted>) {
        let (events, receiver) = mpsc::unbounded_channel();
        (
            Self {
                api,
                challenge,
                phase: Mutex::new(OrderPhase::Idle),
                pending: Mutex::new(None),
                events,
            },
            receiver,
        )
    }

    pub fn phase(&self) -> OrderPhase {
        self.phase
            .lock()
            .map(|p| *p)
            .unwrap_or(OrderPhase::Idle)
    }

    fn set_phase(&self, phase: OrderPhase) {
        if let Ok(mut current) = self.phase.lock() {
            *current = phase;
        }
    }

    /// Atomically claim the coordinator if idle.
    fn try_begin(&self) -> bool {
        let Ok(mut phase) = self.phase.lock() else {
            return false;
        };
        if *phase != OrderPhase::Idle {
            return false;
        }
        *phase = OrderPhase::Validating;
        true
    }

    /// Validate and submit an order. Market orders price against
    /// `quote_price`; limit orders price against their own limit.
    pub async fn submit(
        &self,
        order: OrderRequest,
        quote_price: Decimal,
    ) -> Result<SubmitOutcome, ValidationError> {
        if !self.try_begin() {
            return Ok(SubmitOutcome::Busy);
        }

        // Limit orders price against their limit, market orders against the
        // live quote.
        let resolved_price = match order.order_type {
            OrderType::Limit => order.limit_price.unwrap_or(Decimal::ZERO),
            OrderType::Market => quote_price,
        };

        if let Err(error) = self.validate(&order, resolved_price) {
            self.set_phase(OrderPhase::Idle);
            return Err(error);
        }

        let estimated_total = order.quantity * resolved_price;
        if estimated_total > CONFIRMATION_THRESHOLD {
            if let Ok(mut pending) = self.pending.lock() {
                *pending = Some(PendingOrder {
                    order,
                    resolved_price,
                });
            }
            self.set_phase(OrderPhase::ConfirmationPending);
            info!(
                total = %estimated_total.round_dp(2),
                "large order parked pending confirmation"
            );
            return Ok(SubmitOutcome::ConfirmationRequired { estimated_total });
        }

        self.set_phase(OrderPhase::Submitting);
        Ok(self.do_submit(order, resolved_price).await)
    }

    /// Release a confirmation-gated order to the backend.
    pub async fn confirm(&self) -> SubmitOutcome {
        {
            let Ok(mut phase) = self.phase.lock() else {
                return SubmitOutcome::Busy;
            };
            if *phase != OrderPhase::ConfirmationPending {
                return SubmitOutcome::Busy;
            }
            *phase = OrderPhase::Submitting;
        }
        let parked = self.pending.lock().ok().and_then(|mut p| p.take());
        match parked {
            Some(PendingOrder {
                order,
                resolved_price,
            }) => self.do_submit(order, resolved_price).await,
            None => {
                self.set_phase(OrderPhase::Idle);
                SubmitOutcome::Busy
            }
        }
    }

    /// Discard a confirmation-gated order. Nothing was sent.
    pub fn cancel(&self) {
        let Ok(mut phase) = self.phase.lock() else {
            return;
        };
        if *phase != OrderPhase::ConfirmationPending {
            return;
        }
        if let Ok(mut pending) = self.pending.lock() {
            *pending = None;
        }
        *phase = OrderPhase::Idle;
    }

    fn validate(&self, order: &OrderRequest, price: Decimal) -> Result<(), ValidationError> {
        let snapshot = self
            .challenge
            .snapshot()
            .ok_or(ValidationError::NoChallenge)?;
        if snapshot.status != ChallengeStatus::Active {
            return Err(ValidationError::ChallengeNotActive);
        }
        if order.symbol.trim().is_empty() {
            return Err(ValidationError::MissingSymbol);
        }
        if order.quantity <= Decimal::ZERO {
            return Err(ValidationError::InvalidQuantity);
        }
        if price <= Decimal::ZERO {
            return Err(ValidationError::NoPrice);
        }
        // Buys are capped by the available balance; sells are not, the
        // backend is authoritative for position feasibility.
        if order.side == OrderSide::Buy && order.quantity * price > snapshot.current_balance {
            return Err(ValidationError::InsufficientBalance);
        }
        Ok(())
    }

    /// Single submission attempt, then reconciliation. The challenge state
    /// is updated before the event is emitted so that event consumers always
    /// observe the post-trade snapshot.
    async fn do_submit(&self, order: OrderRequest, resolved_price: Decimal) -> SubmitOutcome {
        let request = ExecuteTradeRequest {
            challenge_id: order.challenge_id,
            symbol: order.symbol.clone(),
            action: order.side,
            quantity: order.quantity,
        };

        let response = self.api.execute_trade(&request).await;
        let outcome = match response {
            Ok(response) => {
                let executed_price = response
                    .price_info
                    .as_ref()
                    .map(|p| p.price_used)
                    .unwrap_or(resolved_price);
                let total = order.quantity * executed_price;
                let new_balance = response.resolved_balance();
                let status = response.resolved_status();

                let trades_count = self
                    .challenge
                    .snapshot()
                    .map(|s| s.trades_count + 1);
                self.challenge.update(ChallengeUpdate {
                    current_balance: new_balance,
                    status,
                    trades_count,
                });

                let event = TradeExecuted {
                    symbol: order.symbol.clone(),
                    side: order.side,
                    quantity: order.quantity,
                    executed_price,
                    total,
                    new_balance,
                    executed_at: chrono::Utc::now(),
                };
                // Receiver may be gone during shutdown.
                let _ = self.events.send(event);

                let message = match status {
                    Some(ChallengeStatus::Passed) => {
                        "Challenge PASSED! Profit target reached.".to_string()
                    }
                    Some(ChallengeStatus::Failed) => {
                        "Challenge FAILED. A risk limit was breached.".to_string()
                    }
                    _ => format!(
                        "{} {} {} @ ${} (Total: ${})",
                        order.side.to_string().to_uppercase(),
                        order.quantity,
                        order.symbol,
                        executed_price.round_dp(2),
                        total.round_dp(2)
                    ),
                };
                info!(
                    symbol = %order.symbol,
                    side = %order.side,
                    quantity = %order.quantity,
                    price = %executed_price,
                    "trade executed"
                );
                SubmitOutcome::Executed(ExecutionReport {
                    message,
                    executed_price,
                    total,
                    new_balance,
                    status,
                })
            }
            Err(error) => {
                let message = error
                    .business_message()
                    .map(str::to_string)
                    .unwrap_or_else(|| error.to_string());
                warn!(symbol = %order.symbol, error = %error, "trade rejected");
                SubmitOutcome::Rejected { message }
            }
        };

        self.set_phase(OrderPhase::Idle);
        outcome
    }

    /// Trade history for the current challenge, newest first as the backend
    /// returns it.
    pub async fn trade_history(&self) -> Result<Vec<TradeRecord>, GatewayError> {
        let challenge_id = self
            .challenge
            .snapshot()
            .map(|s| s.id)
            .ok_or(GatewayError::Rejected {
                status: 0,
                message: ValidationError::NoChallenge.to_string(),
            })?;
        Ok(self.api.trade_history(challenge_id).await?.trades)
    }
}

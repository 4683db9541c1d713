//! Fetch gateway: authenticated request layer to the challenge backend.
//!
//! The gateway injects the bearer credential, normalizes every failure into
//! [`GatewayError`], and surfaces 401 as a session-expiry condition owned by
//! the session collaborator. Engines depend on the narrow API traits below,
//! never on the concrete client, so they can be tested against fakes.

pub mod client;
pub mod error;
pub mod types;

pub use client::{FetchGateway, SessionContext};
pub use error::GatewayError;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use types::{
    ChallengeDetails, ChallengeRecord, ExecuteTradeRequest, ExecuteTradeResponse, HistoryResponse,
    PriceResponse, TradeHistoryResponse,
};

/// Per-symbol quote and chart-history access.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MarketDataApi: Send + Sync {
    async fn fetch_price(&self, symbol: &str) -> Result<PriceResponse, GatewayError>;

    async fn fetch_history(
        &self,
        symbol: &str,
        period: &str,
        interval: &str,
    ) -> Result<HistoryResponse, GatewayError>;
}

/// Challenge listing and performance enrichment.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChallengeApi: Send + Sync {
    async fn list_challenges(&self) -> Result<Vec<ChallengeRecord>, GatewayError>;

    async fn challenge_details(&self, challenge_id: u64)
        -> Result<ChallengeDetails, GatewayError>;
}

/// Order submission and trade history.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TradeApi: Send + Sync {
    async fn execute_trade(
        &self,
        request: &ExecuteTradeRequest,
    ) -> Result<ExecuteTradeResponse, GatewayError>;

    async fn trade_history(&self, challenge_id: u64)
        -> Result<TradeHistoryResponse, GatewayError>;
}

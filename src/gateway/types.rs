//! Wire DTOs for the backend HTTP contract.
//!
//! The backend leaves several fields optional or duck-typed (`time` vs
//! `timestamp`, `new_balance` vs `challenge.current_balance`). Each of those
//! gets an explicit `Option` here and exactly one documented resolution rule
//! on the DTO, so call sites never re-derive fallbacks ad hoc.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{ChallengeStatus, OrderSide, Quote};

/// Timestamps arrive either as RFC 3339 or as naive ISO strings (the backend
/// serializes UTC without an offset). Parsed leniently, unparseable → `None`.
pub(crate) mod flexible_time {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(de: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(de)?;
        Ok(raw.as_deref().and_then(parse))
    }

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(dt.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
            .ok()
            .map(|naive| DateTime::from_naive_utc_and_offset(naive, Utc))
    }
}

/// `GET /market/price/{symbol}`
#[derive(Debug, Clone, Deserialize)]
pub struct PriceResponse {
    pub symbol: String,
    pub current_price: Decimal,
    #[serde(default)]
    pub market: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default, deserialize_with = "flexible_time::deserialize")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl PriceResponse {
    /// Currency defaults to USD, observation time to now.
    pub fn into_quote(self) -> Quote {
        Quote {
            symbol: self.symbol,
            price: self.current_price,
            market: self.market,
            currency: self.currency.unwrap_or_else(|| "USD".to_string()),
            observed_at: self.timestamp.unwrap_or_else(Utc::now),
        }
    }
}

/// One point of `GET /market/history/{symbol}`.
///
/// A point carries `time` or `timestamp`, and either OHLC fields or a bare
/// `value`. Resolution: timestamp is `time` else `timestamp`; a point is a
/// candle when `close` is present, else a plain value point.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryPoint {
    #[serde(default)]
    pub time: Option<i64>,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub open: Option<Decimal>,
    #[serde(default)]
    pub high: Option<Decimal>,
    #[serde(default)]
    pub low: Option<Decimal>,
    #[serde(default)]
    pub close: Option<Decimal>,
    #[serde(default)]
    pub value: Option<Decimal>,
}

impl HistoryPoint {
    pub fn resolved_time(&self) -> Option<i64> {
        self.time.or(self.timestamp)
    }

    pub fn close_value(&self) -> Option<Decimal> {
        self.close.or(self.value)
    }
}

/// `GET /market/history/{symbol}?period&interval`
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryResponse {
    pub symbol: String,
    #[serde(default)]
    pub period: Option<String>,
    #[serde(default)]
    pub interval: Option<String>,
    #[serde(default)]
    pub count: Option<usize>,
    #[serde(default)]
    pub data: Vec<HistoryPoint>,
}

/// One entry of `GET /challenges`.
#[derive(Debug, Clone, Deserialize)]
pub struct ChallengeRecord {
    pub id: u64,
    pub status: ChallengeStatus,
    #[serde(default)]
    pub plan_type: Option<String>,
    pub starting_balance: Decimal,
    pub current_balance: Decimal,
    #[serde(default, deserialize_with = "flexible_time::deserialize")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "flexible_time::deserialize")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// `GET /challenges`
#[derive(Debug, Clone, Deserialize)]
pub struct ChallengesResponse {
    #[serde(default)]
    pub challenges: Vec<ChallengeRecord>,
}

/// Performance block of the challenge details payload. All fields default to
/// zero so a sparse payload still composes into a snapshot.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PerformanceMetrics {
    #[serde(default)]
    pub total_pnl: Decimal,
    #[serde(default)]
    pub total_pnl_percent: Decimal,
    #[serde(default)]
    pub daily_pnl: Decimal,
    #[serde(default)]
    pub daily_pnl_percent: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetailsBalance {
    pub current_balance: Decimal,
}

/// `GET /trades/challenges/{id}`: the performance enrichment call. Its
/// failure degrades the snapshot rather than failing the fetch, so every
/// field here is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChallengeDetails {
    #[serde(default)]
    pub challenge: Option<DetailsBalance>,
    #[serde(default)]
    pub performance: Option<PerformanceMetrics>,
    #[serde(default)]
    pub trades_count: Option<u32>,
}

/// `POST /trades/execute` body.
#[derive(Debug, Clone, Serialize)]
pub struct ExecuteTradeRequest {
    pub challenge_id: u64,
    pub symbol: String,
    pub action: OrderSide,
    #[serde(with = "rust_decimal::serde::float")]
    pub quantity: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PriceInfo {
    pub price_used: Decimal,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub market: Option<String>,
}

/// Challenge block the execute endpoint may attach alongside the flat fields.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutedChallenge {
    pub id: u64,
    pub current_balance: Decimal,
    pub status: ChallengeStatus,
    #[serde(default)]
    pub pnl_percent: Option<Decimal>,
}

/// `POST /trades/execute` response.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteTradeResponse {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub price_info: Option<PriceInfo>,
    #[serde(default)]
    pub new_balance: Option<Decimal>,
    #[serde(default)]
    pub challenge_status: Option<ChallengeStatus>,
    #[serde(default)]
    pub challenge: Option<ExecutedChallenge>,
}

impl ExecuteTradeResponse {
    /// Flat `new_balance` wins over the nested challenge block.
    pub fn resolved_balance(&self) -> Option<Decimal> {
        self.new_balance
            .or_else(|| self.challenge.as_ref().map(|c| c.current_balance))
    }

    /// Flat `challenge_status` wins over the nested challenge block.
    pub fn resolved_status(&self) -> Option<ChallengeStatus> {
        self.challenge_status
            .or_else(|| self.challenge.as_ref().map(|c| c.status))
    }
}

/// One entry of `GET /trades/history/{id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct TradeRecord {
    pub id: u64,
    pub symbol: String,
    pub action: OrderSide,
    pub quantity: Decimal,
    pub price: Decimal,
    #[serde(default)]
    pub total_value: Option<Decimal>,
    #[serde(default)]
    pub balance_after_trade: Option<Decimal>,
    #[serde(default, deserialize_with = "flexible_time::deserialize")]
    pub created_at: Option<DateTime<Utc>>,
}

/// `GET /trades/history/{id}`
#[derive(Debug, Clone, Deserialize)]
pub struct TradeHistoryResponse {
    #[serde(default)]
    pub trades: Vec<TradeRecord>,
    #[serde(default)]
    pub count: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_price_response_defaults() {
        let json = r#"{"symbol":"AAPL","current_price":101.5,"market":"NASDAQ"}"#;
        let resp: PriceResponse = serde_json::from_str(json).unwrap();
        let quote = resp.into_quote();
        assert_eq!(quote.price, dec!(101.5));
        assert_eq!(quote.currency, "USD");
        assert_eq!(quote.market.as_deref(), Some("NASDAQ"));
    }

    #[test]
    fn test_flexible_time_accepts_naive_iso() {
        assert!(flexible_time::parse("2026-08-26T09:30:00").is_some());
        assert!(flexible_time::parse("2026-08-26T09:30:00.123456").is_some());
        assert!(flexible_time::parse("2026-08-26T09:30:00Z").is_some());
        assert!(flexible_time::parse("not a date").is_none());
    }

    #[test]
    fn test_history_point_resolution() {
        let json = r#"{"timestamp":1724650200,"value":101.5}"#;
        let point: HistoryPoint = serde_json::from_str(json).unwrap();
        assert_eq!(point.resolved_time(), Some(1724650200));
        assert_eq!(point.close_value(), Some(dec!(101.5)));

        let json = r#"{"time":1,"open":1,"high":2,"low":0.5,"close":1.5}"#;
        let point: HistoryPoint = serde_json::from_str(json).unwrap();
        assert_eq!(point.close_value(), Some(dec!(1.5)));
    }

    #[test]
    fn test_execute_response_resolution() {
        let json = r#"{
            "message": "Trade executed successfully",
            "price_info": {"price_used": 101.75},
            "challenge": {"id": 7, "current_balance": 493.75, "status": "active"}
        }"#;
        let resp: ExecuteTradeResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.resolved_balance(), Some(dec!(493.75)));
        assert_eq!(resp.resolved_status(), Some(ChallengeStatus::Active));

        // Flat fields win when both shapes are present.
        let json = r#"{
            "price_info": {"price_used": 50},
            "new_balance": 900,
            "challenge_status": "failed",
            "challenge": {"id": 7, "current_balance": 910, "status": "active"}
        }"#;
        let resp: ExecuteTradeResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.resolved_balance(), Some(dec!(900)));
        assert_eq!(resp.resolved_status(), Some(ChallengeStatus::Failed));
    }

    #[test]
    fn test_execute_request_serializes_quantity_as_number() {
        let req = ExecuteTradeRequest {
            challenge_id: 7,
            symbol: "AAPL".to_string(),
            action: OrderSide::Buy,
            quantity: dec!(5),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["action"], "buy");
        assert!(json["quantity"].is_number());
    }
}

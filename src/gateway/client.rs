//! HTTP client for the challenge backend.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

use super::error::GatewayError;
use super::types::{
    ChallengeDetails, ChallengeRecord, ChallengesResponse, ExecuteTradeRequest,
    ExecuteTradeResponse, HistoryResponse, PriceResponse, TradeHistoryResponse,
};
use super::{ChallengeApi, MarketDataApi, TradeApi};

/// Hook invoked when the backend reports the session is no longer valid.
pub type ExpiryHook = Box<dyn Fn() + Send + Sync>;

/// Explicit session state passed to the gateway constructor.
///
/// Replaces any ambient token global: the gateway reads the bearer credential
/// from here per request, and on a 401 clears it and fires the expiry hook.
pub struct SessionContext {
    token: RwLock<Option<String>>,
    on_expired: Option<ExpiryHook>,
}

impl SessionContext {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: RwLock::new(token),
            on_expired: None,
        }
    }

    pub fn with_expiry_hook(token: Option<String>, hook: ExpiryHook) -> Self {
        Self {
            token: RwLock::new(token),
            on_expired: Some(hook),
        }
    }

    pub fn set_token(&self, token: Option<String>) {
        if let Ok(mut slot) = self.token.write() {
            *slot = token;
        }
    }

    pub fn bearer(&self) -> Option<String> {
        self.token.read().ok().and_then(|t| t.clone())
    }

    fn expire(&self) {
        self.set_token(None);
        if let Some(hook) = &self.on_expired {
            hook();
        }
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("has_token", &self.bearer().is_some())
            .finish()
    }
}

/// Authenticated request layer for the challenge backend.
pub struct FetchGateway {
    client: Client,
    base_url: String,
    session: Arc<SessionContext>,
}

impl FetchGateway {
    /// The timeout is a fixed upper bound sized for a cold-start-tolerant
    /// backend; a timeout classifies as retryable like any other transient
    /// failure.
    pub fn new(base_url: &str, session: Arc<SessionContext>, timeout: Duration) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            session,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        match self.session.bearer() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, GatewayError> {
        let response = request.send().await.map_err(transport_error)?;
        self.decode(response).await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, GatewayError> {
        self.send(self.authed(self.client.get(self.url(path)))).await
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, GatewayError> {
        self.send(self.authed(self.client.post(self.url(path)).json(body)))
            .await
    }

    async fn decode<T: DeserializeOwned>(&self, response: Response) -> Result<T, GatewayError> {
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED {
            warn!("backend returned 401; clearing session");
            self.session.expire();
            return Err(GatewayError::SessionExpired);
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = extract_error_message(&body)
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string());
            debug!(status = status.as_u16(), message = %message, "backend error response");
            return Err(if status.is_server_error() {
                GatewayError::Server {
                    status: status.as_u16(),
                    message,
                }
            } else {
                GatewayError::Rejected {
                    status: status.as_u16(),
                    message,
                }
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))
    }
}

fn transport_error(error: reqwest::Error) -> GatewayError {
    if error.is_timeout() {
        GatewayError::Timeout
    } else {
        GatewayError::Network(error.to_string())
    }
}

/// Pull the most specific message out of a `{ error, message }` body:
/// business `message` over `error` over nothing.
fn extract_error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    for key in ["message", "error"] {
        if let Some(text) = value.get(key).and_then(|v| v.as_str()) {
            if !text.trim().is_empty() {
                return Some(text.to_string());
            }
        }
    }
    None
}

fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_uppercase()
}

#[async_trait]
impl MarketDataApi for FetchGateway {
    async fn fetch_price(&self, symbol: &str) -> Result<PriceResponse, GatewayError> {
        let path = format!("/market/price/{}", normalize_symbol(symbol));
        self.get_json(&path).await
    }

    async fn fetch_history(
        &self,
        symbol: &str,
        period: &str,
        interval: &str,
    ) -> Result<HistoryResponse, GatewayError> {
        let path = format!("/market/history/{}", normalize_symbol(symbol));
        let request = self
            .client
            .get(self.url(&path))
            .query(&[("period", period), ("interval", interval)]);
        self.send(self.authed(request)).await
    }
}

#[async_trait]
impl ChallengeApi for FetchGateway {
    async fn list_challenges(&self) -> Result<Vec<ChallengeRecord>, GatewayError> {
        let response: ChallengesResponse = self.get_json("/challenges").await?;
        Ok(response.challenges)
    }

    async fn challenge_details(
        &self,
        challenge_id: u64,
    ) -> Result<ChallengeDetails, GatewayError> {
        let path = format!("/trades/challenges/{challenge_id}");
        self.get_json(&path).await
    }
}

#[async_trait]
impl TradeApi for FetchGateway {
    async fn execute_trade(
        &self,
        request: &ExecuteTradeRequest,
    ) -> Result<ExecuteTradeResponse, GatewayError> {
        self.post_json("/trades/execute", request).await
    }

    async fn trade_history(
        &self,
        challenge_id: u64,
    ) -> Result<TradeHistoryResponse, GatewayError> {
        let path = format!("/trades/history/{challenge_id}");
        self.get_json(&path).await
    }
}

//! TradeDesk entry point.
//!
//! Headless runner: keeps the configured watchlist quotes live, polls the
//! current challenge, and logs a status line per refresh cycle. Order entry
//! goes through the library's execution coordinator.

use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tradedesk::challenge::{spawn_polling, ChallengeStateEngine};
use tradedesk::config::AppConfig;
use tradedesk::gateway::{FetchGateway, SessionContext};
use tradedesk::price_sync::PriceSyncEngine;

#[tokio::main]
async fn main() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tradedesk=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = AppConfig::load()?;
    config.validate_env()?;
    info!("Starting TradeDesk: {}", config.digest());

    let token = std::env::var("TRADEDESK_API_TOKEN").ok();
    let session = Arc::new(SessionContext::with_expiry_hook(
        token,
        Box::new(|| {
            warn!("Session expired; set a fresh TRADEDESK_API_TOKEN and restart");
        }),
    ));
    let gateway = Arc::new(FetchGateway::new(
        &config.gateway.base_url,
        session,
        config.request_timeout(),
    ));

    let prices = PriceSyncEngine::new(gateway.clone(), config.retry_policy());
    for symbol in &config.app.watchlist {
        prices.subscribe(symbol, config.price_interval());
    }

    let challenges = Arc::new(ChallengeStateEngine::new(
        gateway,
        config.retry_policy(),
        config.risk_limits(),
    ));
    challenges.fetch(true).await;
    let poller = spawn_polling(challenges.clone(), config.challenge_refresh());

    let mut status = tokio::time::interval(config.challenge_refresh());
    loop {
        tokio::select! {
            _ = status.tick() => {
                log_status(&config, &prices, &challenges);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    poller.stop();
    prices.stop_all();
    info!("TradeDesk stopped");
    Ok(())
}

fn log_status(config: &AppConfig, prices: &PriceSyncEngine, challenges: &Arc<ChallengeStateEngine>) {
    for symbol in &config.app.watchlist {
        if let Some(sub) = prices.subscription(symbol) {
            let view = sub.snapshot();
            match view.price() {
                Some(price) => info!(
                    symbol = %sub.symbol(),
                    price = %price,
                    stale = sub.is_stale(),
                    "quote"
                ),
                None => warn!(
                    symbol = %sub.symbol(),
                    error = view.error.as_deref().unwrap_or("no data yet"),
                    "quote unavailable"
                ),
            }
        }
    }

    match challenges.snapshot() {
        Some(snap) => {
            info!(
                challenge_id = snap.id,
                status = %snap.status,
                balance = %snap.current_balance.round_dp(2),
                total_pnl_pct = %snap.total_pnl_percent.round_dp(2),
                progress_pct = %snap.progress_to_target.round_dp(1),
                "challenge"
            );
            if let Some(trigger) = challenges.breach() {
                warn!(rule = %trigger, "risk rule breached");
            }
        }
        None => {
            if let Some(error) = challenges.error() {
                warn!(error = %error, "challenge state unavailable");
            } else {
                info!("No challenge for this session");
            }
        }
    }
}

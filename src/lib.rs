//! TradeDesk Library
//!
//! Client-side engine for simulated-trading challenges: polled price
//! synchronization, challenge state with optimistic updates, and the
//! order execution lifecycle against the challenge backend.

pub mod challenge;
pub mod config;
pub mod execution;
pub mod gateway;
pub mod price_sync;
pub mod retry;
pub mod types;

//! OcBot Library
//!
//! Option-chain support/resistance watcher: C1–C6 eligibility gate and a
//! paper-trading position lifecycle for NSE index options

pub mod config;
pub mod control;
pub mod dedup;
pub mod eligibility;
pub mod engine;
pub mod events;
pub mod levels;
pub mod market_view;
pub mod paper_trading;
pub mod performance;
pub mod persistence;
pub mod pricing;
pub mod provider;
pub mod risk;
pub mod session;
pub mod types;

//! Odds matching, valuation and arbitrage engine.
//!
//! Modules, leaf first:
//! - `odds`: American / decimal / implied-probability arithmetic
//! - `feed`: strict odds data model, boundary decode, The Odds API fetcher
//! - `matching`: player-name resolution and strict outcome matching
//! - `aggregate`: best / average / per-book view of one line
//! - `valuation`: no-vig and average-baseline EV
//! - `arb`: two-sided arbitrage detection, grouping and stake sizing
//! - `cache`: cache keys, fallback lookup, Valkey and in-memory stores
//! - `engine`: the concurrent pass that ties it together

pub mod aggregate;
pub mod arb;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod feed;
pub mod matching;
pub mod odds;
pub mod valuation;

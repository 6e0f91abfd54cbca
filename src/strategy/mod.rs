//! Strategy boundary.
//!
//! Strategy-selection heuristics are collaborator territory; the engine
//! only needs a narrow contract that yields entry intents for the gate to
//! size. One minimal built-in implementation (regime following) exercises
//! the pipeline end to end.

pub mod regime_follow;

pub use regime_follow::RegimeFollowStrategy;

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;

use crate::config::WatchedInstrument;
use crate::types::{AccountSnapshot, RegimeSnapshot, SentimentSnapshot, TradeIntent, WardenError};

/// Read-only view of the cycle's refreshed inputs handed to strategies.
pub struct StrategyContext<'a> {
    pub regime: &'a RegimeSnapshot,
    pub sentiment: Option<&'a SentimentSnapshot>,
    pub prices: &'a HashMap<String, Decimal>,
    pub account: &'a AccountSnapshot,
    pub watchlist: &'a [WatchedInstrument],
}

impl StrategyContext<'_> {
    /// Whether an open position already exists for the symbol.
    pub fn has_position(&self, symbol: &str) -> bool {
        self.account.positions.iter().any(|p| p.symbol == symbol)
    }
}

/// A source of entry intents, evaluated once per cycle while leading.
#[async_trait]
pub trait TradeStrategy: Send + Sync {
    /// Stable identifier, recorded on every intent this strategy emits.
    fn id(&self) -> &str;

    fn is_enabled(&self) -> bool {
        true
    }

    /// Propose candidate entries for this cycle. May return an empty list.
    async fn propose(&self, ctx: &StrategyContext<'_>) -> Result<Vec<TradeIntent>, WardenError>;
}

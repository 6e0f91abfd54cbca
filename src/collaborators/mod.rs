//! Collaborator boundary.
//!
//! Defines the narrow contracts the engine consumes and provides HTTP
//! implementations for the remote ones:
//! - Arbiter — remote leadership authority (lease claim/release/status)
//! - MarketDataProvider — prices, regime observations, sentiment, volatility
//! - ExchangeGateway — read-only account snapshots
//! - PersistenceFacade — durable local state and the cycle archive
//! - TradeDispatcher — hand-off point for open/close instructions
//!
//! The engine never reaches past these traits; concrete protocol details
//! live behind them.

pub mod arbiter;
pub mod exchange;
pub mod market_data;

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::info;
use uuid::Uuid;

use crate::types::{
    AccountSnapshot, ApprovedOrder, ArchiveRecord, ClaimResponse, CloseInstruction,
    PersistedState, RegimeLabel, SentimentSnapshot, SessionStatus, WardenError,
};

/// Remote leadership authority holding the single lease slot.
#[async_trait]
pub trait Arbiter: Send + Sync {
    /// Attempt to claim (or, for the current holder, renew) the lease.
    /// `force` overwrites any holder unconditionally.
    async fn claim_session(
        &self,
        instance_id: &str,
        force: bool,
    ) -> Result<ClaimResponse, WardenError>;

    /// Explicitly give up the lease. Returns whether a lease held by
    /// `instance_id` was actually cleared.
    async fn release_session(&self, instance_id: &str) -> Result<bool, WardenError>;

    /// Authoritative view of the current session.
    async fn session_status(&self) -> Result<SessionStatus, WardenError>;

    /// Fire-and-forget release for teardown paths that cannot await the
    /// normal request pipeline. Never fails; errors are swallowed.
    async fn release_best_effort(&self, instance_id: &str) {
        let _ = self.release_session(instance_id).await;
    }
}

/// Raw regime detector output, before streak/confirmation tracking.
#[derive(Debug, Clone)]
pub struct RegimeObservation {
    pub label: RegimeLabel,
    pub confidence: f64,
}

/// Market data feeds. Indicator math lives on the other side of this trait.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Current prices for the given symbols. Missing symbols are absent
    /// from the map rather than an error.
    async fn get_prices(
        &self,
        symbols: &[String],
    ) -> Result<HashMap<String, Decimal>, WardenError>;

    /// Regime observation for one symbol on one timeframe.
    async fn get_regime(
        &self,
        symbol: &str,
        timeframe: &str,
    ) -> Result<RegimeObservation, WardenError>;

    /// Market-wide sentiment index.
    async fn get_sentiment_index(&self) -> Result<SentimentSnapshot, WardenError>;

    /// Average true range for a symbol, in quote currency. Used by
    /// volatility-adjusted sizing.
    async fn get_atr(&self, symbol: &str, timeframe: &str) -> Result<Decimal, WardenError>;
}

/// Read-only exchange account access. This engine never mutates through
/// the gateway; order placement crosses `TradeDispatcher` instead.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    async fn get_account_snapshot(&self) -> Result<AccountSnapshot, WardenError>;
}

/// Durable local state: resumable cycle state plus an append-only archive.
#[async_trait]
pub trait PersistenceFacade: Send + Sync {
    async fn load_cycle_state(&self) -> Result<Option<PersistedState>, WardenError>;

    async fn save_cycle_state(&self, state: &PersistedState) -> Result<(), WardenError>;

    async fn append_archive(&self, records: &[ArchiveRecord]) -> Result<(), WardenError>;
}

/// Where approved orders and close instructions go. Placement protocol
/// details are the implementor's concern.
#[async_trait]
pub trait TradeDispatcher: Send + Sync {
    /// Submit an approved entry. Returns a dispatch receipt id.
    async fn open_position(&self, order: &ApprovedOrder) -> Result<String, WardenError>;

    /// Submit a close instruction. Returns a dispatch receipt id.
    async fn close_position(
        &self,
        instruction: &CloseInstruction,
    ) -> Result<String, WardenError>;

    fn is_dry_run(&self) -> bool;
}

// ---------------------------------------------------------------------------
// Dry-run dispatcher
// ---------------------------------------------------------------------------

/// Paper-mode dispatcher: logs every instruction, touches nothing.
pub struct DryRunDispatcher;

#[async_trait]
impl TradeDispatcher for DryRunDispatcher {
    async fn open_position(&self, order: &ApprovedOrder) -> Result<String, WardenError> {
        let receipt = format!("dry-run-{}", Uuid::new_v4());
        info!(
            strategy = %order.intent.strategy_id,
            symbol = %order.intent.symbol,
            side = %order.intent.side,
            notional = %order.notional,
            risk_multiplier = format!("{:.1}%", order.risk_multiplier_pct),
            receipt = %receipt,
            "[DRY RUN] Would open position"
        );
        Ok(receipt)
    }

    async fn close_position(
        &self,
        instruction: &CloseInstruction,
    ) -> Result<String, WardenError> {
        let receipt = format!("dry-run-{}", Uuid::new_v4());
        info!(
            symbol = %instruction.symbol,
            side = %instruction.side,
            quantity = %instruction.quantity,
            reason = %instruction.reason,
            receipt = %receipt,
            "[DRY RUN] Would close position"
        );
        Ok(receipt)
    }

    fn is_dry_run(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Shared types for the WARDEN engine.
//!
//! These types form the data model used across all modules.
//! They are designed to be stable so that collaborator, risk,
//! leadership, and engine modules can depend on them without
//! circular references.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Market regime
// ---------------------------------------------------------------------------

/// Categorical market-state label reported by the regime detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegimeLabel {
    Uptrend,
    Downtrend,
    Ranging,
    Neutral,
}

impl fmt::Display for RegimeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegimeLabel::Uptrend => write!(f, "uptrend"),
            RegimeLabel::Downtrend => write!(f, "downtrend"),
            RegimeLabel::Ranging => write!(f, "ranging"),
            RegimeLabel::Neutral => write!(f, "neutral"),
        }
    }
}

impl std::str::FromStr for RegimeLabel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "uptrend" | "up" | "bull" | "bullish" => Ok(RegimeLabel::Uptrend),
            "downtrend" | "down" | "bear" | "bearish" => Ok(RegimeLabel::Downtrend),
            "ranging" | "range" | "sideways" | "chop" => Ok(RegimeLabel::Ranging),
            "neutral" | "unknown" => Ok(RegimeLabel::Neutral),
            _ => Err(anyhow::anyhow!("Unknown regime label: {s}")),
        }
    }
}

/// Current market regime with a confirmation streak.
///
/// The label and confidence are replaced once per cycle from the external
/// detector; the streak fields are owned by the engine and survive process
/// restarts so confirmation does not reset spuriously.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeSnapshot {
    pub label: RegimeLabel,
    /// Detector confidence in the label (0.0–1.0).
    pub confidence: f64,
    /// Whether the label has persisted for `confirmation_threshold` periods.
    pub is_confirmed: bool,
    /// Consecutive periods the current label has been observed.
    pub consecutive_periods: u32,
    /// Periods required before a label counts as confirmed.
    pub confirmation_threshold: u32,
    /// Most recent labels, oldest first. Bounded by the engine.
    pub history: Vec<RegimeLabel>,
}

impl RegimeSnapshot {
    /// A neutral, unconfirmed snapshot (fresh start).
    pub fn neutral(confirmation_threshold: u32) -> Self {
        Self {
            label: RegimeLabel::Neutral,
            confidence: 0.0,
            is_confirmed: false,
            consecutive_periods: 0,
            confirmation_threshold,
            history: Vec::new(),
        }
    }

    /// Fold in one detector observation, updating the confirmation streak
    /// and bounded history. Called at most once per cycle.
    pub fn observe(&mut self, label: RegimeLabel, confidence: f64, max_history: usize) {
        if label == self.label {
            self.consecutive_periods = self.consecutive_periods.saturating_add(1);
        } else {
            self.label = label;
            self.consecutive_periods = 1;
        }
        self.confidence = confidence.clamp(0.0, 1.0);
        self.is_confirmed = self.consecutive_periods >= self.confirmation_threshold;

        self.history.push(label);
        if self.history.len() > max_history {
            let excess = self.history.len() - max_history;
            self.history.drain(..excess);
        }
    }

    /// Whether this is a confirmed downtrend (used by the trading block).
    pub fn is_confirmed_downtrend(&self) -> bool {
        self.is_confirmed && self.label == RegimeLabel::Downtrend
    }
}

impl fmt::Display for RegimeSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({:.0}%{}, streak={})",
            self.label,
            self.confidence * 100.0,
            if self.is_confirmed { ", confirmed" } else { "" },
            self.consecutive_periods,
        )
    }
}

/// Market-wide sentiment index (fear/greed style, 0–100).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentimentSnapshot {
    pub value: f64,
    pub classification: String,
}

// ---------------------------------------------------------------------------
// Account & positions
// ---------------------------------------------------------------------------

/// Order direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// A single asset balance on the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balance {
    pub asset: String,
    pub free: Decimal,
    pub locked: Decimal,
}

impl Balance {
    pub fn total(&self) -> Decimal {
        self.free + self.locked
    }
}

/// An open position as reported by the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionInfo {
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    pub opened_at: DateTime<Utc>,
    /// Strategy that opened the position, when known.
    #[serde(default)]
    pub strategy_id: Option<String>,
}

impl PositionInfo {
    /// Current notional value at the mark price.
    pub fn notional(&self) -> Decimal {
        self.quantity * self.mark_price
    }

    /// Unrealized P&L in quote currency (sign follows the position side).
    pub fn unrealized_pnl(&self) -> Decimal {
        let delta = self.mark_price - self.entry_price;
        match self.side {
            Side::Buy => delta * self.quantity,
            Side::Sell => -delta * self.quantity,
        }
    }

    /// Unrealized P&L as a fraction of entry notional (0.05 = +5%).
    pub fn unrealized_pnl_pct(&self) -> f64 {
        use rust_decimal::prelude::ToPrimitive;
        let entry_notional = self.quantity * self.entry_price;
        if entry_notional.is_zero() {
            return 0.0;
        }
        (self.unrealized_pnl() / entry_notional)
            .to_f64()
            .unwrap_or(0.0)
    }

    /// How long the position has been open.
    pub fn age(&self) -> Duration {
        Utc::now() - self.opened_at
    }
}

impl fmt::Display for PositionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} qty={} entry={} mark={} (pnl {:+.2}%)",
            self.side,
            self.symbol,
            self.quantity,
            self.entry_price,
            self.mark_price,
            self.unrealized_pnl_pct() * 100.0,
        )
    }
}

/// Point-in-time view of the exchange account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub balances: Vec<Balance>,
    pub positions: Vec<PositionInfo>,
    pub fetched_at: DateTime<Utc>,
}

impl AccountSnapshot {
    /// Free balance in the given quote asset.
    pub fn available_funds(&self, quote_asset: &str) -> Decimal {
        self.balances
            .iter()
            .filter(|b| b.asset == quote_asset)
            .map(|b| b.free)
            .sum()
    }

    /// Total notional currently allocated to open positions.
    pub fn allocated_notional(&self) -> Decimal {
        self.positions.iter().map(|p| p.notional()).sum()
    }

    /// Aggregate unrealized P&L as a fraction of allocated notional.
    pub fn unrealized_pnl_pct(&self) -> f64 {
        use rust_decimal::prelude::ToPrimitive;
        let allocated = self.allocated_notional();
        if allocated.is_zero() {
            return 0.0;
        }
        let pnl: Decimal = self.positions.iter().map(|p| p.unrealized_pnl()).sum();
        (pnl / allocated).to_f64().unwrap_or(0.0)
    }
}

// ---------------------------------------------------------------------------
// Leadership lease
// ---------------------------------------------------------------------------

/// The arbiter's record of the current leadership lease.
///
/// Owned by the arbiter; this struct is a read-only reference copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub holder_id: String,
    pub claimed_at: DateTime<Utc>,
    pub last_renewed_at: DateTime<Utc>,
    /// Whether the current holder took the lease by force.
    pub forced: bool,
}

impl LeaseRecord {
    /// A lease is stale once the holder has not renewed within the TTL.
    pub fn is_stale(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        now - self.last_renewed_at > ttl
    }
}

/// Authoritative session state as reported by the arbiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatus {
    pub is_active: bool,
    pub active_id: Option<String>,
    pub lease: Option<LeaseRecord>,
}

/// Arbiter response to a claim attempt.
#[derive(Debug, Clone)]
pub enum ClaimResponse {
    /// The lease is now held by the requesting instance.
    Granted { lease: LeaseRecord },
    /// Another holder is active. The lease record lets the caller judge
    /// staleness locally.
    Denied { lease: LeaseRecord },
}

// ---------------------------------------------------------------------------
// Cycle bookkeeping
// ---------------------------------------------------------------------------

/// Smoothing factor for the rolling average cycle duration.
const CYCLE_EMA_ALPHA: f64 = 0.2;

/// Counters that survive restarts (persisted after every cycle).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CycleStats {
    pub total_cycles: u64,
    pub cycles_failed: u64,
    pub last_cycle_duration_ms: u64,
    pub rolling_avg_duration_ms: f64,
    pub last_completed_at: Option<DateTime<Utc>>,
}

impl CycleStats {
    /// Fold a completed cycle's duration into the counters.
    pub fn record_cycle(&mut self, duration_ms: u64) {
        self.total_cycles += 1;
        self.last_cycle_duration_ms = duration_ms;
        self.rolling_avg_duration_ms = if self.total_cycles == 1 {
            duration_ms as f64
        } else {
            CYCLE_EMA_ALPHA * duration_ms as f64
                + (1.0 - CYCLE_EMA_ALPHA) * self.rolling_avg_duration_ms
        };
        self.last_completed_at = Some(Utc::now());
    }

    pub fn record_failure(&mut self) {
        self.cycles_failed += 1;
    }
}

/// The ordered phases of a scan cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanPhase {
    VerifyLeadership,
    RefreshRegime,
    RefreshPrices,
    MonitorPositions,
    CapitalCheck,
    EvaluateStrategies,
    Archive,
}

impl fmt::Display for ScanPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanPhase::VerifyLeadership => write!(f, "verify_leadership"),
            ScanPhase::RefreshRegime => write!(f, "refresh_regime"),
            ScanPhase::RefreshPrices => write!(f, "refresh_prices"),
            ScanPhase::MonitorPositions => write!(f, "monitor_positions"),
            ScanPhase::CapitalCheck => write!(f, "capital_check"),
            ScanPhase::EvaluateStrategies => write!(f, "evaluate_strategies"),
            ScanPhase::Archive => write!(f, "archive"),
        }
    }
}

/// Duration of one phase within a cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTiming {
    pub phase: ScanPhase,
    pub duration_ms: u64,
}

/// How a `run_cycle` invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// All phases ran.
    Completed,
    /// Capital check failed: strategy evaluation skipped, rest ran.
    CompletedStrategiesSkipped,
    /// Leadership was lost; remaining phases aborted.
    AbortedLeadershipLost,
    /// A cycle was already in flight; this invocation was a no-op.
    SkippedAlreadyRunning,
}

/// Summary of one scan cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cycle_number: u64,
    pub outcome: CycleOutcome,
    pub phase_timings: Vec<PhaseTiming>,
    pub risk_score: Option<f64>,
    pub risk_multiplier_pct: Option<f64>,
    pub intents_approved: usize,
    pub intents_rejected: usize,
    pub closes_issued: usize,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
}

impl CycleReport {
    /// Report for a no-op invocation (re-entrancy guard hit).
    pub fn skipped(cycle_number: u64) -> Self {
        Self {
            cycle_number,
            outcome: CycleOutcome::SkippedAlreadyRunning,
            phase_timings: Vec::new(),
            risk_score: None,
            risk_multiplier_pct: None,
            intents_approved: 0,
            intents_rejected: 0,
            closes_issued: 0,
            duration_ms: 0,
            started_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Trading intents & instructions
// ---------------------------------------------------------------------------

/// A strategy's proposal to enter a position. One per candidate trade.
#[derive(Debug, Clone)]
pub struct TradeIntent {
    pub strategy_id: String,
    pub symbol: String,
    pub side: Side,
    /// Per-candidate confidence (0.0–1.0) used by conviction sizing.
    pub conviction: f64,
    /// Combined signal strength (0.0–1.0); intents below the configured
    /// minimum are discarded before sizing.
    pub signal_strength: f64,
}

/// An intent that passed the position size gate, ready for dispatch.
#[derive(Debug, Clone)]
pub struct ApprovedOrder {
    pub intent: TradeIntent,
    pub notional: Decimal,
    pub risk_multiplier_pct: f64,
}

/// Why the position monitor wants a position closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    StopLoss,
    TakeProfit,
    MaxAge,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::StopLoss => write!(f, "stop_loss"),
            CloseReason::TakeProfit => write!(f, "take_profit"),
            CloseReason::MaxAge => write!(f, "max_age"),
        }
    }
}

/// Instruction to close an open position, emitted by the monitor phase.
#[derive(Debug, Clone)]
pub struct CloseInstruction {
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub reason: CloseReason,
}

// ---------------------------------------------------------------------------
// Engine state & persistence
// ---------------------------------------------------------------------------

/// Paper routes approved orders through the dry-run dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    #[default]
    Paper,
    Live,
}

impl fmt::Display for TradingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradingMode::Paper => write!(f, "paper"),
            TradingMode::Live => write!(f, "live"),
        }
    }
}

impl std::str::FromStr for TradingMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "paper" | "dry-run" | "dryrun" => Ok(TradingMode::Paper),
            "live" | "real" => Ok(TradingMode::Live),
            _ => Err(anyhow::anyhow!("Unknown trading mode: {s}")),
        }
    }
}

/// Scheduler lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Stopped,
    Initializing,
    Idle,
    Scanning,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Stopped => write!(f, "stopped"),
            EngineState::Initializing => write!(f, "initializing"),
            EngineState::Idle => write!(f, "idle"),
            EngineState::Scanning => write!(f, "scanning"),
        }
    }
}

/// Durable local state, written after every completed cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedState {
    /// Whether the scheduler was running when state was last saved. Used
    /// only to re-attempt the leadership claim after re-initialization.
    pub is_running: bool,
    pub trading_mode: TradingMode,
    pub regime_state: RegimeSnapshot,
    pub cycle_stats: CycleStats,
}

impl PersistedState {
    pub fn fresh(trading_mode: TradingMode, confirmation_threshold: u32) -> Self {
        Self {
            is_running: false,
            trading_mode,
            regime_state: RegimeSnapshot::neutral(confirmation_threshold),
            cycle_stats: CycleStats::default(),
        }
    }
}

/// One archived cycle, appended to durable history after every cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveRecord {
    pub cycle_number: u64,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub outcome: String,
    pub risk_score: Option<f64>,
    pub risk_multiplier_pct: Option<f64>,
    pub intents_approved: u32,
    pub intents_rejected: u32,
    pub closes_issued: u32,
    pub available_funds: Decimal,
    pub allocated_notional: Decimal,
}

/// A user-visible alert. Critical errors share this channel with normal
/// status rather than disappearing into logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertInfo {
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Snapshot of engine status served by the dashboard. Written by the
/// leading instance; read-only everywhere else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub instance_id: String,
    pub state: EngineState,
    pub is_leader: bool,
    pub trading_mode: TradingMode,
    pub cycle_stats: CycleStats,
    pub regime: Option<RegimeSnapshot>,
    pub last_risk_score: Option<f64>,
    pub last_risk_multiplier_pct: Option<f64>,
    pub next_scheduled_at: Option<DateTime<Utc>>,
    pub last_alert: Option<AlertInfo>,
    pub updated_at: DateTime<Utc>,
}

impl StatusSnapshot {
    pub fn stopped(instance_id: &str, trading_mode: TradingMode) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            state: EngineState::Stopped,
            is_leader: false,
            trading_mode,
            cycle_stats: CycleStats::default(),
            regime: None,
            last_risk_score: None,
            last_risk_multiplier_pct: None,
            next_scheduled_at: None,
            last_alert: None,
            updated_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// How an error affects the scheduler: critical errors stop the engine,
/// non-critical errors end the current phase or cycle gracefully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Critical,
    NonCritical,
}

/// Domain-specific error types for WARDEN.
#[derive(Debug, thiserror::Error)]
pub enum WardenError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Initialization error: {0}")]
    Init(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Arbiter error: {0}")]
    Arbiter(String),

    #[error("Network error ({endpoint}): {message}")]
    Network {
        endpoint: String,
        message: String,
        /// Failures attributable to insufficient balance are expected
        /// exchange behaviour, not infrastructure faults.
        balance_related: bool,
    },

    #[error("Timed out: {operation}")]
    Timeout { operation: String },

    #[error("Exchange rejected: {0}")]
    ExchangeRejected(String),

    #[error("Missing data: {0}")]
    MissingData(String),
}

impl WardenError {
    /// Classify per the engine's error taxonomy: initialization,
    /// configuration, persistence, and non-balance network failures stop
    /// the engine; everything else is logged and the schedule continues.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            WardenError::Config(_) | WardenError::Init(_) | WardenError::Storage(_) => {
                ErrorSeverity::Critical
            }
            WardenError::Network {
                balance_related, ..
            } => {
                if *balance_related {
                    ErrorSeverity::NonCritical
                } else {
                    ErrorSeverity::Critical
                }
            }
            WardenError::Arbiter(_)
            | WardenError::Timeout { .. }
            | WardenError::ExchangeRejected(_)
            | WardenError::MissingData(_) => ErrorSeverity::NonCritical,
        }
    }

    pub fn is_critical(&self) -> bool {
        self.severity() == ErrorSeverity::Critical
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

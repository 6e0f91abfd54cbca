//! Position size gating.
//!
//! Validates a proposed order notional against funds, exchange minimums,
//! and configured caps. The gate is pure and stateless per call: identical
//! inputs always produce identical results, and nothing is cached across
//! candidates. Rejections are values, not errors — a rejected candidate is
//! skipped without affecting the rest of the cycle.

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::fmt;
use tracing::debug;

// ---------------------------------------------------------------------------
// Request / result
// ---------------------------------------------------------------------------

/// One candidate trade's sizing request. Ephemeral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizingRequest {
    pub available_funds: Decimal,
    pub proposed_notional: Decimal,
    pub instrument_min_notional: Decimal,
    /// Order size quantization step in quote currency. Zero disables
    /// quantization.
    pub instrument_step_size: Decimal,
}

/// Why the gate turned a candidate down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    NotPositive,
    BelowMinimumTrade,
    ExceedsAvailableFunds,
    BelowInstrumentMinimum,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::NotPositive => write!(f, "not_positive"),
            RejectReason::BelowMinimumTrade => write!(f, "below_minimum"),
            RejectReason::ExceedsAvailableFunds => write!(f, "exceeds_available_funds"),
            RejectReason::BelowInstrumentMinimum => write!(f, "below_instrument_minimum"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizingResult {
    pub accepted: bool,
    pub reason: Option<RejectReason>,
    /// Step-quantized notional, present only when accepted.
    pub adjusted_notional: Option<Decimal>,
}

impl SizingResult {
    fn rejected(reason: RejectReason) -> Self {
        Self {
            accepted: false,
            reason: Some(reason),
            adjusted_notional: None,
        }
    }

    fn accepted(notional: Decimal) -> Self {
        Self {
            accepted: true,
            reason: None,
            adjusted_notional: Some(notional),
        }
    }
}

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

pub struct PositionSizeGate {
    /// Smallest order the engine will consider, in quote currency.
    min_trade_value: Decimal,
}

impl PositionSizeGate {
    pub fn new(min_trade_value: Decimal) -> Self {
        Self { min_trade_value }
    }

    /// Validate one candidate. Invoked once per candidate trade.
    pub fn evaluate(&self, request: &SizingRequest) -> SizingResult {
        let proposed = request.proposed_notional;

        if proposed <= Decimal::ZERO {
            return SizingResult::rejected(RejectReason::NotPositive);
        }
        if proposed < self.min_trade_value {
            return SizingResult::rejected(RejectReason::BelowMinimumTrade);
        }
        if proposed > request.available_funds {
            return SizingResult::rejected(RejectReason::ExceedsAvailableFunds);
        }
        if proposed < request.instrument_min_notional {
            return SizingResult::rejected(RejectReason::BelowInstrumentMinimum);
        }

        let adjusted = quantize(proposed, request.instrument_step_size);
        // Quantizing down can drop a borderline order under the filters.
        if adjusted < self.min_trade_value {
            return SizingResult::rejected(RejectReason::BelowMinimumTrade);
        }
        if adjusted < request.instrument_min_notional {
            return SizingResult::rejected(RejectReason::BelowInstrumentMinimum);
        }

        debug!(
            proposed = %proposed,
            adjusted = %adjusted,
            "Sizing accepted"
        );
        SizingResult::accepted(adjusted)
    }
}

/// Round down to the instrument's step size. A zero step passes through.
fn quantize(notional: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return notional;
    }
    (notional / step).floor() * step
}

// ---------------------------------------------------------------------------
// Sizing strategies
// ---------------------------------------------------------------------------

/// Volatility-adjusted notional:
/// `(risk% × balance) / (ATR × stop multiplier) × price`.
///
/// `risk_pct` is the effective percentage after the risk multiplier has
/// scaled the configured maximum. Returns zero when the stop distance is
/// degenerate; the gate rejects zero as not positive.
pub fn volatility_adjusted_notional(
    balance: Decimal,
    risk_pct: f64,
    atr: Decimal,
    stop_multiplier: Decimal,
    price: Decimal,
) -> Decimal {
    let stop_distance = atr * stop_multiplier;
    if stop_distance <= Decimal::ZERO || price <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let risk_fraction = Decimal::from_f64(risk_pct / 100.0).unwrap_or(Decimal::ZERO);
    let risk_amount = balance * risk_fraction;
    let quantity = risk_amount / stop_distance;
    quantity * price
}

/// Fixed-base notional scaled by the candidate's conviction, clamped to
/// [0, 1].
pub fn fixed_conviction_notional(base: Decimal, conviction: f64) -> Decimal {
    let clamped = Decimal::from_f64(conviction.clamp(0.0, 1.0)).unwrap_or(Decimal::ZERO);
    base * clamped
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

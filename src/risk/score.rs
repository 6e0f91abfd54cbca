//! Composite risk scoring.
//!
//! Combines weighted normalized sub-scores (unrealized/realized P&L,
//! regime, volatility, opportunity rate, sentiment, signal quality) into
//! one bounded score and derives the risk multiplier that scales position
//! sizing. Recomputation is throttled; calls within the window return the
//! cached result. The breakdown is always derived fresh from live inputs
//! and never persisted.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::RiskScoreConfig;
use crate::types::{RegimeLabel, RegimeSnapshot, SentimentSnapshot};

// ---------------------------------------------------------------------------
// Normalization constants
// ---------------------------------------------------------------------------

/// Neutral sub-score used when an input is missing: degrade, don't crash.
const NEUTRAL_SCORE: f64 = 50.0;

/// P&L fraction mapped onto the full score range: ±20% → 0..100.
const PNL_FULL_RANGE: f64 = 0.20;

/// ATR/price fraction treated as neutral volatility.
const NEUTRAL_VOLATILITY: f64 = 0.05;

/// Opportunities per cycle treated as neutral.
const NEUTRAL_OPPORTUNITY_RATE: f64 = 2.0;

// ---------------------------------------------------------------------------
// Inputs & breakdown
// ---------------------------------------------------------------------------

/// Live signals feeding one score computation. Every field is optional;
/// missing inputs contribute the neutral 50.
#[derive(Debug, Clone, Default)]
pub struct RiskInputs {
    /// Aggregate unrealized P&L as a fraction of allocated notional.
    pub unrealized_pnl_pct: Option<f64>,
    /// Realized P&L over the trailing window, as a fraction of balance.
    pub realized_pnl_pct: Option<f64>,
    pub regime: Option<RegimeSnapshot>,
    /// ATR as a fraction of price for the regime symbol.
    pub volatility_pct: Option<f64>,
    /// Candidate intents surfaced in the last cycle.
    pub opportunity_rate: Option<f64>,
    pub sentiment: Option<SentimentSnapshot>,
    /// Mean signal strength of recent intents (0.0–1.0).
    pub signal_quality: Option<f64>,
}

/// One weighted component of the composite score.
#[derive(Debug, Clone, Copy)]
pub struct ComponentScore {
    pub score: f64,
    pub weight: f64,
}

/// The composite result handed to position sizing.
#[derive(Debug, Clone)]
pub struct RiskScoreBreakdown {
    pub components: BTreeMap<&'static str, ComponentScore>,
    pub final_score: f64,
    /// Percentage of the configured maximum risk to apply, bounded by
    /// `[floor_pct, max_multiplier_pct]`.
    pub risk_multiplier_pct: f64,
    pub computed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

pub struct RiskScoreAggregator {
    config: RiskScoreConfig,
    recompute_interval: Duration,
    cache: Mutex<Option<(Instant, RiskScoreBreakdown)>>,
}

impl RiskScoreAggregator {
    pub fn new(config: RiskScoreConfig) -> Self {
        let recompute_interval = Duration::from_secs(config.recompute_interval_secs);
        Self {
            config,
            recompute_interval,
            cache: Mutex::new(None),
        }
    }

    /// Compute the composite score, throttled to at most one recompute per
    /// configured interval. Calls inside the window return the cached
    /// breakdown regardless of the inputs passed.
    pub fn compute(&self, inputs: &RiskInputs) -> RiskScoreBreakdown {
        {
            let cache = self.cache.lock().unwrap();
            if let Some((at, cached)) = cache.as_ref() {
                if at.elapsed() < self.recompute_interval {
                    return cached.clone();
                }
            }
        }

        let breakdown = self.compute_fresh(inputs);
        *self.cache.lock().unwrap() = Some((Instant::now(), breakdown.clone()));
        breakdown
    }

    fn compute_fresh(&self, inputs: &RiskInputs) -> RiskScoreBreakdown {
        let w = &self.config.weights;
        let mut components = BTreeMap::new();

        components.insert(
            "unrealized_pnl",
            ComponentScore {
                score: normalize_pnl(inputs.unrealized_pnl_pct),
                weight: w.unrealized_pnl,
            },
        );
        components.insert(
            "realized_pnl",
            ComponentScore {
                score: normalize_pnl(inputs.realized_pnl_pct),
                weight: w.realized_pnl,
            },
        );
        components.insert(
            "regime",
            ComponentScore {
                score: normalize_regime(inputs.regime.as_ref()),
                weight: w.regime,
            },
        );
        components.insert(
            "volatility",
            ComponentScore {
                score: normalize_volatility(inputs.volatility_pct),
                weight: w.volatility,
            },
        );
        components.insert(
            "opportunity",
            ComponentScore {
                score: normalize_opportunity(inputs.opportunity_rate),
                weight: w.opportunity,
            },
        );
        components.insert(
            "sentiment",
            ComponentScore {
                score: normalize_sentiment(inputs.sentiment.as_ref()),
                weight: w.sentiment,
            },
        );
        components.insert(
            "signal_quality",
            ComponentScore {
                score: normalize_signal_quality(inputs.signal_quality),
                weight: w.signal_quality,
            },
        );

        let final_score: f64 = components
            .values()
            .map(|c| c.score * c.weight)
            .sum::<f64>()
            .clamp(0.0, 100.0);

        let risk_multiplier_pct = self.derive_multiplier(final_score);

        debug!(
            final_score = format!("{final_score:.1}"),
            multiplier = format!("{risk_multiplier_pct:.1}%"),
            "Risk score computed"
        );

        RiskScoreBreakdown {
            components,
            final_score,
            risk_multiplier_pct,
            computed_at: Utc::now(),
        }
    }

    /// Piecewise, monotonic mapping from score to multiplier.
    ///
    /// Deteriorating conditions are punished faster than improving ones
    /// are rewarded, and the floor keeps trading capability above zero.
    fn derive_multiplier(&self, score: f64) -> f64 {
        let cfg = &self.config;
        let max = cfg.max_multiplier_pct;

        let raw = if score >= cfg.full_threshold {
            max
        } else if score >= cfg.mid_threshold {
            let t = (score - cfg.mid_threshold) / (cfg.full_threshold - cfg.mid_threshold);
            (0.5 + 0.5 * t) * max
        } else if score >= cfg.low_threshold {
            let t = (score - cfg.low_threshold) / (cfg.mid_threshold - cfg.low_threshold);
            (0.1 + 0.4 * t) * max
        } else {
            0.1 * max
        };

        raw.max(cfg.floor_pct).min(max)
    }
}

// ---------------------------------------------------------------------------
// Normalizers — each maps a raw input onto [0, 100], 50 = neutral/unknown
// ---------------------------------------------------------------------------

fn normalize_pnl(pnl_pct: Option<f64>) -> f64 {
    match pnl_pct {
        Some(p) => (NEUTRAL_SCORE + p / PNL_FULL_RANGE * NEUTRAL_SCORE).clamp(0.0, 100.0),
        None => NEUTRAL_SCORE,
    }
}

fn normalize_regime(regime: Option<&RegimeSnapshot>) -> f64 {
    let Some(r) = regime else {
        return NEUTRAL_SCORE;
    };
    // Unconfirmed observations pull half weight toward their direction.
    let direction_weight = if r.is_confirmed { 50.0 } else { 25.0 };
    let score = match r.label {
        RegimeLabel::Uptrend => NEUTRAL_SCORE + r.confidence * direction_weight,
        RegimeLabel::Downtrend => NEUTRAL_SCORE - r.confidence * direction_weight,
        RegimeLabel::Ranging => NEUTRAL_SCORE - r.confidence * 10.0,
        RegimeLabel::Neutral => NEUTRAL_SCORE,
    };
    score.clamp(0.0, 100.0)
}

fn normalize_volatility(volatility_pct: Option<f64>) -> f64 {
    match volatility_pct {
        Some(v) => (100.0 - v / NEUTRAL_VOLATILITY * NEUTRAL_SCORE).clamp(0.0, 100.0),
        None => NEUTRAL_SCORE,
    }
}

fn normalize_opportunity(rate: Option<f64>) -> f64 {
    match rate {
        Some(r) => (r / NEUTRAL_OPPORTUNITY_RATE * NEUTRAL_SCORE).clamp(0.0, 100.0),
        None => NEUTRAL_SCORE,
    }
}

fn normalize_sentiment(sentiment: Option<&SentimentSnapshot>) -> f64 {
    match sentiment {
        Some(s) => s.value.clamp(0.0, 100.0),
        None => NEUTRAL_SCORE,
    }
}

fn normalize_signal_quality(quality: Option<f64>) -> f64 {
    match quality {
        Some(q) => (q * 100.0).clamp(0.0, 100.0),
        None => NEUTRAL_SCORE,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Regime-follow strategy.
//!
//! Proposes a long entry for each watchlist instrument without an open
//! position while the market regime is a confirmed uptrend. Conviction
//! tracks detector confidence; signal strength additionally discounts by
//! sentiment when the index is fearful.

use async_trait::async_trait;
use tracing::debug;

use super::{StrategyContext, TradeStrategy};
use crate::types::{RegimeLabel, Side, TradeIntent, WardenError};

#[derive(Debug, Clone)]
pub struct RegimeFollowConfig {
    pub enabled: bool,
    /// Regime observations below this confidence propose nothing.
    pub min_confidence: f64,
}

impl Default for RegimeFollowConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_confidence: 0.6,
        }
    }
}

pub struct RegimeFollowStrategy {
    config: RegimeFollowConfig,
}

impl RegimeFollowStrategy {
    pub fn new(config: RegimeFollowConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TradeStrategy for RegimeFollowStrategy {
    fn id(&self) -> &str {
        "regime_follow"
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    async fn propose(&self, ctx: &StrategyContext<'_>) -> Result<Vec<TradeIntent>, WardenError> {
        let regime = ctx.regime;
        if regime.label != RegimeLabel::Uptrend
            || !regime.is_confirmed
            || regime.confidence < self.config.min_confidence
        {
            return Ok(Vec::new());
        }

        // Sentiment discount: extreme fear halves the combined signal.
        let sentiment_factor = match ctx.sentiment {
            Some(s) if s.value < 25.0 => 0.5,
            Some(s) if s.value < 45.0 => 0.8,
            _ => 1.0,
        };

        let mut intents = Vec::new();
        for instrument in ctx.watchlist {
            if ctx.has_position(&instrument.symbol) {
                continue;
            }
            // No price, no trade — the gate can't size what it can't mark.
            if !ctx.prices.contains_key(&instrument.symbol) {
                debug!(symbol = %instrument.symbol, "No price for symbol, skipping");
                continue;
            }

            intents.push(TradeIntent {
                strategy_id: self.id().to_string(),
                symbol: instrument.symbol.clone(),
                side: Side::Buy,
                conviction: regime.confidence,
                signal_strength: regime.confidence * sentiment_factor,
            });
        }

        Ok(intents)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WatchedInstrument;
    use crate::types::{AccountSnapshot, PositionInfo, RegimeSnapshot, SentimentSnapshot};
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    fn confirmed_uptrend(confidence: f64) -> RegimeSnapshot {
        let mut r = RegimeSnapshot::neutral(2);
        r.observe(RegimeLabel::Uptrend, confidence, 5);
        r.observe(RegimeLabel::Uptrend, confidence, 5);
        r
    }

    fn watchlist() -> Vec<WatchedInstrument> {
        vec![
            WatchedInstrument {
                symbol: "BTCUSDT".into(),
                min_notional: dec!(10),
                step_size: dec!(0.1),
            },
            WatchedInstrument {
                symbol: "ETHUSDT".into(),
                min_notional: dec!(10),
                step_size: dec!(0.1),
            },
        ]
    }

    fn empty_account() -> AccountSnapshot {
        AccountSnapshot {
            balances: vec![],
            positions: vec![],
            fetched_at: Utc::now(),
        }
    }

    fn prices_for_all() -> HashMap<String, rust_decimal::Decimal> {
        HashMap::from([
            ("BTCUSDT".to_string(), dec!(50000)),
            ("ETHUSDT".to_string(), dec!(2500)),
        ])
    }

    #[tokio::test]
    async fn test_proposes_for_confirmed_uptrend() {
        let strategy = RegimeFollowStrategy::new(RegimeFollowConfig::default());
        let regime = confirmed_uptrend(0.8);
        let prices = prices_for_all();
        let account = empty_account();
        let watch = watchlist();
        let ctx = StrategyContext {
            regime: &regime,
            sentiment: None,
            prices: &prices,
            account: &account,
            watchlist: &watch,
        };

        let intents = strategy.propose(&ctx).await.unwrap();
        assert_eq!(intents.len(), 2);
        assert!(intents.iter().all(|i| i.side == Side::Buy));
        assert!((intents[0].conviction - 0.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_no_intents_when_unconfirmed() {
        let strategy = RegimeFollowStrategy::new(RegimeFollowConfig::default());
        let mut regime = RegimeSnapshot::neutral(3);
        regime.observe(RegimeLabel::Uptrend, 0.9, 5);
        let prices = prices_for_all();
        let account = empty_account();
        let watch = watchlist();
        let ctx = StrategyContext {
            regime: &regime,
            sentiment: None,
            prices: &prices,
            account: &account,
            watchlist: &watch,
        };

        assert!(strategy.propose(&ctx).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_intents_below_min_confidence() {
        let strategy = RegimeFollowStrategy::new(RegimeFollowConfig {
            enabled: true,
            min_confidence: 0.7,
        });
        let regime = confirmed_uptrend(0.6);
        let prices = prices_for_all();
        let account = empty_account();
        let watch = watchlist();
        let ctx = StrategyContext {
            regime: &regime,
            sentiment: None,
            prices: &prices,
            account: &account,
            watchlist: &watch,
        };

        assert!(strategy.propose(&ctx).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_skips_symbols_with_positions() {
        let strategy = RegimeFollowStrategy::new(RegimeFollowConfig::default());
        let regime = confirmed_uptrend(0.8);
        let prices = prices_for_all();
        let mut account = empty_account();
        account.positions.push(PositionInfo {
            symbol: "BTCUSDT".into(),
            side: Side::Buy,
            quantity: dec!(0.1),
            entry_price: dec!(48000),
            mark_price: dec!(50000),
            opened_at: Utc::now(),
            strategy_id: Some("regime_follow".into()),
        });
        let watch = watchlist();
        let ctx = StrategyContext {
            regime: &regime,
            sentiment: None,
            prices: &prices,
            account: &account,
            watchlist: &watch,
        };

        let intents = strategy.propose(&ctx).await.unwrap();
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].symbol, "ETHUSDT");
    }

    #[tokio::test]
    async fn test_skips_unpriced_symbols() {
        let strategy = RegimeFollowStrategy::new(RegimeFollowConfig::default());
        let regime = confirmed_uptrend(0.8);
        let prices = HashMap::from([("BTCUSDT".to_string(), dec!(50000))]);
        let account = empty_account();
        let watch = watchlist();
        let ctx = StrategyContext {
            regime: &regime,
            sentiment: None,
            prices: &prices,
            account: &account,
            watchlist: &watch,
        };

        let intents = strategy.propose(&ctx).await.unwrap();
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].symbol, "BTCUSDT");
    }

    #[tokio::test]
    async fn test_fear_discounts_signal_strength() {
        let strategy = RegimeFollowStrategy::new(RegimeFollowConfig::default());
        let regime = confirmed_uptrend(0.8);
        let prices = prices_for_all();
        let account = empty_account();
        let watch = watchlist();
        let fear = SentimentSnapshot {
            value: 20.0,
            classification: "extreme fear".into(),
        };
        let ctx = StrategyContext {
            regime: &regime,
            sentiment: Some(&fear),
            prices: &prices,
            account: &account,
            watchlist: &watch,
        };

        let intents = strategy.propose(&ctx).await.unwrap();
        assert!((intents[0].signal_strength - 0.4).abs() < 1e-9);
    }
}

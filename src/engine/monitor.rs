//! Position monitor.
//!
//! Reconciles open positions against fresh prices and emits close
//! instructions for positions that hit the stop-loss, take-profit, or
//! maximum holding-age thresholds. The monitor only reads prices and
//! entry marks; indicator-based exit logic lives with the strategies.

use chrono::Duration;
use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::{debug, info};

use crate::config::MonitorConfig;
use crate::types::{CloseInstruction, CloseReason, PositionInfo};

pub struct PositionMonitor {
    config: MonitorConfig,
}

impl PositionMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self { config }
    }

    /// Review open positions with the latest prices. Positions whose
    /// symbol has no fresh price are evaluated at their last mark.
    pub fn review(
        &self,
        positions: &[PositionInfo],
        prices: &HashMap<String, Decimal>,
    ) -> Vec<CloseInstruction> {
        let mut instructions = Vec::new();

        for position in positions {
            let mut marked = position.clone();
            if let Some(price) = prices.get(&position.symbol) {
                marked.mark_price = *price;
            } else {
                debug!(
                    symbol = %position.symbol,
                    "No fresh price, evaluating at last mark"
                );
            }

            if let Some(reason) = self.exit_reason(&marked) {
                info!(
                    symbol = %marked.symbol,
                    reason = %reason,
                    pnl = format!("{:+.2}%", marked.unrealized_pnl_pct() * 100.0),
                    age_hours = marked.age().num_hours(),
                    "Close instruction emitted"
                );
                instructions.push(CloseInstruction {
                    symbol: marked.symbol.clone(),
                    side: marked.side,
                    quantity: marked.quantity,
                    reason,
                });
            }
        }

        instructions
    }

    fn exit_reason(&self, position: &PositionInfo) -> Option<CloseReason> {
        let pnl_pct = position.unrealized_pnl_pct();

        if pnl_pct <= -self.config.stop_loss_pct {
            return Some(CloseReason::StopLoss);
        }
        if pnl_pct >= self.config.take_profit_pct {
            return Some(CloseReason::TakeProfit);
        }
        if self.config.max_holding_hours > 0
            && position.age() > Duration::hours(self.config.max_holding_hours as i64)
        {
            return Some(CloseReason::MaxAge);
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

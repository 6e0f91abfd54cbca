//! HTTP exchange gateway.
//!
//! Read-only account snapshots (balances + open positions). The gateway
//! recognizes balance-related failure messages so the scheduler can keep
//! them out of the critical bucket.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::ExchangeGateway;
use crate::types::{AccountSnapshot, Balance, PositionInfo, Side, WardenError};

/// Substrings in exchange error bodies that mark a failure as
/// balance-related (expected behaviour, not infrastructure).
const BALANCE_ERROR_MARKERS: &[&str] = &["insufficient balance", "insufficient funds"];

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct WireBalance {
    asset: String,
    free: Decimal,
    #[serde(default)]
    locked: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePosition {
    symbol: String,
    side: String,
    quantity: Decimal,
    entry_price: Decimal,
    mark_price: Decimal,
    opened_at: DateTime<Utc>,
    #[serde(default)]
    strategy_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SnapshotReply {
    balances: Vec<WireBalance>,
    positions: Vec<WirePosition>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// REST client for the exchange account endpoint.
pub struct HttpExchangeGateway {
    client: Client,
    base_url: String,
}

impl HttpExchangeGateway {
    pub fn new(base_url: String, snapshot_timeout: Duration) -> Result<Self, WardenError> {
        let client = Client::builder()
            .timeout(snapshot_timeout)
            .build()
            .map_err(|e| WardenError::Init(format!("Failed to build exchange client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn network_err(&self, message: String) -> WardenError {
        let lowered = message.to_lowercase();
        let balance_related = BALANCE_ERROR_MARKERS
            .iter()
            .any(|marker| lowered.contains(marker));
        WardenError::Network {
            endpoint: self.base_url.clone(),
            message,
            balance_related,
        }
    }
}

#[async_trait]
impl ExchangeGateway for HttpExchangeGateway {
    async fn get_account_snapshot(&self) -> Result<AccountSnapshot, WardenError> {
        let url = format!("{}/account/snapshot", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.network_err(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(self.network_err(format!("snapshot returned HTTP {status}: {body}")));
        }

        let reply: SnapshotReply = resp
            .json()
            .await
            .map_err(|e| self.network_err(e.to_string()))?;

        let positions = reply
            .positions
            .into_iter()
            .map(|p| {
                let side = match p.side.to_lowercase().as_str() {
                    "sell" | "short" => Side::Sell,
                    _ => Side::Buy,
                };
                PositionInfo {
                    symbol: p.symbol,
                    side,
                    quantity: p.quantity,
                    entry_price: p.entry_price,
                    mark_price: p.mark_price,
                    opened_at: p.opened_at,
                    strategy_id: p.strategy_id,
                }
            })
            .collect::<Vec<_>>();

        let balances = reply
            .balances
            .into_iter()
            .map(|b| Balance {
                asset: b.asset,
                free: b.free,
                locked: b.locked,
            })
            .collect::<Vec<_>>();

        debug!(
            balances = balances.len(),
            positions = positions.len(),
            "Account snapshot fetched"
        );

        Ok(AccountSnapshot {
            balances,
            positions,
            fetched_at: Utc::now(),
        })
    }
}

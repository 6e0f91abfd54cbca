//! HTTP market-data client.
//!
//! Fetches prices, regime observations, the sentiment index, and ATR from
//! the market-data service. Regime payloads arrive with inconsistent field
//! names depending on the upstream detector version; normalization to the
//! fixed `RegimeObservation` schema happens here, at the boundary, so the
//! engine never sees the loose shapes.

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use super::{MarketDataProvider, RegimeObservation};
use crate::types::{RegimeLabel, SentimentSnapshot, WardenError};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PricesReply {
    prices: HashMap<String, Decimal>,
}

/// Regime payload as upstream actually sends it. Older detector builds use
/// `trend`/`strength`, newer ones `label`/`confidence`; some report the
/// label under `regime`. Only one variant of each is expected to be set.
#[derive(Debug, Deserialize)]
struct RawRegimeReply {
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    trend: Option<String>,
    #[serde(default)]
    regime: Option<String>,

    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    strength: Option<f64>,
    #[serde(default)]
    score: Option<f64>,
}

impl RawRegimeReply {
    /// Collapse the loose shapes into the fixed schema. Unknown or missing
    /// labels normalize to `Neutral` with zero confidence rather than
    /// failing the phase.
    fn normalize(self) -> RegimeObservation {
        let raw_label = self
            .label
            .or(self.trend)
            .or(self.regime)
            .unwrap_or_default();

        let label = raw_label.parse::<RegimeLabel>().unwrap_or_else(|_| {
            if !raw_label.is_empty() {
                warn!(raw_label, "Unrecognized regime label, treating as neutral");
            }
            RegimeLabel::Neutral
        });

        let confidence = self
            .confidence
            .or(self.strength)
            .or(self.score)
            .unwrap_or(0.0)
            .clamp(0.0, 1.0);

        RegimeObservation { label, confidence }
    }
}

#[derive(Debug, Deserialize)]
struct SentimentReply {
    value: f64,
    #[serde(default)]
    classification: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AtrReply {
    atr: Decimal,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// REST client for the market-data service.
pub struct HttpMarketData {
    client: Client,
    base_url: String,
}

impl HttpMarketData {
    pub fn new(base_url: String, request_timeout: Duration) -> Result<Self, WardenError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| WardenError::Init(format!("Failed to build market-data client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn network_err(&self, message: impl std::fmt::Display) -> WardenError {
        WardenError::Network {
            endpoint: self.base_url.clone(),
            message: message.to_string(),
            balance_related: false,
        }
    }
}

#[async_trait]
impl MarketDataProvider for HttpMarketData {
    async fn get_prices(
        &self,
        symbols: &[String],
    ) -> Result<HashMap<String, Decimal>, WardenError> {
        let url = format!("{}/prices", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&[("symbols", symbols.join(","))])
            .send()
            .await
            .map_err(|e| self.network_err(e))?;

        if !resp.status().is_success() {
            return Err(self.network_err(format!("prices returned HTTP {}", resp.status())));
        }

        let reply: PricesReply = resp.json().await.map_err(|e| self.network_err(e))?;
        debug!(
            requested = symbols.len(),
            received = reply.prices.len(),
            "Prices fetched"
        );
        Ok(reply.prices)
    }

    async fn get_regime(
        &self,
        symbol: &str,
        timeframe: &str,
    ) -> Result<RegimeObservation, WardenError> {
        let url = format!("{}/regime/{symbol}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&[("timeframe", timeframe)])
            .send()
            .await
            .map_err(|e| self.network_err(e))?;

        if !resp.status().is_success() {
            return Err(self.network_err(format!("regime returned HTTP {}", resp.status())));
        }

        let raw: RawRegimeReply = resp.json().await.map_err(|e| self.network_err(e))?;
        Ok(raw.normalize())
    }

    async fn get_sentiment_index(&self) -> Result<SentimentSnapshot, WardenError> {
        let url = format!("{}/sentiment", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.network_err(e))?;

        if !resp.status().is_success() {
            return Err(self.network_err(format!(
                "sentiment returned HTTP {}",
                resp.status()
            )));
        }

        let reply: SentimentReply = resp.json().await.map_err(|e| self.network_err(e))?;
        Ok(SentimentSnapshot {
            value: reply.value.clamp(0.0, 100.0),
            classification: reply.classification.unwrap_or_else(|| "unknown".to_string()),
        })
    }

    async fn get_atr(&self, symbol: &str, timeframe: &str) -> Result<Decimal, WardenError> {
        let url = format!("{}/atr/{symbol}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&[("timeframe", timeframe)])
            .send()
            .await
            .map_err(|e| self.network_err(e))?;

        if !resp.status().is_success() {
            return Err(self.network_err(format!("atr returned HTTP {}", resp.status())));
        }

        let reply: AtrReply = resp.json().await.map_err(|e| self.network_err(e))?;
        Ok(reply.atr)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Mock collaborators for integration testing.
//!
//! Provides deterministic in-memory implementations of the collaborator
//! traits — an arbiter with real lease/TTL semantics and a controllable
//! clock offset, a scripted market-data provider, a mutable exchange
//! account, a recording dispatcher, and in-memory persistence. All state
//! is fully controllable from test code.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use warden::collaborators::{
    Arbiter, ExchangeGateway, MarketDataProvider, PersistenceFacade, RegimeObservation,
    TradeDispatcher,
};
use warden::types::{
    AccountSnapshot, ApprovedOrder, ArchiveRecord, Balance, ClaimResponse, CloseInstruction,
    LeaseRecord, PersistedState, PositionInfo, RegimeLabel, SentimentSnapshot, SessionStatus,
    WardenError,
};

// ---------------------------------------------------------------------------
// Arbiter
// ---------------------------------------------------------------------------

/// In-memory arbiter holding a single lease slot with TTL semantics.
///
/// Time can be advanced with `advance` so staleness scenarios don't need
/// wall-clock sleeps. A claim by the current holder renews; a claim
/// against a stale holder takes the slot over; `force` overwrites
/// unconditionally.
pub struct MockArbiter {
    lease: Mutex<Option<LeaseRecord>>,
    ttl: ChronoDuration,
    clock_offset: Mutex<ChronoDuration>,
    unreachable: AtomicBool,
}

impl MockArbiter {
    pub fn new(ttl_secs: i64) -> Self {
        Self {
            lease: Mutex::new(None),
            ttl: ChronoDuration::seconds(ttl_secs),
            clock_offset: Mutex::new(ChronoDuration::zero()),
            unreachable: AtomicBool::new(false),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now() + *self.clock_offset.lock().unwrap()
    }

    /// Advance the arbiter's clock (lease ages accordingly).
    pub fn advance(&self, duration: ChronoDuration) {
        let mut offset = self.clock_offset.lock().unwrap();
        *offset = *offset + duration;
    }

    /// Make all requests fail until cleared.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn current_holder(&self) -> Option<String> {
        self.lease
            .lock()
            .unwrap()
            .as_ref()
            .map(|l| l.holder_id.clone())
    }

    pub fn current_lease(&self) -> Option<LeaseRecord> {
        self.lease.lock().unwrap().clone()
    }

    fn check_reachable(&self) -> Result<(), WardenError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(WardenError::Arbiter("arbiter unreachable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Arbiter for MockArbiter {
    async fn claim_session(
        &self,
        instance_id: &str,
        force: bool,
    ) -> Result<ClaimResponse, WardenError> {
        self.check_reachable()?;
        let now = self.now();
        let mut slot = self.lease.lock().unwrap();

        let settled = match slot.as_mut() {
            Some(lease) if lease.holder_id == instance_id => {
                // Idempotent renew for the current holder.
                lease.last_renewed_at = now;
                Some(ClaimResponse::Granted {
                    lease: lease.clone(),
                })
            }
            Some(lease) if !force && !lease.is_stale(self.ttl, now) => {
                Some(ClaimResponse::Denied {
                    lease: lease.clone(),
                })
            }
            _ => None,
        };
        if let Some(response) = settled {
            return Ok(response);
        }

        // Free slot, stale holder, or forced takeover.
        let lease = LeaseRecord {
            holder_id: instance_id.to_string(),
            claimed_at: now,
            last_renewed_at: now,
            forced: force && slot.is_some(),
        };
        *slot = Some(lease.clone());
        Ok(ClaimResponse::Granted { lease })
    }

    async fn release_session(&self, instance_id: &str) -> Result<bool, WardenError> {
        self.check_reachable()?;
        let mut slot = self.lease.lock().unwrap();
        let held = matches!(slot.as_ref(), Some(lease) if lease.holder_id == instance_id);
        if held {
            *slot = None;
        }
        Ok(held)
    }

    async fn session_status(&self) -> Result<SessionStatus, WardenError> {
        self.check_reachable()?;
        let now = self.now();
        let slot = self.lease.lock().unwrap();
        match slot.as_ref() {
            Some(lease) if !lease.is_stale(self.ttl, now) => Ok(SessionStatus {
                is_active: true,
                active_id: Some(lease.holder_id.clone()),
                lease: Some(lease.clone()),
            }),
            other => Ok(SessionStatus {
                is_active: false,
                active_id: None,
                lease: other.cloned(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

/// Scripted market data: regime, prices, and ATR are settable from tests.
pub struct MockMarketData {
    regime: Mutex<RegimeObservation>,
    prices: Mutex<HashMap<String, Decimal>>,
    atr: Mutex<Decimal>,
    sentiment: Mutex<SentimentSnapshot>,
}

impl MockMarketData {
    pub fn new() -> Self {
        Self {
            regime: Mutex::new(RegimeObservation {
                label: RegimeLabel::Neutral,
                confidence: 0.0,
            }),
            prices: Mutex::new(HashMap::from([
                ("BTCUSDT".to_string(), dec!(50000)),
                ("ETHUSDT".to_string(), dec!(2500)),
            ])),
            atr: Mutex::new(dec!(1000)),
            sentiment: Mutex::new(SentimentSnapshot {
                value: 50.0,
                classification: "neutral".into(),
            }),
        }
    }

    pub fn set_regime(&self, label: RegimeLabel, confidence: f64) {
        *self.regime.lock().unwrap() = RegimeObservation { label, confidence };
    }

    pub fn set_price(&self, symbol: &str, price: Decimal) {
        self.prices.lock().unwrap().insert(symbol.to_string(), price);
    }
}

#[async_trait]
impl MarketDataProvider for MockMarketData {
    async fn get_prices(
        &self,
        symbols: &[String],
    ) -> Result<HashMap<String, Decimal>, WardenError> {
        let prices = self.prices.lock().unwrap();
        Ok(symbols
            .iter()
            .filter_map(|s| prices.get(s).map(|p| (s.clone(), *p)))
            .collect())
    }

    async fn get_regime(
        &self,
        _symbol: &str,
        _timeframe: &str,
    ) -> Result<RegimeObservation, WardenError> {
        let regime = self.regime.lock().unwrap();
        Ok(RegimeObservation {
            label: regime.label,
            confidence: regime.confidence,
        })
    }

    async fn get_sentiment_index(&self) -> Result<SentimentSnapshot, WardenError> {
        Ok(self.sentiment.lock().unwrap().clone())
    }

    async fn get_atr(&self, _symbol: &str, _timeframe: &str) -> Result<Decimal, WardenError> {
        Ok(*self.atr.lock().unwrap())
    }
}

// ---------------------------------------------------------------------------
// Exchange
// ---------------------------------------------------------------------------

/// Mutable in-memory exchange account.
pub struct MockExchange {
    snapshot: Mutex<AccountSnapshot>,
}

impl MockExchange {
    pub fn with_funds(funds: Decimal) -> Self {
        Self {
            snapshot: Mutex::new(AccountSnapshot {
                balances: vec![Balance {
                    asset: "USDT".into(),
                    free: funds,
                    locked: Decimal::ZERO,
                }],
                positions: Vec::new(),
                fetched_at: Utc::now(),
            }),
        }
    }

    pub fn add_position(&self, position: PositionInfo) {
        self.snapshot.lock().unwrap().positions.push(position);
    }
}

#[async_trait]
impl ExchangeGateway for MockExchange {
    async fn get_account_snapshot(&self) -> Result<AccountSnapshot, WardenError> {
        let mut snapshot = self.snapshot.lock().unwrap().clone();
        snapshot.fetched_at = Utc::now();
        Ok(snapshot)
    }
}

// ---------------------------------------------------------------------------
// Dispatcher & persistence
// ---------------------------------------------------------------------------

/// Records every dispatched instruction.
#[derive(Default)]
pub struct RecordingDispatcher {
    pub opens: Mutex<Vec<ApprovedOrder>>,
    pub closes: Mutex<Vec<CloseInstruction>>,
}

#[async_trait]
impl TradeDispatcher for RecordingDispatcher {
    async fn open_position(&self, order: &ApprovedOrder) -> Result<String, WardenError> {
        self.opens.lock().unwrap().push(order.clone());
        Ok(format!("mock-open-{}", self.opens.lock().unwrap().len()))
    }

    async fn close_position(
        &self,
        instruction: &CloseInstruction,
    ) -> Result<String, WardenError> {
        self.closes.lock().unwrap().push(instruction.clone());
        Ok(format!("mock-close-{}", self.closes.lock().unwrap().len()))
    }

    fn is_dry_run(&self) -> bool {
        true
    }
}

/// In-memory persistence with a failure switch for critical-error tests.
#[derive(Default)]
pub struct MockPersistence {
    pub state: Mutex<Option<PersistedState>>,
    pub archives: Mutex<Vec<ArchiveRecord>>,
    pub fail_writes: AtomicBool,
}

impl MockPersistence {
    pub fn archived_cycles(&self) -> usize {
        self.archives.lock().unwrap().len()
    }
}

#[async_trait]
impl PersistenceFacade for MockPersistence {
    async fn load_cycle_state(&self) -> Result<Option<PersistedState>, WardenError> {
        Ok(self.state.lock().unwrap().clone())
    }

    async fn save_cycle_state(&self, state: &PersistedState) -> Result<(), WardenError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(WardenError::Storage("simulated write failure".into()));
        }
        *self.state.lock().unwrap() = Some(state.clone());
        Ok(())
    }

    async fn append_archive(&self, records: &[ArchiveRecord]) -> Result<(), WardenError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(WardenError::Storage("simulated write failure".into()));
        }
        self.archives.lock().unwrap().extend_from_slice(records);
        Ok(())
    }
}

//! Scan-cycle scheduler.
//!
//! The top-level state machine. While this instance holds the leadership
//! lease it drives phased scan cycles on a fixed interval: verify
//! leadership, refresh regime and prices, reconcile positions, gate new
//! entries through risk scoring and position sizing, then archive and
//! persist resumable counters. Lease renewal and passive leadership
//! verification run as independent lower-frequency tasks that never block
//! an in-flight cycle.
//!
//! Error discipline: phase failures are classified critical (stop the
//! engine, release the lease, raise an alert) or non-critical (log,
//! degrade, next cycle proceeds on schedule).

use chrono::Utc;
use futures::future::join_all;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::collaborators::{
    ExchangeGateway, MarketDataProvider, PersistenceFacade, TradeDispatcher,
};
use crate::config::{AppConfig, SizingStrategy};
use crate::engine::monitor::PositionMonitor;
use crate::leadership::{ClaimResult, LeaderElectionCoordinator, LeadershipState};
use crate::retry::{with_timeout, RetryPolicy};
use crate::risk::sizing::{fixed_conviction_notional, volatility_adjusted_notional};
use crate::risk::{PositionSizeGate, RiskInputs, RiskScoreAggregator, SizingRequest};
use crate::strategy::{StrategyContext, TradeStrategy};
use crate::types::{
    AccountSnapshot, AlertInfo, ApprovedOrder, ArchiveRecord, CycleOutcome, CycleReport,
    CycleStats, EngineState, PersistedState, PhaseTiming, RegimeSnapshot, ScanPhase,
    SentimentSnapshot, StatusSnapshot, TradingMode, WardenError,
};

/// Countdown resolution for cycle scheduling.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Outcome of a start attempt. A conflicting holder is actionable state,
/// not an error: the operator may force-claim through the dashboard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    ConflictingHolder { holder_id: String },
    ArbiterUnavailable,
}

/// Injected collaborators. One set per engine instance; no globals.
pub struct SchedulerDeps {
    pub coordinator: Arc<LeaderElectionCoordinator>,
    pub market_data: Arc<dyn MarketDataProvider>,
    pub exchange: Arc<dyn ExchangeGateway>,
    pub dispatcher: Arc<dyn TradeDispatcher>,
    pub persistence: Arc<dyn PersistenceFacade>,
    pub strategies: Vec<Arc<dyn TradeStrategy>>,
}

/// Mutable cycle state. Owned by the leading instance; single writer.
struct Inner {
    regime: RegimeSnapshot,
    sentiment: Option<SentimentSnapshot>,
    stats: CycleStats,
    trading_mode: TradingMode,
    next_scheduled_at: Option<chrono::DateTime<Utc>>,
    /// Equity at the first snapshot of the session; realized P&L input is
    /// derived as equity change minus the unrealized component.
    session_baseline_equity: Option<Decimal>,
    /// Inputs carried from the previous cycle into risk scoring.
    last_opportunity_rate: Option<f64>,
    last_signal_quality: Option<f64>,
}

pub struct ScanCycleScheduler {
    config: Arc<AppConfig>,
    deps: SchedulerDeps,
    aggregator: RiskScoreAggregator,
    gate: PositionSizeGate,
    monitor: PositionMonitor,
    phase_retry: RetryPolicy,
    inner: tokio::sync::Mutex<Inner>,
    /// Re-entrancy guard: at most one cycle in flight, ever.
    cycle_in_flight: AtomicBool,
    stop_requested: AtomicBool,
    state: RwLock<EngineState>,
    status: Arc<RwLock<StatusSnapshot>>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    /// Back-reference for handing `Arc<Self>` to spawned tasks.
    self_ref: Weak<Self>,
}

/// Clears the in-flight flag when a cycle unwinds by any path.
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl ScanCycleScheduler {
    /// Build a scheduler, resuming counters and regime streaks from
    /// persisted state when available.
    pub fn new(
        config: Arc<AppConfig>,
        deps: SchedulerDeps,
        restored: Option<PersistedState>,
    ) -> Arc<Self> {
        let trading_mode = restored
            .as_ref()
            .map(|s| s.trading_mode)
            .unwrap_or(config.agent.trading_mode);
        let regime = restored
            .as_ref()
            .map(|s| s.regime_state.clone())
            .unwrap_or_else(|| {
                RegimeSnapshot::neutral(config.scanner.regime_confirmation_periods)
            });
        let stats = restored
            .as_ref()
            .map(|s| s.cycle_stats.clone())
            .unwrap_or_default();

        let status = StatusSnapshot::stopped(deps.coordinator.instance_id(), trading_mode);

        Arc::new_cyclic(|self_ref| Self {
            aggregator: RiskScoreAggregator::new(config.risk_score.clone()),
            gate: PositionSizeGate::new(config.scanner.min_trade_value),
            monitor: PositionMonitor::new(config.monitor.clone()),
            phase_retry: RetryPolicy::new(2, Duration::from_millis(500)),
            inner: tokio::sync::Mutex::new(Inner {
                regime,
                sentiment: None,
                stats,
                trading_mode,
                next_scheduled_at: None,
                session_baseline_equity: None,
                last_opportunity_rate: None,
                last_signal_quality: None,
            }),
            cycle_in_flight: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            state: RwLock::new(EngineState::Stopped),
            status: Arc::new(RwLock::new(status)),
            tasks: std::sync::Mutex::new(Vec::new()),
            self_ref: self_ref.clone(),
            config,
            deps,
        })
    }

    pub fn state(&self) -> EngineState {
        *self.state.read().unwrap()
    }

    /// Shared status snapshot for the dashboard.
    pub fn status_handle(&self) -> Arc<RwLock<StatusSnapshot>> {
        self.status.clone()
    }

    pub fn coordinator(&self) -> &Arc<LeaderElectionCoordinator> {
        &self.deps.coordinator
    }

    /// Current durable state, e.g. for the final save on shutdown.
    pub async fn persisted_state(&self, is_running: bool) -> PersistedState {
        let inner = self.inner.lock().await;
        PersistedState {
            is_running,
            trading_mode: inner.trading_mode,
            regime_state: inner.regime.clone(),
            cycle_stats: inner.stats.clone(),
        }
    }

    fn set_state(&self, next: EngineState) {
        *self.state.write().unwrap() = next;
        let mut status = self.status.write().unwrap();
        status.state = next;
        status.is_leader = self.deps.coordinator.is_leader();
        status.updated_at = Utc::now();
    }

    fn raise_alert(&self, message: String) {
        error!(alert = %message, "Engine alert");
        let mut status = self.status.write().unwrap();
        status.last_alert = Some(AlertInfo {
            message,
            at: Utc::now(),
        });
        status.updated_at = Utc::now();
    }

    // -- Lifecycle ---------------------------------------------------------

    /// Claim leadership and begin scanning. On success the first cycle
    /// runs immediately and the countdown, renewal, and verification
    /// tasks are spawned.
    pub async fn start(&self, force: bool) -> Result<StartOutcome, WardenError> {
        if matches!(self.state(), EngineState::Idle | EngineState::Scanning) {
            debug!("Start requested but scheduler already running");
            return Ok(StartOutcome::Started);
        }

        self.set_state(EngineState::Initializing);
        self.stop_requested.store(false, Ordering::SeqCst);

        match self.deps.coordinator.claim(force).await {
            Ok(ClaimResult::Granted) => {}
            Ok(ClaimResult::Conflict { holder_id }) => {
                info!(
                    holder = %holder_id,
                    "Another instance is leading; staying in observer mode"
                );
                self.set_state(EngineState::Stopped);
                return Ok(StartOutcome::ConflictingHolder { holder_id });
            }
            Err(e) => {
                // Arbiter unreachable is non-critical: stay down, the
                // operator (or a restart) retries later.
                warn!(error = %e, "Leadership claim failed, arbiter unavailable");
                self.set_state(EngineState::Stopped);
                return Ok(StartOutcome::ArbiterUnavailable);
            }
        }

        self.set_state(EngineState::Idle);
        self.spawn_renewal_task();
        self.spawn_verify_task();

        info!(
            instance_id = self.deps.coordinator.instance_id(),
            interval_ms = self.config.agent.scan_interval_ms,
            "Scheduler started; running first cycle"
        );

        match self.run_cycle().await {
            Ok(report) => log_cycle_report(&report),
            Err(e) if e.is_critical() => {
                self.raise_alert(format!("Critical failure in first cycle: {e}"));
                self.stop().await;
                return Err(e);
            }
            Err(e) => warn!(error = %e, "First cycle failed (non-critical)"),
        }

        self.spawn_countdown_task();
        Ok(StartOutcome::Started)
    }

    /// Stop scanning, cancel the countdown, and release the lease.
    /// Idempotent.
    pub async fn stop(&self) {
        if self.stop_requested.swap(true, Ordering::SeqCst)
            && self.state() == EngineState::Stopped
        {
            return;
        }

        {
            let mut inner = self.inner.lock().await;
            inner.next_scheduled_at = None;
        }
        {
            let mut status = self.status.write().unwrap();
            status.next_scheduled_at = None;
        }

        self.deps.coordinator.release().await;
        self.set_state(EngineState::Stopped);

        // Abort background tasks last: stop() may be running inside the
        // countdown task itself, and an early abort would cancel the lease
        // release above at its next await point.
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        info!("Scheduler stopped");
    }

    fn spawn_countdown_task(&self) {
        let Some(scheduler) = self.self_ref.upgrade() else {
            return;
        };
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(TICK_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                if scheduler.stop_requested.load(Ordering::SeqCst) {
                    break;
                }
                // Leadership is the engine-wide cancellation mechanism.
                if !scheduler.deps.coordinator.is_leader() {
                    warn!("Leadership lost; stopping scheduler");
                    scheduler.stop().await;
                    break;
                }

                let due = {
                    let inner = scheduler.inner.lock().await;
                    inner
                        .next_scheduled_at
                        .map(|at| Utc::now() >= at)
                        .unwrap_or(false)
                };
                if !due {
                    continue;
                }

                match scheduler.run_cycle().await {
                    Ok(report) => log_cycle_report(&report),
                    Err(e) if e.is_critical() => {
                        scheduler.raise_alert(format!("Critical cycle failure: {e}"));
                        scheduler.stop().await;
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Cycle failed (non-critical), keeping schedule");
                        let mut inner = scheduler.inner.lock().await;
                        inner.stats.record_failure();
                        inner.next_scheduled_at =
                            Some(Utc::now() + chrono::Duration::milliseconds(
                                scheduler.config.agent.scan_interval_ms as i64,
                            ));
                    }
                }
            }
        });
        self.tasks.lock().unwrap().push(handle);
    }

    fn spawn_renewal_task(&self) {
        let coordinator = self.deps.coordinator.clone();
        let interval = Duration::from_secs(self.config.leadership.renew_interval_secs);
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately; skip it, the claim just happened.
            tick.tick().await;
            loop {
                tick.tick().await;
                if !matches!(
                    coordinator.state(),
                    LeadershipState::Leader
                ) {
                    break;
                }
                coordinator.renew().await;
                if coordinator.should_verify() {
                    if let Err(e) = coordinator.verify().await {
                        warn!(error = %e, "Escalated verify failed");
                    }
                }
            }
        });
        self.tasks.lock().unwrap().push(handle);
    }

    fn spawn_verify_task(&self) {
        let coordinator = self.deps.coordinator.clone();
        let interval = Duration::from_secs(self.config.leadership.verify_interval_secs);
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await;
            loop {
                tick.tick().await;
                match coordinator.verify().await {
                    Ok(true) => {}
                    Ok(false) => {
                        // Stand-down recorded; the countdown task observes
                        // the state change and stops the scheduler.
                        break;
                    }
                    Err(e) => warn!(error = %e, "Periodic verify failed"),
                }
            }
        });
        self.tasks.lock().unwrap().push(handle);
    }

    // -- Cycle -------------------------------------------------------------

    /// Run one scan cycle. Invoking while a cycle is already in flight is
    /// a no-op (never two cycles concurrently).
    pub async fn run_cycle(&self) -> Result<CycleReport, WardenError> {
        if self
            .cycle_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // Read the counter from the published status: the in-flight
            // cycle holds the inner lock and a no-op must not wait on it.
            let total = self.status.read().unwrap().cycle_stats.total_cycles;
            debug!("Cycle already in flight; invocation skipped");
            return Ok(CycleReport::skipped(total));
        }
        let _guard = InFlightGuard(&self.cycle_in_flight);

        self.set_state(EngineState::Scanning);
        let result = self.run_cycle_inner().await;
        if self.state() == EngineState::Scanning {
            self.set_state(EngineState::Idle);
        }
        result
    }

    async fn run_cycle_inner(&self) -> Result<CycleReport, WardenError> {
        let started_at = Utc::now();
        let cycle_start = Instant::now();
        let mut inner = self.inner.lock().await;
        let cycle_number = inner.stats.total_cycles + 1;
        let mut timings: Vec<PhaseTiming> = Vec::new();

        info!(cycle = cycle_number, "Starting cycle");

        // Phase 1: verify leadership. Losing the lease aborts the cycle.
        let phase_start = Instant::now();
        let leads = self.verify_leadership().await;
        record_phase(&mut timings, ScanPhase::VerifyLeadership, phase_start);
        if !leads {
            warn!(cycle = cycle_number, "Not leading; aborting cycle");
            return Ok(self.abort_report(cycle_number, started_at, timings));
        }

        // Phase 2: refresh regime + sentiment. Failures degrade to the
        // previous snapshot.
        let phase_start = Instant::now();
        self.refresh_regime(&mut inner).await;
        record_phase(&mut timings, ScanPhase::RefreshRegime, phase_start);

        // Phase 3: refresh prices (+ ATR for the regime symbol).
        let phase_start = Instant::now();
        let prices = self.refresh_prices().await;
        let atr = self.fetch_atr().await;
        record_phase(&mut timings, ScanPhase::RefreshPrices, phase_start);

        // Phase 4: reconcile and monitor existing positions.
        let phase_start = Instant::now();
        let account = self.fetch_account().await?;
        let mut closes_issued = 0usize;
        if let Some(snapshot) = &account {
            closes_issued = self.monitor_positions(snapshot, &prices).await;
        }
        record_phase(&mut timings, ScanPhase::MonitorPositions, phase_start);

        // Risk scoring feeds the sizing decisions below.
        let breakdown = {
            let volatility_pct = volatility_fraction(atr, &prices, &self.config.market_data.regime_symbol);
            let (unrealized, realized) = pnl_inputs(&mut inner, account.as_ref());
            self.aggregator.compute(&RiskInputs {
                unrealized_pnl_pct: unrealized,
                realized_pnl_pct: realized,
                regime: Some(inner.regime.clone()),
                volatility_pct,
                opportunity_rate: inner.last_opportunity_rate,
                sentiment: inner.sentiment.clone(),
                signal_quality: inner.last_signal_quality,
            })
        };

        // Phase 5: capital check. Failing it skips strategy evaluation but
        // the archive phase still runs.
        let phase_start = Instant::now();
        let (skip_strategies, available, allocated) = match &account {
            Some(snapshot) => {
                let available = snapshot.available_funds(&self.config.agent.quote_asset);
                let allocated = snapshot.allocated_notional();
                let skip = available < self.config.scanner.min_trade_value
                    || allocated >= self.config.scanner.invest_cap;
                if skip {
                    info!(
                        available = %available,
                        allocated = %allocated,
                        "Capital check failed; skipping strategy evaluation"
                    );
                }
                (skip, available, allocated)
            }
            None => {
                warn!("No account snapshot; skipping strategy evaluation");
                (true, Decimal::ZERO, Decimal::ZERO)
            }
        };
        record_phase(&mut timings, ScanPhase::CapitalCheck, phase_start);

        // Phase 6: evaluate strategies and open positions through the gate.
        let phase_start = Instant::now();
        let (approved, rejected) = match &account {
            Some(snapshot) if !skip_strategies => {
                // Leadership may have been lost mid-cycle; re-check before
                // the only phase that opens positions.
                if !self.deps.coordinator.is_leader() {
                    warn!("Leadership lost before entry phase; aborting cycle");
                    return Ok(self.abort_report(cycle_number, started_at, timings));
                }
                self.evaluate_strategies(
                    &mut inner,
                    snapshot,
                    &prices,
                    atr,
                    available,
                    breakdown.risk_multiplier_pct,
                )
                .await
            }
            _ => (0, 0),
        };
        record_phase(&mut timings, ScanPhase::EvaluateStrategies, phase_start);

        // Phase 7: archive + persist resumable state. Storage failures are
        // critical and unwind to the countdown loop.
        let phase_start = Instant::now();
        let duration_ms = cycle_start.elapsed().as_millis() as u64;
        inner.stats.record_cycle(duration_ms);

        let outcome = if skip_strategies {
            CycleOutcome::CompletedStrategiesSkipped
        } else {
            CycleOutcome::Completed
        };

        let record = ArchiveRecord {
            cycle_number,
            started_at,
            duration_ms,
            outcome: outcome_label(outcome).to_string(),
            risk_score: Some(breakdown.final_score),
            risk_multiplier_pct: Some(breakdown.risk_multiplier_pct),
            intents_approved: approved as u32,
            intents_rejected: rejected as u32,
            closes_issued: closes_issued as u32,
            available_funds: available,
            allocated_notional: allocated,
        };
        self.deps.persistence.append_archive(&[record]).await?;

        let persisted = PersistedState {
            is_running: true,
            trading_mode: inner.trading_mode,
            regime_state: inner.regime.clone(),
            cycle_stats: inner.stats.clone(),
        };
        self.deps.persistence.save_cycle_state(&persisted).await?;
        record_phase(&mut timings, ScanPhase::Archive, phase_start);

        // Reschedule.
        let next = Utc::now()
            + chrono::Duration::milliseconds(self.config.agent.scan_interval_ms as i64);
        inner.next_scheduled_at = Some(next);

        self.publish_status(&inner, breakdown.final_score, breakdown.risk_multiplier_pct);

        Ok(CycleReport {
            cycle_number,
            outcome,
            phase_timings: timings,
            risk_score: Some(breakdown.final_score),
            risk_multiplier_pct: Some(breakdown.risk_multiplier_pct),
            intents_approved: approved,
            intents_rejected: rejected,
            closes_issued,
            duration_ms,
            started_at,
        })
    }

    fn abort_report(
        &self,
        cycle_number: u64,
        started_at: chrono::DateTime<Utc>,
        timings: Vec<PhaseTiming>,
    ) -> CycleReport {
        CycleReport {
            cycle_number,
            outcome: CycleOutcome::AbortedLeadershipLost,
            phase_timings: timings,
            risk_score: None,
            risk_multiplier_pct: None,
            intents_approved: 0,
            intents_rejected: 0,
            closes_issued: 0,
            duration_ms: 0,
            started_at,
        }
    }

    fn publish_status(&self, inner: &Inner, score: f64, multiplier: f64) {
        let mut status = self.status.write().unwrap();
        status.is_leader = self.deps.coordinator.is_leader();
        status.trading_mode = inner.trading_mode;
        status.cycle_stats = inner.stats.clone();
        status.regime = Some(inner.regime.clone());
        status.last_risk_score = Some(score);
        status.last_risk_multiplier_pct = Some(multiplier);
        status.next_scheduled_at = inner.next_scheduled_at;
        status.updated_at = Utc::now();
    }

    // -- Phases ------------------------------------------------------------

    async fn verify_leadership(&self) -> bool {
        let timeout = self.config.leadership.request_timeout();
        match with_timeout(timeout, "verify_leadership", self.deps.coordinator.verify()).await {
            Ok(is_leader) => is_leader,
            Err(e) => {
                // Arbiter unreachable: keep the local belief and continue;
                // the renewal loop keeps pressing for reconciliation.
                warn!(error = %e, "Leadership verify failed, trusting local state");
                self.deps.coordinator.is_leader()
            }
        }
    }

    async fn refresh_regime(&self, inner: &mut Inner) {
        let timeout = Duration::from_secs(self.config.market_data.request_timeout_secs);
        let symbol = self.config.market_data.regime_symbol.clone();
        let timeframe = self.config.market_data.regime_timeframe.clone();
        let market_data = self.deps.market_data.clone();

        let observation = self
            .phase_retry
            .run(
                "refresh_regime",
                || {
                    let market_data = market_data.clone();
                    let symbol = symbol.clone();
                    let timeframe = timeframe.clone();
                    async move {
                        with_timeout(timeout, "get_regime", async {
                            market_data.get_regime(&symbol, &timeframe).await
                        })
                        .await
                    }
                },
                |e| !e.is_critical(),
            )
            .await;

        match observation {
            Ok(obs) => {
                inner
                    .regime
                    .observe(obs.label, obs.confidence, self.config.scanner.regime_history_len);
                debug!(regime = %inner.regime, "Regime refreshed");
            }
            Err(e) => warn!(error = %e, "Regime refresh failed, keeping previous snapshot"),
        }

        if self.config.market_data.sentiment_enabled {
            let market_data = self.deps.market_data.clone();
            match with_timeout(timeout, "get_sentiment", async {
                market_data.get_sentiment_index().await
            })
            .await
            {
                Ok(sentiment) => inner.sentiment = Some(sentiment),
                Err(e) => warn!(error = %e, "Sentiment refresh failed, keeping previous"),
            }
        }
    }

    async fn refresh_prices(&self) -> HashMap<String, Decimal> {
        let timeout = Duration::from_secs(self.config.market_data.request_timeout_secs);
        let symbols: Vec<String> = self
            .config
            .watchlist
            .iter()
            .map(|w| w.symbol.clone())
            .collect();
        let market_data = self.deps.market_data.clone();

        let result = self
            .phase_retry
            .run(
                "refresh_prices",
                || {
                    let market_data = market_data.clone();
                    let symbols = symbols.clone();
                    async move {
                        with_timeout(timeout, "get_prices", async {
                            market_data.get_prices(&symbols).await
                        })
                        .await
                    }
                },
                |e| !e.is_critical(),
            )
            .await;

        match result {
            Ok(prices) => prices,
            Err(e) => {
                warn!(error = %e, "Price refresh failed; cycle continues without fresh prices");
                HashMap::new()
            }
        }
    }

    async fn fetch_atr(&self) -> Option<Decimal> {
        let timeout = Duration::from_secs(self.config.market_data.request_timeout_secs);
        let market_data = self.deps.market_data.clone();
        let symbol = self.config.market_data.regime_symbol.clone();
        let timeframe = self.config.market_data.regime_timeframe.clone();

        match with_timeout(timeout, "get_atr", async {
            market_data.get_atr(&symbol, &timeframe).await
        })
        .await
        {
            Ok(atr) => Some(atr),
            Err(e) => {
                warn!(error = %e, "ATR fetch failed");
                None
            }
        }
    }

    /// Critical network failures propagate; timeouts degrade to `None`.
    async fn fetch_account(&self) -> Result<Option<AccountSnapshot>, WardenError> {
        let timeout = Duration::from_secs(self.config.exchange.snapshot_timeout_secs);
        let exchange = self.deps.exchange.clone();

        match with_timeout(timeout, "account_snapshot", async {
            exchange.get_account_snapshot().await
        })
        .await
        {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) if e.is_critical() => Err(e),
            Err(e) => {
                warn!(error = %e, "Account snapshot failed (non-critical)");
                Ok(None)
            }
        }
    }

    async fn monitor_positions(
        &self,
        snapshot: &AccountSnapshot,
        prices: &HashMap<String, Decimal>,
    ) -> usize {
        let instructions = self.monitor.review(&snapshot.positions, prices);
        if instructions.is_empty() {
            return 0;
        }

        let dispatches = instructions
            .iter()
            .map(|instruction| self.deps.dispatcher.close_position(instruction));
        let results = join_all(dispatches).await;

        let mut issued = 0usize;
        for (instruction, result) in instructions.iter().zip(results) {
            match result {
                Ok(receipt) => {
                    issued += 1;
                    debug!(
                        symbol = %instruction.symbol,
                        receipt = %receipt,
                        "Close dispatched"
                    );
                }
                Err(e) => warn!(
                    symbol = %instruction.symbol,
                    error = %e,
                    "Close dispatch failed"
                ),
            }
        }
        issued
    }

    async fn evaluate_strategies(
        &self,
        inner: &mut Inner,
        account: &AccountSnapshot,
        prices: &HashMap<String, Decimal>,
        atr: Option<Decimal>,
        available: Decimal,
        risk_multiplier_pct: f64,
    ) -> (usize, usize) {
        let scanner = &self.config.scanner;

        if scanner.block_trading_on_downtrend && inner.regime.is_confirmed_downtrend() {
            info!("Confirmed downtrend; entries blocked by configuration");
            return (0, 0);
        }
        if inner.regime.confidence < scanner.min_regime_confidence {
            debug!(
                confidence = inner.regime.confidence,
                "Regime confidence below minimum; no entries this cycle"
            );
            return (0, 0);
        }

        let ctx = StrategyContext {
            regime: &inner.regime,
            sentiment: inner.sentiment.as_ref(),
            prices,
            account,
            watchlist: &self.config.watchlist,
        };

        let mut all_intents = Vec::new();
        for strategy in &self.deps.strategies {
            if !strategy.is_enabled() {
                continue;
            }
            let open_for_strategy = account
                .positions
                .iter()
                .filter(|p| p.strategy_id.as_deref() == Some(strategy.id()))
                .count();
            let budget = scanner
                .max_positions_per_strategy
                .saturating_sub(open_for_strategy);
            if budget == 0 {
                debug!(strategy = strategy.id(), "Position budget exhausted");
                continue;
            }

            match strategy.propose(&ctx).await {
                Ok(mut intents) => {
                    intents.truncate(budget);
                    all_intents.extend(intents);
                }
                Err(e) => warn!(
                    strategy = strategy.id(),
                    error = %e,
                    "Strategy evaluation failed"
                ),
            }
        }

        // Feed next cycle's risk inputs before filtering.
        inner.last_opportunity_rate = Some(all_intents.len() as f64);
        inner.last_signal_quality = if all_intents.is_empty() {
            None
        } else {
            Some(
                all_intents.iter().map(|i| i.signal_strength).sum::<f64>()
                    / all_intents.len() as f64,
            )
        };

        let mut approved = 0usize;
        let mut rejected = 0usize;
        let mut remaining_funds = available;

        for intent in all_intents {
            if intent.signal_strength < scanner.min_combined_signal_strength {
                debug!(
                    symbol = %intent.symbol,
                    strength = intent.signal_strength,
                    "Signal below combined minimum"
                );
                rejected += 1;
                continue;
            }

            let Some(instrument) = self
                .config
                .watchlist
                .iter()
                .find(|w| w.symbol == intent.symbol)
            else {
                rejected += 1;
                continue;
            };

            let effective_risk_pct =
                scanner.max_balance_risk_pct * risk_multiplier_pct / 100.0;
            let proposed = match self.config.sizing.strategy {
                SizingStrategy::VolatilityAdjusted => {
                    let (Some(atr), Some(price)) = (atr, prices.get(&intent.symbol)) else {
                        debug!(symbol = %intent.symbol, "No ATR/price for sizing");
                        rejected += 1;
                        continue;
                    };
                    volatility_adjusted_notional(
                        remaining_funds,
                        effective_risk_pct,
                        atr,
                        self.config.sizing.atr_stop_multiplier,
                        *price,
                    )
                }
                SizingStrategy::FixedConviction => {
                    let base = self.config.sizing.base_position_size
                        * Decimal::from_f64(risk_multiplier_pct / 100.0)
                            .unwrap_or(Decimal::ONE);
                    fixed_conviction_notional(base, intent.conviction)
                }
            };

            let request = SizingRequest {
                available_funds: remaining_funds,
                proposed_notional: proposed,
                instrument_min_notional: instrument.min_notional,
                instrument_step_size: instrument.step_size,
            };
            let decision = self.gate.evaluate(&request);

            let Some(notional) = decision.adjusted_notional.filter(|_| decision.accepted)
            else {
                if let Some(reason) = decision.reason {
                    info!(
                        symbol = %intent.symbol,
                        proposed = %proposed,
                        reason = %reason,
                        "Entry rejected by size gate"
                    );
                }
                rejected += 1;
                continue;
            };
            let order = ApprovedOrder {
                intent,
                notional,
                risk_multiplier_pct,
            };
            match self.deps.dispatcher.open_position(&order).await {
                Ok(receipt) => {
                    approved += 1;
                    remaining_funds -= notional;
                    info!(
                        symbol = %order.intent.symbol,
                        notional = %notional,
                        receipt = %receipt,
                        "Entry dispatched"
                    );
                }
                Err(e) => {
                    warn!(
                        symbol = %order.intent.symbol,
                        error = %e,
                        "Entry dispatch failed"
                    );
                    rejected += 1;
                }
            }
        }

        (approved, rejected)
    }
}

// -- helpers ----------------------------------------------------------------

fn record_phase(timings: &mut Vec<PhaseTiming>, phase: ScanPhase, start: Instant) {
    let duration_ms = start.elapsed().as_millis() as u64;
    debug!(phase = %phase, duration_ms, "Phase complete");
    timings.push(PhaseTiming { phase, duration_ms });
}

fn outcome_label(outcome: CycleOutcome) -> &'static str {
    match outcome {
        CycleOutcome::Completed => "completed",
        CycleOutcome::CompletedStrategiesSkipped => "strategies_skipped",
        CycleOutcome::AbortedLeadershipLost => "aborted_leadership_lost",
        CycleOutcome::SkippedAlreadyRunning => "skipped",
    }
}

/// ATR as a fraction of the regime symbol's price.
fn volatility_fraction(
    atr: Option<Decimal>,
    prices: &HashMap<String, Decimal>,
    regime_symbol: &str,
) -> Option<f64> {
    let atr = atr?;
    let price = prices.get(regime_symbol)?;
    if price.is_zero() {
        return None;
    }
    (atr / price).to_f64()
}

/// Unrealized P&L from the snapshot; realized derived as session equity
/// change minus the unrealized component.
fn pnl_inputs(inner: &mut Inner, account: Option<&AccountSnapshot>) -> (Option<f64>, Option<f64>) {
    let Some(snapshot) = account else {
        return (None, None);
    };

    let unrealized_pct = snapshot.unrealized_pnl_pct();
    let allocated = snapshot.allocated_notional();
    let equity = snapshot
        .balances
        .iter()
        .map(|b| b.total())
        .sum::<Decimal>()
        + allocated;

    let baseline = *inner.session_baseline_equity.get_or_insert(equity);
    let realized_pct = if baseline.is_zero() {
        None
    } else {
        let unrealized_amount: Decimal =
            snapshot.positions.iter().map(|p| p.unrealized_pnl()).sum();
        ((equity - baseline - unrealized_amount) / baseline).to_f64()
    };

    (Some(unrealized_pct), realized_pct)
}

fn log_cycle_report(report: &CycleReport) {
    if report.outcome == CycleOutcome::SkippedAlreadyRunning {
        return;
    }
    info!(
        cycle = report.cycle_number,
        outcome = outcome_label(report.outcome),
        duration_ms = report.duration_ms,
        risk_score = report.risk_score.map(|s| format!("{s:.1}")),
        approved = report.intents_approved,
        rejected = report.intents_rejected,
        closes = report.closes_issued,
        "Cycle complete"
    );
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

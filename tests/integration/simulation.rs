//! End-to-end simulation of the lease-coordinated scan engine.
//!
//! Exercises the coordination properties across multiple competing
//! instances: the single-leader invariant, staleness takeover, forced
//! takeover, split-brain stand-down, and the full scheduler lifecycle
//! against mock collaborators.

use chrono::Duration as ChronoDuration;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

use warden::config::{
    AgentConfig, AppConfig, DashboardConfig, ExchangeConfig, LeadershipConfig,
    MarketDataConfig, MonitorConfig, RiskScoreConfig, RiskWeights, ScannerConfig,
    SizingConfig, SizingStrategy, StorageConfig, WatchedInstrument,
};
use warden::engine::scheduler::{ScanCycleScheduler, SchedulerDeps, StartOutcome};
use warden::leadership::{ClaimResult, LeaderElectionCoordinator, LeadershipState};
use warden::strategy::regime_follow::{RegimeFollowConfig, RegimeFollowStrategy};
use warden::strategy::TradeStrategy;
use warden::types::{EngineState, RegimeLabel, TradingMode};

use crate::mock_collaborators::{
    MockArbiter, MockExchange, MockMarketData, MockPersistence, RecordingDispatcher,
};

const LEASE_TTL_SECS: i64 = 60;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn coordinator(arbiter: Arc<MockArbiter>, instance_id: &str) -> Arc<LeaderElectionCoordinator> {
    Arc::new(LeaderElectionCoordinator::new(
        arbiter,
        instance_id.to_string(),
        ChronoDuration::seconds(LEASE_TTL_SECS),
        3,
        Duration::from_millis(1),
    ))
}

fn test_config(instance_id: &str) -> Arc<AppConfig> {
    Arc::new(AppConfig {
        agent: AgentConfig {
            name: "WARDEN-SIM".into(),
            instance_id: Some(instance_id.into()),
            scan_interval_ms: 3_600_000, // cycles only run when driven
            trading_mode: TradingMode::Paper,
            quote_asset: "USDT".into(),
        },
        leadership: LeadershipConfig {
            arbiter_url: "http://unused".into(),
            auth_token_env: None,
            lease_ttl_secs: LEASE_TTL_SECS as u64,
            renew_interval_secs: 1,
            verify_interval_secs: 1,
            claim_max_attempts: 3,
            claim_base_delay_ms: 1,
            request_timeout_secs: 5,
        },
        market_data: MarketDataConfig {
            base_url: "http://unused".into(),
            request_timeout_secs: 5,
            regime_timeframe: "4h".into(),
            regime_symbol: "BTCUSDT".into(),
            sentiment_enabled: true,
        },
        exchange: ExchangeConfig {
            base_url: "http://unused".into(),
            request_timeout_secs: 5,
            snapshot_timeout_secs: 5,
        },
        scanner: ScannerConfig {
            min_combined_signal_strength: 0.5,
            min_regime_confidence: 0.5,
            min_trade_value: dec!(10),
            max_positions_per_strategy: 3,
            max_balance_risk_pct: 2.0,
            invest_cap: dec!(100000),
            block_trading_on_downtrend: true,
            regime_confirmation_periods: 1,
            regime_history_len: 10,
        },
        monitor: MonitorConfig {
            stop_loss_pct: 0.05,
            take_profit_pct: 0.10,
            max_holding_hours: 0,
        },
        sizing: SizingConfig {
            strategy: SizingStrategy::FixedConviction,
            base_position_size: dec!(100),
            atr_stop_multiplier: dec!(1.5),
        },
        risk_score: RiskScoreConfig {
            recompute_interval_secs: 0,
            max_multiplier_pct: 100.0,
            floor_pct: 5.0,
            full_threshold: 80.0,
            mid_threshold: 50.0,
            low_threshold: 30.0,
            weights: RiskWeights {
                unrealized_pnl: 0.20,
                realized_pnl: 0.20,
                regime: 0.15,
                volatility: 0.15,
                opportunity: 0.10,
                sentiment: 0.10,
                signal_quality: 0.10,
            },
        },
        watchlist: vec![WatchedInstrument {
            symbol: "BTCUSDT".into(),
            min_notional: dec!(10),
            step_size: dec!(0.1),
        }],
        storage: StorageConfig {
            state_file: "unused.json".into(),
            archive_db: ":memory:".into(),
        },
        dashboard: DashboardConfig {
            enabled: false,
            port: 0,
        },
    })
}

struct Instance {
    scheduler: Arc<ScanCycleScheduler>,
    market: Arc<MockMarketData>,
    exchange: Arc<MockExchange>,
    dispatcher: Arc<RecordingDispatcher>,
    persistence: Arc<MockPersistence>,
}

fn instance(arbiter: Arc<MockArbiter>, instance_id: &str) -> Instance {
    let market = Arc::new(MockMarketData::new());
    let exchange = Arc::new(MockExchange::with_funds(dec!(10000)));
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let persistence = Arc::new(MockPersistence::default());
    let strategies: Vec<Arc<dyn TradeStrategy>> = vec![Arc::new(RegimeFollowStrategy::new(
        RegimeFollowConfig::default(),
    ))];

    let deps = SchedulerDeps {
        coordinator: coordinator(arbiter, instance_id),
        market_data: market.clone(),
        exchange: exchange.clone(),
        dispatcher: dispatcher.clone(),
        persistence: persistence.clone(),
        strategies,
    };

    Instance {
        scheduler: ScanCycleScheduler::new(test_config(instance_id), deps, None),
        market,
        exchange,
        dispatcher,
        persistence,
    }
}

// ---------------------------------------------------------------------------
// Leadership scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_fresh_claim_granted_then_second_denied() {
    let arbiter = Arc::new(MockArbiter::new(LEASE_TTL_SECS));
    let a = coordinator(arbiter.clone(), "inst-a");
    let b = coordinator(arbiter.clone(), "inst-b");

    assert_eq!(a.claim(false).await.unwrap(), ClaimResult::Granted);
    assert_eq!(
        b.claim(false).await.unwrap(),
        ClaimResult::Conflict {
            holder_id: "inst-a".into()
        }
    );
    assert_eq!(arbiter.current_holder().as_deref(), Some("inst-a"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_single_leader_invariant_under_concurrent_claims() {
    let arbiter = Arc::new(MockArbiter::new(LEASE_TTL_SECS));

    let mut handles = Vec::new();
    for i in 0..8 {
        let coord = coordinator(arbiter.clone(), &format!("inst-{i}"));
        handles.push(tokio::spawn(async move { coord.claim(false).await.unwrap() }));
    }

    let mut granted = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            ClaimResult::Granted => granted += 1,
            ClaimResult::Conflict { .. } => conflicts += 1,
        }
    }

    assert_eq!(granted, 1, "exactly one instance may win the lease");
    assert_eq!(conflicts, 7);
}

#[tokio::test]
async fn test_staleness_recovery_and_stand_down() {
    let arbiter = Arc::new(MockArbiter::new(LEASE_TTL_SECS));
    let a = coordinator(arbiter.clone(), "inst-a");
    let b = coordinator(arbiter.clone(), "inst-b");

    assert_eq!(a.claim(false).await.unwrap(), ClaimResult::Granted);

    // A stops renewing; the lease goes stale.
    arbiter.advance(ChronoDuration::seconds(LEASE_TTL_SECS + 5));

    // B takes over without force.
    assert_eq!(b.claim(false).await.unwrap(), ClaimResult::Granted);
    assert_eq!(arbiter.current_holder().as_deref(), Some("inst-b"));

    // A's reconciliation discovers the loss and stands down.
    assert!(!a.verify().await.unwrap());
    assert_eq!(a.state(), LeadershipState::Lost);
    assert!(b.verify().await.unwrap());
}

#[tokio::test]
async fn test_forced_takeover() {
    let arbiter = Arc::new(MockArbiter::new(LEASE_TTL_SECS));
    let a = coordinator(arbiter.clone(), "inst-a");
    let b = coordinator(arbiter.clone(), "inst-b");

    assert_eq!(a.claim(false).await.unwrap(), ClaimResult::Granted);
    assert!(matches!(
        b.claim(false).await.unwrap(),
        ClaimResult::Conflict { .. }
    ));

    // Operator takes control.
    assert_eq!(b.claim(true).await.unwrap(), ClaimResult::Granted);
    let lease = arbiter.current_lease().unwrap();
    assert_eq!(lease.holder_id, "inst-b");
    assert!(lease.forced);

    assert!(!a.verify().await.unwrap());
    assert_eq!(a.state(), LeadershipState::Lost);
}

#[tokio::test]
async fn test_renewal_keeps_lease_fresh() {
    let arbiter = Arc::new(MockArbiter::new(LEASE_TTL_SECS));
    let a = coordinator(arbiter.clone(), "inst-a");
    let b = coordinator(arbiter.clone(), "inst-b");

    a.claim(false).await.unwrap();

    // Age the lease close to the TTL, renew, age again: still fresh.
    arbiter.advance(ChronoDuration::seconds(LEASE_TTL_SECS - 10));
    assert!(a.renew().await);
    arbiter.advance(ChronoDuration::seconds(LEASE_TTL_SECS - 10));

    assert!(matches!(
        b.claim(false).await.unwrap(),
        ClaimResult::Conflict { .. }
    ));
}

#[tokio::test]
async fn test_release_hands_over_cleanly() {
    let arbiter = Arc::new(MockArbiter::new(LEASE_TTL_SECS));
    let a = coordinator(arbiter.clone(), "inst-a");
    let b = coordinator(arbiter.clone(), "inst-b");

    a.claim(false).await.unwrap();
    assert!(a.release().await);
    assert!(arbiter.current_holder().is_none());

    assert_eq!(b.claim(false).await.unwrap(), ClaimResult::Granted);
}

#[tokio::test]
async fn test_arbiter_outage_keeps_local_state() {
    let arbiter = Arc::new(MockArbiter::new(LEASE_TTL_SECS));
    let a = coordinator(arbiter.clone(), "inst-a");
    a.claim(false).await.unwrap();

    arbiter.set_unreachable(true);
    // Renew fails non-fatally; the local belief survives the outage.
    assert!(!a.renew().await);
    assert!(a.is_leader());
    assert!(a.verify().await.is_err());
    assert!(a.is_leader());

    arbiter.set_unreachable(false);
    assert!(a.renew().await);
}

// ---------------------------------------------------------------------------
// Scheduler lifecycle scenarios
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn test_scheduler_end_to_end() {
    let arbiter = Arc::new(MockArbiter::new(LEASE_TTL_SECS));
    let inst = instance(arbiter.clone(), "inst-a");
    inst.market.set_regime(RegimeLabel::Uptrend, 0.9);

    let outcome = inst.scheduler.start(false).await.unwrap();
    assert_eq!(outcome, StartOutcome::Started);
    assert_eq!(arbiter.current_holder().as_deref(), Some("inst-a"));

    // First cycle ran immediately: archived, persisted, and (with a
    // confirmed uptrend and ample funds) opened a position.
    assert_eq!(inst.persistence.archived_cycles(), 1);
    let persisted = inst.persistence.state.lock().unwrap().clone().unwrap();
    assert!(persisted.is_running);
    assert_eq!(persisted.cycle_stats.total_cycles, 1);
    assert_eq!(inst.dispatcher.opens.lock().unwrap().len(), 1);

    inst.scheduler.stop().await;
    assert_eq!(inst.scheduler.state(), EngineState::Stopped);
    assert!(arbiter.current_holder().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_second_scheduler_stays_inert() {
    let arbiter = Arc::new(MockArbiter::new(LEASE_TTL_SECS));
    let a = instance(arbiter.clone(), "inst-a");
    let b = instance(arbiter.clone(), "inst-b");

    assert_eq!(a.scheduler.start(false).await.unwrap(), StartOutcome::Started);

    let outcome = b.scheduler.start(false).await.unwrap();
    assert_eq!(
        outcome,
        StartOutcome::ConflictingHolder {
            holder_id: "inst-a".into()
        }
    );
    assert_eq!(b.scheduler.state(), EngineState::Stopped);
    // The inert observer ran no cycles and opened nothing.
    assert_eq!(b.persistence.archived_cycles(), 0);
    assert!(b.dispatcher.opens.lock().unwrap().is_empty());

    a.scheduler.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_forced_takeover_stops_previous_leader() {
    let arbiter = Arc::new(MockArbiter::new(LEASE_TTL_SECS));
    let a = instance(arbiter.clone(), "inst-a");
    let b = instance(arbiter.clone(), "inst-b");

    assert_eq!(a.scheduler.start(false).await.unwrap(), StartOutcome::Started);

    // Operator forces B to take control.
    assert_eq!(a.scheduler.state(), EngineState::Idle);
    assert_eq!(b.scheduler.start(true).await.unwrap(), StartOutcome::Started);
    assert_eq!(arbiter.current_holder().as_deref(), Some("inst-b"));

    // A's background verification (1s interval) notices and the countdown
    // loop collapses the scheduler to Stopped.
    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert_eq!(a.scheduler.state(), EngineState::Stopped);

    // B keeps leading.
    assert_eq!(arbiter.current_holder().as_deref(), Some("inst-b"));
    b.scheduler.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_arbiter_down_at_startup_is_actionable_not_fatal() {
    let arbiter = Arc::new(MockArbiter::new(LEASE_TTL_SECS));
    arbiter.set_unreachable(true);
    let inst = instance(arbiter.clone(), "inst-a");

    let outcome = inst.scheduler.start(false).await.unwrap();
    assert_eq!(outcome, StartOutcome::ArbiterUnavailable);
    assert_eq!(inst.scheduler.state(), EngineState::Stopped);

    // Once the arbiter is back, a retry succeeds.
    arbiter.set_unreachable(false);
    assert_eq!(inst.scheduler.start(false).await.unwrap(), StartOutcome::Started);
    inst.scheduler.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_critical_persistence_failure_stops_engine() {
    let arbiter = Arc::new(MockArbiter::new(LEASE_TTL_SECS));
    let inst = instance(arbiter.clone(), "inst-a");
    inst.persistence.fail_writes.store(true, std::sync::atomic::Ordering::SeqCst);

    // The first cycle hits the storage failure; start surfaces it as a
    // critical error and the lease is released.
    let result = inst.scheduler.start(false).await;
    assert!(result.is_err());
    assert_eq!(inst.scheduler.state(), EngineState::Stopped);
    assert!(arbiter.current_holder().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_monitor_closes_losing_position() {
    let arbiter = Arc::new(MockArbiter::new(LEASE_TTL_SECS));
    let inst = instance(arbiter.clone(), "inst-a");

    // Long entered at 60k, marked down to 50k: a 16% loss against the 5%
    // stop, so the first cycle must emit a close instruction.
    inst.exchange.add_position(warden::types::PositionInfo {
        symbol: "BTCUSDT".into(),
        side: warden::types::Side::Buy,
        quantity: dec!(0.1),
        entry_price: dec!(60000),
        mark_price: dec!(60000),
        opened_at: chrono::Utc::now(),
        strategy_id: Some("regime_follow".into()),
    });
    inst.market.set_price("BTCUSDT", dec!(50000));

    inst.scheduler.start(false).await.unwrap();

    let closes = inst.dispatcher.closes.lock().unwrap().clone();
    assert_eq!(closes.len(), 1);
    assert_eq!(closes[0].symbol, "BTCUSDT");
    assert_eq!(closes[0].reason, warden::types::CloseReason::StopLoss);

    inst.scheduler.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_restart_resumes_counters() {
    let arbiter = Arc::new(MockArbiter::new(LEASE_TTL_SECS));
    let first = instance(arbiter.clone(), "inst-a");

    first.scheduler.start(false).await.unwrap();
    first.scheduler.stop().await;
    let saved = first.persistence.state.lock().unwrap().clone().unwrap();
    assert_eq!(saved.cycle_stats.total_cycles, 1);

    // A new process with the same identity resumes from the saved state.
    let market = Arc::new(MockMarketData::new());
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let persistence = Arc::new(MockPersistence::default());
    let strategies: Vec<Arc<dyn TradeStrategy>> = vec![Arc::new(RegimeFollowStrategy::new(
        RegimeFollowConfig::default(),
    ))];
    let deps = SchedulerDeps {
        coordinator: coordinator(arbiter.clone(), "inst-a"),
        market_data: market,
        exchange: Arc::new(MockExchange::with_funds(dec!(10000))),
        dispatcher,
        persistence: persistence.clone(),
        strategies,
    };
    let revived = ScanCycleScheduler::new(test_config("inst-a"), deps, Some(saved));

    revived.start(false).await.unwrap();
    let persisted = persistence.state.lock().unwrap().clone().unwrap();
    assert_eq!(persisted.cycle_stats.total_cycles, 2);
    revived.stop().await;
}

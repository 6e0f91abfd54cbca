//! WARDEN — Lease-coordinated autonomous trading scanner
//!
//! Entry point. Loads configuration, initialises structured logging,
//! restores resumable state from disk, wires the collaborators, and runs
//! the lease-gated scan loop with graceful shutdown and best-effort lease
//! release on teardown.

use anyhow::{Context, Result};
use secrecy::SecretString;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use warden::collaborators::arbiter::HttpArbiter;
use warden::collaborators::exchange::HttpExchangeGateway;
use warden::collaborators::market_data::HttpMarketData;
use warden::collaborators::{DryRunDispatcher, PersistenceFacade, TradeDispatcher};
use warden::config::AppConfig;
use warden::dashboard::routes::DashboardState;
use warden::dashboard::{spawn_dashboard, EngineControl};
use warden::engine::scheduler::{ScanCycleScheduler, SchedulerDeps, StartOutcome};
use warden::leadership::LeaderElectionCoordinator;
use warden::storage::LocalPersistence;
use warden::strategy::regime_follow::{RegimeFollowConfig, RegimeFollowStrategy};
use warden::strategy::TradeStrategy;
use warden::types::{EngineState, TradingMode};

const BANNER: &str = r#"
__        ___    ____  ____  _____ _   _
\ \      / / \  |  _ \|  _ \| ____| \ | |
 \ \ /\ / / _ \ | |_) | | | |  _| |  \| |
  \ V  V / ___ \|  _ <| |_| | |___| |\  |
   \_/\_/_/   \_\_| \_\____/|_____|_| \_|

  Watchful Arbitration & Risk-Disciplined Execution eNgine
  v0.1.0 — Single-leader scanner
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    // Load configuration from TOML
    let config_path =
        std::env::var("WARDEN_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = Arc::new(AppConfig::load(&config_path)?);

    // Initialise structured logging
    init_logging();

    // Print startup banner
    println!("{BANNER}");
    info!(
        agent_name = %cfg.agent.name,
        scan_interval_ms = cfg.agent.scan_interval_ms,
        trading_mode = %cfg.agent.trading_mode,
        watchlist = cfg.watchlist.len(),
        "WARDEN starting up"
    );

    // -- Identity & collaborators -----------------------------------------

    let instance_id = cfg
        .agent
        .instance_id
        .clone()
        .unwrap_or_else(|| format!("warden-{}", uuid::Uuid::new_v4()));

    let auth_token: Option<SecretString> = match &cfg.leadership.auth_token_env {
        Some(env_name) => Some(SecretString::new(
            AppConfig::resolve_env(env_name)
                .context("Arbiter auth token configured but not resolvable")?,
        )),
        None => None,
    };

    let arbiter = Arc::new(HttpArbiter::new(
        cfg.leadership.arbiter_url.clone(),
        auth_token,
        cfg.leadership.request_timeout(),
    )?);

    let market_data = Arc::new(HttpMarketData::new(
        cfg.market_data.base_url.clone(),
        Duration::from_secs(cfg.market_data.request_timeout_secs),
    )?);

    let exchange = Arc::new(HttpExchangeGateway::new(
        cfg.exchange.base_url.clone(),
        Duration::from_secs(cfg.exchange.snapshot_timeout_secs),
    )?);

    let persistence = Arc::new(
        LocalPersistence::open(&cfg.storage.state_file, &cfg.storage.archive_db).await?,
    );

    let coordinator = Arc::new(LeaderElectionCoordinator::new(
        arbiter,
        instance_id.clone(),
        cfg.leadership.lease_ttl(),
        cfg.leadership.claim_max_attempts,
        Duration::from_millis(cfg.leadership.claim_base_delay_ms),
    ));

    // Dispatch is dry-run until a live order router is integrated; paper
    // mode uses it by definition.
    if cfg.agent.trading_mode == TradingMode::Live {
        warn!("Live mode configured but no live dispatcher integrated; dispatching dry-run");
    }
    let dispatcher: Arc<dyn TradeDispatcher> = Arc::new(DryRunDispatcher);

    let strategies: Vec<Arc<dyn TradeStrategy>> =
        vec![Arc::new(RegimeFollowStrategy::new(RegimeFollowConfig {
            enabled: true,
            min_confidence: cfg.scanner.min_regime_confidence,
        }))];

    // -- Restore state & build the engine ----------------------------------

    let restored = persistence.load_cycle_state().await?;
    let was_previously_running = restored.as_ref().map(|s| s.is_running).unwrap_or(true);

    let scheduler = ScanCycleScheduler::new(
        cfg.clone(),
        SchedulerDeps {
            coordinator: coordinator.clone(),
            market_data,
            exchange,
            dispatcher,
            persistence: persistence.clone(),
            strategies,
        },
        restored,
    );

    // Dashboard serves status and the operator claim/stop controls.
    if cfg.dashboard.enabled {
        let control: Arc<dyn EngineControl> = scheduler.clone();
        let state = Arc::new(DashboardState::new(scheduler.status_handle(), control));
        spawn_dashboard(state, cfg.dashboard.port)?;
    }

    // -- Start (only after full initialization) ----------------------------

    // The "previously running" flag re-attempts the claim; an explicit
    // operator stop sticks until the dashboard claim endpoint is hit.
    if was_previously_running {
        match scheduler.start(false).await? {
            StartOutcome::Started => {}
            StartOutcome::ConflictingHolder { holder_id } => info!(
                holder = %holder_id,
                "Another instance is leading; observing. Use the dashboard to force-claim."
            ),
            StartOutcome::ArbiterUnavailable => warn!(
                "Arbiter unavailable at startup; observing. Use the dashboard to retry."
            ),
        }
    } else {
        info!("Previous session was stopped by an operator; waiting for dashboard claim");
    }

    // -- Wait for shutdown --------------------------------------------------

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received.");

    let was_running = matches!(
        scheduler.state(),
        EngineState::Idle | EngineState::Scanning
    );
    scheduler.stop().await;

    // Final best-effort release on the teardown channel, bounded so a hung
    // arbiter cannot stall process exit.
    let _ = tokio::time::timeout(
        Duration::from_secs(2),
        coordinator.release_best_effort(),
    )
    .await;

    // Persist final state so the next launch resumes counters and streaks.
    let final_state = scheduler.persisted_state(was_running).await;
    persistence.save_cycle_state(&final_state).await?;

    info!(
        instance_id = %instance_id,
        cycles = final_state.cycle_stats.total_cycles,
        "WARDEN shut down cleanly."
    );

    Ok(())
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warden=info"));

    let json_logging = std::env::var("WARDEN_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}

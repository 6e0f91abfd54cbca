//! Engine — scan-cycle scheduling and position monitoring.

pub mod monitor;
pub mod scheduler;

pub use monitor::PositionMonitor;
pub use scheduler::{ScanCycleScheduler, SchedulerDeps, StartOutcome};

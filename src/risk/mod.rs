//! Risk subsystem — composite scoring and position size gating.

pub mod score;
pub mod sizing;

pub use score::{RiskInputs, RiskScoreAggregator, RiskScoreBreakdown};
pub use sizing::{PositionSizeGate, RejectReason, SizingRequest, SizingResult};

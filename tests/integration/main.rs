//! Integration test harness.

mod mock_collaborators;
mod simulation;

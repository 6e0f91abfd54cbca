//! Persistence layer.
//!
//! Saves and loads the engine's resumable state to/from a JSON file and
//! appends per-cycle records to the SQLite archive. Storage failures are
//! critical: the engine must not keep trading with counters it cannot
//! persist.

pub mod archive;

use async_trait::async_trait;
use std::path::Path;
use tracing::{debug, info};

use crate::collaborators::PersistenceFacade;
use crate::types::{ArchiveRecord, PersistedState, WardenError};
use archive::CycleArchive;

/// Default state file path.
const DEFAULT_STATE_FILE: &str = "warden_state.json";

/// Save engine state to a JSON file.
pub fn save_state(state: &PersistedState, path: Option<&str>) -> Result<(), WardenError> {
    let path = path.unwrap_or(DEFAULT_STATE_FILE);
    let json = serde_json::to_string_pretty(state)
        .map_err(|e| WardenError::Storage(format!("Failed to serialise state: {e}")))?;

    std::fs::write(path, &json)
        .map_err(|e| WardenError::Storage(format!("Failed to write state to {path}: {e}")))?;

    debug!(
        path,
        cycles = state.cycle_stats.total_cycles,
        "State saved"
    );
    Ok(())
}

/// Load engine state from a JSON file.
/// Returns None if the file doesn't exist (fresh start).
pub fn load_state(path: Option<&str>) -> Result<Option<PersistedState>, WardenError> {
    let path = path.unwrap_or(DEFAULT_STATE_FILE);

    if !Path::new(path).exists() {
        info!(path, "No saved state found, starting fresh");
        return Ok(None);
    }

    let json = std::fs::read_to_string(path)
        .map_err(|e| WardenError::Storage(format!("Failed to read state from {path}: {e}")))?;

    let state: PersistedState = serde_json::from_str(&json)
        .map_err(|e| WardenError::Storage(format!("Failed to parse state from {path}: {e}")))?;

    info!(
        path,
        cycles = state.cycle_stats.total_cycles,
        was_running = state.is_running,
        regime = %state.regime_state,
        "State loaded from disk"
    );

    Ok(Some(state))
}

/// Delete the state file (for testing or reset).
pub fn delete_state(path: Option<&str>) -> Result<(), WardenError> {
    let path = path.unwrap_or(DEFAULT_STATE_FILE);
    if Path::new(path).exists() {
        std::fs::remove_file(path)
            .map_err(|e| WardenError::Storage(format!("Failed to delete state file {path}: {e}")))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Facade
// ---------------------------------------------------------------------------

/// File-backed persistence: JSON for the resumable state, SQLite for the
/// append-only cycle archive.
pub struct LocalPersistence {
    state_file: String,
    archive: CycleArchive,
}

impl LocalPersistence {
    pub async fn open(state_file: &str, archive_db: &str) -> Result<Self, WardenError> {
        let archive = CycleArchive::open(archive_db).await?;
        Ok(Self {
            state_file: state_file.to_string(),
            archive,
        })
    }

    pub fn archive(&self) -> &CycleArchive {
        &self.archive
    }
}

#[async_trait]
impl PersistenceFacade for LocalPersistence {
    async fn load_cycle_state(&self) -> Result<Option<PersistedState>, WardenError> {
        load_state(Some(&self.state_file))
    }

    async fn save_cycle_state(&self, state: &PersistedState) -> Result<(), WardenError> {
        save_state(state, Some(&self.state_file))
    }

    async fn append_archive(&self, records: &[ArchiveRecord]) -> Result<(), WardenError> {
        self.archive.append(records).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

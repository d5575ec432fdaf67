//! Versioned snapshot of job and service state.
//!
//! The file is YAML with a top-level `version: [major, minor, patch]`. Files
//! without the key predate versioning and are refused, as are files written
//! by a newer controller. Loading happens once at startup, before anything
//! is saved.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, TronError};
use crate::io::{atomic_write, read_optional};
use crate::job::JobState;
use crate::service::ServiceState;

pub const STATE_VERSION: [u32; 3] = [0, 2, 0];
pub const STATE_FILE: &str = "tron_state.yaml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub version: [u32; 3],
    #[serde(default)]
    pub jobs: BTreeMap<String, JobState>,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceState>,
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            jobs: BTreeMap::new(),
            services: BTreeMap::new(),
        }
    }
}

impl StateSnapshot {
    pub fn parse(data: &str) -> Result<Self> {
        let value: serde_yaml::Value = serde_yaml::from_str(data)?;
        let version = value
            .get("version")
            .cloned()
            .ok_or(TronError::UnsupportedVersion)?;
        let found: [u32; 3] = serde_yaml::from_value(version)?;
        if found > STATE_VERSION {
            return Err(TronError::StateFileVersion {
                found,
                supported: STATE_VERSION,
            });
        }
        Ok(serde_yaml::from_value(value)?)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

/// Owns the state file and tracks whether anything changed since the last
/// save.
#[derive(Debug)]
pub struct StateHandler {
    path: PathBuf,
    dirty: bool,
}

impl StateHandler {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(STATE_FILE),
            dirty: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// `Ok(None)` when there is no state file yet.
    pub fn load(&self) -> Result<Option<StateSnapshot>> {
        let Some(data) = read_optional(&self.path)? else {
            debug!(path = %self.path.display(), "no state file");
            return Ok(None);
        };
        let snapshot = StateSnapshot::parse(&data)?;
        info!(
            path = %self.path.display(),
            jobs = snapshot.jobs.len(),
            services = snapshot.services.len(),
            "state loaded"
        );
        Ok(Some(snapshot))
    }

    pub fn save(&mut self, snapshot: &StateSnapshot) -> Result<()> {
        atomic_write(&self.path, snapshot.to_yaml()?.as_bytes())?;
        self.dirty = false;
        debug!(path = %self.path.display(), "state saved");
        Ok(())
    }
}

use crate::action::ActionGraph;
use crate::error::{Result, TronError};
use crate::scheduler::Scheduler;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

impl ConfigWarning {
    fn warning(message: String) -> Self {
        Self {
            level: WarnLevel::Warning,
            message,
        }
    }

    fn error(message: String) -> Self {
        Self {
            level: WarnLevel::Error,
            message,
        }
    }
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    pub hostname: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodePoolConfig {
    pub name: String,
    pub nodes: Vec<String>,
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub requires: Vec<String>,
    /// Overrides the job's node for this action only.
    #[serde(default)]
    pub node: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupActionConfig {
    pub command: String,
    #[serde(default)]
    pub node: Option<String>,
}

// ---------------------------------------------------------------------------
// Schedules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleConfig {
    /// Every `seconds` after the previous run time.
    Interval { seconds: u64 },
    /// Once a day at `time` (`HH:MM` or `HH:MM:SS`, UTC).
    Daily { time: String },
    /// Again as soon as the previous run is out of the way.
    Constant,
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,
    pub node: String,
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub allow_overlap: bool,
    #[serde(default = "default_true")]
    pub queueing: bool,
    #[serde(default)]
    pub all_nodes: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_run_limit")]
    pub run_limit: usize,
    pub actions: Vec<ActionConfig>,
    #[serde(default)]
    pub cleanup_action: Option<CleanupActionConfig>,
}

fn default_true() -> bool {
    true
}

fn default_run_limit() -> usize {
    50
}

// ---------------------------------------------------------------------------
// Services
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub node: String,
    pub count: u32,
    pub command: String,
    pub pid_file: String,
    /// Seconds between liveness checks; 0 disables monitoring.
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_monitor_interval() -> u64 {
    20
}

// ---------------------------------------------------------------------------
// MasterConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MasterConfig {
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub node_pools: Vec<NodePoolConfig>,
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

impl MasterConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::parse(&data)
    }

    pub fn parse(data: &str) -> Result<Self> {
        let cfg: MasterConfig = serde_yaml::from_str(data)?;
        Ok(cfg)
    }

    /// Directory for the state file: explicit `state_dir`, else the config's
    /// own directory.
    pub fn state_dir_for(&self, config_path: &Path) -> PathBuf {
        if let Some(dir) = &self.state_dir {
            return dir.clone();
        }
        match config_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    pub fn job(&self, name: &str) -> Result<&JobConfig> {
        self.jobs
            .iter()
            .find(|j| j.name == name)
            .ok_or_else(|| TronError::JobNotFound(name.to_string()))
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        let mut pool_names: HashSet<&str> = HashSet::new();
        for n in &self.nodes {
            if !pool_names.insert(n.name.as_str()) {
                warnings.push(ConfigWarning::error(format!("duplicate node '{}'", n.name)));
            }
        }
        for p in &self.node_pools {
            if !pool_names.insert(p.name.as_str()) {
                warnings.push(ConfigWarning::error(format!(
                    "node pool '{}' reuses an existing name",
                    p.name
                )));
            }
            if p.nodes.is_empty() {
                warnings.push(ConfigWarning::error(format!("node pool '{}' is empty", p.name)));
            }
            for member in &p.nodes {
                if !self.nodes.iter().any(|n| &n.name == member) {
                    warnings.push(ConfigWarning::error(format!(
                        "node pool '{}' references unknown node '{}'",
                        p.name, member
                    )));
                }
            }
        }

        let mut names: HashSet<&str> = HashSet::new();
        for job in &self.jobs {
            if !names.insert(job.name.as_str()) {
                warnings.push(ConfigWarning::error(format!("duplicate job '{}'", job.name)));
            }
            if !pool_names.contains(job.node.as_str()) {
                warnings.push(ConfigWarning::error(format!(
                    "job '{}' references unknown node '{}'",
                    job.name, job.node
                )));
            }
            for action in &job.actions {
                if action.command.trim().is_empty() {
                    warnings.push(ConfigWarning::warning(format!(
                        "job '{}' action '{}' has an empty command",
                        job.name, action.name
                    )));
                }
                if let Some(node) = &action.node {
                    if !pool_names.contains(node.as_str()) {
                        warnings.push(ConfigWarning::error(format!(
                            "job '{}' action '{}' references unknown node '{}'",
                            job.name, action.name, node
                        )));
                    }
                }
            }
            if job.actions.is_empty() {
                warnings.push(ConfigWarning::error(format!("job '{}' has no actions", job.name)));
            }
            if job.run_limit == 0 {
                warnings.push(ConfigWarning::error(format!(
                    "job '{}' run_limit must be at least 1",
                    job.name
                )));
            }
            if let Err(e) = Scheduler::from_config(&job.schedule) {
                warnings.push(ConfigWarning::error(format!("job '{}': {e}", job.name)));
            }
            if let Err(e) = ActionGraph::from_config(&job.actions, job.cleanup_action.as_ref()) {
                warnings.push(ConfigWarning::error(format!("job '{}': {e}", job.name)));
            }
        }

        for svc in &self.services {
            if !names.insert(svc.name.as_str()) {
                warnings.push(ConfigWarning::error(format!(
                    "service '{}' reuses an existing job or service name",
                    svc.name
                )));
            }
            if !pool_names.contains(svc.node.as_str()) {
                warnings.push(ConfigWarning::error(format!(
                    "service '{}' references unknown node '{}'",
                    svc.name, svc.node
                )));
            }
            if svc.count == 0 {
                warnings.push(ConfigWarning::warning(format!(
                    "service '{}' has count 0 and will never run",
                    svc.name
                )));
            }
            if svc.monitor_interval == 0 {
                warnings.push(ConfigWarning::warning(format!(
                    "service '{}' has monitoring disabled",
                    svc.name
                )));
            }
            if svc.command.trim().is_empty() {
                warnings.push(ConfigWarning::error(format!(
                    "service '{}' has an empty command",
                    svc.name
                )));
            }
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

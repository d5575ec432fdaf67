use thiserror::Error;

#[derive(Debug, Error)]
pub enum TronError {
    #[error("action '{action}' requires unknown action '{dependency}'")]
    UnknownDependency { action: String, dependency: String },

    #[error("dependency cycle through action '{0}'")]
    DependencyCycle(String),

    #[error("duplicate action name: {0}")]
    DuplicateAction(String),

    #[error("action not found: {0}")]
    ActionNotFound(String),

    #[error("unknown node or node pool: {0}")]
    UnknownNode(String),

    #[error("node pool '{0}' has no nodes")]
    EmptyNodePool(String),

    #[error("unresolved key '{key}' in command: {command}")]
    UnresolvedKey { key: String, command: String },

    #[error("invalid date spec: {0}")]
    InvalidDateSpec(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("job run not found: {job}.{run}")]
    RunNotFound { job: String, run: u64 },

    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("service instance not found: {service}.{instance}")]
    InstanceNotFound { service: String, instance: u32 },

    #[error("state file has no version marker; the legacy format is not supported")]
    UnsupportedVersion,

    #[error("state file version {found:?} is newer than supported {supported:?}")]
    StateFileVersion {
        found: [u32; 3],
        supported: [u32; 3],
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, TronError>;

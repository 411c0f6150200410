//! Top-level error types for waypoint.

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Invoker(#[from] InvokerError),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading errors. Permanent per §7 — abort the daemon at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config from {path}: {source}")]
    Load {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required config key: {0}")]
    MissingKey(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Persistent queue store errors (§4.1).
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("duplicate message id: {0}")]
    DuplicateId(String),

    #[error("store busy: {0}")]
    Busy(String),

    #[error("response {0} not found")]
    ResponseNotFound(i64),

    #[error("message {0} not found")]
    MessageNotFound(i64),

    #[error("message {0} is not in dead state")]
    NotDead(i64),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Agent Invoker errors (§4.3). Transient unless noted.
#[derive(Debug, thiserror::Error)]
pub enum InvokerError {
    #[error("subprocess for agent {agent_id} exited with status {code}: {stderr}")]
    NonZeroExit {
        agent_id: String,
        code: i32,
        stderr: String,
    },

    #[error("failed to spawn subprocess for agent {agent_id}: {source}")]
    Spawn {
        agent_id: String,
        source: std::io::Error,
    },

    #[error("no parseable response in subprocess output for agent {agent_id}")]
    NoResponse { agent_id: String },

    #[error("missing subprocess binary: {0}")]
    MissingBinary(String),

    #[error("failed to read prompt file for agent {agent_id} at {path}: {source}")]
    PromptFile {
        agent_id: String,
        path: String,
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Routing resolver errors. In practice the resolver never fails (§4.2 is a
/// pure, total function); this exists for the "unknown agent with no
/// default" permanent-failure path in §7.
#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("no agents configured")]
    NoAgentsConfigured,
}

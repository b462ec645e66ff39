//! Top-level error types for berth.

use std::sync::Arc;

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Deploy(#[from] DeployError),

    #[error(transparent)]
    ControlPlane(#[from] ControlPlaneError),

    #[error(transparent)]
    Secrets(#[from] SecretsError),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config from {path}: {source}")]
    Load {
        path: String,
        source: Arc<std::io::Error>,
    },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required config key: {0}")]
    MissingKey(String),
}

/// Database connection and operation errors.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("failed to connect to SQLite: {0}")]
    SqliteConnect(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("no free port between {base} and {limit}")]
    PortsExhausted { base: i64, limit: i64 },
}

/// Lifecycle errors raised by deployment providers.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    /// A required credential or setting is missing. Raised before any backend call.
    #[error("invalid deployment request: {0}")]
    Validation(String),

    #[error("instance {id} not found")]
    InstanceNotFound { id: String },

    #[error("no configuration stored for user {user_id}")]
    ConfigurationNotFound { user_id: String },

    #[error("backend resource {name} not found")]
    ResourceNotFound { name: String },

    /// The backend kept rejecting a mutation with cooldown or rate-limit errors
    /// for the whole retry budget.
    #[error("{operation} blocked by cooldown after {waited_secs}s: {last_error}")]
    CooldownBlocked {
        operation: String,
        waited_secs: u64,
        last_error: String,
    },

    #[error("deployment {status}: {}", logs.join("\n"))]
    DeploymentFailed { status: String, logs: Vec<String> },

    #[error("deployment timed out after {secs}s")]
    TimedOut { secs: u64 },

    #[error("container engine error: {0}")]
    Container(String),
}

/// Remote control-plane transport errors. Every variant keeps the original
/// message from the platform.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ControlPlaneError {
    #[error("control plane request failed: {0}")]
    Request(String),

    #[error("control plane returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("control plane error: {0}")]
    Api(String),

    #[error("failed to decode control plane response: {0}")]
    Decode(String),
}

impl ControlPlaneError {
    /// HTTP status code, when the failure carried one.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ControlPlaneError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Secrets and credential errors.
#[derive(Debug, thiserror::Error)]
pub enum SecretsError {
    #[error("failed to encrypt secret: {0}")]
    EncryptionFailed(String),

    #[error("failed to decrypt secret: {0}")]
    DecryptionFailed(String),

    #[error("invalid key format")]
    InvalidKey,
}

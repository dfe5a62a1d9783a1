use thiserror::Error;

pub type Result<T> = std::result::Result<T, KeelError>;

#[derive(Debug, Error)]
pub enum KeelError {
    /// Blob or content is absent. Never used for integrity failures.
    #[error("not found: {0}")]
    NotFound(String),

    /// Hash or ciphertext verification failed. Callers must not fall back to
    /// unverified bytes.
    #[error("data corruption detected: {0}")]
    Corruption(String),

    /// Write refused because the blob exists and the caller asked not to
    /// recreate it.
    #[error("blob already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid blob id '{0}'")]
    InvalidBlobId(String),

    #[error("maintenance is owned by '{owner}', not '{caller}' (use --force to override)")]
    NotMaintenanceOwner { owner: String, caller: String },

    #[error("unsafe maintenance parameters: {0}")]
    UnsafeParameters(String),

    #[error(
        "clock skew detected: local clock is out of sync with repository timestamp \
         by more than allowed {max_secs}s (local: {local} repository: {repository})"
    )]
    ClockSkew {
        local: chrono::DateTime<chrono::Utc>,
        repository: chrono::DateTime<chrono::Utc>,
        max_secs: i64,
    },

    #[error("decryption failed: wrong passphrase or corrupted key material")]
    DecryptionFailed,

    #[error("key derivation error: {0}")]
    KeyDerivation(String),

    #[error("repository not found at '{0}'")]
    RepoNotFound(String),

    #[error("repository already exists at '{0}'")]
    RepoAlreadyExists(String),

    #[error("unsupported repository version: {0}")]
    UnsupportedVersion(u32),

    #[error("unsupported by backend: {0}")]
    Unsupported(String),

    /// Transient backend failure, eligible for caller-level retry.
    #[error("storage backend error during {op}: {message}")]
    Backend { op: String, message: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("{failed} of {total} items failed")]
    PartialFailure { failed: usize, total: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl KeelError {
    pub fn backend(op: &str, message: impl std::fmt::Display) -> Self {
        KeelError::Backend {
            op: op.to_string(),
            message: message.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, KeelError::NotFound(_))
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, KeelError::Corruption(_))
    }

    /// Whether the caller may retry the operation unchanged.
    pub fn is_transient(&self) -> bool {
        match self {
            KeelError::Backend { .. } => true,
            KeelError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}

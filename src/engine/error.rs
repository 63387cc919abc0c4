use ulid::Ulid;

/// Error taxonomy for every scheduling operation.
///
/// `Validation` and `Conflict` are rejected before any mutation and carry
/// the specific limiting rule in the message. `Wal` is the infrastructure
/// class: the operation is safe to retry because handlers are idempotent.
#[derive(Debug)]
pub enum EngineError {
    Validation(String),
    Conflict(String),
    NotFound(Ulid),
    AlreadyExists(Ulid),
    LimitExceeded(&'static str),
    Wal(String),
}

impl EngineError {
    /// Stable machine-readable class for wire envelopes and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::Conflict(_) => "conflict",
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::Wal(_) => "infrastructure",
        }
    }

    pub fn is_infrastructure(&self) -> bool {
        matches!(self, EngineError::Wal(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid request: {msg}"),
            EngineError::Conflict(msg) => write!(f, "conflict: {msg}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Wal(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

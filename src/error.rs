//! Error types for Heimdall Mail Core

/// Result type alias for Heimdall Mail operations
pub type HeimdallResult<T> = Result<T, HeimdallError>;

/// Main error type for Heimdall Mail
#[derive(Debug, thiserror::Error)]
pub enum HeimdallError {
    /// Folder backend errors
    #[error("Folder error: {0}")]
    Folder(String),

    /// Account backend errors
    #[error("Account error: {0}")]
    Account(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The monitoring session was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Invalid state errors
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Not found errors
    #[error("Not found: {0}")]
    NotFound(String),

    /// Internal consistency violation; indicates a bug, never retried
    #[error("Invariant violation: {0}")]
    Invariant(String),
}

impl HeimdallError {
    /// Create a new folder error
    pub fn folder(msg: impl Into<String>) -> Self {
        Self::Folder(msg.into())
    }

    /// Create a new account error
    pub fn account(msg: impl Into<String>) -> Self {
        Self::Account(msg.into())
    }

    /// Create a new timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a new invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a new not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a new invariant violation error
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::Invariant(msg.into())
    }

    /// Check if this error is a session cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Check if this error indicates an internal bug
    pub fn is_invariant(&self) -> bool {
        matches!(self, Self::Invariant(_))
    }

    /// Check if this is a transient error the next scan can reconcile
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Folder(_) | Self::Account(_) | Self::Io(_) | Self::Timeout(_)
        )
    }
}

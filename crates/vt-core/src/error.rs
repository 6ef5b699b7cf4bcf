//! Error types for vt-core.

use thiserror::Error;

/// Result type alias using vt-core Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for voicetime operations
#[derive(Error, Debug)]
pub enum Error {
    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database lock poisoned")]
    LockPoisoned,

    // Configuration errors
    #[error("Voice tracking disabled for community {0}")]
    TrackingDisabled(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    // Session errors
    #[error("No active voice session for user {user_id} in community {community_id}")]
    SessionNotFound {
        community_id: String,
        user_id: String,
    },

    #[error("Voice session not found: {0}")]
    SessionMissing(String),

    // Pair errors
    #[error("User cannot form a pair with themselves: {0}")]
    SelfPair(String),

    // Notification errors
    #[error("Notification delivery failed: {0}")]
    Notification(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a session-not-found error for an active session lookup
    pub fn session_not_found(community_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self::SessionNotFound {
            community_id: community_id.into(),
            user_id: user_id.into(),
        }
    }

    /// Whether this failure is treated as a best-effort no-op by the tracker
    /// (state may already have been reconciled elsewhere).
    pub fn is_best_effort(&self) -> bool {
        matches!(
            self,
            Self::SessionNotFound { .. } | Self::SessionMissing(_) | Self::TrackingDisabled(_)
        )
    }
}

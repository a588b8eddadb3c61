//! Service error taxonomy shared by every component.
//!
//! Each variant belongs to exactly one [`ErrorKind`]; the gateway turns the
//! kind into an HTTP status and the variant into a stable machine code.

/// Coarse error classes a caller can act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or missing input. The caller must fix the request.
    Validation,
    NotFound,
    /// Duplicate task identifier.
    Conflict,
    QuotaExceeded,
    /// Unauthenticated, banned, or not a participant.
    Forbidden,
    /// The embedding provider could not produce a vector.
    DependencyUnavailable,
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),
    #[error("agent not found")]
    AgentNotFound,
    #[error("task not found or does not belong to this agent")]
    TaskNotFound,
    #[error("conversation not found")]
    ConversationNotFound,
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    QuotaExceeded(String),
    #[error("authentication required")]
    Unauthenticated,
    #[error("agent is banned")]
    AgentBanned,
    #[error("agent is not a participant in this conversation")]
    NotParticipant,
    #[error("{0}")]
    InvalidReport(String),
    #[error("embedding provider unavailable: {0}")]
    EmbeddingUnavailable(String),
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::InvalidReport(_) => ErrorKind::Validation,
            Self::AgentNotFound | Self::TaskNotFound | Self::ConversationNotFound => {
                ErrorKind::NotFound
            }
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            Self::Unauthenticated | Self::AgentBanned | Self::NotParticipant => {
                ErrorKind::Forbidden
            }
            Self::EmbeddingUnavailable(_) => ErrorKind::DependencyUnavailable,
            Self::Storage(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Stable machine-readable code for the JSON error body.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "invalid_request",
            Self::AgentNotFound => "agent_not_found",
            Self::TaskNotFound => "task_not_found",
            Self::ConversationNotFound => "conversation_not_found",
            Self::Conflict(_) => "task_exists",
            Self::QuotaExceeded(_) => "rate_limit_exceeded",
            Self::Unauthenticated => "unauthorized",
            Self::AgentBanned => "agent_banned",
            Self::NotParticipant => "not_participant",
            Self::InvalidReport(_) => "invalid_report",
            Self::EmbeddingUnavailable(_) => "embedding_error",
            Self::Storage(_) | Self::Internal(_) => "internal_error",
        }
    }
}

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

//! # Errors
//!
//! Two layers: [`StoreError`] is what the ports report, [`DomainError`] is what services hand to
//! their callers. Every `DomainError` belongs to exactly one [`ErrorKind`]; transports map kinds
//! to status codes and nothing else.

use thiserror::Error;

/// Failures reported by persistence ports.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// A unique constraint rejected the write.
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),

    /// Lock contention or a serialization failure; retrying is expected to succeed.
    #[error("contention: {0}")]
    Contention(String),

    /// The store could not be reached or the statement failed.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A row could not be mapped back to a domain model.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// The error taxonomy shared by every service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or malformed input; never retried.
    Validation,
    /// Duplicate vote or comment; the client may treat it as a no-op.
    Conflict,
    /// Caller lacks the rights for this operation.
    Authorization,
    NotFound,
    /// Store failures, exhausted retries, timeouts.
    Fatal,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("comment text is empty")]
    MissingText,

    #[error("quoted text requires a source url")]
    MissingQuoteSource,

    #[error("vote weight {0} is outside [-1, 1]")]
    InvalidWeight(f32),

    #[error("an identical comment already exists in this conversation")]
    DuplicateComment,

    #[error("this vote was already recorded")]
    DuplicateVote,

    #[error("conversation is closed")]
    ConversationClosed,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("a linked social identity is required to vote in this conversation")]
    SocialIdentityRequired,

    #[error("could not join conversation after {attempts} attempts")]
    JoinExhausted { attempts: u32 },

    #[error("conversation has no comments")]
    NoComments,

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl DomainError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        DomainError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DomainError::MissingText
            | DomainError::MissingQuoteSource
            | DomainError::InvalidWeight(_) => ErrorKind::Validation,
            DomainError::DuplicateComment | DomainError::DuplicateVote => ErrorKind::Conflict,
            DomainError::ConversationClosed
            | DomainError::Forbidden(_)
            | DomainError::SocialIdentityRequired => ErrorKind::Authorization,
            DomainError::NotFound { .. } => ErrorKind::NotFound,
            DomainError::JoinExhausted { .. }
            | DomainError::NoComments
            | DomainError::Timeout(_)
            | DomainError::Store(_) => ErrorKind::Fatal,
        }
    }

    /// Stable machine-readable code for clients.
    pub fn code(&self) -> &'static str {
        match self {
            DomainError::NotFound { .. } => "not_found",
            DomainError::MissingText => "missing_text",
            DomainError::MissingQuoteSource => "missing_quote_src",
            DomainError::InvalidWeight(_) => "invalid_weight",
            DomainError::DuplicateComment => "duplicate_comment",
            DomainError::DuplicateVote => "duplicate_vote",
            DomainError::ConversationClosed => "conversation_closed",
            DomainError::Forbidden(_) => "forbidden",
            DomainError::SocialIdentityRequired => "social_required",
            DomainError::JoinExhausted { .. } => "join_exhausted",
            DomainError::NoComments => "no_comments",
            DomainError::Timeout(_) => "timeout",
            DomainError::Store(_) => "internal",
        }
    }
}

/// A specialized Result type for service operations.
pub type Result<T> = std::result::Result<T, DomainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicates_are_conflicts_not_failures() {
        assert_eq!(DomainError::DuplicateVote.kind(), ErrorKind::Conflict);
        assert_eq!(DomainError::DuplicateComment.kind(), ErrorKind::Conflict);
        assert_ne!(DomainError::DuplicateVote.code(), DomainError::Store(StoreError::Unavailable("x".into())).code());
    }

    #[test]
    fn store_errors_are_fatal() {
        let err: DomainError = StoreError::Unavailable("connection refused".into()).into();
        assert_eq!(err.kind(), ErrorKind::Fatal);
        assert_eq!(DomainError::JoinExhausted { attempts: 10 }.kind(), ErrorKind::Fatal);
    }
}

// Semantic error kinds shared across components.
// Adapters raise these through anyhow chains; the HTTP layer downcasts to map
// onto status codes, and the job plane writes them onto owning rows.

use thiserror::Error;

/// Transport-agnostic error kinds.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RagError {
    #[error("AUTH_INVALID: {0}")]
    AuthInvalid(String),

    #[error("AUTH_FORBIDDEN: {0}")]
    AuthForbidden(String),

    #[error("NOT_FOUND: {0}")]
    NotFound(String),

    #[error("CONFLICT_STATE: {0}")]
    ConflictState(String),

    #[error("QUOTA_EXCEEDED_REQUESTS: daily request cap {0} reached")]
    QuotaExceededRequests(i64),

    #[error("QUOTA_EXCEEDED_TOKENS: daily token cap {0} reached")]
    QuotaExceededTokens(i64),

    #[error("UNSUPPORTED_FORMAT: {0}")]
    UnsupportedFormat(String),

    #[error("PARSE_FAILED: {0}")]
    ParseFailed(String),

    #[error("EMBED_FAILED: {0}")]
    EmbedFailed(String),

    #[error("INDEX_WRITE_FAILED: {0}")]
    IndexWriteFailed(String),

    #[error("INDEX_READ_FAILED: {0}")]
    IndexReadFailed(String),

    #[error("RERANK_UNAVAILABLE: {0}")]
    RerankUnavailable(String),

    #[error("LLM_FAILED: {0}")]
    LlmFailed(String),

    #[error("LLM_RATE_LIMITED: {0}")]
    LlmRateLimited(String),

    #[error("QUEUE_UNAVAILABLE: {0}")]
    QueueUnavailable(String),

    #[error("INTERRUPTED: {0}")]
    Interrupted(String),
}

impl RagError {
    /// Short machine-readable code for API payloads and row error messages.
    pub fn code(&self) -> &'static str {
        match self {
            RagError::AuthInvalid(_) => "AUTH_INVALID",
            RagError::AuthForbidden(_) => "AUTH_FORBIDDEN",
            RagError::NotFound(_) => "NOT_FOUND",
            RagError::ConflictState(_) => "CONFLICT_STATE",
            RagError::QuotaExceededRequests(_) => "QUOTA_EXCEEDED_REQUESTS",
            RagError::QuotaExceededTokens(_) => "QUOTA_EXCEEDED_TOKENS",
            RagError::UnsupportedFormat(_) => "UNSUPPORTED_FORMAT",
            RagError::ParseFailed(_) => "PARSE_FAILED",
            RagError::EmbedFailed(_) => "EMBED_FAILED",
            RagError::IndexWriteFailed(_) => "INDEX_WRITE_FAILED",
            RagError::IndexReadFailed(_) => "INDEX_READ_FAILED",
            RagError::RerankUnavailable(_) => "RERANK_UNAVAILABLE",
            RagError::LlmFailed(_) => "LLM_FAILED",
            RagError::LlmRateLimited(_) => "LLM_RATE_LIMITED",
            RagError::QueueUnavailable(_) => "QUEUE_UNAVAILABLE",
            RagError::Interrupted(_) => "INTERRUPTED",
        }
    }

    /// HTTP status the transport layer maps this kind onto.
    pub fn http_status(&self) -> u16 {
        match self {
            RagError::AuthInvalid(_) => 401,
            RagError::AuthForbidden(_) => 403,
            RagError::NotFound(_) => 404,
            RagError::ConflictState(_) => 409,
            RagError::QuotaExceededRequests(_) | RagError::QuotaExceededTokens(_) => 429,
            RagError::UnsupportedFormat(_) => 415,
            _ => 500,
        }
    }

    /// True for kinds the job plane retries with delay before going terminal.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RagError::IndexWriteFailed(_)
                | RagError::IndexReadFailed(_)
                | RagError::LlmRateLimited(_)
                | RagError::QueueUnavailable(_)
        )
    }
}

/// Truncate an error chain for persistence onto an entity row.
/// Row error messages are capped at 500 characters.
pub fn truncate_error(err: &anyhow::Error) -> String {
    let mut msg = format!("{err:#}");
    if msg.len() > 500 {
        let mut cut = 500;
        while !msg.is_char_boundary(cut) {
            cut -= 1;
        }
        msg.truncate(cut);
    }
    msg
}

/// Message written onto rows reset by worker-startup reconciliation.
pub const INTERRUPTED_MESSAGE: &str = "interrupted: service restarted";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(RagError::AuthInvalid("no token".into()).http_status(), 401);
        assert_eq!(RagError::AuthForbidden("viewer".into()).http_status(), 403);
        assert_eq!(RagError::NotFound("doc 7".into()).http_status(), 404);
        assert_eq!(RagError::ConflictState("deleting".into()).http_status(), 409);
        assert_eq!(RagError::QuotaExceededRequests(100).http_status(), 429);
        assert_eq!(RagError::QuotaExceededTokens(100_000).http_status(), 429);
        assert_eq!(RagError::IndexWriteFailed("bulk".into()).http_status(), 500);
    }

    #[test]
    fn test_transient_kinds() {
        assert!(RagError::LlmRateLimited("429".into()).is_transient());
        assert!(!RagError::UnsupportedFormat(".xls".into()).is_transient());
    }

    #[test]
    fn test_truncate_error() {
        let long = "x".repeat(800);
        let err = anyhow::anyhow!(long);
        let msg = truncate_error(&err);
        assert_eq!(msg.len(), 500);

        let short = anyhow::anyhow!("boom");
        assert_eq!(truncate_error(&short), "boom");
    }

    #[test]
    fn test_code_matches_display() {
        let err = RagError::QuotaExceededRequests(5);
        assert!(err.to_string().starts_with(err.code()));
    }
}

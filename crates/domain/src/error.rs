use serde::Serialize;

/// Shared error type used across all squidbot crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    /// Mailbox for an actor key is at capacity.
    #[error("mailbox full for {0}")]
    MailboxFull(String),

    /// The actor for a key went away twice in a row during submission.
    #[error("actor terminated for {0}")]
    ActorTerminated(String),

    /// The subagent queue is at capacity.
    #[error("subagent queue full")]
    QueueFull,

    #[error(transparent)]
    Budget(#[from] LimitError),

    /// A peer rejected or failed a federation request.
    /// `status` is `None` when the transport itself failed.
    #[error("peer {peer}: {message}")]
    PeerRequest {
        peer: String,
        status: Option<u16>,
        message: String,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A result was requested for a run that has not finished.
    #[error("run {0} is not terminal")]
    NotTerminal(String),

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether a federation delivery attempt may be retried against the
    /// same peer: transport failures and status 408 / 429 / 5xx.
    pub fn is_retryable_request(&self) -> bool {
        match self {
            Error::PeerRequest { status, .. } => match status {
                Some(s) => *s == 408 || *s == 429 || *s >= 500,
                None => true,
            },
            _ => false,
        }
    }
}

/// A token-budget preflight projection exceeded a scope's hard limit.
#[derive(thiserror::Error, Debug, Clone, Serialize)]
#[error(
    "token limit exceeded for scope {scope}: used {used}, reserved {reserved}, \
     requested {requested}, limit {limit}"
)]
pub struct LimitError {
    pub scope: String,
    pub used: u64,
    pub reserved: u64,
    pub requested: u64,
    pub limit: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_error_display_names_every_field() {
        let err = LimitError {
            scope: "global".into(),
            used: 10,
            reserved: 5,
            requested: 3,
            limit: 12,
        };
        let text = err.to_string();
        assert!(text.contains("scope global"));
        assert!(text.contains("used 10"));
        assert!(text.contains("reserved 5"));
        assert!(text.contains("requested 3"));
        assert!(text.contains("limit 12"));
    }

    #[test]
    fn retryable_statuses() {
        let make = |status| Error::PeerRequest {
            peer: "p1".into(),
            status,
            message: "boom".into(),
        };
        assert!(make(Some(408)).is_retryable_request());
        assert!(make(Some(429)).is_retryable_request());
        assert!(make(Some(500)).is_retryable_request());
        assert!(make(Some(503)).is_retryable_request());
        assert!(make(None).is_retryable_request());
        assert!(!make(Some(400)).is_retryable_request());
        assert!(!make(Some(401)).is_retryable_request());
        assert!(!make(Some(404)).is_retryable_request());
    }

    #[test]
    fn non_request_errors_are_not_retryable() {
        assert!(!Error::QueueFull.is_retryable_request());
        assert!(!Error::Other("x".into()).is_retryable_request());
    }
}

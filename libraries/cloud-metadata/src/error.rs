use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LookupError {
    /// Network failures, timeouts, throttling. Worth retrying.
    #[error("transient failure while {what}: {reason}")]
    Transient { what: String, reason: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("{what} is ambiguous: {matches} instances match")]
    Ambiguous { what: String, matches: usize },

    #[error("missing metadata: {0}")]
    MissingMetadata(String),

    #[error("{what} failed: {reason}")]
    Permanent { what: String, reason: String },
}

impl LookupError {
    pub fn transient(what: impl Into<String>, reason: impl ToString) -> Self {
        LookupError::Transient {
            what: what.into(),
            reason: reason.to_string(),
        }
    }

    pub fn permanent(what: impl Into<String>, reason: impl ToString) -> Self {
        LookupError::Permanent {
            what: what.into(),
            reason: reason.to_string(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, LookupError::Transient { .. })
    }
}

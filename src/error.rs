//! Error types for signaling and session establishment.

use thiserror::Error;

/// Errors surfaced by the signaling orchestration layer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SignalError {
    /// Failure reaching the peer's signaling endpoint or serving our own.
    #[error("Signaling transport error: {0}")]
    Transport(String),

    /// Network I/O error.
    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    /// A session description that does not follow the line-pair wire format.
    #[error("Malformed session description: {0}")]
    MalformedDescription(String),

    /// A received candidate string did not parse.
    #[error("Invalid candidate '{candidate}': {reason}")]
    CandidateParse { candidate: String, reason: String },

    /// Any failure reported by the connectivity agent (credential retrieval,
    /// gathering, accept/dial, restart, or an established-session error).
    #[error("Agent error: {0}")]
    Agent(String),
}

impl SignalError {
    pub fn candidate_parse(candidate: impl Into<String>, reason: impl ToString) -> Self {
        Self::CandidateParse {
            candidate: candidate.into(),
            reason: reason.to_string(),
        }
    }

    /// Returns true if a fresh signaling round may be attempted after this error.
    ///
    /// **Recoverable:**
    /// - `Transport` / `Network` - the peer may simply not be up yet
    /// - `Agent` - session-fatal, but a re-keyed round can succeed
    ///
    /// **Non-recoverable:**
    /// - `MalformedDescription` / `CandidateParse` - per-request failures; the
    ///   offending exchange is rejected and retrying the same input cannot help
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SignalError::Transport(_) | SignalError::Network(_) | SignalError::Agent(_)
        )
    }

    /// Returns true if the error should reject a single inbound signaling
    /// request rather than end the process.
    pub fn is_request_scoped(&self) -> bool {
        matches!(
            self,
            SignalError::MalformedDescription(_) | SignalError::CandidateParse { .. }
        )
    }
}

/// Result type alias for signaling operations.
pub type SignalResult<T> = Result<T, SignalError>;

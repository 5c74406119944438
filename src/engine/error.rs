//! Engine error taxonomy.
//!
//! Only request-level problems are `Err` values. Adapter failures and
//! unparseable judge/orchestrator payloads are folded into `ResultItem.error`
//! using the `code: detail` strings built here.

use super::ledger::{LedgerError, RunId};
use super::trace::TraceError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("unknown model: {0}")]
    UnknownModel(String),
    #[error("run not found: {0}")]
    RunNotFound(RunId),
    #[error("ledger error: {0}")]
    Ledger(LedgerError),
    #[error("trace error: {0}")]
    Trace(#[from] TraceError),
}

impl EngineError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// Rejected before any adapter call was made.
    pub fn is_invalid_request(&self) -> bool {
        matches!(self, Self::InvalidRequest(_) | Self::UnknownModel(_))
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::UnknownModel(_) => "unknown_model",
            Self::RunNotFound(_) => "run_not_found",
            Self::Ledger(_) => "ledger_error",
            Self::Trace(_) => "trace_error",
        }
    }
}

impl From<LedgerError> for EngineError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound(id) => Self::RunNotFound(id),
            LedgerError::InvalidTransition { .. } => Self::InvalidRequest(err.to_string()),
            other => Self::Ledger(other),
        }
    }
}

/// Stable prefixes for `ResultItem.error`.
pub mod item_error {
    pub const TIMEOUT: &str = "timeout";
    pub const CANCELLED: &str = "cancelled";
    pub const EMPTY_RESPONSE: &str = "empty_response";
    pub const PARSE_ERROR: &str = "parse_error";

    pub fn format(code: &str, detail: impl std::fmt::Display) -> String {
        format!("{code}: {detail}")
    }

    /// The code part of an item error string.
    pub fn code_of(error: &str) -> &str {
        error.split_once(':').map(|(code, _)| code).unwrap_or(error)
    }
}

//! Error types shared by the upstream pool, the fault policy controller
//! and the aggregation engine.

use http::StatusCode;

/// Failure of a single upstream call, after retries when they apply.
///
/// Results of shared call futures are cloned to every dependent call,
/// so this type is `Clone`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("upstream call timed out")]
    Timeout,

    #[error("connection failure: {0}")]
    ConnectionFailure(String),

    #[error("upstream responded with status {status}")]
    UpstreamError { status: u16 },

    #[error("upstream payload is not valid JSON: {0}")]
    InvalidPayload(String),

    #[error("circuit open for service {0}")]
    CircuitOpen(String),

    #[error("service {0} is overloaded")]
    Overloaded(String),

    #[error("normalization failed: {0}")]
    Normalization(String),

    #[error("missing input {0}")]
    MissingInput(String),

    #[error("dependency {0} failed")]
    DependencyFailed(String),
}

impl CallError {
    /// Transport-level failures that a retry may cure.
    pub fn is_transient(&self) -> bool {
        matches!(self, CallError::Timeout | CallError::ConnectionFailure(_))
    }

    pub fn is_client_error(&self) -> bool {
        matches!(self, CallError::UpstreamError { status } if (400..500).contains(status))
    }

    /// Failures that never reached the upstream and say nothing about its health.
    pub fn is_rejection(&self) -> bool {
        matches!(self, CallError::CircuitOpen(_) | CallError::Overloaded(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CallError::Timeout => "Timeout",
            CallError::ConnectionFailure(_) => "ConnectionFailure",
            CallError::UpstreamError { .. } => "UpstreamError",
            CallError::InvalidPayload(_) => "InvalidPayload",
            CallError::CircuitOpen(_) => "CircuitOpen",
            CallError::Overloaded(_) => "Overloaded",
            CallError::Normalization(_) => "NormalizationError",
            CallError::MissingInput(_) => "MissingInput",
            CallError::DependencyFailed(_) => "DependencyFailed",
        }
    }
}

/// Terminal, per-request failure reported to the caller.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AggregationError {
    #[error("unknown client profile '{0}'")]
    UnknownClientProfile(String),

    #[error("unknown operation '{0}'")]
    UnknownOperation(String),

    #[error("required call '{causing_call}' failed: {reason}")]
    AggregationFailed {
        causing_call: String,
        reason: CallError,
    },

    #[error("payload of {size} bytes exceeds the profile budget of {limit} bytes")]
    PayloadBudgetExceeded { size: usize, limit: usize },
}

impl AggregationError {
    pub fn status(&self) -> StatusCode {
        match self {
            AggregationError::UnknownClientProfile(_) | AggregationError::UnknownOperation(_) => {
                StatusCode::NOT_FOUND
            }
            AggregationError::AggregationFailed { reason, .. } if reason.is_rejection() => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AggregationError::AggregationFailed { .. } => StatusCode::BAD_GATEWAY,
            AggregationError::PayloadBudgetExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AggregationError::UnknownClientProfile(_) => "UnknownClientProfile",
            AggregationError::UnknownOperation(_) => "UnknownOperation",
            AggregationError::AggregationFailed { .. } => "AggregationFailed",
            AggregationError::PayloadBudgetExceeded { .. } => "PayloadBudgetExceeded",
        }
    }

    pub fn causing_call(&self) -> Option<&str> {
        match self {
            AggregationError::AggregationFailed { causing_call, .. } => Some(causing_call),
            _ => None,
        }
    }
}

use thiserror::Error;

/// Failure of a single echo sub-request.
#[derive(Debug, Error)]
pub enum EchoError {
    #[error("request for key {key} failed: {source}")]
    Transport {
        key: u32,
        #[source]
        source: reqwest::Error,
    },

    #[error("echo service returned {status} for key {key}")]
    Status { key: u32, status: u16 },

    #[error("malformed echo body for key {key}: {message}")]
    MalformedBody { key: u32, message: String },

    #[error("echo body for key {key} has no args.key")]
    MissingField { key: u32 },
}

impl EchoError {
    pub fn key(&self) -> u32 {
        match self {
            Self::Transport { key, .. }
            | Self::Status { key, .. }
            | Self::MalformedBody { key, .. }
            | Self::MissingField { key } => *key,
        }
    }

    /// Short classification used in logs.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "transport",
            Self::Status { .. } => "status",
            Self::MalformedBody { .. } => "malformed_body",
            Self::MissingField { .. } => "missing_field",
        }
    }
}

/// Failure of a whole fan-out. The first failing sub-request wins.
#[derive(Debug, Error)]
pub enum FanoutError {
    #[error("sub-request {key} failed: {source}")]
    SubRequest {
        key: u32,
        #[source]
        source: EchoError,
    },

    #[error("fan-out timed out after {0}ms")]
    Timeout(u64),

    #[error("fan-out cancelled")]
    Cancelled,

    #[error("worker for key {key} panicked")]
    WorkerPanicked { key: u32 },
}

impl From<EchoError> for FanoutError {
    fn from(source: EchoError) -> Self {
        Self::SubRequest {
            key: source.key(),
            source,
        }
    }
}

impl FanoutError {
    /// Key of the sub-request that caused the failure, if one did.
    pub fn failed_key(&self) -> Option<u32> {
        match self {
            Self::SubRequest { key, .. } | Self::WorkerPanicked { key } => Some(*key),
            Self::Timeout(_) | Self::Cancelled => None,
        }
    }

    /// Sanitized message safe to return to HTTP callers.
    /// Never includes upstream URLs or response bodies.
    pub fn user_message(&self) -> String {
        match self {
            Self::SubRequest { .. } | Self::WorkerPanicked { .. } => "request failed".to_string(),
            Self::Timeout(ms) => format!("request timed out after {ms}ms"),
            Self::Cancelled => "request cancelled".to_string(),
        }
    }
}

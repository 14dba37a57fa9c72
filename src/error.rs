// Centralized error handling for the moonhost server
use thiserror::Error;

/// Main error type for host operations
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("pairing failed: {0}")]
    Pairing(#[from] PairingError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("runner failed: {0}")]
    Runner(#[from] RunnerError),

    #[error("resource exhausted: {resource}")]
    ResourceExhausted { resource: String },

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("crypto error: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),
}

impl ServerError {
    /// HTTP status this error maps to on client-facing endpoints
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Unauthorized(_) => 401,
            Self::NotFound(_) => 404,
            Self::Pairing(_) => 403,
            Self::Protocol(_) => 400,
            Self::ResourceExhausted { .. } => 503,
            Self::Transient(_) => 503,
            _ => 500,
        }
    }

    /// Whether the caller may retry the operation unchanged
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::ResourceExhausted { .. } | Self::Io(_)
        )
    }
}

/// Failures of the 4-phase pairing handshake
#[derive(Error, Debug)]
pub enum PairingError {
    #[error("no pairing in progress for {client}")]
    NoSuchExchange { client: String },

    #[error("multiple pairing attempts in flight from {client}")]
    AmbiguousExchange { client: String },

    #[error("request arrived in phase {got}, expected {expected}")]
    PhaseMismatch {
        expected: &'static str,
        got: &'static str,
    },

    #[error("challenge decrypt produced garbage")]
    BadChallenge,

    #[error("client hash does not match the stored pairing secret")]
    SecretMismatch,

    #[error("client signature rejected")]
    BadSignature,

    #[error("PIN entry timed out")]
    PinTimeout,

    #[error("certificate is already paired")]
    AlreadyPaired,

    #[error("malformed pairing payload: {0}")]
    Malformed(String),
}

/// Malformed HTTP, RTSP or SDP input
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("missing query parameter {0}")]
    MissingParam(&'static str),

    #[error("invalid hex in parameter {0}")]
    BadHex(&'static str),

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("malformed RTSP request: {0}")]
    Rtsp(String),

    #[error("malformed SDP: {0}")]
    Sdp(String),
}

/// Runner start and supervision failures
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("failed to start {what}: {reason}")]
    StartFailed { what: &'static str, reason: String },

    #[error("application exited unexpectedly with status {status}")]
    UnexpectedExit { status: i64 },

    #[error("container engine error: {0}")]
    Container(#[from] bollard::errors::Error),

    #[error("device attach failed: {0}")]
    DeviceAttach(String),
}

/// Result type alias for host operations
pub type Result<T> = std::result::Result<T, ServerError>;

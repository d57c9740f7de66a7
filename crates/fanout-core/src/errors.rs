/// Errors from the upstream push-stream transport.
/// None of these are fatal to the host; retryable variants feed the
/// backoff policy, the rest degrade to "not connected".
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("upstream status {status}")]
    Status { status: u16 },
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),
    #[error("closed by server")]
    ClosedByServer,
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectFailed(_) | Self::StreamInterrupted(_) | Self::ClosedByServer => true,
            Self::Status { status } => *status == 429 || *status >= 500,
        }
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::ConnectFailed(_) => "connect_failed",
            Self::Status { .. } => "status",
            Self::StreamInterrupted(_) => "stream_interrupted",
            Self::ClosedByServer => "closed_by_server",
        }
    }
}

/// Errors surfaced by the tab-side event bus API.
#[derive(Clone, Debug, thiserror::Error)]
pub enum BusError {
    #[error("event name \"{0}\" is reserved for connection lifecycle")]
    ReservedEvent(String),
    #[error("broker is no longer reachable")]
    BrokerGone,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

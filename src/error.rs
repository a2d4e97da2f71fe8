use std::fmt;

use crate::transport::TransportError;

#[derive(Debug)]
pub enum ClientError {
    /// Malformed caller input — no request was issued.
    Input(String),
    /// A clause combination the chosen operation forbids.
    Misuse(String),
    /// A transport-level failure (connection, payload decode, timeout, or
    /// a non-5XX HTTP status).
    Transport(TransportError),
    /// The server shed load with a 5XX status.
    Server { status: u16 },
    /// The reply envelope carried an error field; the server's message is
    /// attached verbatim.
    ServerContent(String),
    /// The retry ceiling was reached; wraps the last transient cause.
    Exhausted(Box<ClientError>),
    Internal(String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Input(msg) => write!(f, "invalid input: {}", msg),
            ClientError::Misuse(msg) => write!(f, "misuse: {}", msg),
            ClientError::Transport(e) => write!(f, "transport error: {}", e),
            ClientError::Server { status } => {
                write!(f, "the server returned an error: status={}", status)
            }
            ClientError::ServerContent(msg) => {
                write!(f, "the server reply contained an error: {}", msg)
            }
            ClientError::Exhausted(last) => write!(
                f,
                "all attempts to get data from the server exhausted, last error: {}",
                last
            ),
            ClientError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<TransportError> for ClientError {
    fn from(err: TransportError) -> Self {
        ClientError::Transport(err)
    }
}

impl ClientError {
    /// Whether the scheduler may retry the request that produced this error.
    /// Connection drops, payload decode failures, timeouts and 5XX replies
    /// are transient; everything else surfaces immediately.
    pub(crate) fn is_retriable(&self) -> bool {
        match self {
            ClientError::Server { .. } => true,
            ClientError::Transport(e) => matches!(
                e,
                TransportError::Connect(_)
                    | TransportError::Timeout(_)
                    | TransportError::Payload(_)
            ),
            _ => false,
        }
    }
}

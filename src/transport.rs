use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

/// Request timeout for the built-in transport.
const REQUEST_TIMEOUT_SECS: u64 = 120;
/// Connect timeout for the built-in transport.
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// The failure classes a transport implementation must keep apart. The
/// scheduler retries the first three and 5XX statuses; other statuses
/// surface to the caller untouched.
#[derive(Debug)]
pub enum TransportError {
    /// DNS / TCP / TLS failure before any response arrived.
    Connect(String),
    /// The response did not arrive within the transport's deadline.
    Timeout(String),
    /// The response body could not be decoded as JSON.
    Payload(String),
    /// The server answered with a non-2XX status.
    Status { status: u16 },
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Connect(msg) => write!(f, "connect error: {}", msg),
            TransportError::Timeout(msg) => write!(f, "request timeout: {}", msg),
            TransportError::Payload(msg) => write!(f, "payload decode error: {}", msg),
            TransportError::Status { status } => write!(f, "http status {}", status),
        }
    }
}

impl std::error::Error for TransportError {}

/// The one capability the core needs from HTTP: POST a JSON body to a URL
/// and get the decoded JSON reply back. Non-2XX statuses are reported as
/// [`TransportError::Status`].
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn post(&self, url: &str, body: Option<&Value>) -> Result<Value, TransportError>;
}

/// Produces access tokens for servers that authenticate by token instead
/// of by webhook secret. `refresh` is called before the first request and
/// again whenever the server rejects the current token.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn refresh(&self) -> Result<String, TransportError>;
}

/// Production transport on top of `reqwest`.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// `ssl: false` disables certificate verification for on-premise
    /// installations behind self-signed certificates.
    pub fn new(ssl: bool) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .danger_accept_invalid_certs(!ssl)
            .build()
            .expect("failed to build HTTP client");
        Self { client }
    }

    /// Wrap a caller-managed `reqwest` client. Its timeouts and TLS
    /// settings are used as-is.
    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn post(&self, url: &str, body: Option<&Value>) -> Result<Value, TransportError> {
        let mut request = self.client.post(url);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(e.to_string())
            } else {
                TransportError::Connect(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
            });
        }

        response
            .json()
            .await
            .map_err(|e| TransportError::Payload(e.to_string()))
    }
}

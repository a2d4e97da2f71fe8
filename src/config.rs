use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ClientError;

/// Burst capacity of the server's admission pool.
pub const DEFAULT_POOL_SIZE: usize = 50;
/// Steady admission rate once the pool is drained.
pub const DEFAULT_REQUESTS_PER_SECOND: f64 = 2.0;

/// Client construction settings. Everything except `webhook` has a
/// default matching the server's advertised policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Webhook granting access to the server's REST API. Requests go to
    /// `{webhook}{method}`; a trailing slash is appended if missing.
    pub webhook: String,

    /// Also gate requests on the per-method sliding window of total
    /// server-side processing seconds.
    #[serde(default)]
    pub respect_velocity_policy: bool,

    #[serde(default = "default_pool_size")]
    pub request_pool_size: usize,

    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,

    /// Verify TLS certificates on the built-in transport.
    #[serde(default = "default_ssl")]
    pub ssl: bool,

    /// Widens tracing output for interactive runs.
    #[serde(default)]
    pub verbose: bool,
}

impl ClientConfig {
    pub fn new(webhook: impl Into<String>) -> Self {
        Self {
            webhook: webhook.into(),
            respect_velocity_policy: false,
            request_pool_size: default_pool_size(),
            requests_per_second: default_requests_per_second(),
            ssl: default_ssl(),
            verbose: false,
        }
    }
}

fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}

fn default_requests_per_second() -> f64 {
    DEFAULT_REQUESTS_PER_SECOND
}

fn default_ssl() -> bool {
    true
}

/// Sanity-check the webhook and bring it to the canonical form with a
/// trailing slash.
pub fn standardize_webhook(webhook: &str) -> Result<String, ClientError> {
    let webhook = webhook.trim();

    let parsed = Url::parse(webhook)
        .map_err(|_| ClientError::Input("webhook is not a valid URL".to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(ClientError::Input(
            "webhook is not a valid http(s) URL".to_string(),
        ));
    }

    let mut webhook = webhook.to_string();
    if !webhook.ends_with('/') {
        webhook.push('/');
    }
    Ok(webhook)
}

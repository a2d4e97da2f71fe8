//! The request scheduler: composes the three admission gates, dispatches
//! through the transport, accounts server-side processing time, and drives
//! the retry/backoff loop.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::time::{sleep, Instant};

use crate::config::{standardize_webhook, ClientConfig};
use crate::error::ClientError;
use crate::response::ServerResponse;
use crate::throttle::{
    ConcurrencyLimiter, SlidingWindow, TokenBucket, MAX_CONCURRENT_REQUESTS,
    MAX_REQUEST_RUNNING_TIME, MEASUREMENT_PERIOD,
};
use crate::transport::{HttpTransport, ReqwestTransport, TokenProvider, TransportError};

/// Consecutive retriable failures tolerated before the operation fails
/// with the last cause.
pub const MAX_RETRIES: i32 = 10;
/// Concurrency restore factor applied while requests succeed.
const RESTORE_CONNECTIONS_FACTOR: f64 = 1.3;
/// Concurrency decrease factor applied while requests fail.
const DECREASE_CONNECTIONS_FACTOR: f64 = 3.0;
/// First backoff sleep, seconds.
const INITIAL_TIMEOUT: f64 = 0.5;
/// Exponential base for successive backoff sleeps.
const BACKOFF_FACTOR: f64 = 1.5;
/// Failures tolerated before backoff sleeps start.
const NUM_FAILURES_NO_TIMEOUT: i32 = 3;

struct SessionState {
    transport: Option<Arc<dyn HttpTransport>>,
    active_runs: usize,
    user_provided: bool,
}

struct AuthState {
    provider: Arc<dyn TokenProvider>,
    current: Mutex<Option<String>>,
}

/// Controls how fast requests are passed to the server so that it does
/// not start shedding them with 5XX errors, and recovers when it does.
pub struct RequestScheduler {
    webhook: String,
    respect_velocity_policy: bool,
    ssl: bool,
    session: Mutex<SessionState>,
    bucket: tokio::sync::Mutex<TokenBucket>,
    /// Per-method sliding windows, created on first use and kept for the
    /// scheduler's lifetime.
    method_windows: DashMap<String, Arc<tokio::sync::Mutex<SlidingWindow>>>,
    pub(crate) concurrency: Arc<ConcurrencyLimiter>,
    /// Positive — consecutive successes; negative — consecutive failures.
    successive: AtomicI32,
    auth: Option<AuthState>,
}

impl RequestScheduler {
    pub fn new(
        config: &ClientConfig,
        transport: Option<Arc<dyn HttpTransport>>,
        token_provider: Option<Arc<dyn TokenProvider>>,
    ) -> Result<Self, ClientError> {
        let webhook = standardize_webhook(&config.webhook)?;
        let user_provided = transport.is_some();
        Ok(Self {
            webhook,
            respect_velocity_policy: config.respect_velocity_policy,
            ssl: config.ssl,
            session: Mutex::new(SessionState {
                transport,
                active_runs: 0,
                user_provided,
            }),
            bucket: tokio::sync::Mutex::new(TokenBucket::new(
                config.request_pool_size,
                config.requests_per_second,
            )),
            method_windows: DashMap::new(),
            concurrency: Arc::new(ConcurrencyLimiter::new(MAX_CONCURRENT_REQUESTS)),
            successive: AtomicI32::new(0),
            auth: token_provider.map(|provider| AuthState {
                provider,
                current: Mutex::new(None),
            }),
        })
    }

    pub fn webhook(&self) -> &str {
        &self.webhook
    }

    /// Enter an active run. The transport session is opened on the 0 → 1
    /// transition and closed when the last run ends, unless the caller
    /// supplied its own transport — that one is never torn down.
    pub(crate) fn begin_run(self: &Arc<Self>) -> RunGuard {
        let mut session = self.session.lock().unwrap();
        if session.transport.is_none() {
            session.transport = Some(Arc::new(ReqwestTransport::new(self.ssl)));
        }
        session.active_runs += 1;
        RunGuard {
            scheduler: self.clone(),
            transport: session.transport.clone().unwrap(),
        }
    }

    /// One logical request with retries. Transient failures (connection
    /// drops, payload errors, timeouts, 5XX) are retried under the
    /// autothrottle until the retry ceiling; everything else surfaces
    /// immediately.
    pub async fn single_request(
        self: &Arc<Self>,
        method: &str,
        params: Option<&Value>,
    ) -> Result<ServerResponse, ClientError> {
        let run = self.begin_run();
        let reply = self
            .single_request_on(run.transport(), method, params)
            .await;
        drop(run);
        reply
    }

    pub(crate) async fn single_request_on(
        &self,
        transport: &Arc<dyn HttpTransport>,
        method: &str,
        params: Option<&Value>,
    ) -> Result<ServerResponse, ClientError> {
        let mut auth_retried = false;
        loop {
            match self.request_attempt(transport, method, params).await {
                Ok(envelope) => {
                    self.success();
                    return Ok(ServerResponse::new(envelope));
                }
                Err(ClientError::Transport(TransportError::Status { status: 401 }))
                    if self.auth.is_some() && !auth_retried =>
                {
                    tracing::debug!("scheduler: token rejected, refreshing");
                    auth_retried = true;
                    self.refresh_token().await?;
                }
                Err(err) if err.is_retriable() => self.failure(err)?,
                Err(err) => return Err(err),
            }
        }
    }

    /// One attempt: pass the gates in order (autothrottle, concurrency,
    /// token bucket, per-method window), POST, account the server time.
    /// The gates are released in reverse order on the way out.
    async fn request_attempt(
        &self,
        transport: &Arc<dyn HttpTransport>,
        method: &str,
        params: Option<&Value>,
    ) -> Result<Value, ClientError> {
        self.autothrottle().await;
        let _permit = self.concurrency.acquire().await;
        self.acquire_bucket_slot().await;

        let window = if self.respect_velocity_policy {
            Some(self.method_window(method))
        } else {
            None
        };
        if let Some(window) = &window {
            let wait = window.lock().await.needed_wait(Instant::now());
            if wait > Duration::ZERO {
                tracing::debug!(
                    "scheduler: velocity budget spent, method={}, wait={:?}",
                    method,
                    wait
                );
                sleep(wait).await;
            }
        }

        tracing::debug!("scheduler: requesting, method={}", method);
        let url = format!("{}{}", self.webhook, method);
        let body = self.body_with_auth(params).await?;
        let outcome = transport.post(&url, body.as_ref().or(params)).await;

        if let Ok(envelope) = &outcome {
            self.account_server_time(method, params, envelope).await;
        }
        if let Some(window) = &window {
            window.lock().await.trim(Instant::now());
        }
        self.bucket.lock().await.trim(Instant::now());

        match outcome {
            Ok(envelope) => Ok(envelope),
            Err(TransportError::Status { status }) if (500..600).contains(&status) => {
                Err(ClientError::Server { status })
            }
            Err(err) => Err(ClientError::Transport(err)),
        }
    }

    /// Wait out the admission pool, then register this request in it.
    async fn acquire_bucket_slot(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                let now = Instant::now();
                let wait = bucket.needed_wait(now);
                if wait.is_zero() {
                    bucket.record(now);
                    return;
                }
                wait
            };
            tracing::debug!("scheduler: admission pool full, wait={:?}", wait);
            sleep(wait).await;
        }
    }

    /// Adapt the concurrency limit to the recent outcome streak, sleeping
    /// once the failure streak outgrows the grace count.
    async fn autothrottle(&self) {
        let streak = self.successive.load(Ordering::Acquire);
        if streak < 0 {
            let limit = self.concurrency.decrease_limit(DECREASE_CONNECTIONS_FACTOR);
            tracing::debug!(
                "scheduler: concurrency decreased, limit={:.2}, streak={}",
                limit,
                streak
            );
            if streak < -NUM_FAILURES_NO_TIMEOUT {
                let power = -streak - NUM_FAILURES_NO_TIMEOUT - 1;
                let delay = INITIAL_TIMEOUT * BACKOFF_FACTOR.powi(power);
                tracing::debug!("scheduler: backing off, delay={:.2}s", delay);
                sleep(Duration::from_secs_f64(delay)).await;
            }
        } else if streak > 0 {
            let limit = self.concurrency.increase_limit(RESTORE_CONNECTIONS_FACTOR);
            tracing::trace!(
                "scheduler: concurrency increased, limit={:.2}, streak={}",
                limit,
                streak
            );
        }
    }

    fn success(&self) {
        self.successive
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |streak| {
                Some((streak + 1).max(1))
            })
            .ok();
    }

    /// Count a retriable failure; past the ceiling the operation fails
    /// with the last cause attached.
    fn failure(&self, err: ClientError) -> Result<(), ClientError> {
        let streak = self
            .successive
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |streak| {
                Some((streak - 1).min(-1))
            })
            .map(|prev| (prev - 1).min(-1))
            .unwrap_or(-1);
        tracing::debug!("scheduler: retriable failure, streak={}, err={}", streak, err);
        if streak < -MAX_RETRIES {
            return Err(ClientError::Exhausted(Box::new(err)));
        }
        Ok(())
    }

    fn method_window(&self, method: &str) -> Arc<tokio::sync::Mutex<SlidingWindow>> {
        // Fast path: the window already exists — no allocation.
        if let Some(entry) = self.method_windows.get(method) {
            return entry.value().clone();
        }
        self.method_windows
            .entry(method.to_string())
            .or_insert_with(|| {
                Arc::new(tokio::sync::Mutex::new(SlidingWindow::new(
                    MAX_REQUEST_RUNNING_TIME,
                    MEASUREMENT_PERIOD,
                )))
            })
            .clone()
    }

    /// Credit observed server time to the right sliding windows. A batch
    /// reply carries one timing block per label; each is credited to the
    /// method named in the outgoing `cmd` entry. A plain reply credits the
    /// dispatched method.
    async fn account_server_time(&self, method: &str, params: Option<&Value>, envelope: &Value) {
        if !self.respect_velocity_policy {
            return;
        }
        let now = Instant::now();
        if method == "batch" {
            let times = envelope
                .pointer("/result/result_time")
                .and_then(Value::as_object);
            let cmd = params
                .and_then(|p| p.pointer("/cmd"))
                .and_then(Value::as_object);
            let (Some(times), Some(cmd)) = (times, cmd) else {
                return;
            };
            for (label, timing) in times {
                let Some(operating) = timing.get("operating").and_then(Value::as_f64) else {
                    continue;
                };
                let Some(sub_method) = cmd
                    .get(label)
                    .and_then(Value::as_str)
                    .map(|command| command.split('?').next().unwrap_or(command))
                else {
                    continue;
                };
                let window = self.method_window(sub_method);
                window.lock().await.record(now, operating);
            }
        } else if let Some(operating) = envelope.pointer("/time/operating").and_then(Value::as_f64)
        {
            let window = self.method_window(method);
            window.lock().await.record(now, operating);
        }
    }

    /// When a token provider is configured, the current token rides along
    /// as the `auth` field of every object body. Raw non-object bodies are
    /// passed through untouched.
    async fn body_with_auth(&self, params: Option<&Value>) -> Result<Option<Value>, ClientError> {
        let Some(auth) = &self.auth else {
            return Ok(None);
        };
        let token = {
            let current = auth.current.lock().unwrap();
            current.clone()
        };
        let token = match token {
            Some(token) => token,
            None => self.refresh_token().await?,
        };
        let mut body = match params {
            None => Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(_) => return Ok(None),
        };
        body.insert("auth".to_string(), Value::String(token));
        Ok(Some(Value::Object(body)))
    }

    async fn refresh_token(&self) -> Result<String, ClientError> {
        let auth = self
            .auth
            .as_ref()
            .expect("refresh_token called without a token provider");
        let token = auth.provider.refresh().await?;
        *auth.current.lock().unwrap() = Some(token.clone());
        Ok(token)
    }

    #[cfg(test)]
    pub(crate) fn successive_streak(&self) -> i32 {
        self.successive.load(Ordering::Acquire)
    }
}

/// An active top-level run holding the session open.
pub(crate) struct RunGuard {
    scheduler: Arc<RequestScheduler>,
    transport: Arc<dyn HttpTransport>,
}

impl RunGuard {
    pub(crate) fn transport(&self) -> &Arc<dyn HttpTransport> {
        &self.transport
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let mut session = self.scheduler.session.lock().unwrap();
        session.active_runs -= 1;
        if session.active_runs == 0 && !session.user_provided {
            session.transport = None;
        }
    }
}

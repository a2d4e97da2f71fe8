//! The public operation surface: `get_all`, `get_by_id`, `call` and
//! friends, plus the blocking facade.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures_util::stream::{FuturesUnordered, StreamExt};
use serde_json::{json, Map, Value};

use crate::batch::{Batcher, Labeling};
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::paginate::Paginator;
use crate::params::{self, Params};
use crate::response::{ExtractMode, Payload};
use crate::scheduler::RequestScheduler;
use crate::throttle::ConcurrencyLimiter;
use crate::transport::{HttpTransport, TokenProvider};

/// Asynchronous client for the server's REST API. Cheap to clone; all
/// clones share one scheduler and its throttling state.
#[derive(Clone)]
pub struct Client {
    scheduler: Arc<RequestScheduler>,
    verbose: bool,
}

impl Client {
    /// Build a client with default settings from a webhook URL.
    pub fn new(webhook: &str) -> Result<Self, ClientError> {
        Self::builder(webhook).build()
    }

    pub fn builder(webhook: &str) -> ClientBuilder {
        ClientBuilder {
            config: ClientConfig::new(webhook),
            transport: None,
            token_provider: None,
        }
    }

    /// Fetch every record a list endpoint holds, paginating past the
    /// server's page size. `start`, `limit` and `order` are forbidden in
    /// `params`: the first two break pagination and ordering is imposed
    /// internally so pages stay disjoint.
    pub async fn get_all(
        &self,
        method: &str,
        params: Option<Params>,
    ) -> Result<Vec<Value>, ClientError> {
        let method = params::standardize_method(method)?;
        if let Some(params) = &params {
            params::validate_params(params)?;
            for clause in ["start", "limit", "order"] {
                if params::contains_clause(params, clause) {
                    return Err(ClientError::Misuse(format!(
                        "get_all() does not support the \"{}\" clause",
                        clause
                    )));
                }
            }
        }

        if self.verbose {
            tracing::info!("client: get_all started, method={}", method);
        }
        let _run = self.scheduler.begin_run();
        let results = Paginator::new(self.scheduler.clone(), method.clone(), params)
            .run()
            .await?;
        if self.verbose {
            tracing::info!(
                "client: get_all finished, method={}, results={}",
                method,
                results.len()
            );
        }
        Ok(results)
    }

    /// Bulk-fetch entities by identifier. Returns a mapping with exactly
    /// one key per distinct input id; duplicates collapse to one request.
    /// The id field name is taken as given — no casing coercion.
    pub async fn get_by_id(
        &self,
        method: &str,
        ids: &[String],
        id_field: &str,
        params: Option<Params>,
    ) -> Result<HashMap<String, Value>, ClientError> {
        let method = params::standardize_method(method)?;
        let id_field = id_field.trim();
        if id_field.is_empty() {
            return Err(ClientError::Input("id field name cannot be empty".to_string()));
        }
        if ids.is_empty() {
            return Err(ClientError::Input("the id list is empty".to_string()));
        }
        if let Some(params) = &params {
            params::validate_params(params)?;
            if params::contains_clause(params, id_field) {
                return Err(ClientError::Misuse(format!(
                    "get_by_id() does not support \"{}\" inside params",
                    id_field
                )));
            }
        }

        let mut unique = Vec::with_capacity(ids.len());
        {
            let mut seen = std::collections::HashSet::new();
            for id in ids {
                if seen.insert(id.as_str()) {
                    unique.push(id.clone());
                }
            }
        }

        let items: Vec<Params> = unique
            .iter()
            .map(|id| params::with_clause(params.as_ref(), id_field, json!(id)))
            .collect();

        let _run = self.scheduler.begin_run();
        let envelopes = Batcher::new(
            self.scheduler.webhook(),
            &method,
            &items,
            Labeling::ByField(id_field.to_string()),
        )
        .envelopes()?;

        let mut merged = HashMap::with_capacity(unique.len());
        for map in self.dispatch_keyed(envelopes).await? {
            merged.extend(map);
        }
        Ok(merged)
    }

    /// Issue one method over a list of params sets. The reply is a vector
    /// with one element per input item, in submission order.
    pub async fn call(&self, method: &str, items: &[Params]) -> Result<Vec<Value>, ClientError> {
        let method = params::standardize_method(method)?;
        if items.is_empty() {
            return Err(ClientError::Input("the item list is empty".to_string()));
        }
        for item in items {
            params::validate_params(item)?;
        }

        let _run = self.scheduler.begin_run();
        let envelopes = Batcher::new(
            self.scheduler.webhook(),
            &method,
            items,
            Labeling::Sequential,
        )
        .envelopes()?;

        // Zero-padded labels sort lexicographically into submission order,
        // so one ordered map re-sequences replies that completed out of
        // order across envelopes.
        let mut ordered = BTreeMap::new();
        for map in self.dispatch_keyed(envelopes).await? {
            ordered.extend(map);
        }
        Ok(ordered.into_values().collect())
    }

    /// `call` for a single params mapping; returns the bare result.
    pub async fn call_one(&self, method: &str, params: Params) -> Result<Value, ClientError> {
        let mut results = self.call(method, std::slice::from_ref(&params)).await?;
        Ok(results.pop().unwrap_or(Value::Null))
    }

    /// Send `body` verbatim as the request payload and hand back the raw
    /// reply envelope. For legacy methods that expect a list body, and for
    /// null-valued params that must survive untouched.
    pub async fn call_raw(&self, method: &str, body: Value) -> Result<Value, ClientError> {
        let method = params::standardize_method(method)?;
        let reply = self.scheduler.single_request(&method, Some(&body)).await?;
        Ok(reply.into_inner())
    }

    /// Dispatch one pre-built multicall envelope. `params` must contain
    /// exactly the `halt` and `cmd` clauses; the reply is the label →
    /// sub-result map.
    pub async fn call_batch(&self, params: Params) -> Result<Map<String, Value>, ClientError> {
        params::validate_params(&params)?;
        if params.len() != 2
            || !params::contains_clause(&params, "halt")
            || !params::contains_clause(&params, "cmd")
        {
            return Err(ClientError::Input(
                "batch params should contain exactly the \"halt\" and \"cmd\" clauses"
                    .to_string(),
            ));
        }

        let body = Value::Object(params);
        let reply = self.scheduler.single_request("batch", Some(&body)).await?;
        match reply.extract_results(ExtractMode::Keyed)? {
            Payload::Map(map) => Ok(map),
            other => Err(ClientError::ServerContent(format!(
                "unexpected batch reply shape: {:?}",
                other
            ))),
        }
    }

    /// Fetch all entity ids from `{branch}.list`, then the full entities
    /// from `{branch}.get`, returning the id → entity mapping.
    pub async fn list_and_get(
        &self,
        method_branch: &str,
        id_field: &str,
    ) -> Result<HashMap<String, Value>, ClientError> {
        let branch = method_branch.trim().trim_end_matches('.').to_lowercase();
        if branch.is_empty() {
            return Err(ClientError::Input("method branch cannot be empty".to_string()));
        }
        if branch.ends_with(".list") || branch.ends_with(".get") {
            return Err(ClientError::Input(
                "pass the method branch without the .list / .get verb".to_string(),
            ));
        }

        let select = params::with_clause(None, "select", json!([id_field]));
        let listed = self.get_all(&format!("{}.list", branch), Some(select)).await?;

        let mut ids = Vec::with_capacity(listed.len());
        for record in &listed {
            match record.get(id_field) {
                Some(Value::String(s)) => ids.push(s.clone()),
                Some(Value::Number(n)) => ids.push(n.to_string()),
                _ => {
                    return Err(ClientError::ServerContent(format!(
                        "a listed record is missing the \"{}\" field",
                        id_field
                    )))
                }
            }
        }
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        self.get_by_id(&format!("{}.get", branch), &ids, id_field, None)
            .await
    }

    /// Temporarily cap concurrency for the guard's lifetime; on drop the
    /// previous cap is restored. Scopes nest.
    pub fn slow(&self, max_concurrent: f64) -> SlowGuard {
        tracing::debug!(
            "client: concurrency cap override pushed, cap={}",
            max_concurrent
        );
        self.scheduler.concurrency.push_override(max_concurrent);
        SlowGuard {
            limiter: self.scheduler.concurrency.clone(),
        }
    }

    /// Send each envelope as its own `batch` request, concurrently, and
    /// collect the keyed payloads in completion order.
    async fn dispatch_keyed(
        &self,
        envelopes: Vec<Params>,
    ) -> Result<Vec<Map<String, Value>>, ClientError> {
        let mut replies = FuturesUnordered::new();
        for envelope in envelopes {
            let scheduler = self.scheduler.clone();
            replies.push(async move {
                let body = Value::Object(envelope);
                scheduler.single_request("batch", Some(&body)).await
            });
        }

        let mut maps = Vec::new();
        while let Some(reply) = replies.next().await {
            match reply?.extract_results(ExtractMode::Keyed)? {
                Payload::Map(map) => maps.push(map),
                other => {
                    return Err(ClientError::ServerContent(format!(
                        "unexpected batch reply shape: {:?}",
                        other
                    )))
                }
            }
        }
        Ok(maps)
    }
}

pub struct ClientBuilder {
    config: ClientConfig,
    transport: Option<Arc<dyn HttpTransport>>,
    token_provider: Option<Arc<dyn TokenProvider>>,
}

impl ClientBuilder {
    /// Replace the whole configuration, keeping the webhook given to
    /// [`Client::builder`] if the new one is empty.
    pub fn config(mut self, mut config: ClientConfig) -> Self {
        if config.webhook.is_empty() {
            config.webhook = self.config.webhook.clone();
        }
        self.config = config;
        self
    }

    pub fn respect_velocity_policy(mut self, on: bool) -> Self {
        self.config.respect_velocity_policy = on;
        self
    }

    pub fn request_pool_size(mut self, pool_size: usize) -> Self {
        self.config.request_pool_size = pool_size;
        self
    }

    pub fn requests_per_second(mut self, rps: f64) -> Self {
        self.config.requests_per_second = rps;
        self
    }

    pub fn ssl(mut self, ssl: bool) -> Self {
        self.config.ssl = ssl;
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.config.verbose = verbose;
        self
    }

    /// Use a caller-managed transport. The scheduler never tears it down.
    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.token_provider = Some(provider);
        self
    }

    pub fn build(self) -> Result<Client, ClientError> {
        let verbose = self.config.verbose;
        let scheduler = RequestScheduler::new(&self.config, self.transport, self.token_provider)?;
        Ok(Client {
            scheduler: Arc::new(scheduler),
            verbose,
        })
    }
}

/// Active `slow()` scope. Dropping it restores the previous cap.
#[must_use = "the cap override ends when the guard is dropped"]
pub struct SlowGuard {
    limiter: Arc<ConcurrencyLimiter>,
}

impl Drop for SlowGuard {
    fn drop(&mut self) {
        self.limiter.pop_override();
        tracing::debug!("client: concurrency cap override popped");
    }
}

/// Blocking facade over [`Client`]: drives a private current-thread
/// runtime, duplicating no logic.
pub struct BlockingClient {
    inner: Client,
    runtime: tokio::runtime::Runtime,
}

impl BlockingClient {
    pub fn new(webhook: &str) -> Result<Self, ClientError> {
        Self::from_client(Client::new(webhook)?)
    }

    pub fn from_client(inner: Client) -> Result<Self, ClientError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| ClientError::Internal(format!("failed to build runtime: {}", e)))?;
        Ok(Self { inner, runtime })
    }

    pub fn get_all(
        &self,
        method: &str,
        params: Option<Params>,
    ) -> Result<Vec<Value>, ClientError> {
        self.runtime.block_on(self.inner.get_all(method, params))
    }

    pub fn get_by_id(
        &self,
        method: &str,
        ids: &[String],
        id_field: &str,
        params: Option<Params>,
    ) -> Result<HashMap<String, Value>, ClientError> {
        self.runtime
            .block_on(self.inner.get_by_id(method, ids, id_field, params))
    }

    pub fn call(&self, method: &str, items: &[Params]) -> Result<Vec<Value>, ClientError> {
        self.runtime.block_on(self.inner.call(method, items))
    }

    pub fn call_one(&self, method: &str, params: Params) -> Result<Value, ClientError> {
        self.runtime.block_on(self.inner.call_one(method, params))
    }

    pub fn call_raw(&self, method: &str, body: Value) -> Result<Value, ClientError> {
        self.runtime.block_on(self.inner.call_raw(method, body))
    }

    pub fn call_batch(&self, params: Params) -> Result<Map<String, Value>, ClientError> {
        self.runtime.block_on(self.inner.call_batch(params))
    }

    pub fn list_and_get(
        &self,
        method_branch: &str,
        id_field: &str,
    ) -> Result<HashMap<String, Value>, ClientError> {
        self.runtime
            .block_on(self.inner.list_and_get(method_branch, id_field))
    }

    /// The override applies to the shared scheduler, so it also slows any
    /// async clones of the inner client.
    pub fn slow(&self, max_concurrent: f64) -> SlowGuard {
        self.inner.slow(max_concurrent)
    }
}

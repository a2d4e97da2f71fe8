//! Driving list endpoints to completion: one direct first request, then
//! batched continuation pages fetched concurrently, deduplicated in order
//! of first appearance.

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::stream::{FuturesUnordered, StreamExt};
use serde_json::{json, Value};

use crate::batch::{Batcher, Labeling};
use crate::error::ClientError;
use crate::params::{self, Params};
use crate::response::{ExtractMode, Payload};
use crate::scheduler::RequestScheduler;

/// List endpoints page at this size.
pub const PAGE_SIZE: usize = 50;

/// Shortfalls at or below this many items stay silent: concurrent
/// deletions legitimately shrink a small tail. An empty continuation
/// phase with more than this many items outstanding points at batch
/// requests failing silently instead.
const EMPTY_BATCH_WARNING_THRESHOLD: usize = 100;

pub struct Paginator {
    scheduler: Arc<RequestScheduler>,
    method: String,
    params: Option<Params>,
}

impl Paginator {
    pub fn new(scheduler: Arc<RequestScheduler>, method: String, params: Option<Params>) -> Self {
        Self {
            scheduler,
            method,
            params,
        }
    }

    pub async fn run(mut self) -> Result<Vec<Value>, ClientError> {
        self.ensure_order_clause();

        let first_params = self.params.clone().map(Value::Object);
        let first = self
            .scheduler
            .single_request(&self.method, first_params.as_ref())
            .await?;

        let total = first.total();
        let mut results = match first.extract_results(ExtractMode::Flatten)? {
            Payload::Items(items) => items,
            Payload::Map(map) => map.into_iter().map(|(_, value)| value).collect(),
            Payload::Value(Value::Null) => Vec::new(),
            Payload::Value(other) => vec![other],
        };

        if first.more_results_expected(results.len()) {
            let total = total.unwrap_or(0) as usize;
            let first_page = results.len();
            results = self.fetch_remaining(results, total).await?;

            let expected_more = total.saturating_sub(first_page);
            let fetched = results.len() - first_page;
            if batch_failure_suspected(expected_more, fetched) {
                tracing::warn!(
                    "paginate: Batch requests returned no results. Expected {} more items but got 0; \
                     this can be caused by data changes during pagination or by batch requests \
                     failing silently, method={}",
                    expected_more,
                    self.method
                );
            }

            results = dedup_keep_first(results);

            if results.len() != total {
                tracing::warn!(
                    "paginate: collected {} results but the server reported total={}, method={}",
                    results.len(),
                    total,
                    self.method
                );
            }
        }

        Ok(results)
    }

    /// Continuation pages are plain clones of the original params with a
    /// moving `start` offset, packed into multicalls.
    async fn fetch_remaining(
        &self,
        mut results: Vec<Value>,
        total: usize,
    ) -> Result<Vec<Value>, ClientError> {
        let pages: Vec<Params> = (results.len()..total)
            .step_by(PAGE_SIZE)
            .map(|start| params::with_clause(self.params.as_ref(), "start", json!(start)))
            .collect();
        tracing::debug!(
            "paginate: fetching continuation pages, method={}, pages={}",
            self.method,
            pages.len()
        );

        let envelopes = Batcher::new(
            self.scheduler.webhook(),
            &self.method,
            &pages,
            Labeling::Sequential,
        )
        .envelopes()?;

        let mut replies = FuturesUnordered::new();
        for envelope in envelopes {
            let scheduler = self.scheduler.clone();
            replies.push(async move {
                let body = Value::Object(envelope);
                scheduler.single_request("batch", Some(&body)).await
            });
        }

        while let Some(reply) = replies.next().await {
            match reply?.extract_results(ExtractMode::Flatten)? {
                Payload::Items(items) => results.extend(items),
                Payload::Map(map) => results.extend(map.into_iter().map(|(_, value)| value)),
                Payload::Value(Value::Null) => {}
                Payload::Value(other) => results.push(other),
            }
        }
        Ok(results)
    }

    /// Without an explicit ordering the server returns pages in arbitrary
    /// order and entities repeat across page boundaries, which makes
    /// deduplication meaningless.
    fn ensure_order_clause(&mut self) {
        let params = self.params.get_or_insert_with(Params::new);
        if !params::contains_clause(params, "order") {
            params.insert("order".to_string(), json!({"ID": "ASC"}));
        }
    }
}

/// An empty continuation phase is only alarming when a lot was expected;
/// a handful of missing items is normal churn.
fn batch_failure_suspected(expected_more: usize, fetched: usize) -> bool {
    fetched == 0 && expected_more > EMPTY_BATCH_WARNING_THRESHOLD
}

/// Structural deduplication, stable on first appearance. Records are
/// compared by their canonical JSON rendering because nested values make
/// them unhashable as-is.
fn dedup_keep_first(items: Vec<Value>) -> Vec<Value> {
    let mut seen = HashSet::with_capacity(items.len());
    items
        .into_iter()
        .filter(|item| seen.insert(item.to_string()))
        .collect()
}

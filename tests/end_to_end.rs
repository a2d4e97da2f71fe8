//! End-to-end scenarios over a scripted transport: pagination, bulk
//! by-id fetches, submission-order calls, URL-length splitting, backoff
//! and the `slow()` concurrency clamp.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use fastcrm::{Client, ClientError, HttpTransport, TransportError};

type Handler = Box<dyn Fn(&str, Option<&Value>) -> Result<Value, TransportError> + Send + Sync>;

/// Transport driven by a closure; records every call.
struct MockTransport {
    handler: Handler,
    calls: Mutex<Vec<(String, Option<Value>)>>,
}

impl MockTransport {
    fn new(
        handler: impl Fn(&str, Option<&Value>) -> Result<Value, TransportError>
            + Send
            + Sync
            + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn calls(&self) -> Vec<(String, Option<Value>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn post(&self, url: &str, body: Option<&Value>) -> Result<Value, TransportError> {
        self.calls
            .lock()
            .unwrap()
            .push((url.to_string(), body.cloned()));
        (self.handler)(url, body)
    }
}

const WEBHOOK: &str = "https://acme.example.com/rest/1/secret/";

fn client_with(transport: Arc<MockTransport>) -> Client {
    Client::builder(WEBHOOK)
        .transport(transport)
        .build()
        .unwrap()
}

/// A well-formed multicall reply around the given label → result map.
fn batch_reply(results: Value) -> Value {
    json!({
        "result": {
            "result": results,
            "result_error": [],
            "result_total": [],
            "result_next": [],
            "result_time": {},
        },
        "time": {"operating": 0.01},
    })
}

fn cmd_map(body: Option<&Value>) -> Map<String, Value> {
    body.and_then(|b| b.get("cmd"))
        .and_then(Value::as_object)
        .cloned()
        .expect("batch body should carry a cmd map")
}

/// `start` offset encoded into a sub-command's query string.
fn start_of(command: &Value) -> usize {
    let command = command.as_str().unwrap();
    command
        .split("start=")
        .nth(1)
        .and_then(|rest| {
            let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse().ok()
        })
        .expect("sub-command should carry a start offset")
}

fn ids_page(start: usize, total: usize) -> Vec<Value> {
    (start + 1..=(start + 50).min(total))
        .map(|i| json!({"ID": i.to_string()}))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_small_list_fetch_issues_one_request() {
    let transport = MockTransport::new(|_url, _body| {
        Ok(json!({"result": [{"ID": "1"}], "total": 1, "time": {"operating": 0.01}}))
    });
    let client = client_with(transport.clone());

    let results = client.get_all("things.list", None).await.unwrap();
    assert_eq!(results, vec![json!({"ID": "1"})]);
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_three_page_fetch_collects_everything_in_order() {
    const TOTAL: usize = 150;
    let transport = MockTransport::new(|url, body| {
        if url.ends_with("/batch") {
            let mut results = Map::new();
            for (label, command) in cmd_map(body) {
                results.insert(label, json!(ids_page(start_of(&command), TOTAL)));
            }
            Ok(batch_reply(Value::Object(results)))
        } else {
            assert!(url.ends_with("/things.list"));
            Ok(json!({
                "result": ids_page(0, TOTAL),
                "total": TOTAL,
                "time": {"operating": 0.05},
            }))
        }
    });
    let client = client_with(transport.clone());

    let results = client.get_all("things.list", None).await.unwrap();
    assert_eq!(results.len(), TOTAL);
    for (i, record) in results.iter().enumerate() {
        assert_eq!(record["ID"], json!((i + 1).to_string()));
    }

    // One direct request plus a single multicall holding both
    // continuation pages.
    let calls = transport.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(cmd_map(calls[1].1.as_ref()).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_first_request_carries_a_default_order() {
    let transport = MockTransport::new(|_url, body| {
        let order = body
            .and_then(|b| b.pointer("/order/ID"))
            .cloned()
            .expect("get_all should impose an ordering");
        assert_eq!(order, json!("ASC"));
        Ok(json!({"result": [], "total": 0}))
    });
    let client = client_with(transport);

    client.get_all("things.list", None).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_exactly_one_page_needs_no_pagination() {
    let transport = MockTransport::new(|_url, _body| {
        Ok(json!({"result": ids_page(0, 50), "total": 50}))
    });
    let client = client_with(transport.clone());

    let results = client.get_all("things.list", None).await.unwrap();
    assert_eq!(results.len(), 50);
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_fifty_one_records_need_one_continuation_page() {
    const TOTAL: usize = 51;
    let transport = MockTransport::new(|url, body| {
        if url.ends_with("/batch") {
            let mut results = Map::new();
            for (label, command) in cmd_map(body) {
                results.insert(label, json!(ids_page(start_of(&command), TOTAL)));
            }
            Ok(batch_reply(Value::Object(results)))
        } else {
            Ok(json!({"result": ids_page(0, TOTAL), "total": TOTAL}))
        }
    });
    let client = client_with(transport.clone());

    let results = client.get_all("things.list", None).await.unwrap();
    assert_eq!(results.len(), 51);

    let calls = transport.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(cmd_map(calls[1].1.as_ref()).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_pages_are_deduplicated() {
    const TOTAL: usize = 60;
    let transport = MockTransport::new(|url, body| {
        if url.ends_with("/batch") {
            let mut results = Map::new();
            for (label, command) in cmd_map(body) {
                // The server repeats record 50 on the second page, as
                // happens under concurrent modification.
                let start = start_of(&command);
                let mut page = ids_page(start, TOTAL);
                page.insert(0, json!({"ID": "50"}));
                results.insert(label, json!(page));
            }
            Ok(batch_reply(Value::Object(results)))
        } else {
            Ok(json!({"result": ids_page(0, TOTAL), "total": TOTAL}))
        }
    });
    let client = client_with(transport);

    let results = client.get_all("things.list", None).await.unwrap();
    assert_eq!(results.len(), TOTAL);
}

#[tokio::test(start_paused = true)]
async fn test_empty_continuation_batches_keep_the_first_page() {
    const TOTAL: usize = 2490;
    let transport = MockTransport::new(|url, body| {
        if url.ends_with("/batch") {
            // Continuation batches silently return nothing while 2440
            // items are still outstanding.
            assert!(!cmd_map(body).is_empty());
            Ok(json!({"result": {"result": {}}}))
        } else {
            Ok(json!({"result": ids_page(0, TOTAL), "total": TOTAL}))
        }
    });
    let client = client_with(transport.clone());

    let results = client.get_all("crm.deal.list", None).await.unwrap();
    assert_eq!(results.len(), 50);
    assert_eq!(transport.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_small_dataset_with_empty_continuation() {
    const TOTAL: usize = 75;
    let transport = MockTransport::new(|url, _body| {
        if url.ends_with("/batch") {
            // A 25-item shortfall can legitimately come from concurrent
            // deletions; the collected page is still returned.
            Ok(json!({"result": {"result": {}}}))
        } else {
            Ok(json!({"result": ids_page(0, TOTAL), "total": TOTAL}))
        }
    });
    let client = client_with(transport.clone());

    let results = client.get_all("crm.deal.list", None).await.unwrap();
    assert_eq!(results.len(), 50);
    assert_eq!(transport.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_by_id_fetch_of_75_ids_uses_two_batches() {
    let transport = MockTransport::new(|url, body| {
        assert!(url.ends_with("/batch"));
        let mut results = Map::new();
        for (label, _command) in cmd_map(body) {
            let item = json!({"ID": label.clone(), "TITLE": format!("item {}", label)});
            results.insert(label, item);
        }
        Ok(batch_reply(Value::Object(results)))
    });
    let client = client_with(transport.clone());

    let ids: Vec<String> = (1..=75).map(|i| i.to_string()).collect();
    let map = client
        .get_by_id("thing.get", &ids, "ID", None)
        .await
        .unwrap();

    assert_eq!(map.len(), 75);
    for id in &ids {
        assert_eq!(map[id]["ID"], json!(id));
    }

    let calls = transport.calls();
    assert_eq!(calls.len(), 2);
    let sizes: Vec<usize> = calls
        .iter()
        .map(|(_, body)| cmd_map(body.as_ref()).len())
        .collect();
    assert!(sizes == vec![50, 25] || sizes == vec![25, 50]);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_ids_collapse() {
    let transport = MockTransport::new(|_url, body| {
        let mut results = Map::new();
        for (label, _command) in cmd_map(body) {
            results.insert(label.clone(), json!({"ID": label}));
        }
        Ok(batch_reply(Value::Object(results)))
    });
    let client = client_with(transport.clone());

    let ids = vec!["7".to_string(), "8".to_string(), "7".to_string()];
    let map = client.get_by_id("thing.get", &ids, "ID", None).await.unwrap();
    assert_eq!(map.len(), 2);
    assert_eq!(cmd_map(transport.calls()[0].1.as_ref()).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_call_returns_results_in_submission_order() {
    let transport = MockTransport::new(|_url, body| {
        let mut results = Map::new();
        for (label, command) in cmd_map(body) {
            // Echo the NAME param back so the caller's order is visible.
            let command = command.as_str().unwrap();
            let name = command
                .split("NAME%5D=")
                .nth(1)
                .map(|rest| {
                    rest.chars()
                        .take_while(|c| c.is_ascii_alphanumeric())
                        .collect::<String>()
                })
                .unwrap();
            results.insert(label, json!(name));
        }
        Ok(batch_reply(Value::Object(results)))
    });
    let client = client_with(transport.clone());

    let items: Vec<_> = (0..120)
        .map(|i| {
            json!({"fields": {"NAME": format!("customer{}", i)}})
                .as_object()
                .cloned()
                .unwrap()
        })
        .collect();
    let results = client.call("crm.lead.add", &items).await.unwrap();

    assert_eq!(results.len(), 120);
    for (i, result) in results.iter().enumerate() {
        assert_eq!(result, &json!(format!("customer{}", i)));
    }
    // 120 items at up to 50 commands per multicall.
    assert_eq!(transport.call_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_call_one_returns_the_bare_element() {
    let transport = MockTransport::new(|_url, body| {
        let mut results = Map::new();
        for (label, _command) in cmd_map(body) {
            results.insert(label, json!(317));
        }
        Ok(batch_reply(Value::Object(results)))
    });
    let client = client_with(transport);

    let fields = json!({"fields": {"NAME": "one"}}).as_object().cloned().unwrap();
    let result = client.call_one("crm.lead.add", fields).await.unwrap();
    assert_eq!(result, json!(317));
}

#[tokio::test(start_paused = true)]
async fn test_oversized_items_split_across_extra_batches() {
    let transport = MockTransport::new(|_url, body| {
        let mut results = Map::new();
        for (label, _command) in cmd_map(body) {
            results.insert(label, json!("ok"));
        }
        Ok(batch_reply(Value::Object(results)))
    });
    let client = client_with(transport.clone());

    let filler = "x".repeat(300);
    let items: Vec<_> = (0..50)
        .map(|i| {
            json!({"fields": {"NAME": format!("n{}", i), "COMMENTS": filler}})
                .as_object()
                .cloned()
                .unwrap()
        })
        .collect();
    let results = client.call("crm.lead.update", &items).await.unwrap();
    assert_eq!(results.len(), 50);
    assert!(
        transport.call_count() >= 2,
        "oversized items should split into several multicalls"
    );
}

#[tokio::test(start_paused = true)]
async fn test_batch_item_error_aborts_the_operation() {
    let transport = MockTransport::new(|_url, _body| {
        Ok(json!({
            "result": {
                "result": {"42": {"ID": "42"}},
                "result_error": {"43": "Access denied"},
            },
        }))
    });
    let client = client_with(transport);

    let ids = vec!["42".to_string(), "43".to_string()];
    let err = client
        .get_by_id("thing.get", &ids, "ID", None)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::ServerContent(_)));
}

#[tokio::test(start_paused = true)]
async fn test_call_batch_returns_the_label_map() {
    let transport = MockTransport::new(|_url, _body| {
        Ok(batch_reply(json!({
            "first": {"ID": "1"},
            "second": {"ID": "2"},
        })))
    });
    let client = client_with(transport);

    let params = json!({
        "halt": 0,
        "cmd": {
            "first": "crm.lead.get?ID=1",
            "second": "crm.lead.get?ID=2",
        },
    })
    .as_object()
    .cloned()
    .unwrap();
    let map = client.call_batch(params).await.unwrap();
    assert_eq!(map.len(), 2);
    assert_eq!(map["first"], json!({"ID": "1"}));
}

#[tokio::test(start_paused = true)]
async fn test_backoff_after_repeated_5xx() {
    let failures = Arc::new(AtomicUsize::new(0));
    let transport = {
        let failures = failures.clone();
        MockTransport::new(move |_url, _body| {
            if failures.fetch_add(1, Ordering::SeqCst) < 4 {
                Err(TransportError::Status { status: 503 })
            } else {
                Ok(json!({"result": "ok"}))
            }
        })
    };
    let client = client_with(transport.clone());

    let started = tokio::time::Instant::now();
    let reply = client.call_raw("server.time", json!({})).await.unwrap();
    assert_eq!(reply, json!({"result": "ok"}));
    assert_eq!(transport.call_count(), 5);
    // The first backoff sleep fires only after the three-failure grace.
    assert!(started.elapsed() >= Duration::from_secs_f64(0.5));
}

#[tokio::test(start_paused = true)]
async fn test_admission_rate_is_capped_past_the_burst_pool() {
    let transport = MockTransport::new(|_url, _body| Ok(json!({"result": "ok"})));
    let client = Client::builder(WEBHOOK)
        .transport(transport.clone())
        .request_pool_size(2)
        .requests_per_second(1.0)
        .build()
        .unwrap();

    let started = tokio::time::Instant::now();
    for _ in 0..4 {
        client.call_raw("server.time", json!({})).await.unwrap();
    }
    // Two requests burst through the pool; the other two are spaced at
    // one per second.
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(transport.call_count(), 4);
}

/// Transport that tracks how many requests are in flight at once.
struct GaugeTransport {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl HttpTransport for GaugeTransport {
    async fn post(&self, _url: &str, _body: Option<&Value>) -> Result<Value, TransportError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(json!({"result": "ok"}))
    }
}

#[tokio::test(start_paused = true)]
async fn test_slow_scope_clamps_concurrency_and_restores() {
    let transport = Arc::new(GaugeTransport {
        in_flight: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    let client = Client::builder(WEBHOOK)
        .transport(transport.clone())
        .build()
        .unwrap();

    {
        let _slow = client.slow(1.0);
        let mut waves = Vec::new();
        for _ in 0..5 {
            let client = client.clone();
            waves.push(tokio::spawn(async move {
                client.call_raw("server.time", json!({})).await.unwrap();
            }));
        }
        for wave in waves {
            wave.await.unwrap();
        }
        assert_eq!(transport.peak.load(Ordering::SeqCst), 1);
    }

    // Cap restored: overlapping requests are admitted together again.
    transport.peak.store(0, Ordering::SeqCst);
    let mut waves = Vec::new();
    for _ in 0..3 {
        let client = client.clone();
        waves.push(tokio::spawn(async move {
            client.call_raw("server.time", json!({})).await.unwrap();
        }));
    }
    for wave in waves {
        wave.await.unwrap();
    }
    assert!(transport.peak.load(Ordering::SeqCst) >= 2);
}

#[tokio::test(start_paused = true)]
async fn test_list_and_get_round_trip() {
    let transport = MockTransport::new(|url, body| {
        if url.ends_with("/batch") {
            let mut results = Map::new();
            for (label, _command) in cmd_map(body) {
                results.insert(label.clone(), json!({"ID": label, "TITLE": "full"}));
            }
            Ok(batch_reply(Value::Object(results)))
        } else {
            assert!(url.ends_with("/crm.lead.list"));
            Ok(json!({
                "result": [{"ID": "1"}, {"ID": "2"}],
                "total": 2,
            }))
        }
    });
    let client = client_with(transport);

    let map = client.list_and_get("crm.lead", "ID").await.unwrap();
    assert_eq!(map.len(), 2);
    assert_eq!(map["1"]["TITLE"], json!("full"));
}

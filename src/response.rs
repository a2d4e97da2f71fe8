//! Classification and flattening of reply envelopes. The server nests
//! useful payloads differently for single calls, multicalls and wrapped
//! list endpoints; callers get one of three [`Payload`] shapes back.

use serde_json::{Map, Value};

use crate::error::ClientError;
use crate::paginate::PAGE_SIZE;

/// How to hand back the inner map of a multicall reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractMode {
    /// Flatten inner lists into one flat list (pagination, plain fetches).
    Flatten,
    /// Keep the label → result mapping (bulk by-id fetches, `call`).
    Keyed,
}

/// Useful payload pulled out of an envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// A flat list of records.
    Items(Vec<Value>),
    /// A label → result mapping.
    Map(Map<String, Value>),
    /// Anything else, returned unchanged.
    Value(Value),
}

/// A decoded reply envelope.
#[derive(Debug, Clone)]
pub struct ServerResponse {
    envelope: Value,
}

impl ServerResponse {
    pub fn new(envelope: Value) -> Self {
        Self { envelope }
    }

    /// The decoded envelope, verbatim.
    pub fn into_inner(self) -> Value {
        self.envelope
    }

    pub fn result(&self) -> Option<&Value> {
        self.envelope.get("result")
    }

    pub fn total(&self) -> Option<u64> {
        self.envelope.get("total").and_then(Value::as_u64)
    }

    /// Server-side processing seconds of a non-batch reply.
    pub fn time_operating(&self) -> Option<f64> {
        self.envelope.pointer("/time/operating").and_then(Value::as_f64)
    }

    /// Per-label timing blocks of a multicall reply.
    pub fn batch_command_times(&self) -> Option<&Map<String, Value>> {
        self.envelope
            .pointer("/result/result_time")
            .and_then(Value::as_object)
    }

    /// Whether the server holds more records than the reply carried:
    /// a `total` above one page that differs from what was collected.
    pub fn more_results_expected(&self, collected: usize) -> bool {
        match self.total() {
            Some(total) => total > PAGE_SIZE as u64 && collected as u64 != total,
            None => false,
        }
    }

    /// Pull the useful payload out of the envelope, surfacing any error
    /// the server reported along the way. A multicall reply is recognised
    /// structurally: it nests a second `result` under `result`.
    pub fn extract_results(&self, mode: ExtractMode) -> Result<Payload, ClientError> {
        if let Some(error) = self.envelope.get("result_error").filter(|v| non_empty(v)) {
            return Err(ClientError::ServerContent(error.to_string()));
        }
        if let Some(error) = self
            .envelope
            .get("error_description")
            .filter(|v| non_empty(v))
        {
            return Err(ClientError::ServerContent(error.to_string()));
        }

        if let Some(Value::Object(inner)) = self.result() {
            if let Some(label_map) = inner.get("result") {
                if let Some(error) = inner.get("result_error").filter(|v| non_empty(v)) {
                    return Err(ClientError::ServerContent(error.to_string()));
                }
                return Ok(extract_from_batch(label_map, mode));
            }
        }

        match self.result() {
            Some(result) => Ok(extract_from_single(result)),
            None => Ok(Payload::Value(Value::Null)),
        }
    }
}

/// An empty error slot comes back as `[]`, `{}`, `""` or `null` depending
/// on the server's PHP mood; none of those is an error.
fn non_empty(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

/// Non-batch payloads: a single-key wrapper around a list (`{"items":
/// [...]}`-style endpoints) unwraps to the list; plain lists stay lists;
/// everything else is returned unchanged.
fn extract_from_single(result: &Value) -> Payload {
    match result {
        Value::Object(map) if map.len() == 1 => {
            let only = map.values().next().unwrap();
            match only {
                Value::Array(items) => Payload::Items(items.clone()),
                _ => Payload::Value(result.clone()),
            }
        }
        Value::Array(items) => Payload::Items(items.clone()),
        other => Payload::Value(other.clone()),
    }
}

fn extract_from_batch(label_map: &Value, mode: ExtractMode) -> Payload {
    // PHP serializes an empty associative array as `[]`.
    let map = match label_map {
        Value::Object(map) => map,
        Value::Array(items) if items.is_empty() => return empty_payload(mode),
        other => return Payload::Value(other.clone()),
    };
    if map.is_empty() {
        return empty_payload(mode);
    }

    match mode {
        ExtractMode::Keyed => Payload::Map(map.clone()),
        ExtractMode::Flatten => {
            // Flatten only when the inner values are lists or single-key
            // wrapped lists; a map of scalars stays a map.
            let first_is_list = matches!(
                extract_from_single(map.values().next().unwrap()),
                Payload::Items(_)
            );
            if !first_is_list {
                return Payload::Map(map.clone());
            }
            let mut items = Vec::new();
            for value in map.values() {
                match extract_from_single(value) {
                    Payload::Items(list) => items.extend(list),
                    Payload::Map(m) => items.push(Value::Object(m)),
                    Payload::Value(v) => items.push(v),
                }
            }
            Payload::Items(items)
        }
    }
}

fn empty_payload(mode: ExtractMode) -> Payload {
    match mode {
        ExtractMode::Flatten => Payload::Items(Vec::new()),
        ExtractMode::Keyed => Payload::Map(Map::new()),
    }
}

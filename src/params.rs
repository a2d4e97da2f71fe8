//! Caller-input validation: method names and params mappings.

use serde_json::{Map, Value};

use crate::error::ClientError;

/// A params mapping as sent to the server. Unknown clauses pass through
/// untouched; the recognised ones are kind-checked before dispatch.
pub type Params = Map<String, Value>;

#[derive(Clone, Copy)]
enum ClauseKind {
    Sequence,
    Mapping,
    Integer,
}

impl ClauseKind {
    fn name(self) -> &'static str {
        match self {
            ClauseKind::Sequence => "sequence",
            ClauseKind::Mapping => "mapping",
            ClauseKind::Integer => "integer",
        }
    }

    fn matches(self, value: &Value) -> bool {
        match self {
            ClauseKind::Sequence => value.is_array(),
            ClauseKind::Mapping => value.is_object(),
            ClauseKind::Integer => value.is_i64() || value.is_u64(),
        }
    }
}

/// Top-level clauses with a known value kind.
const EXPECTED_CLAUSES: &[(&str, ClauseKind)] = &[
    ("select", ClauseKind::Sequence),
    ("filter", ClauseKind::Mapping),
    ("order", ClauseKind::Mapping),
    ("fields", ClauseKind::Mapping),
    ("cmd", ClauseKind::Mapping),
    ("halt", ClauseKind::Integer),
    ("limit", ClauseKind::Integer),
    ("start", ClauseKind::Integer),
];

/// Normalize a method name: trimmed, lowercased, non-empty. `batch` is
/// reserved for the batching engine — `call_batch` is the way to issue
/// one directly.
pub fn standardize_method(method: &str) -> Result<String, ClientError> {
    let method = method.trim().to_lowercase();
    if method.is_empty() {
        return Err(ClientError::Input("method cannot be empty".to_string()));
    }
    if method == "batch" {
        return Err(ClientError::Input(
            "method cannot be 'batch', use call_batch() instead".to_string(),
        ));
    }
    Ok(method)
}

/// Kind-check the recognised top-level clauses. Clause names compare
/// case-insensitively; the mapping itself is left untouched so the
/// original casing reaches the wire.
pub fn validate_params(params: &Params) -> Result<(), ClientError> {
    for (key, value) in params {
        let wanted = EXPECTED_CLAUSES
            .iter()
            .find(|(name, _)| key.trim().eq_ignore_ascii_case(name));
        if let Some((name, kind)) = wanted {
            if !kind.matches(value) {
                return Err(ClientError::Input(format!(
                    "clause \"{}\" should be a {}",
                    name,
                    kind.name()
                )));
            }
        }
    }
    Ok(())
}

/// Case-insensitive clause lookup.
pub fn contains_clause(params: &Params, clause: &str) -> bool {
    params
        .keys()
        .any(|key| key.trim().eq_ignore_ascii_case(clause))
}

/// Clone `base` (if any) and set one extra clause on top.
pub fn with_clause(base: Option<&Params>, key: &str, value: Value) -> Params {
    let mut merged = base.cloned().unwrap_or_default();
    merged.insert(key.to_string(), value);
    merged
}

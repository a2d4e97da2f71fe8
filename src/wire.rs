//! Outbound query encoding following PHP's `http_build_query` conventions:
//! nested maps become `key[sub]=value`, sequences become
//! `key[0]=value&key[1]=value`, keys and values are percent-encoded.
//! Sub-commands inside a batch envelope carry their params in this form.

use serde_json::Value;
use urlencoding::encode;

/// Render a JSON value as an `application/x-www-form-urlencoded` query
/// string. The top level is expected to be a mapping; scalars at the top
/// level have no key to attach to and are skipped.
pub fn http_build_query(value: &Value) -> String {
    let mut pairs = Vec::new();
    collect_pairs(value, None, &mut pairs);
    pairs.join("&")
}

fn collect_pairs(value: &Value, key: Option<&str>, out: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (sub_key, sub_value) in map {
                let nested = match key {
                    Some(key) => format!("{}[{}]", key, sub_key),
                    None => sub_key.clone(),
                };
                collect_pairs(sub_value, Some(&nested), out);
            }
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                let nested = match key {
                    Some(key) => format!("{}[{}]", key, i),
                    None => i.to_string(),
                };
                collect_pairs(item, Some(&nested), out);
            }
        }
        scalar => {
            if let Some(key) = key {
                out.push(format!("{}={}", encode(key), encode(&render_scalar(scalar))));
            }
        }
    }
}

/// Scalar rendering quirks of the server: booleans travel as `Y`/`N`,
/// null as an empty string.
fn render_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(true) => "Y".to_string(),
        Value::Bool(false) => "N".to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

//! Packing logical item lists into server-side multicalls. Each envelope
//! carries at most [`MAX_BATCH_SIZE`] sub-commands and its URL-encoded
//! form stays within the server's URL-length ceiling.

use serde_json::{json, Map, Value};

use crate::error::ClientError;
use crate::params::Params;
use crate::wire;

/// The server executes at most this many sub-commands per multicall.
pub const MAX_BATCH_SIZE: usize = 50;
/// The server rejects batch URLs longer than this many bytes.
pub const MAX_URL_LEN: usize = 5820;

/// How sub-commands inside an envelope are labelled. The server keys its
/// reply map by these labels.
#[derive(Debug, Clone)]
pub enum Labeling {
    /// `cmd0000000000`, `cmd0000000001`, ... — the decimal width makes the
    /// lexicographic label order equal the submission order.
    Sequential,
    /// The value of the named item field becomes the label, so the reply
    /// maps straight back to the requested identifier.
    ByField(String),
}

pub struct Batcher<'a> {
    webhook: &'a str,
    method: &'a str,
    items: &'a [Params],
    labeling: Labeling,
}

impl<'a> Batcher<'a> {
    pub fn new(
        webhook: &'a str,
        method: &'a str,
        items: &'a [Params],
        labeling: Labeling,
    ) -> Self {
        Self {
            webhook,
            method,
            items,
            labeling,
        }
    }

    /// Produce the batch envelopes, recomputing with a smaller batch size
    /// whenever an envelope's encoded URL would exceed the ceiling.
    pub fn envelopes(&self) -> Result<Vec<Params>, ClientError> {
        let mut batch_size = MAX_BATCH_SIZE;
        loop {
            let envelopes = self.build(batch_size)?;
            let longest = envelopes
                .iter()
                .map(|envelope| self.encoded_len(envelope))
                .max()
                .unwrap_or(0);
            if longest <= MAX_URL_LEN {
                if batch_size < MAX_BATCH_SIZE {
                    tracing::debug!(
                        "batch: size reduced to fit URL ceiling, method={}, batch_size={}",
                        self.method,
                        batch_size
                    );
                }
                return Ok(envelopes);
            }
            if batch_size == 1 {
                return Err(ClientError::Input(
                    "a single command exceeds the URL length ceiling".to_string(),
                ));
            }
            let shrunk =
                (batch_size as f64 / (longest as f64 / MAX_URL_LEN as f64)).floor() as usize;
            batch_size = shrunk.clamp(1, batch_size - 1);
        }
    }

    fn build(&self, batch_size: usize) -> Result<Vec<Params>, ClientError> {
        let mut envelopes = Vec::with_capacity(self.items.len().div_ceil(batch_size));
        for (chunk_no, chunk) in self.items.chunks(batch_size).enumerate() {
            let mut cmd = Map::new();
            for (offset, item) in chunk.iter().enumerate() {
                let label = self.label(chunk_no * batch_size + offset, item)?;
                let command = format!(
                    "{}?{}",
                    self.method,
                    wire::http_build_query(&Value::Object(item.clone()))
                );
                cmd.insert(label, Value::String(command));
            }
            let mut envelope = Map::new();
            envelope.insert("halt".to_string(), json!(0));
            envelope.insert("cmd".to_string(), Value::Object(cmd));
            envelopes.push(envelope);
        }
        Ok(envelopes)
    }

    fn label(&self, index: usize, item: &Params) -> Result<String, ClientError> {
        match &self.labeling {
            Labeling::Sequential => Ok(format!("cmd{:010}", index)),
            Labeling::ByField(field) => {
                let value = item.get(field).ok_or_else(|| {
                    ClientError::Input(format!("item is missing the \"{}\" field", field))
                })?;
                match value {
                    Value::String(s) => Ok(s.clone()),
                    Value::Number(n) => Ok(n.to_string()),
                    other => Err(ClientError::Input(format!(
                        "field \"{}\" cannot label a command: {}",
                        field, other
                    ))),
                }
            }
        }
    }

    /// Length of the envelope's fully encoded request line, measured the
    /// way the server measures it.
    fn encoded_len(&self, envelope: &Params) -> usize {
        self.webhook.len()
            + "batch".len()
            + wire::http_build_query(&Value::Object(envelope.clone())).len()
    }
}

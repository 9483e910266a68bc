use std::collections::BTreeMap;

use redis::Value;

pub(crate) const ADDRESS_FIELD: &str = "address";
pub(crate) const BODY_FIELD: &str = "body";
pub(crate) const HEADER_PREFIX: &str = "h-";

/// A message as handed to a transport: headers and an opaque body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransportMessage {
    /// Headers by name. Iteration, and the field order of the stream entry,
    /// is sorted by name, not by insertion.
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl TransportMessage {
    pub fn new(headers: BTreeMap<String, String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            headers,
            body: body.into(),
        }
    }

    /// Adds a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// A message read back from the outbox stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxMessage {
    /// Stream entry id, assigned by Redis.
    pub id: String,
    pub destination_address: String,
    /// Headers by name, sorted by name.
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl OutboxMessage {
    pub fn to_transport_message(&self) -> TransportMessage {
        TransportMessage {
            headers: self.headers.clone(),
            body: self.body.clone(),
        }
    }
}

/// Builds the `XADD` field list for a message: address, body, then one
/// `h-<name>` field per header in name order.
pub(crate) fn entry_fields(destination: &str, message: &TransportMessage) -> Vec<(String, Vec<u8>)> {
    let mut fields = Vec::with_capacity(message.headers.len() + 2);
    fields.push((ADDRESS_FIELD.to_string(), destination.as_bytes().to_vec()));
    fields.push((BODY_FIELD.to_string(), message.body.clone()));
    for (name, value) in &message.headers {
        fields.push((format!("{HEADER_PREFIX}{name}"), value.as_bytes().to_vec()));
    }
    fields
}

/// Reads an outbox message from the fields of a stream entry.
///
/// Returns the reason when the entry is not a valid outbox message.
pub(crate) fn decode_entry(
    id: &str,
    fields: &[(String, Value)],
) -> std::result::Result<OutboxMessage, String> {
    let mut destination = None;
    let mut body = Vec::new();
    let mut headers = BTreeMap::new();

    for (name, value) in fields {
        match name.as_str() {
            ADDRESS_FIELD => {
                destination = Some(
                    redis::from_redis_value::<String>(value)
                        .map_err(|e| format!("invalid address: {e}"))?,
                );
            }
            BODY_FIELD => {
                body = redis::from_redis_value::<Vec<u8>>(value)
                    .map_err(|e| format!("invalid body: {e}"))?;
            }
            other => {
                let Some(header) = other.strip_prefix(HEADER_PREFIX) else {
                    return Err(format!("unknown field {other}"));
                };
                let value = redis::from_redis_value::<String>(value)
                    .map_err(|e| format!("invalid header {header}: {e}"))?;
                headers.insert(header.to_string(), value);
            }
        }
    }

    let destination_address = destination.ok_or_else(|| "missing address".to_string())?;
    Ok(OutboxMessage {
        id: id.to_string(),
        destination_address,
        headers,
        body,
    })
}

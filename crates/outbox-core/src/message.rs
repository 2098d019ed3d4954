//! The outbox message model and its serializable dynamic-value maps.

use crate::{OutboxError, OutboxResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{btree_map, BTreeMap};

/// A message that will be relayed to the event stream.
///
/// `id`, `dispatched`, and `dispatched_at` are owned by the data store:
/// the id is assigned at insert and never reused, and `dispatched_at` is
/// set in the same statement that flips `dispatched`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutboxMessage {
    /// Store-assigned, monotonically increasing identifier.
    pub id: i64,
    /// True once the message has been published and recorded as dispatched.
    pub dispatched: bool,
    /// When the message was recorded as dispatched.
    pub dispatched_at: Option<DateTime<Utc>>,
    /// Body delivered to the stream verbatim.
    pub payload: Vec<u8>,
    /// Routing hints interpreted by the stream adapter.
    pub options: DynamicValues,
    /// Envelope metadata forwarded as broker headers/attributes.
    pub headers: DynamicValues,
}

impl OutboxMessage {
    /// Create an undispatched message carrying the given payload.
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            ..Default::default()
        }
    }

    /// Set a per-message option.
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<DynamicValue>) -> Self {
        self.options.insert(key, value);
        self
    }

    /// Set an envelope header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<DynamicValue>) -> Self {
        self.headers.insert(key, value);
        self
    }
}

/// A single dynamic scalar carried in message options or headers.
///
/// Serialized untagged, so the stored form is a plain JSON scalar
/// (byte sequences become arrays of numbers).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DynamicValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
}

impl DynamicValue {
    /// Name of the carried type, used in type-mismatch errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            DynamicValue::Null => "null",
            DynamicValue::Bool(_) => "bool",
            DynamicValue::Int(_) => "int",
            DynamicValue::Float(_) => "float",
            DynamicValue::String(_) => "string",
            DynamicValue::Bytes(_) => "bytes",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DynamicValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DynamicValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer view. Accepts integral floats as well: values decoded from
    /// JSON numbers may arrive as floats even when logically integers.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DynamicValue::Int(i) => Some(*i),
            DynamicValue::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    /// Byte view. Strings are exposed as their UTF-8 bytes.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            DynamicValue::Bytes(b) => Some(b),
            DynamicValue::String(s) => Some(s.as_bytes()),
            _ => None,
        }
    }
}

impl From<&str> for DynamicValue {
    fn from(v: &str) -> Self {
        DynamicValue::String(v.to_string())
    }
}

impl From<String> for DynamicValue {
    fn from(v: String) -> Self {
        DynamicValue::String(v)
    }
}

impl From<bool> for DynamicValue {
    fn from(v: bool) -> Self {
        DynamicValue::Bool(v)
    }
}

impl From<i64> for DynamicValue {
    fn from(v: i64) -> Self {
        DynamicValue::Int(v)
    }
}

impl From<i32> for DynamicValue {
    fn from(v: i32) -> Self {
        DynamicValue::Int(v.into())
    }
}

impl From<f64> for DynamicValue {
    fn from(v: f64) -> Self {
        DynamicValue::Float(v)
    }
}

impl From<Vec<u8>> for DynamicValue {
    fn from(v: Vec<u8>) -> Self {
        DynamicValue::Bytes(v)
    }
}

/// A string-keyed map of dynamic values.
///
/// An empty map serializes to a null sentinel so the store can keep the
/// column NULL; a NULL column reads back as an empty map without error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DynamicValues(BTreeMap<String, DynamicValue>);

impl DynamicValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, key: &str) -> Option<&DynamicValue> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<DynamicValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, DynamicValue> {
        self.0.iter()
    }

    /// Encoded form for storage: `None` for an empty map, otherwise the
    /// JSON object bytes.
    pub fn to_stored(&self) -> OutboxResult<Option<Vec<u8>>> {
        if self.0.is_empty() {
            return Ok(None);
        }

        Ok(Some(serde_json::to_vec(self)?))
    }

    /// Decode the stored form. A NULL column yields an empty map; any
    /// non-null value must be the JSON object encoding.
    pub fn from_stored(raw: Option<&[u8]>) -> OutboxResult<Self> {
        match raw {
            None => Ok(Self::default()),
            Some(bytes) => Ok(serde_json::from_slice(bytes)?),
        }
    }

    /// JSON-value form for stores with native JSON columns.
    pub fn to_json(&self) -> OutboxResult<Option<serde_json::Value>> {
        if self.0.is_empty() {
            return Ok(None);
        }

        Ok(Some(serde_json::to_value(self)?))
    }

    /// Decode from a JSON column. NULL yields an empty map.
    pub fn from_json(raw: Option<serde_json::Value>) -> OutboxResult<Self> {
        match raw {
            None => Ok(Self::default()),
            Some(value) => Ok(serde_json::from_value(value)?),
        }
    }

    /// String option, or `OptionType` if present with another type.
    pub fn opt_str(&self, key: &'static str) -> OutboxResult<Option<&str>> {
        match self.0.get(key) {
            None => Ok(None),
            Some(value) => value.as_str().map(Some).ok_or(OutboxError::OptionType {
                key,
                expected: "string",
                found: value.type_name(),
            }),
        }
    }

    /// Mandatory string option, or `OptionMandatory` when absent.
    pub fn require_str(&self, key: &'static str) -> OutboxResult<&str> {
        self.opt_str(key)?.ok_or(OutboxError::OptionMandatory(key))
    }

    /// Boolean option, or `OptionType` if present with another type.
    pub fn opt_bool(&self, key: &'static str) -> OutboxResult<Option<bool>> {
        match self.0.get(key) {
            None => Ok(None),
            Some(value) => value.as_bool().map(Some).ok_or(OutboxError::OptionType {
                key,
                expected: "bool",
                found: value.type_name(),
            }),
        }
    }

    /// Integer option, or `OptionType` if present with another type.
    pub fn opt_i64(&self, key: &'static str) -> OutboxResult<Option<i64>> {
        match self.0.get(key) {
            None => Ok(None),
            Some(value) => value.as_i64().map(Some).ok_or(OutboxError::OptionType {
                key,
                expected: "int",
                found: value.type_name(),
            }),
        }
    }
}

impl FromIterator<(String, DynamicValue)> for DynamicValues {
    fn from_iter<I: IntoIterator<Item = (String, DynamicValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for DynamicValues {
    type Item = (String, DynamicValue);
    type IntoIter = btree_map::IntoIter<String, DynamicValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DynamicValues {
        let mut values = DynamicValues::new();
        values.insert("exchange.name", "orders");
        values.insert("exchange.durable", true);
        values.insert("partition", 3i64);
        values.insert("weight", 1.5f64);
        values.insert("blob", vec![1u8, 2, 3]);
        values
    }

    #[test]
    fn round_trips_through_stored_form() {
        let values = sample();
        let stored = values.to_stored().unwrap().unwrap();
        let decoded = DynamicValues::from_stored(Some(&stored)).unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn empty_map_stores_as_null() {
        let values = DynamicValues::new();
        assert_eq!(values.to_stored().unwrap(), None);
        assert_eq!(values.to_json().unwrap(), None);
    }

    #[test]
    fn null_reads_back_as_empty_map() {
        let decoded = DynamicValues::from_stored(None).unwrap();
        assert!(decoded.is_empty());

        let decoded = DynamicValues::from_json(None).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn malformed_input_is_a_decode_error() {
        let err = DynamicValues::from_stored(Some(b"not json")).unwrap_err();
        assert!(matches!(err, OutboxError::Decode(_)));
    }

    #[test]
    fn round_trips_through_json_form() {
        let values = sample();
        let json = values.to_json().unwrap();
        let decoded = DynamicValues::from_json(json).unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn integral_floats_read_as_integers() {
        // JSON decoding may turn an integer into a float
        let value = DynamicValue::Float(3.0);
        assert_eq!(value.as_i64(), Some(3));

        let value = DynamicValue::Float(3.5);
        assert_eq!(value.as_i64(), None);
    }

    #[test]
    fn typed_extraction_reports_mismatches() {
        let values = sample();

        assert_eq!(values.opt_str("exchange.name").unwrap(), Some("orders"));
        assert_eq!(values.opt_bool("exchange.durable").unwrap(), Some(true));
        assert_eq!(values.opt_i64("partition").unwrap(), Some(3));
        assert_eq!(values.opt_str("missing").unwrap(), None);

        let err = values.opt_str("partition").unwrap_err();
        assert!(matches!(
            err,
            OutboxError::OptionType {
                key: "partition",
                expected: "string",
                found: "int",
            }
        ));
    }

    #[test]
    fn mandatory_extraction_reports_missing_keys() {
        let values = DynamicValues::new();
        let err = values.require_str("topic").unwrap_err();
        assert!(matches!(err, OutboxError::OptionMandatory("topic")));
    }

    #[test]
    fn builder_style_message_construction() {
        let msg = OutboxMessage::new(b"payload".to_vec())
            .with_option("topic", "orders")
            .with_header("trace-id", "abc");

        assert_eq!(msg.payload, b"payload");
        assert_eq!(msg.options.opt_str("topic").unwrap(), Some("orders"));
        assert_eq!(msg.headers.opt_str("trace-id").unwrap(), Some("abc"));
        assert!(!msg.dispatched);
        assert!(msg.dispatched_at.is_none());
    }
}

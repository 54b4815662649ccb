//! Immutable message envelopes.
//!
//! An [`Envelope`] is the unit of data that flows through processor chains and
//! event groups. It carries a [`Payload`], scoped properties, attachments and
//! the correlation metadata used by the [`EventCorrelator`](crate::correlation::EventCorrelator).
//!
//! Envelopes are copy-on-write: every `with_*` method returns a new envelope and
//! leaves the receiver untouched. Cloning an envelope is cheap (one `Arc` bump).
//!
//! # Example
//!
//! ```
//! use courier_core::envelope::Envelope;
//!
//! let original = Envelope::new("quote").with_correlation_id("order-42");
//! let tagged = original.with_property("bank", "acme");
//!
//! assert!(original.property("bank").is_none());
//! assert_eq!(tagged.property("bank").and_then(|v| v.as_str()), Some("acme"));
//! assert_eq!(tagged.correlation_id(), Some("order-42"));
//! ```

use crate::error::ProcessorError;
use crate::exchange::ExchangePattern;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Message body carried by an [`Envelope`].
///
/// The engine never interprets payloads itself; only processors and
/// aggregation strategies do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Payload {
    /// No body
    Empty,
    /// UTF-8 text
    Text(String),
    /// Opaque bytes
    Bytes(Vec<u8>),
    /// A numeric value
    Number(f64),
    /// Structured JSON document
    Json(Value),
    /// Ordered collection of payloads (e.g. the result of a collection aggregation)
    List(Vec<Payload>),
}

impl Payload {
    /// Short name of the payload variant, used in error messages
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Text(_) => "text",
            Self::Bytes(_) => "bytes",
            Self::Number(_) => "number",
            Self::Json(_) => "json",
            Self::List(_) => "list",
        }
    }

    /// Borrow the payload as text, if it is text
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Interpret the payload as a number.
    ///
    /// Numbers are returned as-is, text is parsed, JSON numbers are converted.
    /// Everything else yields `None`.
    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            Self::Text(text) => text.trim().parse().ok(),
            Self::Json(value) => value.as_f64(),
            _ => None,
        }
    }

    /// Borrow the payload as a list, if it is a list
    #[must_use]
    pub fn as_list(&self) -> Option<&[Payload]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Check if the payload is empty
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self::Empty
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, ""),
            Self::Text(text) => write!(f, "{text}"),
            Self::Bytes(bytes) => write!(f, "<{} bytes>", bytes.len()),
            Self::Number(value) => write!(f, "{value}"),
            Self::Json(value) => write!(f, "{value}"),
            Self::List(items) => {
                write!(f, "[")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            },
        }
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<f64> for Payload {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

/// Property scopes carried by an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyScope {
    /// Properties set by the inbound connector that produced the envelope
    Inbound,
    /// Properties set by processors, visible to outbound connectors
    Outbound,
}

/// Position of an envelope inside a correlation group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sequence {
    /// Zero-based position within the group
    pub index: usize,
    /// Expected number of members in the group, if known
    pub total: Option<usize>,
}

/// Failure description attached to an envelope.
///
/// Request-response callers receive an envelope carrying an `ErrorInfo`
/// instead of a raw error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Error category (e.g. `routing`, `aggregation`)
    pub kind: String,
    /// Human readable message
    pub message: String,
    /// Processor that failed, when known
    pub processor: Option<String>,
}

impl ErrorInfo {
    /// Create a new error description
    #[must_use]
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            processor: None,
        }
    }

    /// Describe a processor error
    #[must_use]
    pub fn from_error(error: &ProcessorError) -> Self {
        Self {
            kind: error.kind().to_string(),
            message: error.to_string(),
            processor: error.processor().map(str::to_string),
        }
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.processor {
            Some(processor) => write!(f, "[{}] {} ({processor})", self.kind, self.message),
            None => write!(f, "[{}] {}", self.kind, self.message),
        }
    }
}

#[derive(Debug, Clone)]
struct EnvelopeInner {
    id: String,
    payload: Payload,
    inbound: BTreeMap<String, Value>,
    outbound: BTreeMap<String, Value>,
    attachments: BTreeMap<String, Arc<[u8]>>,
    correlation_id: Option<String>,
    sequence: Option<usize>,
    group_size: Option<usize>,
    exchange_pattern: ExchangePattern,
    error: Option<ErrorInfo>,
    created_at: DateTime<Utc>,
}

/// Immutable message unit flowing through the engine
#[derive(Debug, Clone)]
pub struct Envelope {
    inner: Arc<EnvelopeInner>,
}

impl Envelope {
    /// Create a new request-response envelope with a fresh id
    #[must_use]
    pub fn new(payload: impl Into<Payload>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), payload)
    }

    /// Create a new envelope with an explicit id
    #[must_use]
    pub fn with_id(id: impl Into<String>, payload: impl Into<Payload>) -> Self {
        Self {
            inner: Arc::new(EnvelopeInner {
                id: id.into(),
                payload: payload.into(),
                inbound: BTreeMap::new(),
                outbound: BTreeMap::new(),
                attachments: BTreeMap::new(),
                correlation_id: None,
                sequence: None,
                group_size: None,
                exchange_pattern: ExchangePattern::default(),
                error: None,
                created_at: Utc::now(),
            }),
        }
    }

    fn modify(&self, f: impl FnOnce(&mut EnvelopeInner)) -> Self {
        let mut inner = (*self.inner).clone();
        f(&mut inner);
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Message id
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Message body
    #[must_use]
    pub fn payload(&self) -> &Payload {
        &self.inner.payload
    }

    /// Correlation id, if the envelope belongs to a group
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.inner.correlation_id.as_deref()
    }

    /// Position within the correlation group, if declared
    #[must_use]
    pub fn sequence(&self) -> Option<Sequence> {
        self.inner.sequence.map(|index| Sequence {
            index,
            total: self.inner.group_size,
        })
    }

    /// Expected size of the correlation group (`None` means unknown)
    #[must_use]
    pub fn group_size(&self) -> Option<usize> {
        self.inner.group_size
    }

    /// Exchange pattern requested for this envelope
    #[must_use]
    pub fn exchange_pattern(&self) -> ExchangePattern {
        self.inner.exchange_pattern
    }

    /// Error attached by an exception strategy, if any
    #[must_use]
    pub fn error(&self) -> Option<&ErrorInfo> {
        self.inner.error.as_ref()
    }

    /// Check if the envelope signals a failure
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.inner.error.is_some()
    }

    /// Creation timestamp
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    /// Look up a property, outbound scope first, then inbound
    #[must_use]
    pub fn property(&self, key: &str) -> Option<&Value> {
        self.inner
            .outbound
            .get(key)
            .or_else(|| self.inner.inbound.get(key))
    }

    /// Look up a property in a specific scope
    #[must_use]
    pub fn scoped_property(&self, scope: PropertyScope, key: &str) -> Option<&Value> {
        match scope {
            PropertyScope::Inbound => self.inner.inbound.get(key),
            PropertyScope::Outbound => self.inner.outbound.get(key),
        }
    }

    /// Property names of a scope, in sorted order
    pub fn property_names(&self, scope: PropertyScope) -> impl Iterator<Item = &str> {
        let map = match scope {
            PropertyScope::Inbound => &self.inner.inbound,
            PropertyScope::Outbound => &self.inner.outbound,
        };
        map.keys().map(String::as_str)
    }

    /// Look up an attachment by name
    #[must_use]
    pub fn attachment(&self, name: &str) -> Option<&[u8]> {
        self.inner.attachments.get(name).map(AsRef::as_ref)
    }

    /// Return a copy with a new payload
    #[must_use]
    pub fn with_payload(&self, payload: impl Into<Payload>) -> Self {
        let payload = payload.into();
        self.modify(|inner| inner.payload = payload)
    }

    /// Return a copy with an outbound property set
    #[must_use]
    pub fn with_property(&self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with_scoped_property(PropertyScope::Outbound, key, value)
    }

    /// Return a copy with a property set in the given scope
    #[must_use]
    pub fn with_scoped_property(
        &self,
        scope: PropertyScope,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        let (key, value) = (key.into(), value.into());
        self.modify(|inner| {
            match scope {
                PropertyScope::Inbound => inner.inbound.insert(key, value),
                PropertyScope::Outbound => inner.outbound.insert(key, value),
            };
        })
    }

    /// Return a copy without the given outbound property
    #[must_use]
    pub fn without_property(&self, key: &str) -> Self {
        self.modify(|inner| {
            inner.outbound.remove(key);
        })
    }

    /// Return a copy with an attachment added
    #[must_use]
    pub fn with_attachment(&self, name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        let (name, data) = (name.into(), Arc::<[u8]>::from(data.into()));
        self.modify(|inner| {
            inner.attachments.insert(name, data);
        })
    }

    /// Return a copy tagged with a correlation id
    #[must_use]
    pub fn with_correlation_id(&self, correlation_id: impl Into<String>) -> Self {
        let correlation_id = correlation_id.into();
        self.modify(|inner| inner.correlation_id = Some(correlation_id))
    }

    /// Return a copy with a sequence position and (optionally) the group size
    #[must_use]
    pub fn with_sequence(&self, index: usize, total: Option<usize>) -> Self {
        self.modify(|inner| {
            inner.sequence = Some(index);
            inner.group_size = total;
        })
    }

    /// Return a copy declaring the expected group size
    #[must_use]
    pub fn with_group_size(&self, total: usize) -> Self {
        self.modify(|inner| inner.group_size = Some(total))
    }

    /// Return a copy with a different exchange pattern
    #[must_use]
    pub fn with_exchange_pattern(&self, pattern: ExchangePattern) -> Self {
        if self.inner.exchange_pattern == pattern {
            return self.clone();
        }
        self.modify(|inner| inner.exchange_pattern = pattern)
    }

    /// Return a copy carrying an error description
    #[must_use]
    pub fn with_error(&self, error: ErrorInfo) -> Self {
        self.modify(|inner| inner.error = Some(error))
    }

    /// Check whether two handles point at the same envelope instance
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for Envelope {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
            || (self.inner.id == other.inner.id
                && self.inner.payload == other.inner.payload
                && self.inner.inbound == other.inner.inbound
                && self.inner.outbound == other.inner.outbound
                && self.inner.attachments == other.inner.attachments
                && self.inner.correlation_id == other.inner.correlation_id
                && self.inner.sequence == other.inner.sequence
                && self.inner.group_size == other.inner.group_size
                && self.inner.exchange_pattern == other.inner.exchange_pattern
                && self.inner.error == other.inner.error)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn with_property_leaves_original_untouched() {
        let original = Envelope::new("payload");
        let updated = original.with_property("k", "v");

        assert!(original.property("k").is_none());
        assert_eq!(updated.property("k"), Some(&Value::from("v")));
        assert_eq!(original.id(), updated.id());
        assert!(!original.ptr_eq(&updated));
    }

    #[test]
    fn outbound_shadows_inbound() {
        let envelope = Envelope::new(Payload::Empty)
            .with_scoped_property(PropertyScope::Inbound, "host", "in")
            .with_property("host", "out");

        assert_eq!(envelope.property("host"), Some(&Value::from("out")));
        assert_eq!(
            envelope.scoped_property(PropertyScope::Inbound, "host"),
            Some(&Value::from("in"))
        );
        assert_eq!(envelope.without_property("host").property("host"), Some(&Value::from("in")));
    }

    #[test]
    fn sequence_reports_index_and_total() {
        let envelope = Envelope::new(1.0).with_sequence(2, Some(3));
        assert_eq!(envelope.sequence(), Some(Sequence { index: 2, total: Some(3) }));

        let unknown = Envelope::new(1.0).with_sequence(0, None);
        assert_eq!(unknown.sequence().unwrap().total, None);
        assert!(Envelope::new(1.0).sequence().is_none());
    }

    #[test]
    fn payload_number_parsing() {
        assert_eq!(Payload::from("0.05").as_number(), Some(0.05));
        assert_eq!(Payload::Number(2.5).as_number(), Some(2.5));
        assert_eq!(Payload::Json(serde_json::json!(7)).as_number(), Some(7.0));
        assert_eq!(Payload::Bytes(vec![1]).as_number(), None);
        assert_eq!(Payload::from("not a number").as_number(), None);
    }

    #[test]
    fn attachments_are_copy_on_write() {
        let original = Envelope::new("body");
        let attached = original.with_attachment("invoice.pdf", vec![1, 2, 3]);

        assert!(original.attachment("invoice.pdf").is_none());
        assert_eq!(attached.attachment("invoice.pdf"), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn payload_display() {
        let list = Payload::List(vec![Payload::from("a"), Payload::Number(1.5)]);
        assert_eq!(list.to_string(), "[a, 1.5]");
    }
}

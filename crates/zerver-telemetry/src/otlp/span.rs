//! OTLP Span Model
//!
//! A minimal span representation that serializes straight into the OTLP
//! JSON wire shape. Timestamps are tracked in milliseconds and widened to
//! nanosecond strings at serialization time.

use serde_json::{json, Value};
use uuid::Uuid;

/// Random 128-bit trace id as 32 lowercase hex chars.
pub fn new_trace_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Random 64-bit span id as 16 lowercase hex chars.
pub fn new_span_id() -> String {
    let full = Uuid::new_v4().simple().to_string();
    full[..16].to_string()
}

/// OTLP span kinds, with their wire enum values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanKind {
    Internal,
    Server,
    Client,
}

impl SpanKind {
    fn wire_value(&self) -> u8 {
        match self {
            Self::Internal => 1,
            Self::Server => 2,
            Self::Client => 3,
        }
    }
}

/// Typed attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Str(String),
    Int(i64),
    Bool(bool),
    Double(f64),
}

impl AttrValue {
    fn to_json(&self) -> Value {
        match self {
            Self::Str(s) => json!({ "stringValue": s }),
            Self::Int(i) => json!({ "intValue": i.to_string() }),
            Self::Bool(b) => json!({ "boolValue": b }),
            Self::Double(d) => json!({ "doubleValue": d }),
        }
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u64> for AttrValue {
    fn from(v: u64) -> Self {
        Self::Int(v as i64)
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

/// One span or event attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyValue {
    pub key: String,
    pub value: AttrValue,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    fn to_json(&self) -> Value {
        json!({ "key": self.key, "value": self.value.to_json() })
    }
}

/// Point-in-time event attached to a span.
#[derive(Debug, Clone, PartialEq)]
pub struct SpanEvent {
    pub name: String,
    pub ts_ms: u64,
    pub attributes: Vec<KeyValue>,
}

impl SpanEvent {
    pub fn new(name: impl Into<String>, ts_ms: u64) -> Self {
        Self {
            name: name.into(),
            ts_ms,
            attributes: Vec::new(),
        }
    }

    pub fn with_attr(mut self, attr: KeyValue) -> Self {
        self.attributes.push(attr);
        self
    }
}

/// Span status: unset or error with a message.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum SpanStatus {
    #[default]
    Unset,
    Error(String),
}

/// An in-flight or finished span.
#[derive(Debug, Clone)]
pub struct Span {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub name: String,
    pub kind: SpanKind,
    pub start_ms: u64,
    pub end_ms: Option<u64>,
    pub attributes: Vec<KeyValue>,
    pub events: Vec<SpanEvent>,
    pub status: SpanStatus,
}

impl Span {
    pub fn new(
        trace_id: impl Into<String>,
        parent_span_id: Option<String>,
        name: impl Into<String>,
        kind: SpanKind,
        start_ms: u64,
    ) -> Self {
        Self {
            trace_id: trace_id.into(),
            span_id: new_span_id(),
            parent_span_id,
            name: name.into(),
            kind,
            start_ms,
            end_ms: None,
            attributes: Vec::new(),
            events: Vec::new(),
            status: SpanStatus::Unset,
        }
    }

    pub fn push_attr(&mut self, attr: KeyValue) {
        self.attributes.push(attr);
    }

    pub fn push_attrs(&mut self, attrs: impl IntoIterator<Item = KeyValue>) {
        self.attributes.extend(attrs);
    }

    pub fn push_event(&mut self, event: SpanEvent) {
        self.events.push(event);
    }

    pub fn end(&mut self, ts_ms: u64) {
        self.end_ms = Some(ts_ms.max(self.start_ms));
    }

    pub fn is_open(&self) -> bool {
        self.end_ms.is_none()
    }

    pub fn set_error(&mut self, message: impl Into<String>) {
        self.status = SpanStatus::Error(message.into());
    }

    /// OTLP JSON wire shape of this span.
    pub fn to_json(&self) -> Value {
        let end_ms = self.end_ms.unwrap_or(self.start_ms);
        let mut obj = json!({
            "traceId": self.trace_id,
            "spanId": self.span_id,
            "name": self.name,
            "kind": self.kind.wire_value(),
            "startTimeUnixNano": ms_to_nano(self.start_ms),
            "endTimeUnixNano": ms_to_nano(end_ms),
            "attributes": self.attributes.iter().map(|a| a.to_json()).collect::<Vec<_>>(),
            "events": self
                .events
                .iter()
                .map(|e| {
                    json!({
                        "timeUnixNano": ms_to_nano(e.ts_ms),
                        "name": e.name,
                        "attributes": e.attributes.iter().map(|a| a.to_json()).collect::<Vec<_>>(),
                    })
                })
                .collect::<Vec<_>>(),
        });
        if let Some(parent) = &self.parent_span_id {
            obj["parentSpanId"] = json!(parent);
        }
        match &self.status {
            SpanStatus::Unset => {}
            SpanStatus::Error(message) => {
                obj["status"] = json!({ "code": 2, "message": message });
            }
        }
        obj
    }
}

fn ms_to_nano(ms: u64) -> String {
    (ms as u128 * 1_000_000).to_string()
}

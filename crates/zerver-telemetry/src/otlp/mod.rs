//! OTLP Span Recording & Export
//!
//! Turns the telemetry event stream of each request into one OTLP JSON
//! span tree (root SERVER span, step/effect children, promoted job spans)
//! and ships it through a background exporter.

mod export;
mod recorder;
mod semconv;
mod span;

pub use export::{
    build_payload, ExportSink, HttpTransport, MemorySink, OtlpExporter, OtlpTransport, Resource,
};
pub use recorder::OtlpRecorder;
pub use semconv::effect_attributes;
pub use span::{new_span_id, new_trace_id, AttrValue, KeyValue, Span, SpanEvent, SpanKind, SpanStatus};

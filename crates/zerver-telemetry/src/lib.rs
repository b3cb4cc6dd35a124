//! Telemetry for the zerver pipeline
//!
//! Three layers:
//! - the event taxonomy (`TelemetryEvent` and friends) every transition in
//!   a request's life is described with,
//! - the per-request recorder (`Telemetry`) that assigns sequence numbers,
//!   balances open frames and fans events out to subscribers,
//! - the OTLP side (`otlp`): an in-flight span recorder with
//!   threshold-based job-span promotion and a background exporter.

pub mod config;
pub mod event;
pub mod otlp;
pub mod recorder;
pub mod subscriber;

pub use config::TelemetryConfig;
pub use event::{
    EventKind, JobEvent, JobKind, JobPhase, Outcome, ParkCause, TelemetryEvent,
};
pub use recorder::{now_ms, Telemetry};
pub use subscriber::{MemorySubscriber, Subscriber};

//! Per-request state for the zerver pipeline
//!
//! A `Context` owns everything a request accumulates while it executes:
//! the parsed request line, header/param/query mappings, the slot store
//! that effects publish results into, exit callbacks, and the identifiers
//! the rest of the stack keys on (request id, authenticated user).
//!
//! Typed access to slots goes through `CtxView`, a zero-cost permission
//! handle whose type parameter fixes which slots a step may read or write.

mod context;
mod correlation;
mod slots;
mod view;

pub use context::Context;
pub use correlation::{correlate, generate_request_id, parse_traceparent};
pub use slots::SlotValue;
pub use view::{with_view, CtxView, ReadsSlot, SlotCodec, SlotTag, ViewSpec, WritesSlot};

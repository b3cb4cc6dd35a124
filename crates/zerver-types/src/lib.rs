//! Core types for the zerver request-execution pipeline
//!
//! This crate provides the foundational types shared across the runtime:
//! - `Decision` - what a step asks the executor to do next
//! - `Effect` / `Need` - declarative I/O requests and their scheduling envelope
//! - `Response` - what is ultimately written back to the transport
//! - `Error` - the request-level error taxonomy with its HTTP code table
//!
//! These types are extracted to a leaf crate so that context, telemetry and
//! executor crates can all reference them without depending on each other.

mod decision;
mod effect;
mod error;
mod response;
mod retry;

pub use decision::{
    Compensation, CompensationTrigger, Decision, DecisionLabel, DispatchMode, JoinPolicy, Layer,
    Need,
};
pub use effect::{
    BufOwner, DbOp, Effect, EffectKind, EffectResult, FileOp, GrpcOp, HttpMethod, KvOp, TcpOp,
    WsOp,
};
pub use error::{Error, ErrorKind};
pub use response::{Body, BodyStream, Response};
pub use retry::Retry;

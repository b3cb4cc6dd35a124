//! Request execution runtime for zerver
//!
//! Drives routes of steps against a per-request `Context`: invokes each
//! step, schedules the effects its `Need`s declare through a host-supplied
//! runner, applies join and compensation semantics, guards targets with
//! circuit breakers, and renders errors. Every transition is reported to
//! the telemetry layer.

pub mod breaker;
pub mod executor;
pub mod render;
pub mod route;
pub mod runner;

pub use breaker::{BreakerConfig, BreakerPool, BreakerSnapshot, BreakerState, CircuitBreaker};
pub use executor::{Executor, ExecutorConfig};
pub use render::render;
pub use route::{Route, Router, StaticRouter, Step};
pub use runner::{cancel_pair, CancelSignal, CancelToken, EffectRunner, RunnerCtx};

//! Telemetry Event Taxonomy
//!
//! Every transition the executor or a queue observes becomes one
//! `TelemetryEvent`: an envelope (request id, per-request sequence,
//! millisecond timestamp) around an `EventKind`.

use serde::{Deserialize, Serialize};

use zerver_types::{DecisionLabel, DispatchMode, JoinPolicy, Layer};

/// Final label of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Done,
    Fail,
    Cancelled,
    Crashed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Fail => "fail",
            Self::Cancelled => "cancelled",
            Self::Crashed => "crashed",
        }
    }
}

/// Why a job parked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParkCause {
    IoWait,
    RateLimit,
    Backpressure,
    Lock,
    Timer,
    Other,
}

impl ParkCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IoWait => "io_wait",
            Self::RateLimit => "rate_limit",
            Self::Backpressure => "backpressure",
            Self::Lock => "lock",
            Self::Timer => "timer",
            Self::Other => "other",
        }
    }
}

/// Which queue family a job belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Effect,
    Step,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Effect => "effect",
            Self::Step => "step",
        }
    }
}

/// Job lifecycle phases, in the order they can occur.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Enqueued,
    Taken,
    Started,
    Parked,
    Resumed,
    Completed,
}

impl JobPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enqueued => "enqueued",
            Self::Taken => "taken",
            Self::Started => "started",
            Self::Parked => "parked",
            Self::Resumed => "resumed",
            Self::Completed => "completed",
        }
    }
}

/// One job lifecycle transition.
///
/// `job_seq` doubles as the owner link: for effect jobs it equals the
/// owning effect's sequence, for step jobs the resumed step's sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub kind: JobKind,
    pub phase: JobPhase,
    pub queue: String,
    pub need_seq: u64,
    pub job_seq: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<u32>,
    /// Parked only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<ParkCause>,
    /// Opaque wait token correlating parked/resumed pairs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency_current: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency_max: Option<u64>,
}

impl JobEvent {
    pub fn new(kind: JobKind, phase: JobPhase, queue: impl Into<String>, need_seq: u64, job_seq: u64) -> Self {
        Self {
            kind,
            phase,
            queue: queue.into(),
            need_seq,
            job_seq,
            worker: None,
            cause: None,
            token: None,
            concurrency_current: None,
            concurrency_max: None,
        }
    }

    pub fn with_worker(mut self, worker: u32) -> Self {
        self.worker = Some(worker);
        self
    }

    pub fn parked(mut self, cause: ParkCause) -> Self {
        self.cause = Some(cause);
        self
    }

    pub fn with_token(mut self, token: u64) -> Self {
        self.token = Some(token);
        self
    }

    pub fn with_concurrency(mut self, current: u64, max: u64) -> Self {
        self.concurrency_current = Some(current);
        self.concurrency_max = Some(max);
        self
    }

    /// Canonical event name, e.g. `effect_job_parked`.
    pub fn name(&self) -> String {
        format!("{}_job_{}", self.kind.as_str(), self.phase.as_str())
    }
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum EventKind {
    RequestStart {
        method: String,
        path: String,
    },
    RequestEnd {
        status: u16,
        outcome: Outcome,
        duration_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        content_type: Option<String>,
        /// Body size for complete bodies; absent for streaming.
        #[serde(skip_serializing_if = "Option::is_none")]
        body_bytes: Option<u64>,
        streaming: bool,
        bytes_in: u64,
        bytes_out: u64,
    },
    StepStart {
        layer: Layer,
        name: String,
        step_seq: u64,
    },
    StepEnd {
        name: String,
        step_seq: u64,
        decision: DecisionLabel,
    },
    NeedScheduled {
        need_seq: u64,
        effect_count: usize,
        mode: DispatchMode,
        join: JoinPolicy,
    },
    StepResume {
        need_seq: u64,
        mode: DispatchMode,
        join: JoinPolicy,
    },
    StepWait {
        need_seq: u64,
    },
    EffectStart {
        effect_seq: u64,
        kind: String,
        target: String,
        /// Most specific operation identifier: url, key, sql, path, task.
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
        attempt: u32,
    },
    EffectEnd {
        effect_seq: u64,
        kind: String,
        ok: bool,
        bytes: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_ctx: Option<String>,
        attempt: u32,
    },
    ExecutorCrash {
        phase: String,
        error_name: String,
    },
    Job(JobEvent),
}

/// Envelope every event is delivered in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub request_id: String,
    /// Strictly increasing within a request.
    pub seq: u64,
    pub ts_ms: u64,
    #[serde(flatten)]
    pub kind: EventKind,
}

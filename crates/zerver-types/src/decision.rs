//! Decisions and Needs
//!
//! A step returns a `Decision`: continue down the pipeline, finish with a
//! response, fail with an error, or pause on a `Need` - a batch of effects
//! with a dispatch mode, a join policy, optional compensations and an
//! optional continuation.

use serde::{Deserialize, Serialize};

use crate::effect::Effect;
use crate::error::Error;
use crate::response::Response;

/// Which stage of the pipeline a step belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    GlobalBefore,
    RouteBefore,
    Main,
    Continuation,
    System,
}

impl Layer {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GlobalBefore => "global_before",
            Self::RouteBefore => "route_before",
            Self::Main => "main",
            Self::Continuation => "continuation",
            Self::System => "system",
        }
    }
}

/// How a need's effects are handed to the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    Sequential,
    Parallel,
}

impl DispatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
        }
    }
}

/// When a paused step resumes relative to its effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinPolicy {
    /// Wait for every effect; succeed iff all succeed.
    All,
    /// Wait for every required effect; optional ones may finish later.
    AllRequired,
    /// Resume on the first completion, success or failure.
    Any,
    /// Resume on the first success; fail with the last failure if none.
    FirstSuccess,
}

impl JoinPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::AllRequired => "all_required",
            Self::Any => "any",
            Self::FirstSuccess => "first_success",
        }
    }
}

/// What makes a compensation fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationTrigger {
    /// An effect in the need reported failure.
    OnFailure,
    /// An effect was cancelled by the join policy.
    OnCancel,
}

/// An effect dispatched when its need fails or cancels work.
///
/// Compensations run through the normal dispatch pipeline but can never
/// carry further needs; each holds exactly one effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Compensation {
    pub label: String,
    pub trigger: CompensationTrigger,
    pub effect: Effect,
}

impl Compensation {
    pub fn on_failure(label: impl Into<String>, effect: Effect) -> Self {
        Self {
            label: label.into(),
            trigger: CompensationTrigger::OnFailure,
            effect,
        }
    }

    pub fn on_cancel(label: impl Into<String>, effect: Effect) -> Self {
        Self {
            label: label.into(),
            trigger: CompensationTrigger::OnCancel,
            effect,
        }
    }
}

/// A request to execute one or more effects and resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Need {
    pub effects: Vec<Effect>,
    pub mode: DispatchMode,
    pub join: JoinPolicy,
    pub compensations: Vec<Compensation>,
    /// Index into the route's continuation table. `None` re-enters the
    /// current step from the top once slots are populated.
    pub continuation: Option<usize>,
}

impl Need {
    pub fn new(effects: Vec<Effect>) -> Self {
        Self {
            effects,
            mode: DispatchMode::Sequential,
            join: JoinPolicy::All,
            compensations: Vec::new(),
            continuation: None,
        }
    }

    pub fn single(effect: Effect) -> Self {
        Self::new(vec![effect])
    }

    pub fn parallel(mut self) -> Self {
        self.mode = DispatchMode::Parallel;
        self
    }

    pub fn join(mut self, join: JoinPolicy) -> Self {
        self.join = join;
        self
    }

    pub fn compensate(mut self, compensation: Compensation) -> Self {
        self.compensations.push(compensation);
        self
    }

    pub fn then_continue_at(mut self, index: usize) -> Self {
        self.continuation = Some(index);
        self
    }
}

/// What a step asks the executor to do next.
#[derive(Debug)]
pub enum Decision {
    /// Proceed to the next step.
    Continue,
    /// End the request with this response.
    Done(Response),
    /// Render this error and finalize.
    Fail(Error),
    /// Pause the step until the need's effects are joined.
    Need(Need),
}

impl Decision {
    pub fn label(&self) -> DecisionLabel {
        match self {
            Self::Continue => DecisionLabel::Continue,
            Self::Done(_) => DecisionLabel::Done,
            Self::Fail(_) => DecisionLabel::Fail,
            Self::Need(_) => DecisionLabel::Need,
        }
    }
}

/// Compact decision tag carried by telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionLabel {
    Continue,
    Done,
    Fail,
    Need,
}

impl DecisionLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::Done => "done",
            Self::Fail => "fail",
            Self::Need => "need",
        }
    }
}

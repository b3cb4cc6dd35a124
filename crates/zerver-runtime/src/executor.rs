//! Request Executor
//!
//! Drives one request through its route: invokes steps, schedules the
//! effects their `Need`s declare, applies join policies, publishes result
//! bytes into context slots, retries failing required effects, dispatches
//! compensations on terminal need failures, and finalizes the request
//! with exit callbacks and a `request_end` event.
//!
//! The executor occupies one logical task per request and yields only at
//! need boundaries. Parallel effect dispatch fans out onto tokio tasks;
//! slot writes are published before a step resumes, so steps never race
//! the runner.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::future::select_all;
use futures::FutureExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use zerver_context::{correlate, Context};
use zerver_telemetry::{
    JobEvent, JobKind, JobPhase, Outcome, Subscriber, Telemetry, TelemetryConfig,
};
use zerver_types::{
    Compensation, CompensationTrigger, Decision, DecisionLabel, DispatchMode, Effect,
    EffectResult, Error, ErrorKind, JoinPolicy, Layer, Need, Response,
};

use crate::breaker::{BreakerPool, CircuitBreaker};
use crate::render::render;
use crate::route::{Route, Step};
use crate::runner::{cancel_pair, CancelSignal, CancelToken, EffectRunner, RunnerCtx};

/// How long finalization waits for cancelled effect tasks to settle.
const DRAIN_GRACE_MS: u64 = 100;

/// Executor tunables.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Whole-request deadline; exceeding it cancels the active need.
    pub request_deadline_ms: Option<u64>,
    pub queue_name_effects: String,
    pub queue_name_continuations: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            request_deadline_ms: None,
            queue_name_effects: "effects".to_string(),
            queue_name_continuations: "continuations".to_string(),
        }
    }
}

impl ExecutorConfig {
    /// Adopt the queue names configured for telemetry.
    pub fn from_telemetry(config: &TelemetryConfig) -> Self {
        Self {
            request_deadline_ms: None,
            queue_name_effects: config.queue_name_effects.clone(),
            queue_name_continuations: config.queue_name_continuations.clone(),
        }
    }

    pub fn with_deadline_ms(mut self, ms: u64) -> Self {
        self.request_deadline_ms = Some(ms);
        self
    }
}

/// Terminal result of one step cycle (the step plus its need/resume loop).
enum StepFlow {
    Continue,
    Done(Response),
    Fail(Error),
    Deadline(Error),
    Crashed(Error),
}

/// Terminal result of one need.
enum NeedResult {
    Resumed,
    Failed {
        error: Error,
        any_failed: bool,
        any_cancelled: bool,
        deadline: bool,
    },
}

struct NeedFailure {
    error: Error,
    deadline: bool,
}

/// One attempt as observed by a parallel effect task.
struct AttemptRecord {
    attempt: u32,
    /// The runner was actually invoked (false for breaker denials and
    /// cancellations that never dispatched).
    dispatched: bool,
    result: EffectResult,
}

/// Everything a parallel effect task reports back.
struct TaskOutput {
    index: usize,
    effect: Effect,
    attempts: Vec<AttemptRecord>,
    result: EffectResult,
}

type TaskFuture =
    Pin<Box<dyn Future<Output = (usize, Result<TaskOutput, oneshot::error::RecvError>)> + Send>>;

/// An effect task still running after its need resumed.
struct PendingTask {
    need_seq: u64,
    fut: TaskFuture,
    /// Kept for AllRequired optionals so an unfinished task can still be
    /// cancelled at drain time. Join losers were already cancelled.
    signal: Option<CancelSignal>,
    /// Publish the result to its slot if it settles in time (AllRequired
    /// optionals). Cancelled join losers only surface telemetry.
    publish: bool,
}

/// The request state machine.
pub struct Executor {
    runner: Arc<dyn EffectRunner>,
    breakers: Arc<BreakerPool>,
    subscribers: Vec<Arc<dyn Subscriber>>,
    global_before: Vec<Step>,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(runner: Arc<dyn EffectRunner>) -> Self {
        Self {
            runner,
            breakers: Arc::new(BreakerPool::default()),
            subscribers: Vec::new(),
            global_before: Vec::new(),
            config: ExecutorConfig::default(),
        }
    }

    pub fn with_breakers(mut self, breakers: Arc<BreakerPool>) -> Self {
        self.breakers = breakers;
        self
    }

    pub fn with_subscriber(mut self, subscriber: Arc<dyn Subscriber>) -> Self {
        self.subscribers.push(subscriber);
        self
    }

    pub fn with_global_before(mut self, steps: Vec<Step>) -> Self {
        self.global_before = steps;
        self
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn breakers(&self) -> &Arc<BreakerPool> {
        &self.breakers
    }

    /// Execute one request against a route. The context must already hold
    /// the parsed request; populating path params is the transport's job.
    pub async fn execute(&self, ctx: &mut Context, route: &Route) -> Response {
        if ctx.request_id().is_empty() {
            correlate(ctx);
        }
        let mut tel = Telemetry::new(ctx.request_id(), self.subscribers.clone());
        tel.request_start(ctx.method(), ctx.path());
        tel.add_bytes_in(ctx.body().len() as u64);

        let deadline = self
            .config
            .request_deadline_ms
            .map(|ms| Instant::now() + Duration::from_millis(ms));
        let mut pending: Vec<PendingTask> = Vec::new();

        let mut outcome = Outcome::Done;
        let mut response: Option<Response> = None;

        let chains: [(&[Step], Layer); 3] = [
            (&self.global_before, Layer::GlobalBefore),
            (&route.before, Layer::RouteBefore),
            (&route.steps, Layer::Main),
        ];
        'outer: for (steps, layer) in chains {
            for step in steps {
                let flow = self
                    .run_step(ctx, route, step, layer, &mut tel, deadline, &mut pending)
                    .await;
                match flow {
                    StepFlow::Continue => {}
                    StepFlow::Done(resp) => {
                        response = Some(resp);
                        break 'outer;
                    }
                    StepFlow::Fail(err) => {
                        outcome = Outcome::Fail;
                        ctx.record_error(err.clone());
                        response = Some(render(&err));
                        break 'outer;
                    }
                    StepFlow::Deadline(err) => {
                        outcome = Outcome::Cancelled;
                        ctx.record_error(err.clone());
                        response = Some(render(&err));
                        break 'outer;
                    }
                    StepFlow::Crashed(err) => {
                        outcome = Outcome::Crashed;
                        ctx.record_error(err.clone());
                        response = Some(render(&err));
                        break 'outer;
                    }
                }
            }
        }

        let mut response = match response {
            Some(resp) => resp,
            None => {
                // The chain ran out without a terminal decision.
                outcome = Outcome::Fail;
                let err = Error::internal("executor", "no_response");
                ctx.record_error(err.clone());
                render(&err)
            }
        };

        self.drain_pending(ctx, &mut tel, &mut pending).await;
        ctx.drain_exit_callbacks();
        ctx.set_status(response.status);
        if response.header("x-request-id").is_none() {
            response.set_header("x-request-id", ctx.request_id().to_string());
        }

        let body_bytes = response.body.len().map(|n| n as u64);
        tel.add_bytes_out(body_bytes.unwrap_or(0));
        let event_log = tel.finish(
            response.status,
            outcome,
            response.content_type().map(|s| s.to_string()),
            body_bytes,
            response.body.is_streaming(),
        );
        tracing::trace!(request_id = %ctx.request_id(), "request trace: {event_log}");
        response
    }

    /// Run one step plus its need/resume loop until a terminal decision.
    ///
    /// The step frame stays open across needs: a resumed continuation (or
    /// the re-entered step) runs under the same `step_seq`, and the final
    /// decision closes the frame.
    #[allow(clippy::too_many_arguments)]
    async fn run_step(
        &self,
        ctx: &mut Context,
        route: &Route,
        step: &Step,
        layer: Layer,
        tel: &mut Telemetry,
        deadline: Option<Instant>,
        pending: &mut Vec<PendingTask>,
    ) -> StepFlow {
        let step_seq = tel.step_start(layer, &step.name);
        let mut body: &Step = step;
        let mut enclosing_comps: Vec<Compensation> = Vec::new();
        let mut last_need_seq: u64 = 0;
        let mut resumes: u32 = 0;

        loop {
            // Resumed invocations flow through the continuation queue.
            if resumes > 0 {
                for phase in [JobPhase::Enqueued, JobPhase::Taken, JobPhase::Started] {
                    tel.job(JobEvent::new(
                        JobKind::Step,
                        phase,
                        self.config.queue_name_continuations.clone(),
                        last_need_seq,
                        step_seq,
                    ));
                }
            }
            let decision = match catch_unwind(AssertUnwindSafe(|| body.invoke(ctx))) {
                Ok(decision) => decision,
                Err(payload) => {
                    let error_name = panic_message(payload.as_ref());
                    tracing::error!(step = %body.name, "step panicked: {error_name}");
                    tel.executor_crash(layer.as_str(), &error_name);
                    if resumes > 0 {
                        tel.job(JobEvent::new(
                            JobKind::Step,
                            JobPhase::Completed,
                            self.config.queue_name_continuations.clone(),
                            last_need_seq,
                            step_seq,
                        ));
                    }
                    tel.step_end(step_seq, DecisionLabel::Fail);
                    return StepFlow::Crashed(Error::internal("executor", body.name.clone()));
                }
            };
            if resumes > 0 {
                tel.job(JobEvent::new(
                    JobKind::Step,
                    JobPhase::Completed,
                    self.config.queue_name_continuations.clone(),
                    last_need_seq,
                    step_seq,
                ));
            }

            match decision {
                Decision::Continue => {
                    tel.step_end(step_seq, DecisionLabel::Continue);
                    return StepFlow::Continue;
                }
                Decision::Done(resp) => {
                    tel.step_end(step_seq, DecisionLabel::Done);
                    return StepFlow::Done(resp);
                }
                Decision::Fail(err) => {
                    tel.step_end(step_seq, DecisionLabel::Fail);
                    // The enclosing need frame's failure compensations.
                    if !enclosing_comps.is_empty() {
                        let rctx = RunnerCtx::from_context(ctx);
                        self.run_compensations(
                            &enclosing_comps,
                            &rctx,
                            tel,
                            last_need_seq,
                            true,
                            false,
                        )
                        .await;
                    }
                    return StepFlow::Fail(err);
                }
                Decision::Need(need) => {
                    let need_seq = tel.next_need_seq();
                    tel.need_scheduled(need_seq, need.effects.len(), need.mode, need.join);
                    match self
                        .run_need(ctx, &need, need_seq, tel, deadline, pending)
                        .await
                    {
                        Ok(()) => {
                            enclosing_comps = need.compensations.clone();
                            last_need_seq = need_seq;
                            body = match need.continuation {
                                Some(index) => match route.continuations.get(index) {
                                    Some(cont) => cont,
                                    None => {
                                        tracing::error!(index, "need names an unknown continuation");
                                        tel.step_end(step_seq, DecisionLabel::Fail);
                                        return StepFlow::Fail(Error::internal(
                                            "executor",
                                            "continuation",
                                        ));
                                    }
                                },
                                None => step,
                            };
                            resumes += 1;
                            tel.step_resume(need_seq, need.mode, need.join);
                        }
                        Err(failure) => {
                            tel.step_end(step_seq, DecisionLabel::Fail);
                            return if failure.deadline {
                                StepFlow::Deadline(failure.error)
                            } else {
                                StepFlow::Fail(failure.error)
                            };
                        }
                    }
                }
            }
        }
    }

    /// Dispatch a need's effects and evaluate its join policy. On terminal
    /// failure the need's compensations run before the error is returned.
    async fn run_need(
        &self,
        ctx: &mut Context,
        need: &Need,
        need_seq: u64,
        tel: &mut Telemetry,
        deadline: Option<Instant>,
        pending: &mut Vec<PendingTask>,
    ) -> Result<(), NeedFailure> {
        if need.effects.is_empty() {
            return Ok(());
        }
        let result = match need.mode {
            DispatchMode::Sequential => {
                self.run_sequential(ctx, need, need_seq, tel, deadline).await
            }
            DispatchMode::Parallel => {
                self.run_parallel(ctx, need, need_seq, tel, deadline, pending)
                    .await
            }
        };
        match result {
            NeedResult::Resumed => Ok(()),
            NeedResult::Failed {
                error,
                any_failed,
                any_cancelled,
                deadline: deadline_hit,
            } => {
                if !need.compensations.is_empty() {
                    let rctx = RunnerCtx::from_context(ctx);
                    self.run_compensations(
                        &need.compensations,
                        &rctx,
                        tel,
                        need_seq,
                        any_failed,
                        any_cancelled,
                    )
                    .await;
                }
                Err(NeedFailure {
                    error,
                    deadline: deadline_hit,
                })
            }
        }
    }

    /// One effect at a time. A required failure cancels the remaining
    /// effects; `Any`/`FirstSuccess` stop as soon as their join is
    /// satisfied.
    async fn run_sequential(
        &self,
        ctx: &mut Context,
        need: &Need,
        need_seq: u64,
        tel: &mut Telemetry,
        deadline: Option<Instant>,
    ) -> NeedResult {
        let rctx = RunnerCtx::from_context(ctx);
        let mut any_failed = false;
        let mut any_cancelled = false;
        let mut success_count = 0usize;
        let mut last_failure: Option<Error> = None;
        let mut required_failure: Option<Error> = None;
        let mut skip_rest = false;

        for effect in &need.effects {
            if skip_rest {
                any_cancelled = true;
                continue;
            }
            if deadline_passed(deadline) {
                return NeedResult::Failed {
                    error: Error::timeout("executor", "deadline"),
                    any_failed,
                    any_cancelled: true,
                    deadline: true,
                };
            }
            let result = self
                .dispatch_effect(&rctx, effect, need_seq, tel, deadline, &CancelToken::never())
                .await;
            match result {
                EffectResult::Success { bytes, .. } => {
                    ctx.slot_put(effect.token, bytes);
                    success_count += 1;
                    if matches!(need.join, JoinPolicy::Any | JoinPolicy::FirstSuccess) {
                        skip_rest = true;
                    }
                }
                EffectResult::Failure(err) => {
                    any_failed = true;
                    match need.join {
                        JoinPolicy::All | JoinPolicy::AllRequired => {
                            if effect.required {
                                required_failure = Some(err.clone());
                                skip_rest = true;
                            }
                        }
                        JoinPolicy::Any => skip_rest = true,
                        JoinPolicy::FirstSuccess => {}
                    }
                    last_failure = Some(err);
                }
            }
        }

        match need.join {
            JoinPolicy::All | JoinPolicy::AllRequired => match required_failure {
                Some(error) => NeedResult::Failed {
                    error,
                    any_failed,
                    any_cancelled,
                    // A failure after the deadline elapsed is the
                    // deadline's doing.
                    deadline: deadline_passed(deadline),
                },
                None => NeedResult::Resumed,
            },
            JoinPolicy::Any => NeedResult::Resumed,
            JoinPolicy::FirstSuccess => {
                if success_count > 0 {
                    NeedResult::Resumed
                } else {
                    NeedResult::Failed {
                        error: last_failure.unwrap_or_else(|| Error::internal("executor", "need")),
                        any_failed,
                        any_cancelled,
                        deadline: deadline_passed(deadline),
                    }
                }
            }
        }
    }

    /// Fan all effects out onto tasks, then collect per the join policy.
    /// Task telemetry is replayed into the request's event stream as each
    /// task is collected, preserving per-request program order.
    #[allow(clippy::too_many_arguments)]
    async fn run_parallel(
        &self,
        ctx: &mut Context,
        need: &Need,
        need_seq: u64,
        tel: &mut Telemetry,
        deadline: Option<Instant>,
        pending: &mut Vec<PendingTask>,
    ) -> NeedResult {
        let rctx = RunnerCtx::from_context(ctx);
        tel.step_wait(need_seq);

        let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(need.effects.len());
        let mut signals: Vec<Option<CancelSignal>> = Vec::with_capacity(need.effects.len());
        let mut waiting: Vec<TaskFuture> = Vec::new();

        for (index, effect) in need.effects.iter().enumerate() {
            let (signal, token) = cancel_pair();
            let (out_tx, out_rx) = oneshot::channel::<TaskOutput>();
            let runner = self.runner.clone();
            let breakers = self.breakers.clone();
            let task_rctx = rctx.clone();
            let task_effect = effect.clone();
            let handle = tokio::spawn(async move {
                let output =
                    run_task(runner, breakers, task_rctx, task_effect, index, deadline, token)
                        .await;
                if out_tx.send(output).is_err() {
                    tracing::debug!("effect result receiver dropped before delivery");
                }
            });
            handles.push(handle);

            let fut: TaskFuture = Box::pin(async move { (index, out_rx.await) });
            if need.join == JoinPolicy::AllRequired && !effect.required {
                // Optional effects keep running in the background; their
                // results land if they settle before finalization.
                pending.push(PendingTask {
                    need_seq,
                    fut,
                    signal: Some(signal),
                    publish: true,
                });
                signals.push(None);
            } else {
                waiting.push(fut);
                signals.push(Some(signal));
            }
        }

        let mut any_failed = false;
        let mut required_failure: Option<Error> = None;
        let mut last_failure: Option<Error> = None;
        let mut satisfied = false;

        while !waiting.is_empty() {
            let select_fut = select_all(waiting);
            let ((index, received), _, remaining) = match deadline {
                Some(d) => match tokio::time::timeout_at(d, select_fut).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        // Deadline: cancel everything and fail the need.
                        for signal in signals.iter().flatten() {
                            signal.cancel();
                        }
                        for handle in &handles {
                            handle.abort();
                        }
                        return NeedResult::Failed {
                            error: Error::timeout("executor", "deadline"),
                            any_failed,
                            any_cancelled: true,
                            deadline: true,
                        };
                    }
                },
                None => select_fut.await,
            };
            waiting = remaining;

            let output = match received {
                Ok(output) => output,
                Err(_) => {
                    tracing::error!(index, "effect task dropped its result channel");
                    any_failed = true;
                    last_failure = Some(Error::internal("executor", "effect_task"));
                    if need.effects[index].required && required_failure.is_none() {
                        required_failure = Some(Error::internal("executor", "effect_task"));
                    }
                    continue;
                }
            };

            self.replay_task(tel, need_seq, &output);

            let succeeded = output.result.is_success();
            if succeeded {
                let publish = match need.join {
                    JoinPolicy::All | JoinPolicy::AllRequired => true,
                    // Exactly one result is observable at resume.
                    JoinPolicy::Any | JoinPolicy::FirstSuccess => !satisfied,
                };
                if publish {
                    let token = output.effect.token;
                    if let EffectResult::Success { bytes, .. } = output.result {
                        ctx.slot_put(token, bytes);
                    }
                }
            } else if let Some(err) = output.result.error() {
                any_failed = true;
                last_failure = Some(err.clone());
                if output.effect.required && required_failure.is_none() {
                    required_failure = Some(err.clone());
                }
            }

            let join_now_satisfied = match need.join {
                JoinPolicy::Any => true,
                JoinPolicy::FirstSuccess => succeeded,
                JoinPolicy::All | JoinPolicy::AllRequired => false,
            };
            if join_now_satisfied && !satisfied {
                satisfied = true;
                // Cancel the losers; they settle in the background and
                // their telemetry lands at drain time.
                for signal in signals.iter().flatten() {
                    signal.cancel();
                }
                for fut in waiting {
                    pending.push(PendingTask {
                        need_seq,
                        fut,
                        signal: None,
                        publish: false,
                    });
                }
                return NeedResult::Resumed;
            }
        }

        match need.join {
            JoinPolicy::All | JoinPolicy::AllRequired => match required_failure {
                Some(error) => NeedResult::Failed {
                    error,
                    any_failed,
                    any_cancelled: false,
                    // A failure after the deadline elapsed is the
                    // deadline's doing.
                    deadline: deadline_passed(deadline),
                },
                None => NeedResult::Resumed,
            },
            JoinPolicy::Any => NeedResult::Resumed,
            JoinPolicy::FirstSuccess => {
                if satisfied {
                    NeedResult::Resumed
                } else {
                    NeedResult::Failed {
                        error: last_failure.unwrap_or_else(|| Error::internal("executor", "need")),
                        any_failed,
                        any_cancelled: false,
                        deadline: deadline_passed(deadline),
                    }
                }
            }
        }
    }

    /// Dispatch one effect inline, with live telemetry per attempt.
    async fn dispatch_effect(
        &self,
        rctx: &RunnerCtx,
        effect: &Effect,
        need_seq: u64,
        tel: &mut Telemetry,
        deadline: Option<Instant>,
        cancel: &CancelToken,
    ) -> EffectResult {
        let mut attempt: u32 = 0;
        loop {
            let effect_seq =
                tel.effect_start(effect.kind_str(), &effect.target, effect.kind.detail(), attempt);
            let breaker = self.breakers.lookup(&effect.target);
            let denied = breaker.as_ref().map(|b| !b.can_execute()).unwrap_or(false);

            let result = if denied {
                // Short-circuit: the transport is never touched and no job
                // is enqueued.
                EffectResult::fail(Error::upstream_unavailable(
                    effect.kind_str(),
                    effect.target.clone(),
                ))
            } else {
                let queue = self.config.queue_name_effects.clone();
                let job = |phase: JobPhase| {
                    JobEvent::new(JobKind::Effect, phase, queue.clone(), need_seq, effect_seq)
                };
                tel.job(job(JobPhase::Enqueued));
                tel.job(job(JobPhase::Taken));
                tel.job(job(JobPhase::Started));
                let result =
                    run_attempt(self.runner.as_ref(), rctx, effect, deadline, cancel.clone()).await;
                tel.job(job(JobPhase::Completed));
                if let Some(b) = &breaker {
                    observe_breaker(b, &result);
                }
                result
            };

            match &result {
                EffectResult::Success { bytes, .. } => {
                    tel.effect_end(effect_seq, true, bytes.len() as u64, None);
                    return result;
                }
                EffectResult::Failure(err) => {
                    tel.effect_end(effect_seq, false, 0, Some(err.ctx_string()));
                    if !retry_allowed(effect, attempt, err.kind, cancel, deadline) {
                        return result;
                    }
                    tokio::time::sleep(Duration::from_millis(
                        effect.retry.jittered_backoff(attempt),
                    ))
                    .await;
                    attempt += 1;
                }
            }
        }
    }

    /// Replay a collected task's attempts into the telemetry stream.
    fn replay_task(&self, tel: &mut Telemetry, need_seq: u64, output: &TaskOutput) {
        let effect = &output.effect;
        for record in &output.attempts {
            let effect_seq = tel.effect_start(
                effect.kind_str(),
                &effect.target,
                effect.kind.detail(),
                record.attempt,
            );
            if record.dispatched {
                let queue = self.config.queue_name_effects.clone();
                for phase in [
                    JobPhase::Enqueued,
                    JobPhase::Taken,
                    JobPhase::Started,
                    JobPhase::Completed,
                ] {
                    tel.job(JobEvent::new(
                        JobKind::Effect,
                        phase,
                        queue.clone(),
                        need_seq,
                        effect_seq,
                    ));
                }
            }
            match &record.result {
                EffectResult::Success { bytes, .. } => {
                    tel.effect_end(effect_seq, true, bytes.len() as u64, None);
                }
                EffectResult::Failure(err) => {
                    tel.effect_end(effect_seq, false, 0, Some(err.ctx_string()));
                }
            }
        }
    }

    /// Fire the compensations whose trigger class occurred, in reverse
    /// declaration order. Compensations cannot carry needs; each is a
    /// single effect dispatched through the normal pipeline, and its
    /// failure is logged but never escalated.
    async fn run_compensations(
        &self,
        compensations: &[Compensation],
        rctx: &RunnerCtx,
        tel: &mut Telemetry,
        need_seq: u64,
        any_failed: bool,
        any_cancelled: bool,
    ) {
        for comp in compensations.iter().rev() {
            let fire = match comp.trigger {
                CompensationTrigger::OnFailure => any_failed,
                CompensationTrigger::OnCancel => any_cancelled,
            };
            if !fire {
                continue;
            }
            tracing::debug!(label = %comp.label, "dispatching compensation");
            let result = self
                .dispatch_effect(rctx, &comp.effect, need_seq, tel, None, &CancelToken::never())
                .await;
            if let EffectResult::Failure(err) = result {
                tracing::warn!(label = %comp.label, "compensation failed: {err}");
            }
        }
    }

    /// Settle leftover background effect tasks at finalization.
    async fn drain_pending(
        &self,
        ctx: &mut Context,
        tel: &mut Telemetry,
        pending: &mut Vec<PendingTask>,
    ) {
        for task in pending.drain(..) {
            if task.publish {
                // Optional effect left running: publish only if it already
                // settled; otherwise its result is discarded.
                match task.fut.now_or_never() {
                    Some((_, Ok(output))) => {
                        let token = output.effect.token;
                        self.replay_task(tel, task.need_seq, &output);
                        if let EffectResult::Success { bytes, .. } = output.result {
                            ctx.slot_put(token, bytes);
                        }
                    }
                    _ => {
                        if let Some(signal) = &task.signal {
                            signal.cancel();
                        }
                    }
                }
            } else {
                // Cancelled join loser: wait briefly for its terminal
                // result so its telemetry lands before request_end.
                match tokio::time::timeout(Duration::from_millis(DRAIN_GRACE_MS), task.fut).await {
                    Ok((_, Ok(output))) => {
                        self.replay_task(tel, task.need_seq, &output);
                    }
                    Ok((index, Err(_))) => {
                        tracing::warn!(index, "cancelled effect task dropped its result");
                    }
                    Err(_) => {
                        tracing::warn!("cancelled effect did not settle before finalization");
                    }
                }
            }
        }
    }
}

/// The body of one parallel effect task: the retry loop without any
/// telemetry, which the executor replays at collection time.
async fn run_task(
    runner: Arc<dyn EffectRunner>,
    breakers: Arc<BreakerPool>,
    rctx: RunnerCtx,
    effect: Effect,
    index: usize,
    deadline: Option<Instant>,
    cancel: CancelToken,
) -> TaskOutput {
    let mut attempts = Vec::new();
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            let result =
                EffectResult::fail(Error::aborted(effect.kind_str(), effect.target.clone()));
            attempts.push(AttemptRecord {
                attempt,
                dispatched: false,
                result: result.clone(),
            });
            return TaskOutput {
                index,
                effect,
                attempts,
                result,
            };
        }

        let breaker = breakers.lookup(&effect.target);
        let denied = breaker.as_ref().map(|b| !b.can_execute()).unwrap_or(false);
        let (dispatched, result) = if denied {
            (
                false,
                EffectResult::fail(Error::upstream_unavailable(
                    effect.kind_str(),
                    effect.target.clone(),
                )),
            )
        } else {
            let result =
                run_attempt(runner.as_ref(), &rctx, &effect, deadline, cancel.clone()).await;
            if let Some(b) = &breaker {
                observe_breaker(b, &result);
            }
            (true, result)
        };
        attempts.push(AttemptRecord {
            attempt,
            dispatched,
            result: result.clone(),
        });

        if result.is_success() {
            return TaskOutput {
                index,
                effect,
                attempts,
                result,
            };
        }
        let kind = result
            .error()
            .map(|e| e.kind)
            .unwrap_or(ErrorKind::InternalError);
        if !retry_allowed(&effect, attempt, kind, &cancel, deadline) {
            return TaskOutput {
                index,
                effect,
                attempts,
                result,
            };
        }
        tokio::time::sleep(Duration::from_millis(effect.retry.jittered_backoff(attempt))).await;
        attempt += 1;
    }
}

/// One runner invocation bounded by the effect timeout and the request
/// deadline.
async fn run_attempt(
    runner: &dyn EffectRunner,
    rctx: &RunnerCtx,
    effect: &Effect,
    deadline: Option<Instant>,
    cancel: CancelToken,
) -> EffectResult {
    let mut timeout = Duration::from_millis(effect.timeout_ms);
    if let Some(d) = deadline {
        let remaining = d.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return EffectResult::fail(Error::timeout(effect.kind_str(), effect.target.clone()));
        }
        timeout = timeout.min(remaining);
    }
    match tokio::time::timeout(timeout, runner.run(effect, rctx, cancel)).await {
        Ok(result) => result,
        Err(_) => EffectResult::fail(Error::timeout(effect.kind_str(), effect.target.clone())),
    }
}

fn observe_breaker(breaker: &CircuitBreaker, result: &EffectResult) {
    match result {
        EffectResult::Success { .. } => breaker.record_success(),
        // Cancellation says nothing about upstream health.
        EffectResult::Failure(err) if err.kind != ErrorKind::Aborted => breaker.record_failure(),
        EffectResult::Failure(_) => {}
    }
}

fn retry_allowed(
    effect: &Effect,
    attempt: u32,
    error_kind: ErrorKind,
    cancel: &CancelToken,
    deadline: Option<Instant>,
) -> bool {
    effect.required
        && attempt < effect.retry.max_attempts
        && error_kind != ErrorKind::Aborted
        && !cancel.is_cancelled()
        && !deadline_passed(deadline)
}

fn deadline_passed(deadline: Option<Instant>) -> bool {
    deadline.map(|d| Instant::now() >= d).unwrap_or(false)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

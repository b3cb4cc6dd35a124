//! OTLP Request Recorder
//!
//! Subscribes to the telemetry stream and maintains one in-flight
//! `RequestRecord` per request id: a root SERVER span, step spans
//! (INTERNAL, nested by the active-step stack), effect spans (CLIENT,
//! parented by the innermost active step) and per-job timing state.
//!
//! Jobs whose dequeue wait or total parked time crosses the configured
//! thresholds are promoted to dedicated `zerver.job.*` spans with their
//! full lifecycle backfilled; everything else contributes plain events to
//! the owning span. On `request_end` the finished tree is assembled into
//! a single OTLP payload and handed to the export sink.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::export::{build_payload, ExportSink, Resource};
use super::semconv::effect_attributes;
use super::span::{new_trace_id, KeyValue, Span, SpanEvent, SpanKind};
use crate::config::TelemetryConfig;
use crate::event::{EventKind, JobEvent, JobKind, JobPhase, Outcome, ParkCause, TelemetryEvent};
use crate::subscriber::Subscriber;

#[derive(Debug, Clone)]
struct OpenPark {
    cause: ParkCause,
    token: Option<u64>,
    park_ms: u64,
    concurrency: Option<(u64, u64)>,
}

#[derive(Debug, Clone)]
struct ParkEpisode {
    cause: ParkCause,
    token: Option<u64>,
    park_ms: u64,
    resume_ms: u64,
    concurrency: Option<(u64, u64)>,
}

#[derive(Debug)]
struct JobState {
    kind: JobKind,
    queue: String,
    need_seq: u64,
    job_seq: u64,
    worker: Option<u32>,
    enqueue_ms: u64,
    take_ms: Option<u64>,
    start_ms: Option<u64>,
    episodes: Vec<ParkEpisode>,
    open_park: Option<OpenPark>,
    /// Step-stack depth at enqueue time.
    depth: u64,
}

struct RequestRecord {
    trace_id: String,
    root: Span,
    children: Vec<Span>,
    /// Innermost active step last.
    step_stack: Vec<u64>,
    step_spans: HashMap<u64, usize>,
    effect_spans: HashMap<u64, usize>,
    jobs: HashMap<(JobKind, u64), JobState>,
}

impl RequestRecord {
    fn new(request_id: &str, method: &str, path: &str, ts_ms: u64) -> Self {
        let trace_id = new_trace_id();
        let mut root = Span::new(trace_id.clone(), None, "zerver.request", SpanKind::Server, ts_ms);
        root.push_attrs([
            KeyValue::new("http.method", method),
            KeyValue::new("http.target", path),
            KeyValue::new("zerver.request_id", request_id),
        ]);
        Self {
            trace_id,
            root,
            children: Vec::new(),
            step_stack: Vec::new(),
            step_spans: HashMap::new(),
            effect_spans: HashMap::new(),
            jobs: HashMap::new(),
        }
    }

    /// Span id of the innermost active step, else the root.
    fn active_parent_id(&self) -> String {
        self.step_stack
            .last()
            .and_then(|seq| self.step_spans.get(seq))
            .map(|&idx| self.children[idx].span_id.clone())
            .unwrap_or_else(|| self.root.span_id.clone())
    }

    /// Push an event onto the innermost active step span, else the root.
    fn push_event_on_active(&mut self, event: SpanEvent) {
        if let Some(&idx) = self
            .step_stack
            .last()
            .and_then(|seq| self.step_spans.get(seq))
        {
            self.children[idx].push_event(event);
        } else {
            self.root.push_event(event);
        }
    }
}

/// Telemetry subscriber producing OTLP span trees.
pub struct OtlpRecorder {
    config: TelemetryConfig,
    resource: Resource,
    sink: Arc<dyn ExportSink>,
    inflight: Mutex<HashMap<String, RequestRecord>>,
}

impl OtlpRecorder {
    pub fn new(config: TelemetryConfig, sink: Arc<dyn ExportSink>) -> Self {
        let resource = Resource::new(config.environment.clone());
        Self {
            config,
            resource,
            sink,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn inflight_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, RequestRecord>> {
        self.inflight.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn handle_request_start(&self, event: &TelemetryEvent, method: &str, path: &str) {
        let record = RequestRecord::new(&event.request_id, method, path, event.ts_ms);
        self.lock().insert(event.request_id.clone(), record);
    }

    fn handle_step_start(&self, event: &TelemetryEvent, name: &str, step_seq: u64, layer: &str) {
        let mut map = self.lock();
        let Some(record) = map.get_mut(&event.request_id) else {
            return;
        };
        let parent = record.active_parent_id();
        let mut span = Span::new(
            record.trace_id.clone(),
            Some(parent),
            format!("zerver.step.{name}"),
            SpanKind::Internal,
            event.ts_ms,
        );
        span.push_attrs([
            KeyValue::new("zerver.layer", layer),
            KeyValue::new("zerver.step_seq", step_seq),
        ]);
        record.children.push(span);
        let idx = record.children.len() - 1;
        record.step_spans.insert(step_seq, idx);
        record.step_stack.push(step_seq);
    }

    fn handle_step_end(&self, event: &TelemetryEvent, step_seq: u64, decision: &str) {
        let mut map = self.lock();
        let Some(record) = map.get_mut(&event.request_id) else {
            return;
        };
        record.step_stack.retain(|&s| s != step_seq);
        if let Some(&idx) = record.step_spans.get(&step_seq) {
            let span = &mut record.children[idx];
            span.push_attr(KeyValue::new("zerver.decision", decision));
            span.end(event.ts_ms);
        }
    }

    fn handle_effect_start(
        &self,
        event: &TelemetryEvent,
        effect_seq: u64,
        kind: &str,
        target: &str,
        detail: Option<&str>,
        attempt: u32,
    ) {
        let mut map = self.lock();
        let Some(record) = map.get_mut(&event.request_id) else {
            return;
        };
        let parent = record.active_parent_id();
        let mut span = Span::new(
            record.trace_id.clone(),
            Some(parent),
            format!("zerver.effect.{kind}"),
            SpanKind::Client,
            event.ts_ms,
        );
        span.push_attrs(effect_attributes(kind, target, detail));
        span.push_attrs([
            KeyValue::new("zerver.effect_seq", effect_seq),
            KeyValue::new("zerver.attempt", attempt as u64),
        ]);
        record.children.push(span);
        let idx = record.children.len() - 1;
        record.effect_spans.insert(effect_seq, idx);
    }

    fn handle_effect_end(
        &self,
        event: &TelemetryEvent,
        effect_seq: u64,
        ok: bool,
        bytes: u64,
        error_ctx: Option<&str>,
    ) {
        let mut map = self.lock();
        let Some(record) = map.get_mut(&event.request_id) else {
            return;
        };
        if let Some(&idx) = record.effect_spans.get(&effect_seq) {
            let span = &mut record.children[idx];
            span.push_attr(KeyValue::new("zerver.bytes", bytes));
            if !ok {
                span.set_error(error_ctx.unwrap_or("effect failed"));
            }
            span.end(event.ts_ms);
        }
    }

    fn handle_job(&self, event: &TelemetryEvent, job: &JobEvent) {
        let mut map = self.lock();
        let Some(record) = map.get_mut(&event.request_id) else {
            return;
        };
        let key = (job.kind, job.job_seq);
        let ts = event.ts_ms;
        match job.phase {
            JobPhase::Enqueued => {
                let depth = record.step_stack.len() as u64;
                record.jobs.insert(
                    key,
                    JobState {
                        kind: job.kind,
                        queue: job.queue.clone(),
                        need_seq: job.need_seq,
                        job_seq: job.job_seq,
                        worker: job.worker,
                        enqueue_ms: ts,
                        take_ms: None,
                        start_ms: None,
                        episodes: Vec::new(),
                        open_park: None,
                        depth,
                    },
                );
            }
            JobPhase::Taken => {
                if let Some(state) = record.jobs.get_mut(&key) {
                    state.take_ms = Some(ts);
                    if job.worker.is_some() {
                        state.worker = job.worker;
                    }
                }
            }
            JobPhase::Started => {
                if let Some(state) = record.jobs.get_mut(&key) {
                    state.start_ms = Some(ts);
                }
            }
            JobPhase::Parked => {
                if let Some(state) = record.jobs.get_mut(&key) {
                    if state.open_park.is_some() {
                        tracing::warn!(job_seq = job.job_seq, "park while already parked");
                    }
                    state.open_park = Some(OpenPark {
                        cause: job.cause.unwrap_or(ParkCause::Other),
                        token: job.token,
                        park_ms: ts,
                        concurrency: job
                            .concurrency_current
                            .zip(job.concurrency_max),
                    });
                }
            }
            JobPhase::Resumed => {
                if let Some(state) = record.jobs.get_mut(&key) {
                    if let Some(open) = state.open_park.take() {
                        state.episodes.push(ParkEpisode {
                            cause: open.cause,
                            token: open.token,
                            park_ms: open.park_ms,
                            resume_ms: ts,
                            concurrency: open.concurrency,
                        });
                    }
                }
            }
            JobPhase::Completed => {
                if let Some(mut state) = record.jobs.remove(&key) {
                    // A park never resumed ends with the job.
                    if let Some(open) = state.open_park.take() {
                        state.episodes.push(ParkEpisode {
                            cause: open.cause,
                            token: open.token,
                            park_ms: open.park_ms,
                            resume_ms: ts,
                            concurrency: open.concurrency,
                        });
                    }
                    self.finalize_job(record, state, ts);
                }
            }
        }
    }

    fn finalize_job(&self, record: &mut RequestRecord, state: JobState, end_ms: u64) {
        let enqueue = state.enqueue_ms;
        let take = state.take_ms.unwrap_or(enqueue);
        let start = state.start_ms.unwrap_or(take);

        let queue_wait_ms = take.saturating_sub(enqueue);
        let dispatch_ms = start.saturating_sub(take);
        let park_wait_ms_total: u64 = state
            .episodes
            .iter()
            .map(|e| e.resume_ms.saturating_sub(e.park_ms))
            .sum();
        let run_active_ms = end_ms
            .saturating_sub(start)
            .saturating_sub(park_wait_ms_total);
        let total_ms = end_ms.saturating_sub(enqueue);

        let promote = self.config.debug_jobs
            || queue_wait_ms >= self.config.promote_queue_ms as u64
            || park_wait_ms_total >= self.config.promote_park_ms as u64;

        let owner_idx = match state.kind {
            JobKind::Effect => record.effect_spans.get(&state.job_seq).copied(),
            JobKind::Step => record.step_spans.get(&state.job_seq).copied(),
        };

        let mut events = Vec::with_capacity(4 + 2 * state.episodes.len());
        let prefix = state.kind.as_str();
        events.push(SpanEvent::new(format!("{prefix}_job_enqueued"), enqueue));
        let mut taken = SpanEvent::new(format!("{prefix}_job_taken"), take);
        if let Some(worker) = state.worker {
            taken = taken.with_attr(KeyValue::new("zerver.worker", worker as u64));
        }
        events.push(taken);
        events.push(SpanEvent::new(format!("{prefix}_job_started"), start));
        for episode in &state.episodes {
            let mut parked = SpanEvent::new(format!("{prefix}_job_parked"), episode.park_ms)
                .with_attr(KeyValue::new("zerver.park.cause", episode.cause.as_str()));
            if let Some(token) = episode.token {
                parked = parked.with_attr(KeyValue::new("zerver.park.token", token));
            }
            if let Some((current, max)) = episode.concurrency {
                parked = parked
                    .with_attr(KeyValue::new("zerver.concurrency.current", current))
                    .with_attr(KeyValue::new("zerver.concurrency.max", max));
            }
            events.push(parked);
            events.push(SpanEvent::new(
                format!("{prefix}_job_resumed"),
                episode.resume_ms,
            ));
        }
        events.push(SpanEvent::new(format!("{prefix}_job_completed"), end_ms));

        if promote {
            let parent = owner_idx
                .map(|idx| record.children[idx].span_id.clone())
                .unwrap_or_else(|| record.root.span_id.clone());
            let mut span = Span::new(
                record.trace_id.clone(),
                Some(parent),
                format!("zerver.job.{}", state.kind.as_str()),
                SpanKind::Internal,
                enqueue,
            );
            span.push_attrs([
                KeyValue::new("zerver.queue", state.queue.as_str()),
                KeyValue::new("zerver.need_seq", state.need_seq),
                KeyValue::new("queue_wait_ms", queue_wait_ms),
                KeyValue::new("dispatch_ms", dispatch_ms),
                KeyValue::new("park_wait_ms_total", park_wait_ms_total),
                KeyValue::new("park_count", state.episodes.len() as u64),
                KeyValue::new("run_active_ms", run_active_ms),
                KeyValue::new("total_ms", total_ms),
            ]);
            if let Some(worker) = state.worker {
                span.push_attr(KeyValue::new("zerver.worker", worker as u64));
            }
            if self.config.export_job_depth {
                span.push_attr(KeyValue::new("zerver.job.depth", state.depth));
            }
            for event in events {
                span.push_event(event);
            }
            span.end(end_ms);
            record.children.push(span);
        } else {
            match owner_idx {
                Some(idx) => {
                    for event in events {
                        record.children[idx].push_event(event);
                    }
                }
                None => {
                    for event in events {
                        record.root.push_event(event);
                    }
                }
            }
        }
    }

    fn handle_request_end(&self, event: &TelemetryEvent, status: u16, outcome: Outcome) {
        let record = self.lock().remove(&event.request_id);
        let Some(mut record) = record else {
            return;
        };

        record
            .root
            .push_attr(KeyValue::new("http.status_code", status as u64));
        record
            .root
            .push_attr(KeyValue::new("zerver.outcome", outcome.as_str()));
        if !matches!(outcome, Outcome::Done) {
            record.root.set_error(outcome.as_str());
        }
        record.root.end(event.ts_ms);

        // Anything still open did not report its own end.
        for span in record.children.iter_mut().filter(|s| s.is_open()) {
            span.set_error("incomplete");
            span.end(event.ts_ms);
        }

        let mut spans = Vec::with_capacity(1 + record.children.len());
        spans.push(record.root);
        spans.extend(record.children);
        let payload = build_payload(&self.resource, &spans);
        self.sink.export(payload);
    }
}

impl Subscriber for OtlpRecorder {
    fn on_event(&self, event: &TelemetryEvent) {
        match &event.kind {
            EventKind::RequestStart { method, path } => {
                self.handle_request_start(event, method, path);
            }
            EventKind::RequestEnd { status, outcome, .. } => {
                self.handle_request_end(event, *status, *outcome);
            }
            EventKind::StepStart {
                layer,
                name,
                step_seq,
            } => {
                self.handle_step_start(event, name, *step_seq, layer.as_str());
            }
            EventKind::StepEnd {
                step_seq, decision, ..
            } => {
                self.handle_step_end(event, *step_seq, decision.as_str());
            }
            EventKind::NeedScheduled {
                need_seq,
                effect_count,
                mode,
                join,
            } => {
                let mut map = self.lock();
                if let Some(record) = map.get_mut(&event.request_id) {
                    let span_event = SpanEvent::new("need_scheduled", event.ts_ms)
                        .with_attr(KeyValue::new("zerver.need_seq", *need_seq))
                        .with_attr(KeyValue::new("zerver.effect_count", *effect_count as u64))
                        .with_attr(KeyValue::new("zerver.mode", mode.as_str()))
                        .with_attr(KeyValue::new("zerver.join", join.as_str()));
                    record.push_event_on_active(span_event);
                }
            }
            EventKind::StepResume { need_seq, .. } => {
                let mut map = self.lock();
                if let Some(record) = map.get_mut(&event.request_id) {
                    let span_event = SpanEvent::new("step_resume", event.ts_ms)
                        .with_attr(KeyValue::new("zerver.need_seq", *need_seq));
                    record.push_event_on_active(span_event);
                }
            }
            EventKind::StepWait { need_seq } => {
                let mut map = self.lock();
                if let Some(record) = map.get_mut(&event.request_id) {
                    let span_event = SpanEvent::new("step_wait", event.ts_ms)
                        .with_attr(KeyValue::new("zerver.need_seq", *need_seq));
                    record.push_event_on_active(span_event);
                }
            }
            EventKind::EffectStart {
                effect_seq,
                kind,
                target,
                detail,
                attempt,
            } => {
                self.handle_effect_start(
                    event,
                    *effect_seq,
                    kind,
                    target,
                    detail.as_deref(),
                    *attempt,
                );
            }
            EventKind::EffectEnd {
                effect_seq,
                ok,
                bytes,
                error_ctx,
                ..
            } => {
                self.handle_effect_end(event, *effect_seq, *ok, *bytes, error_ctx.as_deref());
            }
            EventKind::ExecutorCrash { phase, error_name } => {
                let mut map = self.lock();
                if let Some(record) = map.get_mut(&event.request_id) {
                    let span_event = SpanEvent::new("executor_crash", event.ts_ms)
                        .with_attr(KeyValue::new("zerver.phase", phase.as_str()))
                        .with_attr(KeyValue::new("zerver.error", error_name.as_str()));
                    record.root.push_event(span_event);
                    record.root.set_error(error_name.as_str());
                }
            }
            EventKind::Job(job) => {
                self.handle_job(event, job);
            }
        }
    }
}

//! Per-Request Telemetry Recorder
//!
//! One `Telemetry` instance lives for the duration of a request. It
//! assigns the request's sequence numbers, keeps LIFO stacks of open
//! step/effect frames so starts and ends pair up, appends every event to
//! an in-memory log, and forwards each event synchronously to the
//! subscribers.

use std::sync::Arc;

use zerver_types::{DecisionLabel, DispatchMode, JoinPolicy, Layer};

use crate::event::{EventKind, JobEvent, Outcome, TelemetryEvent};
use crate::subscriber::Subscriber;

/// Milliseconds since the Unix epoch, saturating at zero on clock
/// regression.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

#[derive(Debug)]
struct OpenStep {
    name: String,
    step_seq: u64,
}

#[derive(Debug)]
struct OpenEffect {
    effect_seq: u64,
    kind: &'static str,
    attempt: u32,
}

/// Per-request telemetry buffer and fan-out point.
pub struct Telemetry {
    request_id: String,
    subscribers: Vec<Arc<dyn Subscriber>>,

    next_seq: u64,
    next_step_seq: u64,
    next_need_seq: u64,
    next_effect_seq: u64,

    open_steps: Vec<OpenStep>,
    open_effects: Vec<OpenEffect>,

    events: Vec<TelemetryEvent>,
    started_ms: u64,
    bytes_in: u64,
    bytes_out: u64,
    finished: bool,
}

impl Telemetry {
    pub fn new(request_id: impl Into<String>, subscribers: Vec<Arc<dyn Subscriber>>) -> Self {
        Self {
            request_id: request_id.into(),
            subscribers,
            next_seq: 1,
            next_step_seq: 0,
            next_need_seq: 0,
            next_effect_seq: 0,
            open_steps: Vec::new(),
            open_effects: Vec::new(),
            events: Vec::new(),
            started_ms: now_ms(),
            bytes_in: 0,
            bytes_out: 0,
            finished: false,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn add_bytes_in(&mut self, n: u64) {
        self.bytes_in += n;
    }

    pub fn add_bytes_out(&mut self, n: u64) {
        self.bytes_out += n;
    }

    fn emit(&mut self, kind: EventKind) {
        let event = TelemetryEvent {
            request_id: self.request_id.clone(),
            seq: self.next_seq,
            ts_ms: now_ms(),
            kind,
        };
        self.next_seq += 1;
        for sub in &self.subscribers {
            sub.on_event(&event);
        }
        self.events.push(event);
    }

    // ── Request frame ───────────────────────────────────────────────────

    pub fn request_start(&mut self, method: &str, path: &str) {
        self.started_ms = now_ms();
        self.emit(EventKind::RequestStart {
            method: method.to_string(),
            path: path.to_string(),
        });
    }

    // ── Step frames ─────────────────────────────────────────────────────

    pub fn step_start(&mut self, layer: Layer, name: &str) -> u64 {
        self.next_step_seq += 1;
        let step_seq = self.next_step_seq;
        self.open_steps.push(OpenStep {
            name: name.to_string(),
            step_seq,
        });
        self.emit(EventKind::StepStart {
            layer,
            name: name.to_string(),
            step_seq,
        });
        step_seq
    }

    pub fn step_end(&mut self, step_seq: u64, decision: DecisionLabel) {
        // LIFO pair match: the closing frame is normally on top, but a
        // force-close may reach deeper.
        let idx = self
            .open_steps
            .iter()
            .rposition(|s| s.step_seq == step_seq);
        let name = match idx {
            Some(i) => self.open_steps.remove(i).name,
            None => {
                tracing::warn!(step_seq, "step_end without matching step_start");
                return;
            }
        };
        self.emit(EventKind::StepEnd {
            name,
            step_seq,
            decision,
        });
    }

    // ── Needs ───────────────────────────────────────────────────────────

    pub fn next_need_seq(&mut self) -> u64 {
        self.next_need_seq += 1;
        self.next_need_seq
    }

    pub fn need_scheduled(
        &mut self,
        need_seq: u64,
        effect_count: usize,
        mode: DispatchMode,
        join: JoinPolicy,
    ) {
        self.emit(EventKind::NeedScheduled {
            need_seq,
            effect_count,
            mode,
            join,
        });
    }

    pub fn step_wait(&mut self, need_seq: u64) {
        self.emit(EventKind::StepWait { need_seq });
    }

    pub fn step_resume(&mut self, need_seq: u64, mode: DispatchMode, join: JoinPolicy) {
        self.emit(EventKind::StepResume {
            need_seq,
            mode,
            join,
        });
    }

    // ── Effect frames ───────────────────────────────────────────────────

    /// Open an effect frame. Each retry attempt gets a fresh sequence so
    /// starts and ends always pair one-to-one.
    pub fn effect_start(
        &mut self,
        kind: &'static str,
        target: &str,
        detail: Option<&str>,
        attempt: u32,
    ) -> u64 {
        self.next_effect_seq += 1;
        let effect_seq = self.next_effect_seq;
        self.open_effects.push(OpenEffect {
            effect_seq,
            kind,
            attempt,
        });
        self.emit(EventKind::EffectStart {
            effect_seq,
            kind: kind.to_string(),
            target: target.to_string(),
            detail: detail.map(|s| s.to_string()),
            attempt,
        });
        effect_seq
    }

    pub fn effect_end(
        &mut self,
        effect_seq: u64,
        ok: bool,
        bytes: u64,
        error_ctx: Option<String>,
    ) {
        let idx = self
            .open_effects
            .iter()
            .rposition(|e| e.effect_seq == effect_seq);
        let (kind, attempt) = match idx {
            Some(i) => {
                let frame = self.open_effects.remove(i);
                (frame.kind, frame.attempt)
            }
            None => {
                tracing::warn!(effect_seq, "effect_end without matching effect_start");
                return;
            }
        };
        self.emit(EventKind::EffectEnd {
            effect_seq,
            kind: kind.to_string(),
            ok,
            bytes,
            error_ctx,
            attempt,
        });
    }

    // ── Jobs / crash ────────────────────────────────────────────────────

    pub fn job(&mut self, event: JobEvent) {
        self.emit(EventKind::Job(event));
    }

    pub fn executor_crash(&mut self, phase: &str, error_name: &str) {
        self.emit(EventKind::ExecutorCrash {
            phase: phase.to_string(),
            error_name: error_name.to_string(),
        });
    }

    // ── Finish ──────────────────────────────────────────────────────────

    /// Close the request: force-close any still-open frames (marked as
    /// errors), emit `request_end`, and return the serialized event log.
    pub fn finish(
        &mut self,
        status: u16,
        outcome: Outcome,
        content_type: Option<String>,
        body_bytes: Option<u64>,
        streaming: bool,
    ) -> String {
        if self.finished {
            tracing::warn!(request_id = %self.request_id, "finish called twice");
            return self.log_json();
        }
        self.finished = true;

        // Drain in LIFO order; unbalanced frames indicate a crashed or
        // cancelled request.
        while let Some(frame) = self.open_effects.last() {
            let seq = frame.effect_seq;
            self.effect_end(seq, false, 0, Some("incomplete".to_string()));
        }
        while let Some(frame) = self.open_steps.last() {
            let seq = frame.step_seq;
            self.step_end(seq, DecisionLabel::Fail);
        }

        let duration_ms = now_ms().saturating_sub(self.started_ms);
        let (bytes_in, bytes_out) = (self.bytes_in, self.bytes_out);
        self.emit(EventKind::RequestEnd {
            status,
            outcome,
            duration_ms,
            content_type,
            body_bytes,
            streaming,
            bytes_in,
            bytes_out,
        });
        self.log_json()
    }

    fn log_json(&self) -> String {
        serde_json::to_string(&self.events).unwrap_or_else(|e| {
            tracing::error!("failed to serialize telemetry log: {e}");
            "[]".to_string()
        })
    }

    /// The in-memory event log (program order for this request).
    pub fn events(&self) -> &[TelemetryEvent] {
        &self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{JobKind, JobPhase};
    use crate::subscriber::MemorySubscriber;

    fn telemetry_with_sink() -> (Telemetry, Arc<MemorySubscriber>) {
        let sink = Arc::new(MemorySubscriber::new());
        let tel = Telemetry::new("req-1", vec![sink.clone() as Arc<dyn Subscriber>]);
        (tel, sink)
    }

    #[test]
    fn test_sequences_strictly_increase() {
        let (mut tel, _) = telemetry_with_sink();
        tel.request_start("GET", "/");
        let s = tel.step_start(Layer::Main, "a");
        tel.step_end(s, DecisionLabel::Continue);
        tel.finish(200, Outcome::Done, None, Some(0), false);

        let seqs: Vec<u64> = tel.events().iter().map(|e| e.seq).collect();
        for pair in seqs.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn test_step_frames_balance() {
        let (mut tel, _) = telemetry_with_sink();
        tel.request_start("GET", "/");
        let a = tel.step_start(Layer::Main, "a");
        tel.step_end(a, DecisionLabel::Done);
        tel.finish(200, Outcome::Done, None, Some(0), false);

        let starts = tel
            .events()
            .iter()
            .filter(|e| matches!(e.kind, EventKind::StepStart { .. }))
            .count();
        let ends = tel
            .events()
            .iter()
            .filter(|e| matches!(e.kind, EventKind::StepEnd { .. }))
            .count();
        assert_eq!(starts, ends);
    }

    #[test]
    fn test_finish_force_closes_open_frames() {
        let (mut tel, _) = telemetry_with_sink();
        tel.request_start("GET", "/");
        let _step = tel.step_start(Layer::Main, "a");
        let _eff = tel.effect_start("db_get", "db", Some("k"), 0);
        tel.finish(500, Outcome::Crashed, None, None, false);

        let forced_effect = tel.events().iter().any(|e| {
            matches!(
                &e.kind,
                EventKind::EffectEnd { ok: false, error_ctx: Some(ctx), .. } if ctx == "incomplete"
            )
        });
        assert!(forced_effect);

        let forced_step = tel.events().iter().any(|e| {
            matches!(
                &e.kind,
                EventKind::StepEnd { decision: DecisionLabel::Fail, .. }
            )
        });
        assert!(forced_step);

        // Last event is request_end.
        assert!(matches!(
            tel.events().last().map(|e| &e.kind),
            Some(EventKind::RequestEnd { .. })
        ));
    }

    #[test]
    fn test_each_attempt_gets_new_effect_seq() {
        let (mut tel, _) = telemetry_with_sink();
        let first = tel.effect_start("http_get", "api", None, 0);
        tel.effect_end(first, false, 0, Some("api/".to_string()));
        let second = tel.effect_start("http_get", "api", None, 1);
        tel.effect_end(second, true, 10, None);
        assert_ne!(first, second);
    }

    #[test]
    fn test_subscriber_sees_every_event() {
        let (mut tel, sink) = telemetry_with_sink();
        tel.request_start("GET", "/");
        tel.job(JobEvent::new(JobKind::Effect, JobPhase::Enqueued, "effects", 1, 1));
        tel.finish(200, Outcome::Done, None, Some(0), false);
        assert_eq!(sink.len(), tel.events().len());
    }

    #[test]
    fn test_log_serializes_to_json_array() {
        let (mut tel, _) = telemetry_with_sink();
        tel.request_start("GET", "/x");
        let json = tel.finish(200, Outcome::Done, Some("application/json".into()), Some(2), false);
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(parsed.is_array());
        assert_eq!(parsed[0]["event"], "request_start");
    }
}

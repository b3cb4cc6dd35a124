//! Property tests for telemetry frame balance and job promotion.

use std::sync::Arc;

use proptest::prelude::*;

use zerver_telemetry::otlp::{MemorySink, OtlpRecorder};
use zerver_telemetry::{
    EventKind, JobEvent, JobKind, JobPhase, MemorySubscriber, Outcome, Subscriber, Telemetry,
    TelemetryConfig, TelemetryEvent,
};
use zerver_types::{DecisionLabel, Layer};

proptest! {
    /// However a request interleaves steps and effects - including ones
    /// left open - the finished log balances starts and ends and carries
    /// strictly increasing sequence ids.
    #[test]
    fn frames_balance_and_seqs_increase(
        step_count in 0usize..6,
        open_effects in 0usize..3,
        close_normally in any::<bool>(),
    ) {
        let sink = Arc::new(MemorySubscriber::new());
        let mut tel = Telemetry::new("req", vec![sink.clone() as Arc<dyn Subscriber>]);
        tel.request_start("GET", "/");

        for i in 0..step_count {
            let step_seq = tel.step_start(Layer::Main, &format!("step{i}"));
            let effect_seq = tel.effect_start("db_get", "db", None, 0);
            tel.effect_end(effect_seq, true, 1, None);
            if close_normally {
                tel.step_end(step_seq, DecisionLabel::Continue);
            }
        }
        for _ in 0..open_effects {
            tel.effect_start("http_get", "api", None, 0);
        }
        tel.finish(200, Outcome::Done, None, Some(0), false);

        let events = tel.events();
        let step_starts = events.iter().filter(|e| matches!(e.kind, EventKind::StepStart { .. })).count();
        let step_ends = events.iter().filter(|e| matches!(e.kind, EventKind::StepEnd { .. })).count();
        let effect_starts = events.iter().filter(|e| matches!(e.kind, EventKind::EffectStart { .. })).count();
        let effect_ends = events.iter().filter(|e| matches!(e.kind, EventKind::EffectEnd { .. })).count();
        prop_assert_eq!(step_starts, step_ends);
        prop_assert_eq!(effect_starts, effect_ends);

        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        prop_assert!(seqs.windows(2).all(|w| w[0] < w[1]));

        // The subscriber saw the identical stream.
        prop_assert_eq!(sink.len(), events.len());
    }

    /// A job is promoted to a dedicated span exactly when queue wait or
    /// total park time reaches a threshold, and the promoted span covers
    /// enqueue..end with the full lifecycle backfilled.
    #[test]
    fn promotion_tracks_thresholds(
        queue_wait in 0u64..20,
        park_wait in 0u64..20,
        run_ms in 0u64..10,
    ) {
        let config = TelemetryConfig::default();
        let sink = Arc::new(MemorySink::new());
        let recorder = OtlpRecorder::new(config.clone(), sink.clone());

        let enqueue = 0;
        let take = enqueue + queue_wait;
        let start = take;
        let park = start + 1;
        let resume = park + park_wait;
        let end = resume + run_ms;

        let mut seq = 0u64;
        let mut send = |ts: u64, kind: EventKind| {
            seq += 1;
            recorder.on_event(&TelemetryEvent {
                request_id: "r".to_string(),
                seq,
                ts_ms: ts,
                kind,
            });
        };

        send(0, EventKind::RequestStart { method: "GET".into(), path: "/".into() });
        let job = |phase| JobEvent::new(JobKind::Effect, phase, "effects", 1, 1);
        send(enqueue, EventKind::Job(job(JobPhase::Enqueued)));
        send(take, EventKind::Job(job(JobPhase::Taken)));
        send(start, EventKind::Job(job(JobPhase::Started)));
        if park_wait > 0 {
            send(park, EventKind::Job(job(JobPhase::Parked).parked(zerver_telemetry::ParkCause::IoWait)));
            send(resume, EventKind::Job(job(JobPhase::Resumed)));
        }
        send(end, EventKind::Job(job(JobPhase::Completed)));
        send(end + 1, EventKind::RequestEnd {
            status: 200,
            outcome: Outcome::Done,
            duration_ms: end + 1,
            content_type: None,
            body_bytes: None,
            streaming: false,
            bytes_in: 0,
            bytes_out: 0,
        });

        let payloads = sink.payloads();
        prop_assert_eq!(payloads.len(), 1);
        let spans = payloads[0]["resourceSpans"][0]["scopeSpans"][0]["spans"]
            .as_array()
            .cloned()
            .unwrap();
        let job_span = spans.iter().find(|s| s["name"] == "zerver.job.effect");

        let should_promote = queue_wait >= config.promote_queue_ms as u64
            || (park_wait > 0 && park_wait >= config.promote_park_ms as u64);
        prop_assert_eq!(job_span.is_some(), should_promote,
            "queue_wait={} park_wait={}", queue_wait, park_wait);

        if let Some(span) = job_span {
            prop_assert_eq!(span["startTimeUnixNano"].as_str(), Some(&*(enqueue * 1_000_000).to_string()));
            prop_assert_eq!(span["endTimeUnixNano"].as_str(), Some(&*(end as u128 * 1_000_000).to_string()));
            let park_episodes = if park_wait > 0 { 1 } else { 0 };
            let events = span["events"].as_array().unwrap();
            prop_assert_eq!(events.len(), 4 + 2 * park_episodes);
        }
    }
}

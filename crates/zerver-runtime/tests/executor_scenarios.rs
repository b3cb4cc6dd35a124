//! End-to-end executor scenarios against a scripted effect runner.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use zerver_context::Context;
use zerver_runtime::{
    BreakerConfig, BreakerPool, BreakerState, CancelToken, EffectRunner, Executor, ExecutorConfig,
    Route, RunnerCtx, Step,
};
use zerver_telemetry::{EventKind, MemorySubscriber, Outcome};
use zerver_types::{
    Compensation, Decision, Effect, Error, JoinPolicy, Layer, Need, Response, Retry,
};

/// What the scripted runner does for one effect, keyed by the effect's
/// detail (url/key) or target.
#[derive(Clone)]
enum Script {
    Ok(Vec<u8>),
    OkAfterMs(u64, Vec<u8>),
    Fail(Error),
    /// Fail this many times, then succeed with the bytes.
    FailTimes(u32, Error, Vec<u8>),
    /// Never completes on its own; cancellation or timeout ends it.
    Hang,
}

#[derive(Default)]
struct ScriptedRunner {
    scripts: Mutex<HashMap<String, Script>>,
    counters: Mutex<HashMap<String, u32>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    fn new() -> Self {
        Self::default()
    }

    fn script(self, key: &str, script: Script) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(key.to_string(), script);
        self
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn key_for(effect: &Effect) -> String {
        effect
            .kind
            .detail()
            .unwrap_or(&effect.target)
            .to_string()
    }
}

#[async_trait]
impl EffectRunner for ScriptedRunner {
    async fn run(
        &self,
        effect: &Effect,
        _rctx: &RunnerCtx,
        mut cancel: CancelToken,
    ) -> zerver_types::EffectResult {
        use zerver_types::EffectResult;

        let key = Self::key_for(effect);
        self.calls.lock().unwrap().push(key.clone());
        let script = self.scripts.lock().unwrap().get(&key).cloned();
        let aborted = || {
            EffectResult::fail(Error::aborted(effect.kind_str(), effect.target.clone()))
        };

        match script {
            None => EffectResult::fail(Error::not_found("runner", key)),
            Some(Script::Ok(bytes)) => EffectResult::ok(bytes),
            Some(Script::OkAfterMs(ms, bytes)) => {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => EffectResult::ok(bytes),
                    _ = cancel.cancelled() => aborted(),
                }
            }
            Some(Script::Fail(err)) => EffectResult::fail(err),
            Some(Script::FailTimes(times, err, bytes)) => {
                let mut counters = self.counters.lock().unwrap();
                let count = counters.entry(key).or_insert(0);
                *count += 1;
                if *count <= times {
                    EffectResult::fail(err)
                } else {
                    EffectResult::ok(bytes)
                }
            }
            Some(Script::Hang) => {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(3600)) => aborted(),
                    _ = cancel.cancelled() => aborted(),
                }
            }
        }
    }
}

/// Route executor logs through the test harness. Safe to call from every
/// test; only the first call installs the subscriber.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn executor_with(runner: ScriptedRunner) -> (Executor, Arc<MemorySubscriber>) {
    let events = Arc::new(MemorySubscriber::new());
    let executor = Executor::new(Arc::new(runner)).with_subscriber(events.clone());
    (executor, events)
}

fn event_names(events: &MemorySubscriber) -> Vec<String> {
    events
        .events()
        .iter()
        .map(|e| match &e.kind {
            EventKind::RequestStart { .. } => "request_start".to_string(),
            EventKind::RequestEnd { .. } => "request_end".to_string(),
            EventKind::StepStart { name, .. } => format!("step_start:{name}"),
            EventKind::StepEnd { decision, .. } => format!("step_end:{}", decision.as_str()),
            EventKind::NeedScheduled { .. } => "need_scheduled".to_string(),
            EventKind::StepResume { .. } => "step_resume".to_string(),
            EventKind::StepWait { .. } => "step_wait".to_string(),
            EventKind::EffectStart { kind, .. } => format!("effect_start:{kind}"),
            EventKind::EffectEnd { ok, .. } => format!("effect_end:{ok}"),
            EventKind::ExecutorCrash { .. } => "executor_crash".to_string(),
            EventKind::Job(job) => job.name(),
        })
        .collect()
}

fn assert_subsequence(haystack: &[String], needles: &[&str]) {
    let mut it = haystack.iter();
    for needle in needles {
        assert!(
            it.any(|name| name.as_str() == *needle),
            "missing {needle:?} (in order) in {haystack:?}"
        );
    }
}

fn request_outcome(events: &MemorySubscriber) -> Option<(u16, Outcome)> {
    events.events().iter().rev().find_map(|e| match &e.kind {
        EventKind::RequestEnd { status, outcome, .. } => Some((*status, *outcome)),
        _ => None,
    })
}

/// Happy path: one db_get, sequential all-join, resume reads the slot.
#[tokio::test]
async fn test_happy_path_db_get() {
    init_tracing();
    let runner = ScriptedRunner::new().script(
        "todo:42",
        Script::Ok(br#"{"id":"42","t":"x"}"#.to_vec()),
    );
    let (executor, events) = executor_with(runner);

    let route = Route::new(vec![Step::new("load_todo", Layer::Main, |ctx| {
        match ctx.slot_get(1).and_then(|v| v.as_bytes()) {
            Some(body) => Decision::Done(Response::json_bytes(200, body.to_vec())),
            None => {
                let key = format!("todo:{}", ctx.param("id").unwrap_or_default());
                Decision::Need(Need::single(Effect::db_get("db", key, 1)))
            }
        }
    })]);

    let mut ctx = Context::new("GET", "/todos/42");
    ctx.set_param("id", "42");
    let response = executor.execute(&mut ctx, &route).await;

    assert_eq!(response.status, 200);
    assert_eq!(
        response.body_bytes(),
        Some(br#"{"id":"42","t":"x"}"#.as_slice())
    );
    assert_eq!(response.header("x-request-id"), Some(ctx.request_id()));

    let names = event_names(&events);
    assert_subsequence(
        &names,
        &[
            "request_start",
            "step_start:load_todo",
            "need_scheduled",
            "effect_start:db_get",
            "effect_end:true",
            "step_resume",
            "step_end:done",
            "request_end",
        ],
    );
    assert_eq!(request_outcome(&events), Some((200, Outcome::Done)));
}

/// Required failure fires the OnFailure compensation and renders 502.
#[tokio::test]
async fn test_required_failure_runs_compensation() {
    init_tracing();
    let runner = Arc::new(
        ScriptedRunner::new()
            .script("pay", Script::Fail(Error::upstream_unavailable("payment", "charge")))
            .script("refund", Script::Ok(b"ok".to_vec())),
    );
    let events = Arc::new(MemorySubscriber::new());
    let executor = Executor::new(runner.clone()).with_subscriber(events.clone());

    let charge = Step::new("charge", Layer::Main, |_| {
        Decision::Need(
            Need::single(Effect::http_post("payments", "pay", b"{}".to_vec(), 2)).compensate(
                Compensation::on_failure(
                    "refund_charge",
                    Effect::http_post("payments", "refund", b"{}".to_vec(), 3),
                ),
            ),
        )
    });
    let ship = Step::new("ship", Layer::Main, |_| {
        Decision::Done(Response::with_status(201))
    });
    let route = Route::new(vec![charge, ship]);

    let mut ctx = Context::new("POST", "/orders");
    let response = executor.execute(&mut ctx, &route).await;

    assert_eq!(response.status, 502);
    assert_eq!(
        response.body_bytes(),
        Some(br#"{"error":{"code":502,"what":"payment","key":"charge"}}"#.as_slice())
    );

    // The compensation reached the runner; ship never ran.
    assert_eq!(runner.calls(), vec!["pay".to_string(), "refund".to_string()]);
    assert_eq!(request_outcome(&events), Some((502, Outcome::Fail)));
    let names = event_names(&events);
    assert!(!names.contains(&"step_start:ship".to_string()));
}

/// Any-join: first completion wins, the loser is cancelled and aborted.
#[tokio::test(start_paused = true)]
async fn test_any_join_cancels_loser() {
    init_tracing();
    let runner = Arc::new(
        ScriptedRunner::new()
            .script("http://a", Script::OkAfterMs(50, b"A".to_vec()))
            .script("http://b", Script::OkAfterMs(10, b"B".to_vec())),
    );
    let events = Arc::new(MemorySubscriber::new());
    let executor = Executor::new(runner.clone()).with_subscriber(events.clone());

    let route = Route::new(vec![Step::new("race", Layer::Main, |ctx| {
        if ctx.slot_contains(11) || ctx.slot_contains(12) {
            Decision::Done(Response::json(
                200,
                &serde_json::json!({
                    "a": ctx.slot_contains(11),
                    "b": ctx.slot_contains(12),
                }),
            ))
        } else {
            Decision::Need(
                Need::new(vec![
                    Effect::http_get("a", "http://a", 11),
                    Effect::http_get("b", "http://b", 12),
                ])
                .parallel()
                .join(JoinPolicy::Any),
            )
        }
    })]);

    let mut ctx = Context::new("GET", "/race");
    let response = executor.execute(&mut ctx, &route).await;

    assert_eq!(response.status, 200);
    assert_eq!(
        response.body_bytes(),
        Some(br#"{"a":false,"b":true}"#.as_slice())
    );
    assert!(ctx.slot_contains(12));
    assert!(!ctx.slot_contains(11));

    // Exactly one successful end (b) and one aborted end (a).
    let ends: Vec<bool> = events
        .events()
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::EffectEnd { ok, .. } => Some(*ok),
            _ => None,
        })
        .collect();
    assert_eq!(ends.len(), 2);
    assert_eq!(ends.iter().filter(|ok| **ok).count(), 1);

    let aborted = events.events().iter().any(|e| {
        matches!(
            &e.kind,
            EventKind::EffectEnd { ok: false, error_ctx: Some(ctx), .. }
                if ctx.contains("http_get")
        )
    });
    assert!(aborted, "loser should end with an aborted error context");
}

/// An open breaker short-circuits the effect without touching the runner.
#[tokio::test]
async fn test_open_breaker_short_circuits() {
    init_tracing();
    let runner = Arc::new(
        ScriptedRunner::new().script("https://payments.example/charge", Script::Ok(b"ok".to_vec())),
    );
    let events = Arc::new(MemorySubscriber::new());
    let breakers = Arc::new(BreakerPool::new(BreakerConfig::default()));
    breakers
        .get("payments.example")
        .force_state(BreakerState::Open, zerver_telemetry::now_ms());

    let executor = Executor::new(runner.clone())
        .with_breakers(breakers.clone())
        .with_subscriber(events.clone());

    let route = Route::new(vec![Step::new("charge", Layer::Main, |_| {
        Decision::Need(Need::single(Effect::http_post(
            "payments.example",
            "https://payments.example/charge",
            b"{}".to_vec(),
            2,
        )))
    })]);

    let mut ctx = Context::new("POST", "/orders");
    let response = executor.execute(&mut ctx, &route).await;

    assert_eq!(response.status, 502);
    assert!(runner.calls().is_empty(), "runner must never see the effect");

    let names = event_names(&events);
    assert_subsequence(&names, &["effect_start:http_post", "effect_end:false"]);
    assert!(
        !names.iter().any(|n| n.starts_with("effect_job_")),
        "denied effects enqueue no jobs: {names:?}"
    );
    // Short-circuiting does not count against the breaker itself.
    assert_eq!(
        breakers.get("payments.example").state(),
        BreakerState::Open
    );
}

/// Failing required effect retries with backoff until the runner recovers.
#[tokio::test(start_paused = true)]
async fn test_retry_until_success() {
    init_tracing();
    let runner = Arc::new(ScriptedRunner::new().script(
        "todo:9",
        Script::FailTimes(2, Error::timeout("db", "todo:9"), b"{}".to_vec()),
    ));
    let events = Arc::new(MemorySubscriber::new());
    let executor = Executor::new(runner.clone()).with_subscriber(events.clone());

    let route = Route::new(vec![Step::new("load", Layer::Main, |ctx| {
        if ctx.slot_contains(1) {
            Decision::Done(Response::with_status(200))
        } else {
            Decision::Need(Need::single(
                Effect::db_get("db", "todo:9", 1).with_retry(Retry::exponential(3, 10)),
            ))
        }
    })]);

    let mut ctx = Context::new("GET", "/todos/9");
    let response = executor.execute(&mut ctx, &route).await;

    assert_eq!(response.status, 200);
    assert_eq!(runner.calls().len(), 3);

    // One start/end pair per attempt, each with a fresh sequence.
    let attempts: Vec<u32> = events
        .events()
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::EffectStart { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .collect();
    assert_eq!(attempts, vec![0, 1, 2]);
}

/// AllRequired: optionals keep running and are discarded if unfinished.
#[tokio::test(start_paused = true)]
async fn test_all_required_discards_slow_optional() {
    init_tracing();
    let runner = Arc::new(
        ScriptedRunner::new()
            .script("order:1", Script::Ok(b"order".to_vec()))
            .script("recs:1", Script::OkAfterMs(5_000, b"recs".to_vec())),
    );
    let events = Arc::new(MemorySubscriber::new());
    let executor = Executor::new(runner.clone()).with_subscriber(events.clone());

    let route = Route::new(vec![Step::new("load_order", Layer::Main, |ctx| {
        if ctx.slot_contains(1) {
            Decision::Done(Response::json(
                200,
                &serde_json::json!({ "recs": ctx.slot_contains(2) }),
            ))
        } else {
            Decision::Need(
                Need::new(vec![
                    Effect::db_get("db", "order:1", 1),
                    Effect::db_get("db", "recs:1", 2).optional(),
                ])
                .parallel()
                .join(JoinPolicy::AllRequired),
            )
        }
    })]);

    let mut ctx = Context::new("GET", "/orders/1");
    let response = executor.execute(&mut ctx, &route).await;

    assert_eq!(response.status, 200);
    assert_eq!(response.body_bytes(), Some(br#"{"recs":false}"#.as_slice()));
    assert!(!ctx.slot_contains(2), "slow optional result is discarded");
}

/// FirstSuccess with all failures fails the need with the last failure.
#[tokio::test]
async fn test_first_success_all_failures() {
    init_tracing();
    let runner = Arc::new(
        ScriptedRunner::new()
            .script("replica-1", Script::Fail(Error::upstream_unavailable("db", "replica-1")))
            .script("replica-2", Script::Fail(Error::timeout("db", "replica-2"))),
    );
    let events = Arc::new(MemorySubscriber::new());
    let executor = Executor::new(runner.clone()).with_subscriber(events.clone());

    let route = Route::new(vec![Step::new("read_any", Layer::Main, |_| {
        Decision::Need(
            Need::new(vec![
                Effect::db_get("replica-1", "replica-1", 1).optional(),
                Effect::db_get("replica-2", "replica-2", 1).optional(),
            ])
            .join(JoinPolicy::FirstSuccess),
        )
    })]);

    let mut ctx = Context::new("GET", "/any");
    let response = executor.execute(&mut ctx, &route).await;

    // Sequential first-success exhausts both replicas then fails.
    assert_eq!(runner.calls().len(), 2);
    assert!(response.status == 502 || response.status == 504);
    assert_eq!(request_outcome(&events).map(|(_, o)| o), Some(Outcome::Fail));
}

/// The request deadline cancels a hanging need and renders 504.
#[tokio::test(start_paused = true)]
async fn test_request_deadline_cancels_need() {
    init_tracing();
    let runner = Arc::new(ScriptedRunner::new().script("slow", Script::Hang));
    let events = Arc::new(MemorySubscriber::new());
    let executor = Executor::new(runner.clone())
        .with_subscriber(events.clone())
        .with_config(ExecutorConfig::default().with_deadline_ms(50));

    let route = Route::new(vec![Step::new("wait", Layer::Main, |_| {
        Decision::Need(
            Need::single(Effect::db_get("slow", "slow", 1).with_timeout_ms(60_000)).parallel(),
        )
    })]);

    let mut ctx = Context::new("GET", "/slow");
    let response = executor.execute(&mut ctx, &route).await;

    assert_eq!(response.status, 504);
    assert_eq!(
        request_outcome(&events),
        Some((504, Outcome::Cancelled))
    );
}

/// A panicking step is captured as executor_crash and rendered as 500.
#[tokio::test]
async fn test_step_panic_is_captured() {
    init_tracing();
    let runner = Arc::new(ScriptedRunner::new());
    let events = Arc::new(MemorySubscriber::new());
    let executor = Executor::new(runner).with_subscriber(events.clone());

    let route = Route::new(vec![Step::new("boom", Layer::Main, |_| {
        panic!("step exploded");
    })]);

    let mut ctx = Context::new("GET", "/boom");
    let response = executor.execute(&mut ctx, &route).await;

    assert_eq!(response.status, 500);
    assert_eq!(
        request_outcome(&events),
        Some((500, Outcome::Crashed))
    );
    let crash = events.events().iter().any(|e| {
        matches!(
            &e.kind,
            EventKind::ExecutorCrash { error_name, .. } if error_name.contains("exploded")
        )
    });
    assert!(crash);
}

/// A need may resume into a named continuation instead of re-entering.
#[tokio::test]
async fn test_named_continuation_resume() {
    init_tracing();
    let runner = Arc::new(ScriptedRunner::new().script("todo:7", Script::Ok(b"seven".to_vec())));
    let events = Arc::new(MemorySubscriber::new());
    let executor = Executor::new(runner).with_subscriber(events.clone());

    let route = Route::new(vec![Step::new("load", Layer::Main, |_| {
        Decision::Need(Need::single(Effect::db_get("db", "todo:7", 1)).then_continue_at(0))
    })])
    .with_continuations(vec![Step::new("respond", Layer::Continuation, |ctx| {
        let body = ctx
            .slot_get(1)
            .and_then(|v| v.as_bytes())
            .unwrap_or_default()
            .to_vec();
        Decision::Done(Response::json_bytes(200, body))
    })]);

    let mut ctx = Context::new("GET", "/todos/7");
    let response = executor.execute(&mut ctx, &route).await;

    assert_eq!(response.status, 200);
    assert_eq!(response.body_bytes(), Some(b"seven".as_slice()));

    // Continuation resumes arrive through the continuation queue.
    let names = event_names(&events);
    assert_subsequence(
        &names,
        &["step_resume", "step_job_enqueued", "step_job_completed", "step_end:done"],
    );
}

/// Before-chain steps run first; a failing guard stops the main chain.
#[tokio::test]
async fn test_before_chain_guard() {
    init_tracing();
    let runner = Arc::new(ScriptedRunner::new());
    let events = Arc::new(MemorySubscriber::new());
    let executor = Executor::new(runner).with_subscriber(events.clone());

    let route = Route::new(vec![Step::new("main", Layer::Main, |_| {
        Decision::Done(Response::with_status(200))
    })])
    .with_before(vec![Step::new("auth_guard", Layer::RouteBefore, |ctx| {
        if ctx.header("authorization").is_some() {
            Decision::Continue
        } else {
            Decision::Fail(Error::unauthorized("auth", ""))
        }
    })]);

    let mut ctx = Context::new("GET", "/private");
    let response = executor.execute(&mut ctx, &route).await;
    assert_eq!(response.status, 401);

    let names = event_names(&events);
    assert!(!names.contains(&"step_start:main".to_string()));

    // With the header present the guard passes through.
    let mut ctx = Context::new("GET", "/private");
    ctx.set_header("authorization", b"Bearer t".to_vec());
    let runner = Arc::new(ScriptedRunner::new());
    let executor = Executor::new(runner);
    let response = executor.execute(&mut ctx, &route).await;
    assert_eq!(response.status, 200);
}

/// Exit callbacks run at finalization in reverse registration order.
#[tokio::test]
async fn test_exit_callbacks_run_lifo_at_finalization() {
    init_tracing();
    let runner = Arc::new(ScriptedRunner::new());
    let executor = Executor::new(runner);
    let order = Arc::new(Mutex::new(Vec::new()));

    let order_a = order.clone();
    let order_b = order.clone();
    let route = Route::new(vec![Step::new("register", Layer::Main, move |ctx| {
        let a = order_a.clone();
        let b = order_b.clone();
        ctx.on_exit(move |_| a.lock().unwrap().push("first"));
        ctx.on_exit(move |_| b.lock().unwrap().push("second"));
        Decision::Done(Response::with_status(204))
    })]);

    let mut ctx = Context::new("DELETE", "/todos/3");
    let response = executor.execute(&mut ctx, &route).await;
    assert_eq!(response.status, 204);
    assert_eq!(*order.lock().unwrap(), vec!["second", "first"]);
}

//! Step Test Harness
//!
//! Runs step functions in isolation against a fabricated `Context`: seed
//! params, queries, headers and slots, invoke the step directly, and
//! assert on the shape of the returned `Decision`. The executor is never
//! involved.
//!
//! ```
//! use zerver_harness::StepHarness;
//! use zerver_types::{Decision, Response};
//!
//! let mut harness = StepHarness::get("/todos/:id");
//! harness.set_param("id", "42");
//! let decision = harness.call(|ctx| {
//!     match ctx.param("id") {
//!         Some(id) => Decision::Done(Response::json(
//!             200,
//!             &serde_json::json!({ "id": id }),
//!         )),
//!         None => Decision::Fail(zerver_types::Error::bad_request("todo", "id")),
//!     }
//! });
//! decision.assert_done(200);
//! ```

use zerver_context::{Context, SlotValue};
use zerver_runtime::Step;
use zerver_types::{Decision, DecisionLabel, ErrorKind, Need, Response};

/// Fabricated-context driver for a single step function.
pub struct StepHarness {
    method: String,
    path: String,
    ctx: Context,
}

impl StepHarness {
    pub fn new(method: &str, path: &str) -> Self {
        let mut ctx = Context::new(method, path);
        ctx.ensure_request_id();
        Self {
            method: method.to_string(),
            path: path.to_string(),
            ctx,
        }
    }

    pub fn get(path: &str) -> Self {
        Self::new("GET", path)
    }

    pub fn post(path: &str) -> Self {
        Self::new("POST", path)
    }

    /// Drop accumulated state and start from a fresh context, keeping the
    /// method and path. Lets one harness serve many cases.
    pub fn reset(&mut self) {
        let mut ctx = Context::new(self.method.clone(), self.path.clone());
        ctx.ensure_request_id();
        self.ctx = ctx;
    }

    pub fn set_param(&mut self, name: &str, value: &str) -> &mut Self {
        self.ctx.set_param(name, value);
        self
    }

    pub fn set_query(&mut self, name: &str, value: &str) -> &mut Self {
        self.ctx.set_query(name, value);
        self
    }

    pub fn set_header(&mut self, name: &str, value: &str) -> &mut Self {
        self.ctx.set_header(name, value.as_bytes().to_vec());
        self
    }

    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) -> &mut Self {
        self.ctx.set_body(body.into());
        self
    }

    pub fn set_user(&mut self, sub: &str) -> &mut Self {
        self.ctx.set_user(sub);
        self
    }

    /// Seed a slot with a string, as if an earlier effect had published it.
    pub fn seed_slot_string(&mut self, id: u32, value: &str) -> &mut Self {
        self.ctx.slot_put(id, value);
        self
    }

    pub fn seed_slot_bytes(&mut self, id: u32, value: impl Into<Vec<u8>>) -> &mut Self {
        self.ctx.slot_put(id, value.into());
        self
    }

    pub fn seed_slot_json(&mut self, id: u32, value: serde_json::Value) -> &mut Self {
        self.ctx.slot_put(id, value);
        self
    }

    pub fn seed_slot(&mut self, id: u32, value: SlotValue) -> &mut Self {
        self.ctx.slot_put(id, value);
        self
    }

    pub fn ctx(&self) -> &Context {
        &self.ctx
    }

    pub fn ctx_mut(&mut self) -> &mut Context {
        &mut self.ctx
    }

    /// Invoke a bare step function.
    pub fn call(&mut self, step: impl Fn(&mut Context) -> Decision) -> DecisionAssert {
        DecisionAssert(step(&mut self.ctx))
    }

    /// Invoke a declared `Step` (including view-typed ones).
    pub fn call_step(&mut self, step: &Step) -> DecisionAssert {
        DecisionAssert(step.invoke(&mut self.ctx))
    }
}

/// Assertion wrapper around a returned `Decision`.
pub struct DecisionAssert(pub Decision);

impl DecisionAssert {
    pub fn label(&self) -> DecisionLabel {
        self.0.label()
    }

    pub fn is_continue(&self) -> bool {
        matches!(self.0, Decision::Continue)
    }

    pub fn done_status(&self) -> Option<u16> {
        match &self.0 {
            Decision::Done(resp) => Some(resp.status),
            _ => None,
        }
    }

    pub fn fail_kind(&self) -> Option<ErrorKind> {
        match &self.0 {
            Decision::Fail(err) => Some(err.kind),
            _ => None,
        }
    }

    pub fn need(&self) -> Option<&Need> {
        match &self.0 {
            Decision::Need(need) => Some(need),
            _ => None,
        }
    }

    pub fn into_response(self) -> Option<Response> {
        match self.0 {
            Decision::Done(resp) => Some(resp),
            _ => None,
        }
    }

    pub fn assert_continue(&self) {
        assert!(
            self.is_continue(),
            "expected Continue, got {:?}",
            self.label()
        );
    }

    pub fn assert_done(&self, status: u16) {
        match self.done_status() {
            Some(actual) => assert_eq!(actual, status, "Done with unexpected status"),
            None => panic!("expected Done({status}), got {:?}", self.label()),
        }
    }

    pub fn assert_fail(&self, kind: ErrorKind) {
        match self.fail_kind() {
            Some(actual) => assert_eq!(actual, kind, "Fail with unexpected kind"),
            None => panic!("expected Fail({kind:?}), got {:?}", self.label()),
        }
    }

    pub fn assert_need(&self) -> &Need {
        match self.need() {
            Some(need) => need,
            None => panic!("expected Need, got {:?}", self.label()),
        }
    }
}

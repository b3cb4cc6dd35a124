//! Routes and Steps
//!
//! A `Step` is a named unit of request logic returning a `Decision`. A
//! `Route` is the ordered step list for one endpoint, with an optional
//! before-chain and a continuation table that `Need`s can index into.
//!
//! Steps are declared either against the raw `Context` (unrestricted) or
//! against a typed view, in which case the view spec's read/write sets are
//! recorded on the step for dependency analyses.

use std::sync::Arc;

use zerver_context::{with_view, Context, CtxView, ViewSpec};
use zerver_types::{Decision, Layer};

type StepFunc = Box<dyn Fn(&mut Context) -> Decision + Send + Sync>;

/// A named unit of request logic.
pub struct Step {
    pub name: String,
    pub layer: Layer,
    /// Slot ids this step reads, when declared through a view.
    pub reads: Vec<u32>,
    /// Slot ids this step writes, when declared through a view.
    pub writes: Vec<u32>,
    func: StepFunc,
}

impl Step {
    /// Step over the raw context; no recorded read/write sets.
    pub fn new(
        name: impl Into<String>,
        layer: Layer,
        func: impl Fn(&mut Context) -> Decision + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            layer,
            reads: Vec::new(),
            writes: Vec::new(),
            func: Box::new(func),
        }
    }

    /// View-typed step. The trampoline lifts the view function into the
    /// context call shape and the spec's slot sets are recorded.
    pub fn with_view<S: ViewSpec + 'static>(
        name: impl Into<String>,
        layer: Layer,
        func: impl Fn(&mut CtxView<'_, S>) -> Decision + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            layer,
            reads: S::reads().to_vec(),
            writes: S::writes().to_vec(),
            func: Box::new(move |ctx: &mut Context| with_view::<S, _>(ctx, |view| func(view))),
        }
    }

    pub fn invoke(&self, ctx: &mut Context) -> Decision {
        (self.func)(ctx)
    }
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("layer", &self.layer)
            .field("reads", &self.reads)
            .field("writes", &self.writes)
            .finish()
    }
}

/// Ordered steps for one endpoint.
#[derive(Debug, Default)]
pub struct Route {
    pub before: Vec<Step>,
    pub steps: Vec<Step>,
    /// Functions a `Need` may name as its resume point.
    pub continuations: Vec<Step>,
}

impl Route {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            before: Vec::new(),
            steps,
            continuations: Vec::new(),
        }
    }

    pub fn with_before(mut self, steps: Vec<Step>) -> Self {
        self.before = steps;
        self
    }

    pub fn with_continuations(mut self, continuations: Vec<Step>) -> Self {
        self.continuations = continuations;
        self
    }
}

/// Route lookup, supplied by the transport layer. The context is
/// populated with the returned path params before the first step runs.
pub trait Router: Send + Sync {
    fn match_route(&self, method: &str, path: &str) -> Option<(Arc<Route>, Vec<(String, String)>)>;
}

/// Fixed-table router matching literal paths with `:param` segments.
pub struct StaticRouter {
    entries: Vec<(String, String, Arc<Route>)>,
}

impl StaticRouter {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn route(mut self, method: &str, pattern: &str, route: Route) -> Self {
        self.entries
            .push((method.to_string(), pattern.to_string(), Arc::new(route)));
        self
    }
}

impl Default for StaticRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl Router for StaticRouter {
    fn match_route(&self, method: &str, path: &str) -> Option<(Arc<Route>, Vec<(String, String)>)> {
        for (m, pattern, route) in &self.entries {
            if m != method {
                continue;
            }
            if let Some(params) = match_pattern(pattern, path) {
                return Some((route.clone(), params));
            }
        }
        None
    }
}

fn match_pattern(pattern: &str, path: &str) -> Option<Vec<(String, String)>> {
    let mut params = Vec::new();
    let pattern_segs: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    let path_segs: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if pattern_segs.len() != path_segs.len() {
        return None;
    }
    for (p, s) in pattern_segs.iter().zip(path_segs.iter()) {
        if let Some(name) = p.strip_prefix(':') {
            params.push((name.to_string(), s.to_string()));
        } else if p != s {
            return None;
        }
    }
    Some(params)
}

//! Effect Runner Boundary
//!
//! The executor never performs I/O; it hands each effect to a
//! host-supplied `EffectRunner` together with a cancellation token. The
//! runner must honour the effect's timeout, treat cancellation as
//! best-effort, and always come back with a terminal `EffectResult`
//! (cancelled work surfaces an `Aborted` failure).

use async_trait::async_trait;
use tokio::sync::watch;

use zerver_context::Context;
use zerver_types::{Effect, EffectResult};

/// Cooperative cancellation signal handed to effect tasks.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when cancellation is requested; pends forever if it never
    /// is.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Sender dropped without cancelling.
                std::future::pending::<()>().await;
            }
        }
    }

    /// A token that can never be cancelled.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }
}

/// Owning side of a cancellation pair.
#[derive(Debug)]
pub struct CancelSignal {
    tx: watch::Sender<bool>,
}

impl CancelSignal {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }
}

/// New linked signal/token pair.
pub fn cancel_pair() -> (CancelSignal, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelSignal { tx }, CancelToken { rx })
}

/// Host-supplied transport for effects.
#[async_trait]
pub trait EffectRunner: Send + Sync {
    /// Execute one effect. Must not block past the effect's timeout and
    /// must return a terminal result even when cancelled.
    async fn run(&self, effect: &Effect, ctx: &RunnerCtx, cancel: CancelToken) -> EffectResult;
}

/// Read-only request facts a runner may consult (never the slot store).
#[derive(Debug, Clone, Default)]
pub struct RunnerCtx {
    pub request_id: String,
    pub user: Option<String>,
}

impl RunnerCtx {
    pub fn from_context(ctx: &Context) -> Self {
        Self {
            request_id: ctx.request_id().to_string(),
            user: ctx.user().map(|s| s.to_string()),
        }
    }
}

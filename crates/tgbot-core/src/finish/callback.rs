use std::sync::Arc;

use crate::Error;

/// Reaction to the outcome of a send.
///
/// The finisher calls exactly one method per run: [`on_sent`](Self::on_sent) when the
/// message went out, [`on_failed`](Self::on_failed) when it did not. `X` is the context
/// the callbacks see, which may be an extended view of the transport context.
pub trait FinishCallback<X: ?Sized, M>: Send + Sync {
    fn on_sent(&self, ctx: &X, msg: &M);
    fn on_failed(&self, ctx: &X, reason: &Error);
}

type SentFn<X, M> = Box<dyn Fn(&X, &M) + Send + Sync>;
type FailedFn<X> = Box<dyn Fn(&X, &Error) + Send + Sync>;

/// Closure-backed [`FinishCallback`]. A missing handler makes that shape a no-op.
pub struct Callback<X: ?Sized, M> {
    sent: Option<SentFn<X, M>>,
    failed: Option<FailedFn<X>>,
}

impl<X: ?Sized, M> Callback<X, M> {
    pub fn new<S, F>(on_sent: S, on_failed: F) -> Self
    where
        S: Fn(&X, &M) + Send + Sync + 'static,
        F: Fn(&X, &Error) + Send + Sync + 'static,
    {
        Self {
            sent: Some(Box::new(on_sent)),
            failed: Some(Box::new(on_failed)),
        }
    }

    pub fn sent<S>(f: S) -> Self
    where
        S: Fn(&X, &M) + Send + Sync + 'static,
    {
        Self {
            sent: Some(Box::new(f)),
            failed: None,
        }
    }

    pub fn failed<F>(f: F) -> Self
    where
        F: Fn(&X, &Error) + Send + Sync + 'static,
    {
        Self {
            sent: None,
            failed: Some(Box::new(f)),
        }
    }

    pub fn shared(self) -> Arc<dyn FinishCallback<X, M>>
    where
        X: 'static,
        M: 'static,
    {
        Arc::new(self)
    }
}

impl<X: ?Sized, M> FinishCallback<X, M> for Callback<X, M> {
    fn on_sent(&self, ctx: &X, msg: &M) {
        if let Some(f) = &self.sent {
            f(ctx, msg);
        }
    }

    fn on_failed(&self, ctx: &X, reason: &Error) {
        if let Some(f) = &self.failed {
            f(ctx, reason);
        }
    }
}

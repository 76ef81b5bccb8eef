//! Actions that run after a message was sent, or failed to send.
//!
//! A [`Finisher`] carries the outcome of one send. Running it:
//! 1. calls every callback in registration order with the active context and either
//!    the sent message or the failure reason (optionally containing panics per callback),
//! 2. closes the session transaction if requested,
//! 3. closes the chat transaction if requested, unless closing the session transaction
//!    was requested and failed. An open session transaction leaves the chat transaction
//!    in use, so it must stay open.
//!
//! Panics and transaction errors are recorded on the returned [`Finished`] and are
//! reported separately.

pub mod callback;
pub mod completor;
pub mod flags;

use std::{
    any::Any,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use tracing::{debug, warn};

pub use callback::{Callback, FinishCallback};
pub use completor::{Completors, FnCompletor, TransactionCompletor, TransactionKind};
pub use flags::FinishFlags;

use crate::{Error, Result};

/// Result of the operation a finisher reports on.
#[derive(Debug)]
pub enum Outcome<M> {
    Sent(M),
    Failed(Error),
}

impl<M> Outcome<M> {
    pub fn is_sent(&self) -> bool {
        matches!(self, Outcome::Sent(_))
    }

    pub fn sent(&self) -> Option<&M> {
        match self {
            Outcome::Sent(msg) => Some(msg),
            Outcome::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&Error> {
        match self {
            Outcome::Sent(_) => None,
            Outcome::Failed(err) => Some(err),
        }
    }
}

/// A panic raised by a callback and contained by [`FinishFlags::PANIC_GUARD`].
pub struct RecoveredPanic {
    index: usize,
    payload: Box<dyn Any + Send>,
}

impl RecoveredPanic {
    /// Position of the panicking callback in the callback list.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn payload(&self) -> &(dyn Any + Send) {
        self.payload.as_ref()
    }

    pub fn into_payload(self) -> Box<dyn Any + Send> {
        self.payload
    }

    /// Panic message, for `panic!("literal")` and formatted panics.
    pub fn message(&self) -> &str {
        if let Some(s) = self.payload.downcast_ref::<&'static str>() {
            s
        } else if let Some(s) = self.payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "<non-string panic payload>"
        }
    }
}

impl fmt::Debug for RecoveredPanic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveredPanic")
            .field("index", &self.index)
            .field("message", &self.message())
            .finish()
    }
}

/// Post-send actions for one message, not yet run.
///
/// `C` is the original transport context handed to transaction completors, `X` the
/// (possibly extended) context handed to callbacks, `M` the sent message.
pub struct Finisher<C: Sync, X, M> {
    flags: FinishFlags,
    original_ctx: C,
    active_ctx: X,
    outcome: Option<Outcome<M>>,
    callbacks: Vec<Arc<dyn FinishCallback<X, M>>>,
    completors: Arc<Completors<C>>,
}

impl<C: Sync, X, M> Finisher<C, X, M> {
    /// Create a finisher without an outcome; mark it with [`make_success`](Self::make_success)
    /// or [`make_error`](Self::make_error) before running.
    ///
    /// Fails with [`Error::CleanupNotConfigured`] when `flags` ask for a transaction that
    /// `completors` cannot close.
    pub fn new(
        flags: FinishFlags,
        callbacks: Vec<Arc<dyn FinishCallback<X, M>>>,
        completors: Arc<Completors<C>>,
        original_ctx: C,
        active_ctx: X,
    ) -> Result<Self> {
        let flags = flags.requested();
        for (flag, kind) in [
            (
                FinishFlags::FINISH_SESSION_TRANSACTION,
                TransactionKind::Session,
            ),
            (FinishFlags::FINISH_CHAT_TRANSACTION, TransactionKind::Chat),
        ] {
            if flags.contains(flag) && completors.get(kind).is_none() {
                return Err(Error::CleanupNotConfigured(kind));
            }
        }

        Ok(Self {
            flags,
            original_ctx,
            active_ctx,
            outcome: None,
            callbacks,
            completors,
        })
    }

    /// Mark the message as sent. Replaces any failure set before.
    pub fn make_success(mut self, msg: M) -> Self {
        self.outcome = Some(Outcome::Sent(msg));
        self
    }

    /// Mark the message as not sent. Replaces any sent message set before.
    pub fn make_error(mut self, reason: Error) -> Self {
        self.outcome = Some(Outcome::Failed(reason));
        self
    }

    pub fn flags(&self) -> FinishFlags {
        self.flags
    }

    pub fn outcome(&self) -> Option<&Outcome<M>> {
        self.outcome.as_ref()
    }

    pub fn callbacks_len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn original_ctx(&self) -> &C {
        &self.original_ctx
    }

    pub fn active_ctx(&self) -> &X {
        &self.active_ctx
    }

    /// Call the callbacks, then close the requested transactions.
    ///
    /// Consumes the finisher, so it runs at most once. Without
    /// [`FinishFlags::PANIC_GUARD`] a panicking callback unwinds through this call and
    /// neither later callbacks nor transaction completors run.
    pub async fn run(self) -> Result<Finished<C, X, M>> {
        let Finisher {
            mut flags,
            original_ctx,
            active_ctx,
            outcome,
            callbacks,
            completors,
        } = self;
        let outcome = outcome.ok_or(Error::MissingOutcome)?;

        debug!(
            callbacks = callbacks.len(),
            sent = outcome.is_sent(),
            flags = ?flags,
            "running finisher"
        );

        let mut recovered_panics = Vec::new();
        for (index, cb) in callbacks.iter().enumerate() {
            let invoke = || match &outcome {
                Outcome::Sent(msg) => cb.on_sent(&active_ctx, msg),
                Outcome::Failed(reason) => cb.on_failed(&active_ctx, reason),
            };

            if !flags.contains(FinishFlags::PANIC_GUARD) {
                invoke();
                continue;
            }
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(invoke)) {
                let recovered = RecoveredPanic { index, payload };
                warn!(index, panic = recovered.message(), "finisher callback panicked");
                recovered_panics.push(recovered);
            }
        }
        drop(callbacks);

        let mut session_error = None;
        let mut chat_error = None;

        if flags.contains(FinishFlags::FINISH_SESSION_TRANSACTION) {
            if let Err(err) =
                finish_transaction(&completors, TransactionKind::Session, &original_ctx).await
            {
                flags.insert(FinishFlags::SESSION_TRANSACTION_FAILED);
                session_error = Some(err);
            }
        }

        // The chat transaction stays open while its session transaction is open.
        if session_error.is_none() && flags.contains(FinishFlags::FINISH_CHAT_TRANSACTION) {
            if let Err(err) =
                finish_transaction(&completors, TransactionKind::Chat, &original_ctx).await
            {
                flags.insert(FinishFlags::CHAT_TRANSACTION_FAILED);
                chat_error = Some(err);
            }
        }

        debug!(
            panics = recovered_panics.len(),
            flags = ?flags,
            "finisher done"
        );

        Ok(Finished {
            flags,
            original_ctx,
            active_ctx,
            outcome,
            recovered_panics,
            session_error,
            chat_error,
        })
    }
}

async fn finish_transaction<C: Sync>(
    completors: &Completors<C>,
    kind: TransactionKind,
    ctx: &C,
) -> Result<()> {
    let completor = completors
        .get(kind)
        .ok_or(Error::CleanupNotConfigured(kind))?;
    let res = completor.finish(ctx).await;
    if let Err(err) = &res {
        warn!(transaction = %kind, error = %err, "failed to finish transaction");
    }
    res
}

impl<C: Sync + fmt::Debug, X: fmt::Debug, M: fmt::Debug> fmt::Debug for Finisher<C, X, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Finisher")
            .field("flags", &self.flags)
            .field("original_ctx", &self.original_ctx)
            .field("active_ctx", &self.active_ctx)
            .field("outcome", &self.outcome)
            .field("callbacks", &self.callbacks.len())
            .field("completors", &self.completors)
            .finish()
    }
}

/// State of a finisher after it ran.
#[derive(Debug)]
pub struct Finished<C, X, M> {
    flags: FinishFlags,
    original_ctx: C,
    active_ctx: X,
    outcome: Outcome<M>,
    recovered_panics: Vec<RecoveredPanic>,
    session_error: Option<Error>,
    chat_error: Option<Error>,
}

impl<C, X, M> Finished<C, X, M> {
    /// Requested flags plus the `*_FAILED` bits set during the run.
    pub fn flags(&self) -> FinishFlags {
        self.flags
    }

    pub fn outcome(&self) -> &Outcome<M> {
        &self.outcome
    }

    pub fn original_ctx(&self) -> &C {
        &self.original_ctx
    }

    pub fn active_ctx(&self) -> &X {
        &self.active_ctx
    }

    /// Panics contained by the panic guard, in the order they happened.
    pub fn recovered_panics(&self) -> &[RecoveredPanic] {
        &self.recovered_panics
    }

    /// Error from closing the session transaction. `None` if it was not requested or
    /// succeeded.
    pub fn session_transaction_error(&self) -> Option<&Error> {
        self.session_error.as_ref()
    }

    /// Error from closing the chat transaction. `None` if it was not requested, was
    /// skipped after a session transaction failure, or succeeded.
    pub fn chat_transaction_error(&self) -> Option<&Error> {
        self.chat_error.as_ref()
    }

    pub fn into_parts(self) -> (Outcome<M>, Vec<RecoveredPanic>) {
        (self.outcome, self.recovered_panics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    struct Ctx(&'static str);

    #[derive(Debug, Clone, PartialEq)]
    struct View {
        base: Ctx,
        locale: &'static str,
    }

    type Log = Arc<Mutex<Vec<String>>>;

    fn push(log: &Log, entry: impl Into<String>) {
        log.lock().unwrap().push(entry.into());
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    struct FakeCompletor {
        name: &'static str,
        fail_with: Option<&'static str>,
        calls: AtomicUsize,
        log: Log,
    }

    impl FakeCompletor {
        fn new(name: &'static str, fail_with: Option<&'static str>, log: &Log) -> Arc<Self> {
            Arc::new(Self {
                name,
                fail_with,
                calls: AtomicUsize::new(0),
                log: log.clone(),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl TransactionCompletor<Ctx> for FakeCompletor {
        async fn finish(&self, ctx: &Ctx) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            push(&self.log, format!("{}:{}", self.name, ctx.0));
            match self.fail_with {
                Some(reason) => Err(Error::External(reason.to_string())),
                None => Ok(()),
            }
        }
    }

    fn view() -> View {
        View {
            base: Ctx("orig"),
            locale: "en",
        }
    }

    fn recording(tag: &'static str, log: &Log) -> Arc<dyn FinishCallback<View, u32>> {
        let sent_log = log.clone();
        let failed_log = log.clone();
        Callback::new(
            move |ctx: &View, msg: &u32| {
                push(&sent_log, format!("{tag}:sent:{}:{}:{msg}", ctx.base.0, ctx.locale))
            },
            move |ctx: &View, reason: &Error| {
                push(&failed_log, format!("{tag}:failed:{}:{reason}", ctx.locale))
            },
        )
        .shared()
    }

    fn panicking(payload: &'static str) -> Arc<dyn FinishCallback<View, u32>> {
        Callback::new(
            move |_: &View, _: &u32| panic!("{}", payload),
            move |_: &View, _: &Error| panic!("{}", payload),
        )
        .shared()
    }

    fn no_completors() -> Arc<Completors<Ctx>> {
        Arc::new(Completors::default())
    }

    #[tokio::test]
    async fn sent_outcome_reaches_every_callback_in_order() {
        let log = Log::default();
        let cbs = vec![
            recording("a", &log),
            recording("b", &log),
            recording("c", &log),
        ];
        let done = Finisher::new(FinishFlags::empty(), cbs, no_completors(), Ctx("orig"), view())
            .unwrap()
            .make_success(7)
            .run()
            .await
            .unwrap();

        assert_eq!(
            entries(&log),
            vec!["a:sent:orig:en:7", "b:sent:orig:en:7", "c:sent:orig:en:7"]
        );
        assert_eq!(done.outcome().sent(), Some(&7));
        assert!(done.recovered_panics().is_empty());
    }

    #[tokio::test]
    async fn failed_outcome_passes_reason_only() {
        let log = Log::default();
        let done = Finisher::new(
            FinishFlags::empty(),
            vec![recording("a", &log), recording("b", &log)],
            no_completors(),
            Ctx("orig"),
            view(),
        )
        .unwrap()
        .make_error(Error::External("chat not found".to_string()))
        .run()
        .await
        .unwrap();

        assert_eq!(
            entries(&log),
            vec![
                "a:failed:en:external error: chat not found",
                "b:failed:en:external error: chat not found"
            ]
        );
        assert!(done.outcome().sent().is_none());
        assert!(done.outcome().failure().is_some());
    }

    #[test]
    fn last_outcome_mutator_wins() {
        let f: Finisher<Ctx, View, u32> =
            Finisher::new(FinishFlags::empty(), vec![], no_completors(), Ctx("o"), view())
                .unwrap()
                .make_success(1)
                .make_error(Error::External("x".to_string()));
        assert!(matches!(f.outcome(), Some(Outcome::Failed(_))));

        let f = f.make_success(2);
        assert_eq!(f.outcome().and_then(Outcome::sent), Some(&2));
    }

    #[test]
    fn unrun_finisher_exposes_both_contexts() {
        let log = Log::default();
        let f = Finisher::new(
            FinishFlags::PANIC_GUARD,
            vec![recording("a", &log), recording("b", &log)],
            no_completors(),
            Ctx("orig"),
            View {
                base: Ctx("extended"),
                locale: "de",
            },
        )
        .unwrap()
        .make_success(1);

        assert_eq!(f.callbacks_len(), 2);
        assert_eq!(f.original_ctx(), &Ctx("orig"));
        assert_eq!(f.active_ctx().base, Ctx("extended"));
        assert_eq!(f.active_ctx().locale, "de");
        assert!(entries(&log).is_empty());
    }

    #[tokio::test]
    async fn run_without_outcome_is_rejected() {
        let log = Log::default();
        let res = Finisher::<Ctx, View, u32>::new(
            FinishFlags::empty(),
            vec![recording("a", &log)],
            no_completors(),
            Ctx("o"),
            view(),
        )
        .unwrap()
        .run()
        .await;

        assert!(matches!(res, Err(Error::MissingOutcome)));
        assert!(entries(&log).is_empty());
    }

    #[test]
    fn requesting_unconfigured_transaction_fails_fast() {
        let res = Finisher::<Ctx, View, u32>::new(
            FinishFlags::FINISH_CHAT_TRANSACTION,
            vec![],
            no_completors(),
            Ctx("o"),
            view(),
        );
        assert!(matches!(
            res,
            Err(Error::CleanupNotConfigured(TransactionKind::Chat))
        ));

        let log = Log::default();
        let only_chat = Arc::new(
            Completors::<Ctx>::default().with_chat(FakeCompletor::new("chat", None, &log)),
        );
        let res = Finisher::<Ctx, View, u32>::new(
            FinishFlags::FINISH_SESSION_TRANSACTION | FinishFlags::FINISH_CHAT_TRANSACTION,
            vec![],
            only_chat,
            Ctx("o"),
            view(),
        );
        assert!(matches!(
            res,
            Err(Error::CleanupNotConfigured(TransactionKind::Session))
        ));
    }

    #[test]
    fn constructor_strips_failure_bits() {
        let f = Finisher::<Ctx, View, u32>::new(
            FinishFlags::PANIC_GUARD | FinishFlags::CHAT_TRANSACTION_FAILED,
            vec![],
            no_completors(),
            Ctx("o"),
            view(),
        )
        .unwrap();
        assert_eq!(f.flags(), FinishFlags::PANIC_GUARD);
    }

    #[tokio::test]
    async fn guarded_panic_is_recorded_and_later_callbacks_run() {
        let log = Log::default();
        let session = FakeCompletor::new("session", None, &log);
        let completors = Arc::new(Completors::<Ctx>::default().with_session(session.clone()));

        let done = Finisher::new(
            FinishFlags::PANIC_GUARD | FinishFlags::FINISH_SESSION_TRANSACTION,
            vec![recording("a", &log), panicking("boom"), recording("c", &log)],
            completors,
            Ctx("orig"),
            view(),
        )
        .unwrap()
        .make_success(1)
        .run()
        .await
        .unwrap();

        let panics: Vec<_> = done.recovered_panics().iter().map(|p| p.message()).collect();
        assert_eq!(panics, vec!["boom"]);
        assert_eq!(done.recovered_panics()[0].index(), 1);
        assert_eq!(
            entries(&log),
            vec!["a:sent:orig:en:1", "c:sent:orig:en:1", "session:orig"]
        );
        assert_eq!(session.calls(), 1);
        assert!(done.session_transaction_error().is_none());
        assert!(done.chat_transaction_error().is_none());
    }

    #[tokio::test]
    async fn guard_is_rearmed_for_every_callback() {
        let done = Finisher::new(
            FinishFlags::PANIC_GUARD,
            vec![panicking("first"), panicking("second"), panicking("third")],
            no_completors(),
            Ctx("orig"),
            view(),
        )
        .unwrap()
        .make_error(Error::External("timeout".to_string()))
        .run()
        .await
        .unwrap();

        let (_, panics) = done.into_parts();
        let indexes: Vec<_> = panics.iter().map(RecoveredPanic::index).collect();
        let messages: Vec<_> = panics.iter().map(|p| p.message().to_string()).collect();
        assert_eq!(indexes, vec![0, 1, 2]);
        assert_eq!(messages, vec!["first", "second", "third"]);
    }

    #[test]
    fn non_string_payload_has_generic_message() {
        let p = RecoveredPanic {
            index: 0,
            payload: Box::new(42_u8),
        };
        assert_eq!(p.message(), "<non-string panic payload>");
        assert!(p.payload().is::<u8>());
        assert_eq!(p.into_payload().downcast_ref::<u8>(), Some(&42));
    }

    #[tokio::test]
    async fn unguarded_panic_aborts_callbacks_and_cleanup() {
        let log = Log::default();
        let session = FakeCompletor::new("session", None, &log);
        let chat = FakeCompletor::new("chat", None, &log);
        let completors = Arc::new(Completors::<Ctx>::new(session.clone(), chat.clone()));

        let finisher = Finisher::new(
            FinishFlags::FINISH_SESSION_TRANSACTION | FinishFlags::FINISH_CHAT_TRANSACTION,
            vec![recording("a", &log), panicking("boom"), recording("c", &log)],
            completors,
            Ctx("orig"),
            view(),
        )
        .unwrap()
        .make_success(5);

        let err = tokio::spawn(finisher.run()).await.unwrap_err();
        assert!(err.is_panic());
        assert_eq!(entries(&log), vec!["a:sent:orig:en:5"]);
        assert_eq!(session.calls(), 0);
        assert_eq!(chat.calls(), 0);
    }

    #[tokio::test]
    async fn session_failure_skips_chat_transaction() {
        let log = Log::default();
        let session = FakeCompletor::new("session", Some("E1"), &log);
        let chat = FakeCompletor::new("chat", None, &log);
        let completors = Arc::new(Completors::<Ctx>::new(session.clone(), chat.clone()));

        let done = Finisher::<Ctx, View, u32>::new(
            FinishFlags::FINISH_SESSION_TRANSACTION | FinishFlags::FINISH_CHAT_TRANSACTION,
            vec![],
            completors,
            Ctx("orig"),
            view(),
        )
        .unwrap()
        .make_success(0)
        .run()
        .await
        .unwrap();

        assert_eq!(
            done.session_transaction_error().map(ToString::to_string),
            Some("external error: E1".to_string())
        );
        assert!(done.chat_transaction_error().is_none());
        assert!(done.flags().contains(FinishFlags::SESSION_TRANSACTION_FAILED));
        assert!(!done.flags().contains(FinishFlags::CHAT_TRANSACTION_FAILED));
        assert_eq!(session.calls(), 1);
        assert_eq!(chat.calls(), 0);
    }

    #[tokio::test]
    async fn chat_failure_is_reported_on_chat_accessor_only() {
        let log = Log::default();
        let chat = FakeCompletor::new("chat", Some("E2"), &log);
        let completors = Arc::new(Completors::<Ctx>::default().with_chat(chat.clone()));

        let done = Finisher::<Ctx, View, u32>::new(
            FinishFlags::FINISH_CHAT_TRANSACTION,
            vec![],
            completors,
            Ctx("orig"),
            view(),
        )
        .unwrap()
        .make_error(Error::External("flood wait".to_string()))
        .run()
        .await
        .unwrap();

        assert!(done.session_transaction_error().is_none());
        assert_eq!(
            done.chat_transaction_error().map(ToString::to_string),
            Some("external error: E2".to_string())
        );
        assert!(done.flags().contains(FinishFlags::CHAT_TRANSACTION_FAILED));
        assert_eq!(chat.calls(), 1);
    }

    #[tokio::test]
    async fn transactions_close_in_order_with_original_context() {
        let log = Log::default();
        let session = FakeCompletor::new("session", None, &log);
        let chat = FakeCompletor::new("chat", None, &log);
        let completors = Arc::new(Completors::<Ctx>::new(session, chat));

        let done = Finisher::new(
            FinishFlags::FINISH_SESSION_TRANSACTION | FinishFlags::FINISH_CHAT_TRANSACTION,
            vec![recording("a", &log)],
            completors,
            Ctx("orig"),
            View {
                base: Ctx("extended"),
                locale: "it",
            },
        )
        .unwrap()
        .make_success(9)
        .run()
        .await
        .unwrap();

        assert_eq!(
            entries(&log),
            vec!["a:sent:extended:it:9", "session:orig", "chat:orig"]
        );
        assert_eq!(done.original_ctx(), &Ctx("orig"));
        assert_eq!(done.active_ctx().locale, "it");
        assert!(done.session_transaction_error().is_none());
        assert!(done.chat_transaction_error().is_none());
        assert_eq!(
            done.flags(),
            FinishFlags::FINISH_SESSION_TRANSACTION | FinishFlags::FINISH_CHAT_TRANSACTION
        );
    }

    #[tokio::test]
    async fn fn_completor_runs_sync_closures() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let session: Arc<dyn TransactionCompletor<Ctx>> =
            Arc::new(FnCompletor(move |_: &Ctx| -> Result<()> {
                h.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        let completors = Arc::new(Completors::<Ctx>::default().with_session(session));

        let done = Finisher::<Ctx, View, u32>::new(
            FinishFlags::FINISH_SESSION_TRANSACTION,
            vec![],
            completors,
            Ctx("orig"),
            view(),
        )
        .unwrap()
        .make_success(3)
        .run()
        .await
        .unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(done.session_transaction_error().is_none());
    }
}

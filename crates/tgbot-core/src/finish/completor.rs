use std::{fmt, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

/// The two nested transactions a finisher may close, in closing order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Session,
    Chat,
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionKind::Session => f.write_str("session"),
            TransactionKind::Chat => f.write_str("chat"),
        }
    }
}

/// Closes one transaction for the context a message was sent with.
///
/// Always receives the original transport context, never an extended view.
#[async_trait]
pub trait TransactionCompletor<C: ?Sized + Sync>: Send + Sync {
    async fn finish(&self, ctx: &C) -> Result<()>;
}

/// Adapter for completors that never await.
pub struct FnCompletor<F>(pub F);

#[async_trait]
impl<C, F> TransactionCompletor<C> for FnCompletor<F>
where
    C: ?Sized + Sync,
    F: Fn(&C) -> Result<()> + Send + Sync,
{
    async fn finish(&self, ctx: &C) -> Result<()> {
        (self.0)(ctx)
    }
}

/// Completors shared by every finisher of a bot.
///
/// Built once at startup and handed to each finisher behind an `Arc`.
pub struct Completors<C: ?Sized + Sync> {
    session: Option<Arc<dyn TransactionCompletor<C>>>,
    chat: Option<Arc<dyn TransactionCompletor<C>>>,
}

impl<C: ?Sized + Sync> Default for Completors<C> {
    fn default() -> Self {
        Self {
            session: None,
            chat: None,
        }
    }
}

impl<C: ?Sized + Sync> Completors<C> {
    pub fn new(
        session: Arc<dyn TransactionCompletor<C>>,
        chat: Arc<dyn TransactionCompletor<C>>,
    ) -> Self {
        Self {
            session: Some(session),
            chat: Some(chat),
        }
    }

    pub fn with_session(mut self, completor: Arc<dyn TransactionCompletor<C>>) -> Self {
        self.session = Some(completor);
        self
    }

    pub fn with_chat(mut self, completor: Arc<dyn TransactionCompletor<C>>) -> Self {
        self.chat = Some(completor);
        self
    }

    pub fn get(&self, kind: TransactionKind) -> Option<&Arc<dyn TransactionCompletor<C>>> {
        match kind {
            TransactionKind::Session => self.session.as_ref(),
            TransactionKind::Chat => self.chat.as_ref(),
        }
    }
}

impl<C: ?Sized + Sync> fmt::Debug for Completors<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completors")
            .field("session", &self.session.is_some())
            .field("chat", &self.chat.is_some())
            .finish()
    }
}

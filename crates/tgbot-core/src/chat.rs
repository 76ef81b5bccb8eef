//! Per-chat bookkeeping and the in-memory session/chat transaction book.
//!
//! Every outgoing message runs inside a chat transaction and, nested in it, a session
//! transaction. [`TransactionBook`] tracks which of them are open and provides the
//! completors a [`Finisher`](crate::finish::Finisher) uses to close them.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    domain::{ChatId, SessionId, UserId},
    errors::Error,
    finish::{Completors, TransactionCompletor, TransactionKind},
    Result,
};

/// What the bot remembers about a chat.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatInfo {
    pub chat_id: ChatId,
    pub started_unixstamp: i64,
    pub last_activity_unixstamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_session: Option<SessionId>,
}

impl ChatInfo {
    pub fn new(chat_id: ChatId, now: i64) -> Self {
        Self {
            chat_id,
            started_unixstamp: now,
            last_activity_unixstamp: now,
            current_session: None,
        }
    }

    /// Record activity at `now`. Never moves the timestamp backwards.
    pub fn touch(&mut self, now: i64) {
        self.last_activity_unixstamp = self.last_activity_unixstamp.max(now);
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Original transport context of one outgoing message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FinishCtx {
    pub chat_id: ChatId,
    pub user_id: Option<UserId>,
    pub session: Option<SessionId>,
}

impl FinishCtx {
    pub fn new(chat_id: ChatId) -> Self {
        Self {
            chat_id,
            user_id: None,
            session: None,
        }
    }

    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_session(mut self, session: SessionId) -> Self {
        self.session = Some(session);
        self
    }
}

#[derive(Debug)]
struct ChatEntry {
    info: ChatInfo,
    chat_open: bool,
    open_session: Option<SessionId>,
}

type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// In-memory tracker of open chat and session transactions.
pub struct TransactionBook {
    chats: Mutex<HashMap<ChatId, ChatEntry>>,
    clock: Clock,
}

impl Default for TransactionBook {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionBook {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(|| Utc::now().timestamp()))
    }

    /// Use `clock` (unix seconds) instead of the system time.
    pub fn with_clock(clock: Clock) -> Self {
        Self {
            chats: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Open the chat transaction for `chat_id`, registering the chat on first use.
    pub async fn begin_chat(&self, chat_id: ChatId) -> Result<()> {
        let now = (self.clock)();
        let mut chats = self.chats.lock().await;
        let entry = chats.entry(chat_id).or_insert_with(|| ChatEntry {
            info: ChatInfo::new(chat_id, now),
            chat_open: false,
            open_session: None,
        });

        if entry.chat_open {
            return Err(Error::transaction(
                TransactionKind::Chat,
                format!("chat {} already has an open transaction", chat_id.0),
            ));
        }
        entry.chat_open = true;
        entry.info.touch(now);
        debug!(chat_id = chat_id.0, "chat transaction opened");
        Ok(())
    }

    /// Open a session transaction inside the chat's open chat transaction.
    pub async fn begin_session(&self, chat_id: ChatId, session: SessionId) -> Result<()> {
        let mut chats = self.chats.lock().await;
        let Some(entry) = chats.get_mut(&chat_id).filter(|e| e.chat_open) else {
            return Err(Error::transaction(
                TransactionKind::Session,
                format!("chat {} has no open chat transaction", chat_id.0),
            ));
        };
        if let Some(open) = &entry.open_session {
            return Err(Error::transaction(
                TransactionKind::Session,
                format!("session {open} is still open in chat {}", chat_id.0),
            ));
        }

        debug!(chat_id = chat_id.0, session = %session, "session transaction opened");
        entry.info.current_session = Some(session.clone());
        entry.open_session = Some(session);
        Ok(())
    }

    pub async fn is_chat_open(&self, chat_id: ChatId) -> bool {
        let chats = self.chats.lock().await;
        chats.get(&chat_id).is_some_and(|e| e.chat_open)
    }

    pub async fn is_session_open(&self, chat_id: ChatId) -> bool {
        let chats = self.chats.lock().await;
        chats
            .get(&chat_id)
            .is_some_and(|e| e.open_session.is_some())
    }

    pub async fn chat_info(&self, chat_id: ChatId) -> Option<ChatInfo> {
        let chats = self.chats.lock().await;
        chats.get(&chat_id).map(|e| e.info.clone())
    }

    /// Close the session transaction for `ctx`'s chat.
    ///
    /// If `ctx` names a session it must be the open one.
    pub async fn finish_session(&self, ctx: &FinishCtx) -> Result<()> {
        let mut chats = self.chats.lock().await;
        let Some(entry) = chats.get_mut(&ctx.chat_id) else {
            return Err(unknown_chat(TransactionKind::Session, ctx.chat_id));
        };
        let Some(open) = &entry.open_session else {
            return Err(Error::transaction(
                TransactionKind::Session,
                format!("chat {} has no open session transaction", ctx.chat_id.0),
            ));
        };
        if let Some(expected) = &ctx.session {
            if expected != open {
                return Err(Error::transaction(
                    TransactionKind::Session,
                    format!("open session is {open}, message was sent in {expected}"),
                ));
            }
        }

        entry.open_session = None;
        debug!(chat_id = ctx.chat_id.0, "session transaction finished");
        Ok(())
    }

    /// Close the chat transaction for `ctx`'s chat and record activity.
    ///
    /// Fails while a session transaction is still open in the chat.
    pub async fn finish_chat(&self, ctx: &FinishCtx) -> Result<()> {
        let now = (self.clock)();
        let mut chats = self.chats.lock().await;
        let Some(entry) = chats.get_mut(&ctx.chat_id) else {
            return Err(unknown_chat(TransactionKind::Chat, ctx.chat_id));
        };
        if !entry.chat_open {
            return Err(Error::transaction(
                TransactionKind::Chat,
                format!("chat {} has no open chat transaction", ctx.chat_id.0),
            ));
        }
        if let Some(open) = &entry.open_session {
            return Err(Error::transaction(
                TransactionKind::Chat,
                format!("session {open} is still open in chat {}", ctx.chat_id.0),
            ));
        }

        entry.chat_open = false;
        entry.info.touch(now);
        debug!(chat_id = ctx.chat_id.0, "chat transaction finished");
        Ok(())
    }

    /// Completors closing this book's transactions, to share among finishers.
    pub fn completors(self: &Arc<Self>) -> Completors<FinishCtx> {
        Completors::new(
            Arc::new(SessionCompletor(self.clone())),
            Arc::new(ChatCompletor(self.clone())),
        )
    }
}

fn unknown_chat(kind: TransactionKind, chat_id: ChatId) -> Error {
    Error::transaction(kind, format!("unknown chat {}", chat_id.0))
}

struct SessionCompletor(Arc<TransactionBook>);

#[async_trait]
impl TransactionCompletor<FinishCtx> for SessionCompletor {
    async fn finish(&self, ctx: &FinishCtx) -> Result<()> {
        self.0.finish_session(ctx).await
    }
}

struct ChatCompletor(Arc<TransactionBook>);

#[async_trait]
impl TransactionCompletor<FinishCtx> for ChatCompletor {
    async fn finish(&self, ctx: &FinishCtx) -> Result<()> {
        self.0.finish_chat(ctx).await
    }
}

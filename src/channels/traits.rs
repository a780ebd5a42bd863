use crate::store::ThreadKey;
use async_trait::async_trait;

/// The bot was addressed directly. Starts a thread when `thread_ts` is absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MentionEvent {
    pub text: String,
    pub channel: String,
    pub thread_ts: Option<String>,
    pub ts: String,
}

/// A plain message posted inside a thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadMessageEvent {
    pub text: String,
    pub channel: String,
    pub thread_ts: String,
    pub ts: String,
    /// Set when the platform reports the message as bot-originated (our own
    /// replies echo back as message events).
    pub is_bot_echo: bool,
}

/// Events delivered by the chat platform boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Mention(MentionEvent),
    ThreadMessage(ThreadMessageEvent),
}

impl InboundEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Mention(_) => "mention",
            Self::ThreadMessage(_) => "thread_message",
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Self::Mention(m) => &m.text,
            Self::ThreadMessage(m) => &m.text,
        }
    }

    pub fn channel(&self) -> &str {
        match self {
            Self::Mention(m) => &m.channel,
            Self::ThreadMessage(m) => &m.channel,
        }
    }

    /// Timestamp of the triggering message itself.
    pub fn ts(&self) -> &str {
        match self {
            Self::Mention(m) => &m.ts,
            Self::ThreadMessage(m) => &m.ts,
        }
    }

    /// Root of the thread the reply belongs in.
    pub fn thread_root(&self) -> &str {
        match self {
            Self::Mention(m) => m
                .thread_ts
                .as_deref()
                .filter(|t| !t.trim().is_empty())
                .unwrap_or(&m.ts),
            Self::ThreadMessage(m) => &m.thread_ts,
        }
    }

    pub fn thread_key(&self) -> ThreadKey {
        ThreadKey::new(self.channel(), self.thread_root())
    }

    /// True when the event is a reply inside a thread that existed before it.
    pub fn is_inside_existing_thread(&self) -> bool {
        self.thread_root() != self.ts()
    }
}

/// One earlier message in a thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryMessage {
    pub ts: String,
    pub text: String,
    pub from_bot: bool,
}

/// Chat-platform capabilities the relay needs: reactions, threaded replies
/// and thread history.
#[async_trait]
pub trait ThreadChannel: Send + Sync {
    /// Human-readable channel name
    fn name(&self) -> &str;

    async fn add_reaction(&self, channel: &str, ts: &str, name: &str) -> anyhow::Result<()>;

    async fn remove_reaction(&self, channel: &str, ts: &str, name: &str) -> anyhow::Result<()>;

    /// Post `text` into the thread rooted at `thread_ts`.
    async fn reply(&self, channel: &str, thread_ts: &str, text: &str) -> anyhow::Result<()>;

    /// Messages of a thread in chronological order, root included, at most `limit`.
    async fn list_replies(
        &self,
        channel: &str,
        thread_ts: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<HistoryMessage>>;

    /// Add a reaction; failure is logged and never propagated.
    async fn add_reaction_best_effort(&self, channel: &str, ts: &str, name: &str) {
        if let Err(e) = self.add_reaction(channel, ts, name).await {
            tracing::warn!("{}: failed to add :{name}: reaction on {ts}: {e:#}", self.name());
        }
    }

    /// Remove a reaction; failure is logged and never propagated.
    async fn remove_reaction_best_effort(&self, channel: &str, ts: &str, name: &str) {
        if let Err(e) = self.remove_reaction(channel, ts, name).await {
            tracing::warn!(
                "{}: failed to remove :{name}: reaction on {ts}: {e:#}",
                self.name()
            );
        }
    }
}

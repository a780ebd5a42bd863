//! Per-event orchestration: topic resolution, assistant round-trip, reply.
//!
//! Each inbound event runs through [`Relay::handle_event`] exactly once. Remote
//! calls are attempted a single time and every failure ends in a visible reply
//! inside the thread, so a thread never stays in the "processing" state.

pub mod format;

use crate::assistant::{AssistantApi, AssistantError, AssistantReply};
use crate::channels::{InboundEvent, ThreadChannel};
use crate::config::Config;
use crate::markdown;
use crate::store::{ThreadKey, TopicStore};
use crate::util::log_snippet;
use format::DebugTrace;
use std::sync::Arc;
use std::time::Duration;

/// Knobs the orchestrator needs, decoupled from the config file layout.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub processing_reaction: String,
    pub topic_ttl: Duration,
    pub docs_base_url: String,
    pub debug_marker: String,
    pub history_limit: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl RelaySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            processing_reaction: config.slack.processing_reaction.clone(),
            topic_ttl: Duration::from_secs(config.store.ttl_secs),
            docs_base_url: config.assistant.docs_base_url.clone(),
            debug_marker: config.assistant.debug_marker.clone(),
            history_limit: config.history_limit(),
        }
    }
}

/// Why an event was dropped without any platform-visible effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The bot's own reply echoed back as a thread message.
    BotEcho,
    /// Thread message in a thread the bot never joined.
    NoTopic,
    /// Topic lookup failed for a thread message.
    StoreUnavailable,
}

/// Final state of one orchestration run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Replied,
    ErrorReplied,
    Dropped(DropReason),
}

#[derive(Debug, thiserror::Error)]
enum RelayError {
    #[error("Failed to create conversation ({status}): {body}")]
    CreateTopic { status: u16, body: String },

    #[error("Failed to process message ({status}): {body}")]
    SendMessage { status: u16, body: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RelayError {
    fn create_topic(err: AssistantError) -> Self {
        match err {
            AssistantError::Http { status, body } => Self::CreateTopic { status, body },
            other => Self::Other(other.into()),
        }
    }

    fn send_message(err: AssistantError) -> Self {
        match err {
            AssistantError::Http { status, body } => Self::SendMessage { status, body },
            other => Self::Other(other.into()),
        }
    }

    /// Text posted into the thread for this failure.
    fn user_message(&self) -> String {
        match self {
            Self::CreateTopic { .. } | Self::SendMessage { .. } => self.to_string(),
            Self::Other(e) => format!("Error: {e:#}"),
        }
    }
}

/// How the topic for a thread was obtained.
enum TopicResolution {
    Reused(String),
    Created(String),
}

impl TopicResolution {
    fn id(&self) -> &str {
        match self {
            Self::Reused(id) | Self::Created(id) => id,
        }
    }
}

/// Ties the topic store, the assistant API and the markdown transcoder together.
pub struct Relay {
    assistant: Arc<dyn AssistantApi>,
    store: Arc<dyn TopicStore>,
    settings: RelaySettings,
}

impl Relay {
    pub fn new(
        assistant: Arc<dyn AssistantApi>,
        store: Arc<dyn TopicStore>,
        settings: RelaySettings,
    ) -> Self {
        Self {
            assistant,
            store,
            settings,
        }
    }

    /// Run one inbound event to completion. Never returns an error: failures
    /// are reported into the thread.
    pub async fn handle_event(
        &self,
        channel: &dyn ThreadChannel,
        event: InboundEvent,
    ) -> RelayOutcome {
        let key = event.thread_key();

        let known_topic = match &event {
            InboundEvent::ThreadMessage(msg) => {
                if msg.is_bot_echo {
                    tracing::debug!("Relay: ignoring bot echo in {key}");
                    return RelayOutcome::Dropped(DropReason::BotEcho);
                }
                match self.store.get(&key).await {
                    Ok(Some(topic_id)) => Some(topic_id),
                    Ok(None) => {
                        tracing::debug!("Relay: no topic for {key}, ignoring thread message");
                        return RelayOutcome::Dropped(DropReason::NoTopic);
                    }
                    Err(e) => {
                        tracing::warn!("Relay: topic lookup failed for {key}: {e:#}");
                        return RelayOutcome::Dropped(DropReason::StoreUnavailable);
                    }
                }
            }
            InboundEvent::Mention(_) => None,
        };

        let source_channel = event.channel().to_string();
        let source_ts = event.ts().to_string();
        let thread_ts = event.thread_root().to_string();
        let reaction = self.settings.processing_reaction.as_str();

        tracing::info!(
            kind = event.kind(),
            key = %key,
            "Relay: handling \"{}\"",
            log_snippet(event.text(), 80)
        );

        channel
            .add_reaction_best_effort(&source_channel, &source_ts, reaction)
            .await;

        match self.compose_reply(channel, &event, &key, known_topic).await {
            Ok(text) => {
                let posted = channel.reply(&source_channel, &thread_ts, &text).await;
                channel
                    .remove_reaction_best_effort(&source_channel, &source_ts, reaction)
                    .await;

                match posted {
                    Ok(()) => RelayOutcome::Replied,
                    Err(e) => {
                        tracing::error!("Relay: failed to post reply in {key}: {e:#}");
                        let fallback = RelayError::Other(e).user_message();
                        self.post_error(channel, &source_channel, &thread_ts, &fallback)
                            .await;
                        RelayOutcome::ErrorReplied
                    }
                }
            }
            Err(err) => {
                tracing::error!("Relay: {key} failed: {err:#}");
                channel
                    .remove_reaction_best_effort(&source_channel, &source_ts, reaction)
                    .await;
                self.post_error(channel, &source_channel, &thread_ts, &err.user_message())
                    .await;
                RelayOutcome::ErrorReplied
            }
        }
    }

    async fn post_error(&self, channel: &dyn ThreadChannel, chat: &str, thread_ts: &str, text: &str) {
        if let Err(e) = channel.reply(chat, thread_ts, text).await {
            tracing::error!("Relay: failed to post error reply in {chat}/{thread_ts}: {e:#}");
        }
    }

    async fn resolve_topic(
        &self,
        key: &ThreadKey,
        known_topic: Option<String>,
    ) -> Result<TopicResolution, RelayError> {
        let existing = match known_topic {
            Some(topic_id) => Some(topic_id),
            None => self.store.get(key).await?,
        };
        if let Some(topic_id) = existing {
            return Ok(TopicResolution::Reused(topic_id));
        }

        let topic_id = self
            .assistant
            .create_topic()
            .await
            .map_err(RelayError::create_topic)?;

        // A lost mapping only costs context on the next turn; the answer still goes out.
        if let Err(e) = self.store.put(key, &topic_id, self.settings.topic_ttl).await {
            tracing::warn!("Relay: failed to persist topic for {key}: {e:#}");
        }
        tracing::info!("Relay: created topic {topic_id} for {key}");
        Ok(TopicResolution::Created(topic_id))
    }

    async fn compose_reply(
        &self,
        channel: &dyn ThreadChannel,
        event: &InboundEvent,
        key: &ThreadKey,
        known_topic: Option<String>,
    ) -> Result<String, RelayError> {
        let marker = self.settings.debug_marker.as_str();
        let mut trace = DebugTrace::new(format::is_debug_request(event.text(), marker));
        trace.record(format!("event: {} {key}", event.kind()));

        let topic = self.resolve_topic(key, known_topic).await?;
        trace.record(match &topic {
            TopicResolution::Reused(id) => format!("topic: reused {id}"),
            TopicResolution::Created(id) => format!("topic: created {id}"),
        });

        let cleaned = format::clean_message(event.text(), marker);
        let message = if matches!(topic, TopicResolution::Created(_))
            && event.is_inside_existing_thread()
        {
            let (with_history, count) = self.history_context(channel, event, &cleaned).await;
            trace.record(format!("history: {count} earlier messages"));
            with_history
        } else {
            cleaned
        };

        let raw = self
            .assistant
            .send_message(topic.id(), &message)
            .await
            .map_err(RelayError::send_message)?;
        trace.record(format!("reply: {} bytes", raw.len()));

        let reply = AssistantReply::parse(&raw);
        let mut text = markdown::to_slack_mrkdwn(&reply.display_text);

        match reply.sources() {
            Ok(sources) => {
                trace.record(format!("sources: {}", sources.len()));
                for (index, source) in sources.iter().enumerate() {
                    let label = source.title.as_deref().unwrap_or(&source.link);
                    trace.record(format!("source [{}]: {label}", index + 1));
                }
                if let Some(footer) =
                    format::citation_footer(&sources, &self.settings.docs_base_url)
                {
                    text.push_str("\n\n");
                    text.push_str(&footer);
                }
            }
            Err(e) => {
                tracing::warn!("Relay: failed to parse sources for {key}: {e}");
                trace.record("sources: unparseable");
            }
        }

        Ok(trace.wrap(&text))
    }

    /// Seed a fresh topic with the thread's earlier turns. Failure to fetch
    /// history degrades to sending the bare message.
    async fn history_context(
        &self,
        channel: &dyn ThreadChannel,
        event: &InboundEvent,
        cleaned: &str,
    ) -> (String, usize) {
        match channel
            .list_replies(
                event.channel(),
                event.thread_root(),
                self.settings.history_limit,
            )
            .await
        {
            Ok(history) => format::with_thread_history(
                &history,
                event.ts(),
                cleaned,
                &self.settings.debug_marker,
            ),
            Err(e) => {
                tracing::warn!(
                    "Relay: failed to fetch history for {}: {e:#}",
                    event.thread_key()
                );
                (cleaned.to_string(), 0)
            }
        }
    }
}

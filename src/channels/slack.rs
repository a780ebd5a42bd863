use super::traits::{
    HistoryMessage, InboundEvent, MentionEvent, ThreadChannel, ThreadMessageEvent,
};
use crate::config::SlackConfig;
use anyhow::Context;
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::time::Duration;

/// Largest page `conversations.replies` accepts.
pub const MAX_HISTORY_LIMIT: usize = 100;

/// Signed requests older than this are rejected as replays.
pub const SIGNATURE_MAX_AGE_SECS: u64 = 300;

/// Message subtypes that still represent a human posting in a thread.
const USER_MESSAGE_SUBTYPES: &[&str] = &["thread_broadcast", "file_share"];

/// Slack Web API client implementing the relay's thread capabilities.
pub struct SlackChannel {
    bot_token: String,
    api_base: String,
    bot_user_id: Option<String>,
    http: reqwest::Client,
}

impl SlackChannel {
    pub fn new(bot_token: String, api_base: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|error| {
                tracing::warn!("Failed to build Slack HTTP client: {error}");
                reqwest::Client::new()
            });

        Self {
            bot_token: bot_token.trim().to_string(),
            api_base: api_base.trim().trim_end_matches('/').to_string(),
            bot_user_id: None,
            http,
        }
    }

    pub fn from_config(config: &SlackConfig) -> Self {
        let channel = Self::new(config.bot_token.clone(), &config.api_base);
        match config.bot_user_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => channel.with_bot_user_id(id),
            _ => channel,
        }
    }

    pub fn with_bot_user_id(mut self, bot_user_id: impl Into<String>) -> Self {
        self.bot_user_id = Some(bot_user_id.into());
        self
    }

    pub fn bot_user_id(&self) -> Option<&str> {
        self.bot_user_id.as_deref()
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/{method}", self.api_base)
    }

    /// Slack returns 200 for most app-level errors; the JSON `ok` field decides.
    async fn check_response(method: &str, resp: reqwest::Response) -> anyhow::Result<serde_json::Value> {
        let status = resp.status();
        let body = resp
            .text()
            .await
            .unwrap_or_else(|e| format!("<failed to read response body: {e}>"));

        if !status.is_success() {
            anyhow::bail!("Slack {method} failed ({status}): {body}");
        }

        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap_or_default();
        if parsed.get("ok") == Some(&serde_json::Value::Bool(false)) {
            let err = parsed
                .get("error")
                .and_then(|e| e.as_str())
                .unwrap_or("unknown");
            anyhow::bail!("Slack {method} failed: {err}");
        }

        Ok(parsed)
    }

    async fn post_json(
        &self,
        method: &str,
        body: &serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        let resp = self
            .http
            .post(self.method_url(method))
            .bearer_auth(&self.bot_token)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Slack {method} request failed"))?;

        Self::check_response(method, resp).await
    }

    /// Resolve the bot's own user id through `auth.test`.
    pub async fn resolve_bot_user_id(&self) -> anyhow::Result<String> {
        let data = self.post_json("auth.test", &serde_json::json!({})).await?;
        data.get("user_id")
            .and_then(|u| u.as_str())
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(String::from)
            .context("Slack auth.test did not return user_id")
    }

    fn is_bot_message(&self, msg: &serde_json::Value) -> bool {
        if msg.get("bot_id").and_then(|b| b.as_str()).is_some() {
            return true;
        }
        match (self.bot_user_id.as_deref(), msg.get("user").and_then(|u| u.as_str())) {
            (Some(bot), Some(user)) => bot == user,
            _ => false,
        }
    }

    fn parse_history(&self, data: &serde_json::Value) -> Vec<HistoryMessage> {
        data.get("messages")
            .and_then(|m| m.as_array())
            .into_iter()
            .flatten()
            .filter_map(|msg| {
                let ts = msg.get("ts").and_then(|t| t.as_str())?;
                let text = msg.get("text").and_then(|t| t.as_str()).unwrap_or("");
                Some(HistoryMessage {
                    ts: ts.to_string(),
                    text: text.to_string(),
                    from_bot: self.is_bot_message(msg),
                })
            })
            .collect()
    }

    /// Slack answers `already_reacted` / `no_reaction` when the desired state
    /// already holds; neither is a failure for the relay.
    fn reaction_already_settled(error: &anyhow::Error) -> bool {
        let text = error.to_string();
        text.ends_with("already_reacted") || text.ends_with("no_reaction")
    }
}

#[async_trait]
impl ThreadChannel for SlackChannel {
    fn name(&self) -> &str {
        "slack"
    }

    async fn add_reaction(&self, channel: &str, ts: &str, name: &str) -> anyhow::Result<()> {
        let body = serde_json::json!({ "channel": channel, "timestamp": ts, "name": name });
        match self.post_json("reactions.add", &body).await {
            Err(e) if !Self::reaction_already_settled(&e) => Err(e),
            _ => Ok(()),
        }
    }

    async fn remove_reaction(&self, channel: &str, ts: &str, name: &str) -> anyhow::Result<()> {
        let body = serde_json::json!({ "channel": channel, "timestamp": ts, "name": name });
        match self.post_json("reactions.remove", &body).await {
            Err(e) if !Self::reaction_already_settled(&e) => Err(e),
            _ => Ok(()),
        }
    }

    async fn reply(&self, channel: &str, thread_ts: &str, text: &str) -> anyhow::Result<()> {
        let body = serde_json::json!({
            "channel": channel,
            "text": text,
            "thread_ts": thread_ts,
        });
        self.post_json("chat.postMessage", &body).await?;
        Ok(())
    }

    async fn list_replies(
        &self,
        channel: &str,
        thread_ts: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<HistoryMessage>> {
        let limit = limit.clamp(1, MAX_HISTORY_LIMIT);
        let params = [
            ("channel", channel.to_string()),
            ("ts", thread_ts.to_string()),
            ("limit", limit.to_string()),
        ];

        let resp = self
            .http
            .get(self.method_url("conversations.replies"))
            .bearer_auth(&self.bot_token)
            .query(&params)
            .send()
            .await
            .context("Slack conversations.replies request failed")?;

        let data = Self::check_response("conversations.replies", resp).await?;
        Ok(self.parse_history(&data))
    }
}

// ── Events API intake ─────────────────────────────────────────────

/// Top-level Events API envelope.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SlackEnvelope {
    UrlVerification {
        challenge: String,
    },
    EventCallback {
        #[serde(default)]
        event_id: Option<String>,
        event: SlackEvent,
    },
    #[serde(other)]
    Other,
}

/// The inner `event` object; only fields the relay reads.
#[derive(Debug, Clone, Deserialize)]
pub struct SlackEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub ts: Option<String>,
    #[serde(default)]
    pub thread_ts: Option<String>,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub bot_id: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
}

impl SlackEvent {
    /// Map a raw Slack event to a relay event.
    ///
    /// Returns `None` for event types the relay ignores, for top-level channel
    /// messages, and for thread messages that mention the bot (the paired
    /// `app_mention` event handles those).
    pub fn into_inbound(self, bot_user_id: Option<&str>) -> Option<InboundEvent> {
        let channel = self.channel.filter(|c| !c.is_empty())?;
        let ts = self.ts.filter(|t| !t.is_empty())?;
        let text = self.text.unwrap_or_default();
        let thread_ts = self.thread_ts.filter(|t| !t.is_empty());

        match self.kind.as_str() {
            "app_mention" => Some(InboundEvent::Mention(MentionEvent {
                text,
                channel,
                thread_ts,
                ts,
            })),
            "message" => {
                let thread_ts = thread_ts?;
                if let Some(bot) = bot_user_id {
                    if text.contains(&format!("<@{bot}>")) {
                        return None;
                    }
                }

                let echo_subtype = self
                    .subtype
                    .as_deref()
                    .is_some_and(|s| !USER_MESSAGE_SUBTYPES.contains(&s));
                let from_bot_user = matches!(
                    (bot_user_id, self.user.as_deref()),
                    (Some(bot), Some(user)) if bot == user
                );
                let is_bot_echo = echo_subtype || self.bot_id.is_some() || from_bot_user;

                Some(InboundEvent::ThreadMessage(ThreadMessageEvent {
                    text,
                    channel,
                    thread_ts,
                    ts,
                    is_bot_echo,
                }))
            }
            _ => None,
        }
    }
}

/// Reasons a signed Slack request is rejected.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("missing Slack signature headers")]
    MissingHeaders,
    #[error("invalid Slack request timestamp")]
    InvalidTimestamp,
    #[error("Slack request timestamp is outside the accepted window")]
    Stale,
    #[error("malformed Slack signature")]
    Malformed,
    #[error("Slack signature mismatch")]
    Mismatch,
}

/// Verify `X-Slack-Signature` (`v0=<hex hmac>`) over `v0:{timestamp}:{body}`.
pub fn verify_slack_signature(
    signing_secret: &str,
    timestamp: &str,
    body: &[u8],
    signature: &str,
    now_unix_secs: u64,
) -> Result<(), SignatureError> {
    let timestamp = timestamp.trim();
    let signature = signature.trim();
    if timestamp.is_empty() || signature.is_empty() {
        return Err(SignatureError::MissingHeaders);
    }

    let sent_at: u64 = timestamp
        .parse()
        .map_err(|_| SignatureError::InvalidTimestamp)?;
    if now_unix_secs.abs_diff(sent_at) > SIGNATURE_MAX_AGE_SECS {
        return Err(SignatureError::Stale);
    }

    let provided = signature
        .strip_prefix("v0=")
        .and_then(|hex_sig| hex::decode(hex_sig).ok())
        .ok_or(SignatureError::Malformed)?;

    let mut mac =
        Hmac::<Sha256>::new_from_slice(signing_secret.as_bytes()).map_err(|_| SignatureError::Malformed)?;
    mac.update(b"v0:");
    mac.update(timestamp.as_bytes());
    mac.update(b":");
    mac.update(body);

    mac.verify_slice(&provided)
        .map_err(|_| SignatureError::Mismatch)
}

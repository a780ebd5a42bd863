//! Remote docs-assistant API: topic creation, message exchange, reply parsing.

pub mod client;

pub use client::AssistantClient;

use async_trait::async_trait;
use serde::Deserialize;

/// Separates the human-readable answer from the JSON sources block in a reply.
pub const SOURCES_SEPARATOR: &str = "||";

/// Errors surfaced by assistant calls.
#[derive(Debug, thiserror::Error)]
pub enum AssistantError {
    /// The API answered with a non-success status.
    #[error("assistant API returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("assistant API request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("assistant API returned an invalid response: {0}")]
    InvalidResponse(String),
}

/// The two remote operations the relay needs. Each call is attempted once.
#[async_trait]
pub trait AssistantApi: Send + Sync {
    /// Open a new conversation and return its topic id.
    async fn create_topic(&self) -> Result<String, AssistantError>;

    /// Send one user turn into a topic and return the raw reply payload.
    async fn send_message(&self, topic_id: &str, message: &str) -> Result<String, AssistantError>;
}

/// A cited document accompanying an answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub link: String,
    pub title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawSource {
    link: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    metadata: Option<RawSourceMetadata>,
}

#[derive(Debug, Deserialize)]
struct RawSourceMetadata {
    #[serde(default)]
    title: Option<String>,
}

impl From<RawSource> for Source {
    fn from(raw: RawSource) -> Self {
        let title = raw
            .title
            .or_else(|| raw.metadata.and_then(|m| m.title))
            .filter(|t| !t.trim().is_empty());
        Self {
            link: raw.link,
            title,
        }
    }
}

/// A reply split into its display text and (still unparsed) sources block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssistantReply {
    pub display_text: String,
    pub sources_raw: Option<String>,
}

impl AssistantReply {
    /// Split a raw payload on the first `||` that opens the sources block.
    ///
    /// The sources block is a JSON array, so a `||` whose tail does not open
    /// with `[` belongs to the answer text (e.g. `a || b` in a code sample).
    /// Source titles may contain `||` themselves, hence the left-to-right scan.
    /// Without a qualifying separator the whole payload is display text.
    pub fn parse(raw: &str) -> Self {
        for (idx, _) in raw.match_indices(SOURCES_SEPARATOR) {
            let tail = raw[idx + SOURCES_SEPARATOR.len()..].trim();
            if tail.is_empty() || tail.starts_with('[') {
                return Self {
                    display_text: raw[..idx].to_string(),
                    sources_raw: (!tail.is_empty()).then(|| tail.to_string()),
                };
            }
        }

        Self {
            display_text: raw.to_string(),
            sources_raw: None,
        }
    }

    /// Decode the sources block. `Ok(empty)` when there is none.
    pub fn sources(&self) -> Result<Vec<Source>, serde_json::Error> {
        let Some(raw) = self.sources_raw.as_deref() else {
            return Ok(Vec::new());
        };
        let parsed: Vec<RawSource> = serde_json::from_str(raw)?;
        Ok(parsed.into_iter().map(Source::from).collect())
    }
}

use crate::assistant::Source;
use crate::channels::HistoryMessage;
use regex::Regex;
use std::sync::LazyLock;

static MENTION_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<@[A-Z0-9]+>").unwrap());

/// Strip bot-mention tokens and the debug marker, then trim.
pub fn clean_message(text: &str, debug_marker: &str) -> String {
    let without_mentions = MENTION_RE.replace_all(text, "");
    let cleaned = if debug_marker.is_empty() {
        without_mentions.into_owned()
    } else {
        without_mentions.replace(debug_marker, "")
    };
    cleaned.trim().to_string()
}

pub fn is_debug_request(text: &str, debug_marker: &str) -> bool {
    !debug_marker.is_empty() && text.contains(debug_marker)
}

/// Prefix the current message with earlier thread turns.
///
/// The triggering message (`current_ts`) is excluded and messages that are
/// empty after cleaning are skipped. Returns `current` unchanged when no
/// earlier turns remain.
pub fn with_thread_history(
    history: &[HistoryMessage],
    current_ts: &str,
    current: &str,
    debug_marker: &str,
) -> (String, usize) {
    let lines: Vec<String> = history
        .iter()
        .filter(|msg| msg.ts != current_ts)
        .filter_map(|msg| {
            let text = clean_message(&msg.text, debug_marker);
            if text.is_empty() {
                return None;
            }
            let sender = if msg.from_bot { "Assistant" } else { "User" };
            Some(format!("{sender}: {text}"))
        })
        .collect();

    if lines.is_empty() {
        return (current.to_string(), 0);
    }

    let count = lines.len();
    (
        format!(
            "Previous conversation in this thread:\n{}\n\nCurrent message: {current}",
            lines.join("\n")
        ),
        count,
    )
}

/// Resolve a source link against the docs site unless it is already absolute.
pub fn absolutize_link(link: &str, docs_base_url: &str) -> String {
    if link.starts_with("http") {
        return link.to_string();
    }
    format!(
        "{}/{}",
        docs_base_url.trim_end_matches('/'),
        link.trim_start_matches('/')
    )
}

/// `Sources: <url|[1]> <url|[2]>`, or `None` when there is nothing to cite.
pub fn citation_footer(sources: &[Source], docs_base_url: &str) -> Option<String> {
    if sources.is_empty() {
        return None;
    }

    let links = sources
        .iter()
        .enumerate()
        .map(|(index, source)| {
            format!(
                "<{}|[{}]>",
                absolutize_link(&source.link, docs_base_url),
                index + 1
            )
        })
        .collect::<Vec<_>>()
        .join(" ");

    Some(format!("Sources: {links}"))
}

/// Trace lines collected during one run; only kept when debug mode is on.
#[derive(Debug, Default)]
pub struct DebugTrace {
    enabled: bool,
    lines: Vec<String>,
}

impl DebugTrace {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            lines: Vec::new(),
        }
    }

    pub fn record(&mut self, line: impl Into<String>) {
        if self.enabled {
            self.lines.push(line.into());
        }
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Prepend the trace block and a `---` rule to `body`.
    pub fn wrap(&self, body: &str) -> String {
        if !self.enabled || self.lines.is_empty() {
            return body.to_string();
        }
        format!("{}\n---\n{body}", self.lines.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(ts: &str, text: &str, from_bot: bool) -> HistoryMessage {
        HistoryMessage {
            ts: ts.into(),
            text: text.into(),
            from_bot,
        }
    }

    #[test]
    fn clean_strips_mentions_and_debug_marker() {
        assert_eq!(
            clean_message("<@U123ABC> [debug] how do I <@U9> log in? ", "[debug]"),
            "how do I  log in?"
        );
        assert_eq!(clean_message("<@U1>", "[debug]"), "");
    }

    #[test]
    fn clean_keeps_lowercase_angle_tokens() {
        assert_eq!(clean_message("see <#C1|general>", "[debug]"), "see <#C1|general>");
    }

    #[test]
    fn debug_request_requires_marker() {
        assert!(is_debug_request("hi [debug]", "[debug]"));
        assert!(!is_debug_request("hi", "[debug]"));
        assert!(!is_debug_request("hi", ""));
    }

    #[test]
    fn history_block_labels_senders_and_skips_current() {
        let history = vec![
            msg("1.0", "<@UBOT> first question", false),
            msg("1.1", "first answer", true),
            msg("1.2", "<@UBOT> second question", false),
        ];

        let (text, count) = with_thread_history(&history, "1.2", "second question", "[debug]");
        assert_eq!(count, 2);
        assert_eq!(
            text,
            "Previous conversation in this thread:\n\
             User: first question\n\
             Assistant: first answer\n\
             \n\
             Current message: second question"
        );
    }

    #[test]
    fn history_with_only_current_message_is_passthrough() {
        let history = vec![msg("1.0", "hello", false)];
        let (text, count) = with_thread_history(&history, "1.0", "hello", "[debug]");
        assert_eq!(text, "hello");
        assert_eq!(count, 0);
    }

    #[test]
    fn footer_absolutizes_relative_links_only() {
        let sources = vec![
            Source {
                link: "a/b".into(),
                title: None,
            },
            Source {
                link: "http://y".into(),
                title: Some("Y".into()),
            },
        ];

        assert_eq!(
            citation_footer(&sources, "https://docs.firstquadrant.ai/").as_deref(),
            Some("Sources: <https://docs.firstquadrant.ai/a/b|[1]> <http://y|[2]>")
        );
    }

    #[test]
    fn footer_handles_leading_slash_and_missing_base_slash() {
        assert_eq!(
            absolutize_link("/guides/x", "https://docs.example.com"),
            "https://docs.example.com/guides/x"
        );
    }

    #[test]
    fn empty_sources_have_no_footer() {
        assert!(citation_footer(&[], "https://docs.example.com").is_none());
    }

    #[test]
    fn disabled_trace_records_nothing() {
        let mut trace = DebugTrace::new(false);
        trace.record("x");
        assert!(trace.lines().is_empty());
        assert_eq!(trace.wrap("body"), "body");
    }

    #[test]
    fn enabled_trace_prepends_rule() {
        let mut trace = DebugTrace::new(true);
        trace.record("event: mention");
        trace.record("topic: created");
        assert_eq!(trace.wrap("body"), "event: mention\ntopic: created\n---\nbody");
    }
}

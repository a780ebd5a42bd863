//! Markdown to Slack mrkdwn transcoding.
//!
//! The assistant answers in CommonMark-flavoured markdown; Slack renders its
//! own dialect (`*bold*`, `_italic_`, `~strike~`, `<url|label>`). The rewrite
//! runs as an ordered list of regex passes over the prose, with code fences
//! and inline code lifted out first so no pass can touch code content.
//!
//! Pass order matters:
//! 1. `**x**` / `__x__` become bold before anything that reads single `*`/`_`.
//! 2. `#`..`###` headings become bold.
//! 3. `* `, `- ` and `1. ` list markers become `•` before the italic pass
//!    could mistake a leading `*` for an emphasis delimiter.
//! 4. `~~x~~` becomes `~x~`.
//! 5. Fenced code keeps its fence and content but loses the language tag.
//! 6. Inline code passes through untouched.
//! 7. `[label](url)` becomes `<url|label>`.
//! 8. Remaining mid-line `*x*` becomes `_x_`.
//! 9. Block quotes (`> x`) already match Slack and pass through.
//! 10. Runs of three or more newlines collapse to one blank line.
//!
//! Bold delimiters produced by passes 1 and 2 are carried as a private-use
//! sentinel until the end so pass 8 never re-reads them as italics.

use regex::{Captures, Regex};
use std::sync::LazyLock;

/// Stand-in for a bold `*` emitted by an earlier pass.
const BOLD_MARK: char = '\u{E000}';
/// Delimits a protected code span placeholder: `MARK<index>MARK`.
const CODE_MARK: char = '\u{E001}';

/// Opening fence, optional language tag terminated by a newline, lazy body, closing fence.
static FENCED_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:([A-Za-z0-9_+#.\-]*)\n)?(.*?)```").unwrap());

static INLINE_CODE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"`[^`\n]+`").unwrap());

static BOLD_STAR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\*\*(.+?)\*\*").unwrap());

static BOLD_UNDERSCORE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"__(.+?)__").unwrap());

static HEADING_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^#{1,3} (.+)$").unwrap());

static UNORDERED_ITEM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^([ \t]*)[*\-] (.+)$").unwrap());

static ORDERED_ITEM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^([ \t]*)\d+\. (.+)$").unwrap());

static STRIKE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"~~(.+?)~~").unwrap());

static LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\]]+)\]\(([^)\s]+)\)").unwrap());

/// A `*x*` span whose opener is preceded by something other than a line break
/// (the `regex` crate has no lookbehind, so the preceding char is captured).
/// Delimiters must hug non-space text, which keeps `a * b * c` intact.
static ITALIC_STAR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([^\n*])\*([^*\s](?:[^*\n]*[^*\s])?)\*").unwrap()
});

static EXCESS_NEWLINES_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());

static CODE_PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("\u{E001}(\\d+)\u{E001}").unwrap());

/// Convert assistant markdown into Slack mrkdwn.
///
/// Total and pure: malformed markdown is rewritten on a best-effort basis and
/// never produces an error. Not idempotent; list bullets and italics change
/// meaning on a second pass.
pub fn to_slack_mrkdwn(markdown: &str) -> String {
    // Sentinels in the input would be read back as bold marks or placeholders.
    let markdown: String = markdown
        .chars()
        .filter(|c| *c != BOLD_MARK && *c != CODE_MARK)
        .collect();

    let mut code_spans = Vec::new();
    let text = protect_code(&markdown, &mut code_spans);

    let bold = format!("{BOLD_MARK}${{1}}{BOLD_MARK}");
    let text = BOLD_STAR_RE.replace_all(&text, bold.as_str());
    let text = BOLD_UNDERSCORE_RE.replace_all(&text, bold.as_str());

    let text = HEADING_RE.replace_all(&text, |caps: &Captures<'_>| {
        let title = caps[1].trim_end().replace(BOLD_MARK, "");
        format!("{BOLD_MARK}{title}{BOLD_MARK}")
    });

    let text = UNORDERED_ITEM_RE.replace_all(&text, "${1}• ${2}");
    let text = ORDERED_ITEM_RE.replace_all(&text, "${1}• ${2}");

    let text = STRIKE_RE.replace_all(&text, "~$1~");
    let text = LINK_RE.replace_all(&text, "<$2|$1>");
    let text = ITALIC_STAR_RE.replace_all(&text, "${1}_${2}_");
    let text = EXCESS_NEWLINES_RE.replace_all(&text, "\n\n");

    let text = text.replace(BOLD_MARK, "*");
    restore_code(&text, &code_spans)
}

/// Swap fenced blocks and inline spans for placeholders, stripping fence
/// language tags on the way out.
fn protect_code(input: &str, spans: &mut Vec<String>) -> String {
    let fenced = FENCED_CODE_RE.replace_all(input, |caps: &Captures<'_>| {
        let body = caps.get(2).map_or("", |m| m.as_str());
        let rendered = if caps.get(1).is_some() {
            format!("```\n{body}```")
        } else {
            format!("```{body}```")
        };
        push_placeholder(spans, rendered)
    });

    INLINE_CODE_RE
        .replace_all(&fenced, |caps: &Captures<'_>| {
            push_placeholder(spans, caps[0].to_string())
        })
        .into_owned()
}

fn push_placeholder(spans: &mut Vec<String>, rendered: String) -> String {
    spans.push(rendered);
    format!("{CODE_MARK}{}{CODE_MARK}", spans.len() - 1)
}

fn restore_code(text: &str, spans: &[String]) -> String {
    CODE_PLACEHOLDER_RE
        .replace_all(text, |caps: &Captures<'_>| {
            caps[1]
                .parse::<usize>()
                .ok()
                .and_then(|index| spans.get(index))
                .cloned()
                .unwrap_or_default()
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bold_becomes_single_asterisk() {
        assert_eq!(to_slack_mrkdwn("**bold**"), "*bold*");
        assert_eq!(to_slack_mrkdwn("__bold__"), "*bold*");
        assert_eq!(to_slack_mrkdwn("a **b** c"), "a *b* c");
    }

    #[test]
    fn headings_become_bold() {
        assert_eq!(to_slack_mrkdwn("# Title"), "*Title*");
        assert_eq!(to_slack_mrkdwn("## Section"), "*Section*");
        assert_eq!(to_slack_mrkdwn("### Sub"), "*Sub*");
    }

    #[test]
    fn deep_headings_are_left_alone() {
        assert_eq!(to_slack_mrkdwn("#### Deep"), "#### Deep");
    }

    #[test]
    fn heading_with_inline_bold_is_not_double_wrapped() {
        assert_eq!(to_slack_mrkdwn("# **Setup** guide"), "*Setup guide*");
    }

    #[test]
    fn heading_is_not_treated_as_list_item() {
        let out = to_slack_mrkdwn("# Install\n- step");
        assert_eq!(out, "*Install*\n• step");
    }

    #[test]
    fn list_items_become_bullets() {
        assert_eq!(to_slack_mrkdwn("- item"), "• item");
        assert_eq!(to_slack_mrkdwn("* item"), "• item");
        assert_eq!(to_slack_mrkdwn("1. first\n2. second"), "• first\n• second");
    }

    #[test]
    fn nested_list_keeps_indentation() {
        assert_eq!(to_slack_mrkdwn("- a\n  - b"), "• a\n  • b");
    }

    #[test]
    fn star_list_marker_is_not_read_as_italic() {
        assert_eq!(
            to_slack_mrkdwn("* first *point*\n* second"),
            "• first _point_\n• second"
        );
    }

    #[test]
    fn strikethrough_uses_single_tilde() {
        assert_eq!(to_slack_mrkdwn("~~gone~~"), "~gone~");
    }

    #[test]
    fn links_use_angle_bracket_form() {
        assert_eq!(to_slack_mrkdwn("[a](http://x)"), "<http://x|a>");
        assert_eq!(
            to_slack_mrkdwn("see [the docs](https://docs.example.com/a) now"),
            "see <https://docs.example.com/a|the docs> now"
        );
    }

    #[test]
    fn mid_line_single_asterisk_becomes_italic() {
        assert_eq!(
            to_slack_mrkdwn("This is **bold** and *italic*"),
            "This is *bold* and _italic_"
        );
    }

    #[test]
    fn arithmetic_asterisks_are_not_italic() {
        assert_eq!(to_slack_mrkdwn("compute a * b * c"), "compute a * b * c");
    }

    #[test]
    fn underscore_italics_pass_through() {
        assert_eq!(to_slack_mrkdwn("an _emphasised_ word"), "an _emphasised_ word");
    }

    #[test]
    fn fenced_code_drops_language_and_keeps_content() {
        let out = to_slack_mrkdwn("```js\ncode\n```");
        assert_eq!(out, "```\ncode\n```");
        assert!(out.starts_with("```"));
        assert!(out.ends_with("```"));
    }

    #[test]
    fn fenced_code_content_is_not_rewritten() {
        let input = "Run:\n```rust\nlet x = a * b * c;\n**not bold** [x](y)\n\n\n\n- item\n```\ndone";
        let out = to_slack_mrkdwn(input);
        assert!(out.contains("let x = a * b * c;\n**not bold** [x](y)\n\n\n\n- item\n```"));
        assert!(out.starts_with("Run:\n```\n"));
        assert!(out.ends_with("```\ndone"));
    }

    #[test]
    fn fence_without_newline_keeps_body() {
        assert_eq!(to_slack_mrkdwn("```ls -la```"), "```ls -la```");
    }

    #[test]
    fn inline_code_is_untouched() {
        assert_eq!(
            to_slack_mrkdwn("use `**kwargs` and **this**"),
            "use `**kwargs` and *this*"
        );
    }

    #[test]
    fn block_quotes_pass_through() {
        assert_eq!(to_slack_mrkdwn("> quoted"), "> quoted");
    }

    #[test]
    fn private_use_sentinels_in_input_are_dropped() {
        assert_eq!(to_slack_mrkdwn("x \u{E001}0\u{E001} y"), "x 0 y");
        assert_eq!(
            to_slack_mrkdwn("`a` then \u{E001}0\u{E001}"),
            "`a` then 0"
        );
        assert_eq!(to_slack_mrkdwn("\u{E000}plain\u{E000}"), "plain");
    }

    #[test]
    fn excess_newlines_collapse() {
        assert_eq!(to_slack_mrkdwn("a\n\n\n\nb"), "a\n\nb");
        assert_eq!(to_slack_mrkdwn("a\n\nb"), "a\n\nb");
    }

    #[test]
    fn unclosed_markup_is_best_effort() {
        assert_eq!(to_slack_mrkdwn("**open"), "**open");
        assert_eq!(to_slack_mrkdwn("```js\nno close"), "```js\nno close");
        assert_eq!(to_slack_mrkdwn(""), "");
    }

    #[test]
    fn mixed_document() {
        let input = "## Answer\n\nUse **SDK** v2:\n\n1. Install\n2. Configure [keys](https://x.dev/k)\n\n\n> Note: ~~old~~ new";
        let expected =
            "*Answer*\n\nUse *SDK* v2:\n\n• Install\n• Configure <https://x.dev/k|keys>\n\n> Note: ~old~ new";
        assert_eq!(to_slack_mrkdwn(input), expected);
    }
}

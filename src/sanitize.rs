//! Reply sanitization for speech synthesis
//!
//! LLM replies carry markup that reads badly aloud: code fences, HTML
//! tags, emoji, emphasis markers, stuttered punctuation. The sanitizer
//! strips all of it down to plain speakable text. It is idempotent, and
//! when stripping leaves nothing it falls back to the raw trimmed reply
//! rather than emitting an empty speech request.

use std::sync::LazyLock;

use regex::Regex;

/// Fenced code blocks, including their content
static CODE_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```[^`]*```").expect("valid regex"));

/// HTML/XML tags
static HTML_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^<>]+>").expect("valid regex"));

/// Emoji and pictographic symbols (common blocks plus ZWJ/variation selector)
static EMOJI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\x{1F100}-\x{1FAFF}\x{2600}-\x{27BF}\x{2B00}-\x{2BFF}\x{FE0F}\x{200D}]")
        .expect("valid regex")
});

/// Markdown emphasis and heading markers
static EMPHASIS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[*_`~#]+").expect("valid regex"));

/// Runs of the same punctuation character
///
/// The `regex` crate has no backreferences, so each character gets its
/// own alternation branch instead of a single `([!?.,;:])\1+` pattern.
static REPEAT_PUNCT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(!)!+|(\?)\?+|(\.)\.+|(,),+|(;);+|(:):+").expect("valid regex")
});

/// Any whitespace run, including newlines
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Strip a reply down to plain speakable text
///
/// Removes fenced code blocks, HTML tags, emoji, markdown emphasis
/// markers; collapses repeated punctuation; normalizes newlines and
/// whitespace to single spaces. Falls back to the raw trimmed input when
/// the stripped result is blank, so the caller always gets something to
/// speak for a non-blank reply.
#[must_use]
pub fn sanitize_for_speech(reply: &str) -> String {
    let text = CODE_FENCE.replace_all(reply, " ");
    let text = HTML_TAG.replace_all(&text, " ");
    let text = EMOJI.replace_all(&text, "");
    let text = EMPHASIS.replace_all(&text, "");
    let text = REPEAT_PUNCT.replace_all(&text, "${1}${2}${3}${4}${5}${6}");
    let text = WHITESPACE.replace_all(&text, " ");
    let cleaned = text.trim();

    if cleaned.is_empty() {
        reply.trim().to_string()
    } else {
        cleaned.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_markdown_emphasis() {
        assert_eq!(sanitize_for_speech("**Sunny** today!"), "Sunny today!");
        assert_eq!(sanitize_for_speech("_quiet_ and *calm*"), "quiet and calm");
    }

    #[test]
    fn test_strips_code_fences_with_content() {
        let reply = "Run this:\n```rust\nfn main() {}\n```\nand you're done.";
        assert_eq!(sanitize_for_speech(reply), "Run this: and you're done.");
    }

    #[test]
    fn test_strips_html_tags() {
        assert_eq!(
            sanitize_for_speech("<b>bold</b> and <a href=\"x\">link</a>"),
            "bold and link"
        );
    }

    #[test]
    fn test_strips_emoji() {
        assert_eq!(sanitize_for_speech("Great job 🎉👍"), "Great job");
        assert_eq!(sanitize_for_speech("sun ☀️ is out"), "sun is out");
    }

    #[test]
    fn test_collapses_repeated_punctuation() {
        assert_eq!(sanitize_for_speech("Wow!!! Really???"), "Wow! Really?");
        assert_eq!(sanitize_for_speech("wait.... what"), "wait. what");
    }

    #[test]
    fn test_normalizes_newlines_and_whitespace() {
        assert_eq!(
            sanitize_for_speech("line one\n\nline   two\tend"),
            "line one line two end"
        );
    }

    #[test]
    fn test_blank_result_falls_back_to_raw_trimmed() {
        // A reply that is nothing but markup strips to empty; the raw
        // trimmed text is returned instead of an empty string.
        assert_eq!(sanitize_for_speech("  🎉🎉  "), "🎉🎉");
    }

    #[test]
    fn test_idempotent_on_clean_text() {
        let clean = "The weather is sunny today.";
        assert_eq!(sanitize_for_speech(clean), clean);
    }

    #[test]
    fn test_idempotent_in_general() {
        for reply in [
            "**Sunny** today!",
            "Run `cargo test` now...",
            "<p>hi</p>\n\nbye!!",
            "plain text",
        ] {
            let once = sanitize_for_speech(reply);
            let twice = sanitize_for_speech(&once);
            assert_eq!(once, twice, "not idempotent for {reply:?}");
        }
    }

    #[test]
    fn test_preserves_plain_punctuation() {
        assert_eq!(
            sanitize_for_speech("Yes, it is. Isn't it?"),
            "Yes, it is. Isn't it?"
        );
    }
}

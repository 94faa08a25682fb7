//! Tolerant extraction of structured tags from LLM output.
//!
//! Models asked to emit `<THOUGHT>`, `<DRAFT>`, `<ACTION>` and
//! `<FINAL_ANSWER>` regions produce every imaginable malformation: unclosed
//! tags, attributes with stray whitespace, tags quoted inside prose
//! ("use <ACTION> tags"), or whole emissions embedded in an escaped error
//! payload. This parser extracts what it can instead of rejecting.

use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

const TAGS: &[&str] = &["THOUGHT", "DRAFT", "ACTION", "FINAL_ANSWER"];

/// Extracted regions of one model emission.
#[derive(Debug, Clone, Default)]
pub struct ParsedReact {
    pub thought: Option<String>,
    pub thought_attrs: HashMap<String, String>,
    pub draft: Option<String>,
    pub action: Option<String>,
    pub final_answer: Option<String>,
}

impl ParsedReact {
    pub fn is_empty(&self) -> bool {
        self.thought.is_none()
            && self.draft.is_none()
            && self.action.is_none()
            && self.final_answer.is_none()
    }
}

fn open_tag_pattern(tag: &str) -> Regex {
    Regex::new(&format!(r"<{}((?:\s+[^>]*)?)>", tag)).expect("valid tag regex")
}

fn title_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r#"title\s*=\s*"([^"]*)""#).expect("valid regex"))
}

/// A tag immediately followed by prose like "tags" is a mention, not an
/// emission ("you must use <ACTION> tags").
fn is_mention(content: &str) -> bool {
    let trimmed = content.trim_start();
    trimmed.starts_with("tags") || trimmed.starts_with("tag ")
}

fn extract_tag(text: &str, tag: &str, require_close: bool) -> Option<(String, String)> {
    let open = open_tag_pattern(tag);
    let close = format!("</{}>", tag);

    for m in open.find_iter(text) {
        let attrs = open
            .captures(&text[m.start()..m.end()])
            .and_then(|c| c.get(1))
            .map(|a| a.as_str().to_string())
            .unwrap_or_default();
        let after = &text[m.end()..];
        let content = match after.find(&close) {
            Some(idx) => &after[..idx],
            None if require_close => continue,
            None => after,
        };
        if is_mention(content) {
            continue;
        }
        let content = content.trim();
        if content.is_empty() {
            continue;
        }
        return Some((content.to_string(), attrs));
    }
    None
}

fn parse_with(text: &str, require_close: bool) -> ParsedReact {
    let mut parsed = ParsedReact::default();
    for tag in TAGS {
        let Some((content, attrs)) = extract_tag(text, tag, require_close) else {
            continue;
        };
        match *tag {
            "THOUGHT" => {
                if let Some(title) = title_pattern().captures(&attrs).map(|c| c[1].to_string()) {
                    parsed.thought_attrs.insert("title".to_string(), title);
                }
                parsed.thought = Some(content);
            }
            "DRAFT" => parsed.draft = Some(content),
            "ACTION" => parsed.action = Some(content),
            "FINAL_ANSWER" => parsed.final_answer = Some(content),
            _ => unreachable!(),
        }
    }
    parsed
}

/// Parses a model emission, tolerating unclosed tags.
pub fn parse(text: &str) -> ParsedReact {
    parse_with(text, false)
}

/// Recovers structured content from a provider error payload (the escaped
/// `failed_generation` blob a 400 carries). Tags must be properly closed
/// here, since an unclosed tag inside a log line is noise, not signal. When no
/// tag survives, the whole recovered generation is treated as a thought.
pub fn extract_from_failed_generation(payload: &str) -> ParsedReact {
    let field = failed_generation_field(payload);
    let had_generation = field.is_some();
    let generation = field.as_deref().map(unescape).unwrap_or_else(|| unescape(payload));

    let mut parsed = parse_with(&generation, true);
    // Only a real failed_generation blob earns the whole-text-as-thought
    // fallback; arbitrary reject messages are not model output.
    if parsed.is_empty() && had_generation {
        let cleaned = generation.trim();
        if cleaned.len() > 10 {
            parsed.thought = Some(cleaned.to_string());
        }
    }
    parsed
}

/// Pulls the raw (still escaped) string value of `"failed_generation"` out
/// of an error payload, walking escapes by hand since the payload itself is
/// arbitrarily quoted.
fn failed_generation_field(payload: &str) -> Option<String> {
    let marker = "\"failed_generation\"";
    let start = payload.find(marker)? + marker.len();
    let rest = &payload[start..];
    let quote = rest.find('"')?;
    let body = &rest[quote + 1..];

    let mut out = String::new();
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                out.push(c);
                if let Some(escaped) = chars.next() {
                    out.push(escaped);
                }
            }
            '"' => return Some(out),
            _ => out.push(c),
        }
    }
    Some(out)
}

fn unescape(text: &str) -> String {
    text.replace("\\n", "\n")
        .replace("\\t", "\t")
        .replace("\\\"", "\"")
}

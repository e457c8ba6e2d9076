//! Message content normalization: markup stripping, entity decoding,
//! quote-block attribution, and typographic quotes.
//!
//! Two backends implement the same contract. `Structural` walks the markup
//! with a small tokenizer; `Regex` is the fallback path built from
//! `once_cell` statics. Output is identical for content without
//! parser-specific edge cases, so the backend choice is a process-start
//! capability decision, not a per-call one.

use once_cell::sync::Lazy;
use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizerBackend {
    Structural,
    Regex,
}

#[derive(Debug, Clone, Copy)]
pub struct ContentNormalizer {
    backend: NormalizerBackend,
}

static QUOTE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)<quote\b[^>]*?authorname="([^"]*)"[^>]*>(.*?)</quote>"#)
        .expect("quote regex")
});

static LEGACY_QUOTE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<legacyquote>.*?</legacyquote>").expect("legacyquote regex"));

static BR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<br\s*/?>").expect("br regex"));

static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").expect("tag regex"));

impl ContentNormalizer {
    pub fn new(backend: NormalizerBackend) -> Self {
        Self { backend }
    }

    /// Resolve the backend once at startup. The structural tokenizer is
    /// always compiled in, so it is the default; the regex path stays as
    /// the degraded-capability fallback.
    pub fn detect() -> Self {
        Self::new(NormalizerBackend::Structural)
    }

    pub fn backend(&self) -> NormalizerBackend {
        self.backend
    }

    /// Produce clean display text from raw message markup.
    pub fn normalize(&self, raw: &str) -> String {
        let stripped = match self.backend {
            NormalizerBackend::Structural => strip_structural(raw),
            NormalizerBackend::Regex => strip_regex(raw),
        };
        let decoded = decode_entities(&stripped);
        typographic_quotes(decoded.trim())
    }
}

impl Default for ContentNormalizer {
    fn default() -> Self {
        Self::detect()
    }
}

fn strip_regex(raw: &str) -> String {
    let no_legacy = LEGACY_QUOTE_RE.replace_all(raw, "");
    let quoted = QUOTE_RE.replace_all(&no_legacy, "$1 wrote:\n> $2\n");
    let with_breaks = BR_RE.replace_all(&quoted, "\n");
    TAG_RE.replace_all(&with_breaks, "").into_owned()
}

/// Single-pass tag tokenizer. Text outside tags is copied through; quote
/// blocks become attributed lines, line breaks become newlines, legacyquote
/// bodies are dropped, and every other tag is removed.
fn strip_structural(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    let mut skipping_legacy = false;

    while let Some(open) = rest.find('<') {
        if !skipping_legacy {
            out.push_str(&rest[..open]);
        }
        let Some(close) = rest[open..].find('>') else {
            // Unterminated tag: treat the remainder as text.
            if !skipping_legacy {
                out.push_str(&rest[open..]);
            }
            return out;
        };
        let tag_body = &rest[open + 1..open + close];
        rest = &rest[open + close + 1..];

        let (name, attrs) = split_tag(tag_body);
        match name.to_ascii_lowercase().as_str() {
            "quote" => {
                if let Some(author) = attr_value(attrs, "authorname") {
                    out.push_str(&author);
                    out.push_str(" wrote:\n> ");
                }
            }
            "/quote" => out.push('\n'),
            "br" | "br/" => {
                if !skipping_legacy {
                    out.push('\n');
                }
            }
            "legacyquote" => skipping_legacy = true,
            "/legacyquote" => skipping_legacy = false,
            _ => {}
        }
    }
    if !skipping_legacy {
        out.push_str(rest);
    }
    out
}

fn split_tag(body: &str) -> (&str, &str) {
    let trimmed = body.trim().trim_end_matches('/');
    match trimmed.find(char::is_whitespace) {
        Some(idx) => (&trimmed[..idx], &trimmed[idx..]),
        None => (trimmed, ""),
    }
}

fn attr_value(attrs: &str, name: &str) -> Option<String> {
    let needle = format!("{name}=\"");
    let start = attrs.find(&needle)? + needle.len();
    let end = attrs[start..].find('"')?;
    Some(attrs[start..start + end].to_string())
}

fn decode_entities(input: &str) -> String {
    // `&amp;` last so `&amp;lt;` decodes to the literal `&lt;`.
    input
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}

/// Convert straight quotes to typographic ones. A double quote opens after
/// start-of-text, whitespace or an opening bracket and closes otherwise;
/// a single quote between word characters is an apostrophe.
fn typographic_quotes(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut prev: Option<char> = None;
    for ch in input.chars() {
        let opening = matches!(prev, None | Some(' ') | Some('\n') | Some('\t'))
            || matches!(prev, Some('(') | Some('[') | Some('{'));
        match ch {
            '"' => out.push(if opening { '\u{201C}' } else { '\u{201D}' }),
            '\'' => out.push(if opening { '\u{2018}' } else { '\u{2019}' }),
            _ => out.push(ch),
        }
        prev = Some(ch);
    }
    out
}

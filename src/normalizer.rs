// src/normalizer.rs
// First strategy to yield a JSON array wins; otherwise the text comes back unformatted.

use crate::models::AiQueryResult;
use log::debug;
use serde_json::Value;
use std::ops::Range;

const FENCE: &str = "```";

struct Extraction {
    data: Vec<Value>,
    span: Range<usize>,
}

type Strategy = fn(&str) -> Option<Extraction>;

const STRATEGIES: &[(&str, Strategy)] = &[
    ("direct", parse_direct),
    ("fenced", parse_fenced),
    ("balanced", parse_balanced),
];

pub fn normalize(text: &str) -> AiQueryResult {
    for (name, strategy) in STRATEGIES {
        if let Some(extraction) = strategy(text) {
            debug!(
                "Extracted {} records with {} strategy",
                extraction.data.len(),
                name
            );
            return AiQueryResult {
                formatted: true,
                data: extraction.data,
                message: residual(text, extraction.span),
                success: true,
            };
        }
    }

    debug!("No JSON array found in {} chars of model output", text.len());
    AiQueryResult {
        formatted: false,
        data: Vec::new(),
        message: text.to_string(),
        success: false,
    }
}

fn parse_array(candidate: &str) -> Option<Vec<Value>> {
    match serde_json::from_str::<Value>(candidate.trim()) {
        Ok(Value::Array(items)) => Some(items),
        _ => None,
    }
}

fn residual(text: &str, span: Range<usize>) -> String {
    let mut rest = String::with_capacity(text.len());
    rest.push_str(&text[..span.start]);
    rest.push(' ');
    rest.push_str(&text[span.end..]);
    rest.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn parse_direct(text: &str) -> Option<Extraction> {
    let data = parse_array(text)?;
    Some(Extraction {
        data,
        span: 0..text.len(),
    })
}

fn parse_fenced(text: &str) -> Option<Extraction> {
    let mut cursor = 0;
    while let Some(open) = text[cursor..].find(FENCE).map(|i| cursor + i) {
        let body_start = open + FENCE.len();
        let close = text[body_start..].find(FENCE).map(|i| body_start + i)?;
        let body = strip_info_string(&text[body_start..close]);
        if let Some(data) = parse_array(body) {
            return Some(Extraction {
                data,
                span: open..close + FENCE.len(),
            });
        }
        cursor = close + FENCE.len();
    }
    None
}

/// Drops a language tag such as `json` from the start of the fence body,
/// whether the tag ends in a newline or a space.
fn strip_info_string(body: &str) -> &str {
    let trimmed = body.trim_start_matches([' ', '\t']);
    let tag_len = trimmed
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '_'))
        .unwrap_or(trimmed.len());
    match trimmed[tag_len..].chars().next() {
        Some(c) if tag_len > 0 && c.is_whitespace() => &trimmed[tag_len..],
        _ => body,
    }
}

fn parse_balanced(text: &str) -> Option<Extraction> {
    let mut spans = closed_arrays(text);
    spans.sort_by_key(|span| span.start);
    spans.into_iter().find_map(|span| {
        let data = parse_array(&text[span.clone()])?;
        Some(Extraction { data, span })
    })
}

/// Byte ranges of every balanced `[...]` in `text`, in one pass.
/// Quotes only open a string literal inside a bracket; a mismatched closer
/// abandons every bracket still open.
fn closed_arrays(text: &str) -> Vec<Range<usize>> {
    let mut open: Vec<(usize, char)> = Vec::new();
    let mut spans = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' if !open.is_empty() => in_string = true,
            '[' => open.push((i, ']')),
            '{' => open.push((i, '}')),
            ']' | '}' => match open.pop() {
                Some((start, closer)) if closer == c => {
                    if c == ']' {
                        spans.push(start..i + 1);
                    }
                }
                Some(_) => open.clear(),
                None => {}
            },
            _ => {}
        }
    }
    spans
}

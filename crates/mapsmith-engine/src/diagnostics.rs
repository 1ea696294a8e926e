//! Sanitising of text and payloads that came from outside the process.
//!
//! Worker stderr and upstream error bodies may contain terminal escapes,
//! megabytes of base64 image data, or both. Everything that reaches an error
//! message or a log line goes through here first.

use serde_json::{Map, Value};

/// Base64 runs at least this long are treated as embedded binary payloads.
const BASE64_RUN_MIN: usize = 160;
const OMITTED: &str = "<omitted>";

pub fn sanitize_text(value: &str, max_chars: usize) -> String {
    truncate_text(redact_payloads(&strip_control(value)).trim(), max_chars)
}

/// Like [`sanitize_text`] but keeps the end, where tracebacks put the cause.
pub fn excerpt_tail(value: &str, max_chars: usize) -> String {
    truncate_tail(redact_payloads(&strip_control(value)).trim(), max_chars)
}

/// Removes ANSI escape sequences and other control characters.
///
/// Newlines and tabs survive; carriage returns become newlines.
pub fn strip_control(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '\u{1b}' => match chars.peek().copied() {
                // CSI: parameters then a final byte in '@'..='~'.
                Some('[') => {
                    chars.next();
                    for next in chars.by_ref() {
                        if ('@'..='~').contains(&next) {
                            break;
                        }
                    }
                }
                // OSC: terminated by BEL or ESC '\'.
                Some(']') => {
                    chars.next();
                    while let Some(next) = chars.next() {
                        if next == '\u{7}' {
                            break;
                        }
                        if next == '\u{1b}' {
                            if chars.peek() == Some(&'\\') {
                                chars.next();
                            }
                            break;
                        }
                    }
                }
                Some(_) => {
                    chars.next();
                }
                None => {}
            },
            '\n' | '\t' => out.push(ch),
            '\r' => {
                if chars.peek() != Some(&'\n') {
                    out.push('\n');
                }
            }
            other if other.is_control() => {}
            other => out.push(other),
        }
    }
    out
}

/// Replaces data-URL bodies and long base64 runs with `<omitted>`.
pub fn redact_payloads(value: &str) -> String {
    let mut out = String::with_capacity(value.len().min(4096));
    let mut run = String::new();
    for ch in value.chars() {
        if is_base64_char(ch) {
            run.push(ch);
            continue;
        }
        flush_run(&mut out, &mut run);
        out.push(ch);
    }
    flush_run(&mut out, &mut run);
    out
}

fn flush_run(out: &mut String, run: &mut String) {
    if run.is_empty() {
        return;
    }
    let after_data_url = out.ends_with(";base64,");
    if run.chars().count() >= BASE64_RUN_MIN || (after_data_url && run.len() > 16) {
        out.push_str(OMITTED);
    } else {
        out.push_str(run);
    }
    run.clear();
}

fn is_base64_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '+' | '/' | '=' | '-' | '_')
}

/// Drops image-bearing fields from a JSON payload before it is surfaced.
pub fn sanitize_payload(value: &Value) -> Value {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) => value.clone(),
        Value::String(text) => Value::String(redact_payloads(text)),
        Value::Array(rows) => Value::Array(rows.iter().map(sanitize_payload).collect()),
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, row) in map {
                let lowered = key.to_ascii_lowercase();
                if matches!(
                    lowered.as_str(),
                    "b64_json" | "image" | "image_bytes" | "data" | "bytesbase64encoded"
                ) {
                    out.insert(key.clone(), Value::String(OMITTED.to_string()));
                    continue;
                }
                out.insert(key.clone(), sanitize_payload(row));
            }
            Value::Object(out)
        }
    }
}

pub fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

pub fn truncate_tail(value: &str, max_chars: usize) -> String {
    let count = value.chars().count();
    if count <= max_chars {
        return value.to_string();
    }
    "…".to_string() + &value.chars().skip(count - max_chars).collect::<String>()
}

pub fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return sanitize_text(&err.to_string(), max_chars);
    }
    sanitize_text(&parts.join(" | caused by: "), max_chars)
}

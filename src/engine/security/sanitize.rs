// Colony Memory — Content Screening
// Rejects (never rewrites) text that carries control sequences or looks like
// an injection attempt. Pattern tables are compiled once.

use crate::atoms::constants::{MAX_METADATA_KEY_LENGTH, MAX_NESTED_METADATA_SIZE};
use crate::atoms::error::{MemoryError, MemoryResult};
use crate::atoms::types::Metadata;
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

/// Which pattern families apply to a piece of text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextKind {
    /// Stored knowledge content: every family, including prompt overrides.
    Knowledge,
    /// History payloads and metadata values.
    Record,
    /// Search text: also rejects SQL comment sequences.
    Query,
}

static MARKUP_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    compile(&[
        (r"(?i)<\s*script\b", "script tag"),
        (r"(?i)javascript\s*:", "javascript: url"),
        (r"(?i)<[^>]*\bon[a-z]+\s*=", "inline event handler"),
        (r"(?i)<\s*(iframe|object|embed|style|link|meta)\b", "embedded markup"),
    ])
});

static SQL_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    compile(&[
        (r"(?i);\s*drop\s+(table|database)\b", "drop statement"),
        (r"(?i);\s*delete\s+from\b", "delete statement"),
        (r"(?i)\bunion\s+(all\s+)?select\b", "union select"),
        (r"(?i)'\s*or\s+'?1'?\s*=\s*'?1", "tautology"),
    ])
});

static QUERY_COMMENT_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    compile(&[(r"--", "sql line comment"), (r"/\*.*?\*/", "sql block comment")])
});

static PROMPT_OVERRIDE_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    compile(&[
        (r"(?i)ignore\s+(all\s+)?previous\s+instructions", "instruction override"),
        (r"(?i)disregard\s+(all\s+)?(prior|previous)\s+(instructions|rules)", "instruction override"),
        (r"(?i)new\s+instructions?\s*:", "injected instructions"),
        (r"(?i)system\s*:\s*you\s+(are|must|should)", "fake system turn"),
        (r"(?i)<\|?system\|?>", "fake system token"),
    ])
});

/// Tab, newline and carriage return are allowed.
fn has_control_chars(text: &str) -> bool {
    text.chars()
        .any(|c| matches!(c, '\x00'..='\x08' | '\x0B' | '\x0C' | '\x0E'..='\x1F' | '\x7F'))
}

fn is_identifier_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ' ' | '@')
}

// Tables are literals; `patterns_compile` guards against a bad edit.
fn compile(table: &[(&str, &'static str)]) -> Vec<(Regex, &'static str)> {
    table
        .iter()
        .filter_map(|(p, label)| Regex::new(p).ok().map(|re| (re, *label)))
        .collect()
}

fn first_match(text: &str, table: &[(Regex, &'static str)]) -> Option<&'static str> {
    table.iter().find(|(re, _)| re.is_match(text)).map(|(_, label)| *label)
}

/// Screen free text. The error names the field and the pattern family,
/// never the offending text.
pub fn screen_text(field: &str, text: &str, kind: TextKind) -> MemoryResult<()> {
    if has_control_chars(text) {
        return Err(MemoryError::validation(format!("{} contains control characters", field)));
    }
    let mut hit = first_match(text, &MARKUP_PATTERNS).or_else(|| first_match(text, &SQL_PATTERNS));
    if hit.is_none() && kind == TextKind::Query {
        hit = first_match(text, &QUERY_COMMENT_PATTERNS);
    }
    if hit.is_none() && kind == TextKind::Knowledge {
        hit = first_match(text, &PROMPT_OVERRIDE_PATTERNS);
    }
    match hit {
        Some(label) => Err(MemoryError::validation(format!("{} rejected: {}", field, label))),
        None => Ok(()),
    }
}

/// Identifier fields (caller ids, departments, categories, thread ids).
pub fn check_identifier(field: &str, value: &str, max_len: usize) -> MemoryResult<()> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(MemoryError::validation(format!("{} is required", field)));
    }
    if value.chars().count() > max_len {
        return Err(MemoryError::validation(format!("{} exceeds {} characters", field, max_len)));
    }
    if !value.chars().all(is_identifier_char) {
        return Err(MemoryError::validation(format!("{} contains invalid characters", field)));
    }
    Ok(())
}

/// Size and content bounds on a metadata map.
pub fn screen_metadata(metadata: &Metadata, max_total: usize) -> MemoryResult<()> {
    let serialized = serde_json::to_string(metadata)?;
    if serialized.len() > max_total {
        return Err(MemoryError::validation(format!("metadata exceeds {} bytes", max_total)));
    }
    for (key, value) in metadata {
        if key.trim().is_empty() || key.chars().count() > MAX_METADATA_KEY_LENGTH {
            return Err(MemoryError::validation(format!(
                "metadata keys must be 1..={} characters",
                MAX_METADATA_KEY_LENGTH
            )));
        }
        if has_control_chars(key) {
            return Err(MemoryError::validation("metadata key contains control characters"));
        }
        screen_value(key, value)?;
    }
    Ok(())
}

fn screen_value(key: &str, value: &Value) -> MemoryResult<()> {
    match value {
        Value::String(s) => screen_text(&format!("metadata.{}", key), s, TextKind::Record),
        Value::Array(_) | Value::Object(_) => {
            if value.to_string().len() > MAX_NESTED_METADATA_SIZE {
                return Err(MemoryError::validation(format!(
                    "metadata.{} nested value exceeds {} bytes",
                    key, MAX_NESTED_METADATA_SIZE
                )));
            }
            let children: Vec<&Value> = match value {
                Value::Array(items) => items.iter().collect(),
                Value::Object(map) => map.values().collect(),
                _ => Vec::new(),
            };
            children.into_iter().try_for_each(|child| screen_value(key, child))
        }
        _ => Ok(()),
    }
}

//! Post-processing: model response text → deterministic JSON bytes.
//!
//! Models wrap JSON in code fences, prepend explanations or append
//! commentary despite being told not to. Extraction is therefore lenient
//! about what surrounds the value and strict about the value itself:
//!
//! 1. A leading BOM is ignored.
//! 2. The first fenced block (` ```json `, ` ```js `, ` ```javascript ` or
//!    untagged) holding a complete JSON value wins.
//! 3. Otherwise every `{` / `[` is tried and the outermost complete value
//!    wins, so a bracketed aside such as `[1]` in the prose never shadows
//!    the record. Text around it is ignored.
//!
//! The parsed value then gets the document identifier as its first key,
//! `year`, and is rendered pretty-printed with a trailing newline. Rendering
//! is a pure function of `(raw, year)`, so reruns produce identical bytes.

use crate::error::JsonExtractionError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

/// Key injected into every output object.
pub const YEAR_KEY: &str = "year";

/// Key a non-object result is wrapped under.
pub const DATA_KEY: &str = "data";

/// Extract, tag and render a model response.
pub fn postprocess(raw: &str, year: &str) -> Result<Vec<u8>, JsonExtractionError> {
    let value = extract_json(raw)?;
    render_json(&attach_year(value, year))
}

// ── Extraction ───────────────────────────────────────────────────────────

static RE_FENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"```(?:json|javascript|js)?[ \t]*\r?\n?([\s\S]*?)```").unwrap()
});

/// Find the first complete JSON object or array in `raw`.
pub fn extract_json(raw: &str) -> Result<Value, JsonExtractionError> {
    let text = raw.trim_start_matches('\u{feff}');
    if text.trim().is_empty() {
        return Err(JsonExtractionError {
            reason: "response is empty".into(),
        });
    }

    for caps in RE_FENCE.captures_iter(text) {
        if let Some(value) = first_value(&caps[1]) {
            return Ok(value);
        }
    }

    if !text.contains(['{', '[']) {
        return Err(JsonExtractionError {
            reason: "no '{' or '[' found".into(),
        });
    }
    first_value(text).ok_or_else(|| JsonExtractionError {
        reason: "no complete JSON object or array parses".into(),
    })
}

/// The outermost JSON value in `text`: of all `{`/`[` positions that start a
/// complete value, the one spanning the most bytes. Earlier wins on a tie.
fn first_value(text: &str) -> Option<Value> {
    let mut best: Option<(usize, Value)> = None;
    let mut covered = 0;
    for (i, c) in text.char_indices() {
        // a value nested inside one already found cannot be longer
        if i < covered || (c != '{' && c != '[') {
            continue;
        }
        let mut values = serde_json::Deserializer::from_str(&text[i..]).into_iter::<Value>();
        let Some(Ok(value)) = values.next() else {
            continue;
        };
        let span = values.byte_offset();
        covered = i + span;
        if best.as_ref().map_or(true, |(longest, _)| span > *longest) {
            best = Some((span, value));
        }
    }
    best.map(|(_, value)| value)
}

// ── Tagging and rendering ────────────────────────────────────────────────

/// Put `year` first in an object, replacing any existing `year`. Any other
/// value is wrapped as `{"year": .., "data": ..}`.
pub fn attach_year(value: Value, year: &str) -> Value {
    let mut tagged = Map::new();
    tagged.insert(YEAR_KEY.to_string(), Value::String(year.to_string()));
    match value {
        Value::Object(fields) => {
            for (k, v) in fields {
                if k != YEAR_KEY {
                    tagged.insert(k, v);
                }
            }
        }
        other => {
            tagged.insert(DATA_KEY.to_string(), other);
        }
    }
    Value::Object(tagged)
}

/// Two-space indented UTF-8 with non-ASCII kept as-is and a trailing newline.
pub fn render_json(value: &Value) -> Result<Vec<u8>, JsonExtractionError> {
    let mut bytes = serde_json::to_vec_pretty(value).map_err(|e| JsonExtractionError {
        reason: format!("cannot render JSON: {e}"),
    })?;
    bytes.push(b'\n');
    Ok(bytes)
}

// ── Persistence ──────────────────────────────────────────────────────────

/// Write `bytes` to `path` via a sibling temp file and rename, so a JSON
/// file is either absent or complete.
pub async fn write_json_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = tmp_sibling(path);
    tokio::fs::write(&tmp, bytes).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

// Turning a free-text model completion into a Score-shaped JSON value.
//
// Stages, in order:
// 1. `extract_candidate`: find the payload. A fenced block tagged `json` wins,
//    then any fenced block holding a `{`, then the first `{...}` span in the
//    raw text (string-aware brace matching; greedy to the last `}` when the
//    braces never balance, as with truncated output).
// 2. `repair_expressions`: rewrite arithmetic written where a number belongs
//    (`"time": 0.6 + 1.8`, or quoted on a numeric note field) into a literal,
//    repeating until the text stops changing. Matches that start inside a
//    string literal are skipped, so prose like `"ratio: 3/4"` is kept.
// 3. Strict `serde_json` parse.
// 4. `evaluate_note_fields`: any string left in a note object is evaluated
//    in place if it is arithmetic; anything else is left alone.
//
// Every evaluation goes through expr.rs; nothing here can execute code.
// Failures at stages 1 and 3 are returned with the raw response attached.

use crate::error::SanitizeError;
use crate::expr;
use regex::{Captures, Regex};
use serde_json::{Number, Value};
use std::sync::LazyLock;
use tracing::{debug, trace};

/// Upper bound on repair passes before giving up on reaching a fixed point.
pub const MAX_REPAIR_PASSES: usize = 8;

/// Note fields that may hold a quoted expression the text pass rewrites.
const NUMERIC_FIELDS: [&str; 5] = ["pitch", "time", "duration", "velocity", "instrument"];

/// An arithmetic run sitting in value position, optionally quoted and
/// optionally preceded by its key.
static EXPR_VALUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?P<lead>(?:"(?P<key>[A-Za-z_]+)"\s*:|[:\[,])\s*)(?P<q1>"?)(?P<expr>[-+(.0-9][-+*/^().0-9 \t]*)(?P<q2>"?)(?P<tail>\s*[,}\]])"#,
    )
    .expect("EXPR_VALUE pattern is valid")
});

/// Extract, repair and parse a model response into a JSON value.
pub fn sanitize(raw: &str) -> Result<Value, SanitizeError> {
    let candidate = extract_candidate(raw).ok_or_else(|| SanitizeError::Extraction {
        raw: raw.to_string(),
    })?;

    let repaired = repair_expressions(candidate);
    if repaired != candidate {
        debug!(
            before = candidate.len(),
            after = repaired.len(),
            "repaired arithmetic in model output"
        );
    }

    let mut value: Value =
        serde_json::from_str(&repaired).map_err(|e| SanitizeError::Parse {
            text: repaired.clone(),
            raw: raw.to_string(),
            message: e.to_string(),
        })?;

    let replaced = evaluate_note_fields(&mut value);
    if replaced > 0 {
        debug!(replaced, "evaluated string-typed note fields");
    }
    Ok(value)
}

/// Locate the JSON payload in a model response.
pub fn extract_candidate(text: &str) -> Option<&str> {
    let blocks = fenced_blocks(text);
    let tagged = blocks
        .iter()
        .filter(|(tag, _)| tag.eq_ignore_ascii_case("json"))
        .find_map(|(_, body)| brace_span(body));
    tagged
        .or_else(|| blocks.iter().find_map(|(_, body)| brace_span(body)))
        .or_else(|| brace_span(text))
}

/// All triple-backtick blocks as `(language tag, body)`. An unterminated
/// final fence runs to the end of the text.
fn fenced_blocks(text: &str) -> Vec<(&str, &str)> {
    const FENCE: &str = "```";
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find(FENCE) {
        let after_open = &rest[open + FENCE.len()..];
        let (tag, body_start) = match after_open.find('\n') {
            Some(nl) => (after_open[..nl].trim(), &after_open[nl + 1..]),
            None => (after_open.trim(), ""),
        };
        match body_start.find(FENCE) {
            Some(close) => {
                blocks.push((tag, &body_start[..close]));
                rest = &body_start[close + FENCE.len()..];
            }
            None => {
                blocks.push((tag, body_start));
                break;
            }
        }
    }
    blocks
}

/// The first `{...}` span, matched with awareness of JSON strings.
fn brace_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, c) in text[start..].char_indices() {
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
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    // Never balanced: take everything up to the last closing brace.
    let end = text.rfind('}').filter(|&end| end > start)?;
    Some(&text[start..=end])
}

/// Rewrite arithmetic expressions in value position until a fixed point.
pub fn repair_expressions(text: &str) -> String {
    let mut current = text.to_string();
    for pass in 0..MAX_REPAIR_PASSES {
        let next = repair_pass(&current);
        if next == current {
            trace!(pass, "expression repair reached a fixed point");
            return current;
        }
        current = next;
    }
    debug!(
        passes = MAX_REPAIR_PASSES,
        "expression repair stopped at the pass limit"
    );
    current
}

/// One left-to-right rewrite of every matching expression.
///
/// The trailing delimiter of a match is not consumed, so it can serve as
/// the leading delimiter of the next array element.
fn repair_pass(text: &str) -> String {
    let strings = string_spans(text);
    let mut out = String::with_capacity(text.len());
    let mut copied = 0;
    let mut search = 0;
    while let Some(caps) = EXPR_VALUE.captures_at(text, search) {
        let (Some(whole), Some(tail)) = (caps.get(0), caps.name("tail")) else {
            break;
        };
        // Every match starts on an ASCII delimiter or quote.
        if inside_string(&strings, whole.start()) {
            search = whole.start() + 1;
            continue;
        }
        if let Some(literal) = rewrite(&caps) {
            out.push_str(&text[copied..whole.start()]);
            out.push_str(&caps["lead"]);
            out.push_str(&literal);
            copied = tail.start();
        }
        search = tail.start();
    }
    out.push_str(&text[copied..]);
    out
}

/// Byte ranges of string literal contents, quotes excluded, in order. An
/// unterminated string runs to the end of the text.
fn string_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut open: Option<usize> = None;
    let mut escaped = false;
    for (i, c) in text.char_indices() {
        match open {
            Some(start) => match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => {
                    spans.push((start, i));
                    open = None;
                }
                _ => {}
            },
            None if c == '"' => open = Some(i + 1),
            None => {}
        }
    }
    if let Some(start) = open {
        spans.push((start, text.len()));
    }
    spans
}

fn inside_string(spans: &[(usize, usize)], pos: usize) -> bool {
    let at = spans.partition_point(|&(start, _)| start <= pos);
    at > 0 && pos < spans[at - 1].1
}

/// The literal replacing a matched expression, or `None` to keep it.
fn rewrite(caps: &Captures<'_>) -> Option<String> {
    let quoted = match (&caps["q1"], &caps["q2"]) {
        ("", "") => false,
        ("\"", "\"") => true,
        _ => return None,
    };
    if quoted {
        let key = caps.name("key")?;
        if !NUMERIC_FIELDS.contains(&key.as_str()) {
            return None;
        }
    }
    let expression = &caps["expr"];
    if !expr::is_compound(expression) {
        return None;
    }
    match expr::evaluate(expression) {
        Ok(v) => Some(expr::format_number(v)),
        Err(e) => {
            trace!(expression, error = %e, "left expression unrepaired");
            None
        }
    }
}

/// Evaluate string-typed fields of every note object in place.
///
/// Returns the number of fields replaced. Strings that are not arithmetic
/// are left untouched.
pub fn evaluate_note_fields(value: &mut Value) -> usize {
    let Some(tracks) = value.get_mut("tracks").and_then(Value::as_array_mut) else {
        return 0;
    };
    let mut replaced = 0;
    for track in tracks {
        let Some(notes) = track.get_mut("notes").and_then(Value::as_array_mut) else {
            continue;
        };
        for note in notes.iter_mut().filter_map(Value::as_object_mut) {
            for (field, slot) in note.iter_mut() {
                let Value::String(text) = &*slot else {
                    continue;
                };
                match expr::evaluate(text).map(json_number) {
                    Ok(Some(number)) => {
                        *slot = number;
                        replaced += 1;
                    }
                    Ok(None) => {}
                    Err(e) => trace!(field = field.as_str(), error = %e, "kept string field"),
                }
            }
        }
    }
    replaced
}

/// An evaluated result as a JSON number: integral values become integers.
fn json_number(v: f64) -> Option<Value> {
    let rounded = expr::round_result(v);
    if rounded.fract() == 0.0 && rounded.abs() < 1e15 {
        Some(Value::from(rounded as i64))
    } else {
        Number::from_f64(rounded).map(Value::Number)
    }
}

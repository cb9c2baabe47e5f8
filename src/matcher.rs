use crate::types::Expected;
use serde::Deserialize;
use serde_json::{Number, Value};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchMode {
    #[default]
    Exact,
    /// Top-level arrays are compared as sets: sorted, duplicates dropped.
    IgnoreOrder,
}

/// Whether `actual` equals at least one accepted alternative.
/// A `Rejected` expectation never matches an output.
pub fn matches(actual: &Value, expected: &Expected, mode: MatchMode) -> bool {
    let actual = canonical_form(actual, mode);
    expected
        .alternatives()
        .iter()
        .any(|alt| canonical_form(alt, mode) == actual)
}

fn canonical_form(value: &Value, mode: MatchMode) -> String {
    match (mode, value) {
        (MatchMode::IgnoreOrder, Value::Array(items)) => {
            let mut parts: Vec<String> = items.iter().map(canonical_string).collect();
            parts.sort();
            parts.dedup();
            format!("[{}]", parts.join(","))
        }
        _ => canonical_string(value),
    }
}

/// Compact encoding with object keys sorted and numbers normalized, so that
/// two semantically equal values produce the same text.
pub fn canonical_string(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&canonical_number(n)),
        Value::String(s) => push_json_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            // Map iteration order depends on serde_json features; sort explicitly.
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (k, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                push_json_string(k, out);
                out.push(':');
                write_canonical(v, out);
            }
            out.push('}');
        }
    }
}

// 2^63 and 2^64, both exact in f64
const I64_BOUND: f64 = 9_223_372_036_854_775_808.0;
const U64_BOUND: f64 = 18_446_744_073_709_551_616.0;

fn canonical_number(n: &Number) -> String {
    if let Some(i) = n.as_i64() {
        return i.to_string();
    }
    if let Some(u) = n.as_u64() {
        return u.to_string();
    }
    match n.as_f64() {
        // Integral floats print as the integer they are exactly equal to
        Some(f) if f.fract() == 0.0 && (-I64_BOUND..I64_BOUND).contains(&f) => {
            (f as i64).to_string()
        }
        Some(f) if f.fract() == 0.0 && (0.0..U64_BOUND).contains(&f) => (f as u64).to_string(),
        Some(f) => Number::from_f64(f)
            .map(|n| n.to_string())
            .unwrap_or_else(|| n.to_string()),
        None => n.to_string(),
    }
}

fn push_json_string(s: &str, out: &mut String) {
    // Serializing a str cannot fail
    match serde_json::to_string(s) {
        Ok(encoded) => out.push_str(&encoded),
        Err(_) => out.push_str(&format!("{s:?}")),
    }
}

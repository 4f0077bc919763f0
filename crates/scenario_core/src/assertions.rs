//! Assertion primitives shared by every event.
//!
//! A declared YAML value becomes a [`Matcher`]; checking it against an
//! observed value yields either success or a [`Difference`] whose `proposed`
//! value is what the scenario should say instead.

use regex::Regex;
use serde_json::{Map, Value};
use std::fmt;

/// Normalisation applied to literal comparisons.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchOptions {
    /// Ignore trailing newlines on both sides
    pub normalize_trailing_newlines: bool,
    /// Treat any run of whitespace as a single space
    pub collapse_whitespace: bool,
}

/// A declared expectation for one value.
#[derive(Debug, Clone)]
pub enum Matcher {
    /// `value` or `{equals: value}`
    Equals(Value),
    /// `{matches: regex}` (anchored at the start) or `{full_match: regex}`
    Matches {
        /// Regex source as written
        pattern: String,
        /// Compiled regex
        regex: Regex,
        /// Whether the whole value must match
        full: bool,
    },
    /// `{is_none: bool}`
    IsNone(bool),
    /// `{in: [a, b, ...]}`
    In(Vec<Value>),
}

/// Why an observed value did not satisfy a matcher.
#[derive(Debug, Clone, PartialEq)]
pub struct Difference {
    /// Human-readable one-liner
    pub summary: String,
    /// What the scenario declares
    pub expected: Value,
    /// What was observed
    pub actual: Value,
    /// Replacement for the declared value
    pub proposed: Value,
}

impl fmt::Display for Difference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.summary)
    }
}

impl Matcher {
    /// Builds a matcher from a declared value.
    ///
    /// Mappings with a single `equals`, `matches`, `full_match`, `is_none` or
    /// `in` key select that matcher; anything else is a literal.
    pub fn from_value(declared: &Value) -> Result<Self, String> {
        let Value::Object(map) = declared else {
            return Ok(Self::Equals(declared.clone()));
        };
        let (Some((key, inner)), 1) = (map.iter().next(), map.len()) else {
            return Ok(Self::Equals(declared.clone()));
        };
        match key.as_str() {
            "equals" => Ok(Self::Equals(inner.clone())),
            "matches" | "full_match" => {
                let pattern = inner
                    .as_str()
                    .ok_or_else(|| format!("'{}' takes a regular expression string", key))?;
                let source = if key == "full_match" {
                    format!("(?s)^(?:{})$", pattern)
                } else {
                    format!("(?s)^(?:{})", pattern)
                };
                let regex = Regex::new(&source).map_err(|e| format!("invalid regex '{}': {}", pattern, e))?;
                Ok(Self::Matches {
                    pattern: pattern.to_string(),
                    regex,
                    full: key == "full_match",
                })
            }
            "is_none" => inner
                .as_bool()
                .map(Self::IsNone)
                .ok_or_else(|| "'is_none' takes true or false".to_string()),
            "in" => inner
                .as_array()
                .map(|items| Self::In(items.clone()))
                .ok_or_else(|| "'in' takes a list of values".to_string()),
            _ => Ok(Self::Equals(declared.clone())),
        }
    }

    /// The declared form, for diffs.
    pub fn declared(&self) -> Value {
        match self {
            Self::Equals(v) => v.clone(),
            Self::Matches { pattern, full, .. } => {
                let key = if *full { "full_match" } else { "matches" };
                let mut map = Map::new();
                map.insert(key.to_string(), Value::String(pattern.clone()));
                Value::Object(map)
            }
            Self::IsNone(flag) => serde_json::json!({ "is_none": flag }),
            Self::In(items) => serde_json::json!({ "in": items }),
        }
    }

    /// Checks `actual` against the matcher.
    pub fn check(&self, actual: &Value, options: MatchOptions) -> Result<(), Difference> {
        let ok = match self {
            Self::Equals(expected) => values_equal(expected, actual, options),
            Self::Matches { regex, .. } => match actual {
                Value::String(s) => regex.is_match(s),
                Value::Null => false,
                other => regex.is_match(&scalar_string(other)),
            },
            Self::IsNone(flag) => actual.is_null() == *flag,
            Self::In(items) => items.iter().any(|v| values_equal(v, actual, options)),
        };
        if ok {
            return Ok(());
        }

        let proposed = match self {
            Self::IsNone(_) => serde_json::json!({ "is_none": actual.is_null() }),
            _ => actual.clone(),
        };
        let summary = match self {
            Self::Equals(expected) => format!("expected {}, got {}", short(expected), short(actual)),
            Self::Matches { pattern, .. } => format!("{} does not match /{}/", short(actual), pattern),
            Self::IsNone(true) => format!("expected no value, got {}", short(actual)),
            Self::IsNone(false) => "expected a value, got none".to_string(),
            Self::In(items) => format!("{} is not one of {}", short(actual), short(&Value::Array(items.clone()))),
        };
        Err(Difference {
            summary,
            expected: self.declared(),
            actual: actual.clone(),
            proposed,
        })
    }
}

/// Locale-independent equality with numeric/string tolerance: `200` equals
/// `"200"`, and strings are compared after the configured normalisation.
pub fn values_equal(expected: &Value, actual: &Value, options: MatchOptions) -> bool {
    match (expected, actual) {
        (Value::String(a), Value::String(b)) => normalize(a, options) == normalize(b, options),
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => a == b,
        },
        (Value::Number(n), Value::String(s)) | (Value::String(s), Value::Number(n)) => {
            s.trim() == n.to_string()
        }
        (Value::Bool(b), Value::String(s)) | (Value::String(s), Value::Bool(b)) => {
            s.trim().eq_ignore_ascii_case(&b.to_string())
        }
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y, options))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter().all(|(k, v)| b.get(k).is_some_and(|w| values_equal(v, w, options)))
        }
        _ => expected == actual,
    }
}

fn normalize(s: &str, options: MatchOptions) -> String {
    let mut out = if options.collapse_whitespace {
        s.split_whitespace().collect::<Vec<_>>().join(" ")
    } else {
        s.to_string()
    };
    if options.normalize_trailing_newlines {
        let trimmed = out.trim_end_matches(['\n', '\r']).len();
        out.truncate(trimmed);
    }
    out
}

/// Renders a scalar the way it would appear in a header or URI.
pub fn scalar_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn short(value: &Value) -> String {
    let text = value.to_string();
    if text.chars().count() > 80 {
        let cut: String = text.chars().take(77).collect();
        format!("{}...", cut)
    } else {
        text
    }
}

// ===== JSON subset =====

/// Checks that every key path declared in `expected` exists in `actual` with
/// an equal value. Extra keys in `actual` are ignored; lists are compared
/// element by element. Returns the dotted path of the first difference.
pub fn json_subset(expected: &Value, actual: &Value, options: MatchOptions) -> Result<(), String> {
    subset_at(expected, actual, options, "")
}

fn subset_at(expected: &Value, actual: &Value, options: MatchOptions, at: &str) -> Result<(), String> {
    match (expected, actual) {
        (Value::Object(e), Value::Object(a)) => {
            for (key, value) in e {
                let path = if at.is_empty() { key.clone() } else { format!("{}.{}", at, key) };
                match a.get(key) {
                    Some(found) => subset_at(value, found, options, &path)?,
                    None => return Err(path),
                }
            }
            Ok(())
        }
        (Value::Array(e), Value::Array(a)) => {
            if e.len() != a.len() {
                return Err(if at.is_empty() { "(length)".to_string() } else { format!("{} (length)", at) });
            }
            for (i, (x, y)) in e.iter().zip(a).enumerate() {
                subset_at(x, y, options, &format!("{}[{}]", at, i))?;
            }
            Ok(())
        }
        _ if values_equal(expected, actual, options) => Ok(()),
        _ => Err(if at.is_empty() { "(root)".to_string() } else { at.to_string() }),
    }
}

/// The declared subset with every declared path refreshed from `actual`.
///
/// Declared keys missing from `actual` are dropped; keys only present in
/// `actual` are not added.
pub fn merge_subset(expected: &Value, actual: &Value) -> Value {
    match (expected, actual) {
        (Value::Object(e), Value::Object(a)) => {
            let mut out = Map::new();
            for (key, value) in e {
                if let Some(found) = a.get(key) {
                    out.insert(key.clone(), merge_subset(value, found));
                }
            }
            Value::Object(out)
        }
        (Value::Array(e), Value::Array(a)) if e.len() == a.len() => {
            Value::Array(e.iter().zip(a).map(|(x, y)| merge_subset(x, y)).collect())
        }
        _ => actual.clone(),
    }
}

// ===== Unordered lists =====

/// Finds a perfect one-to-one assignment of `expected` items onto `actual`
/// items where `fits(e, a)` holds, regardless of order.
///
/// Returns `assignment[e] = a`, or `None` when the sizes differ or no perfect
/// matching exists. Uses augmenting paths, so a greedy early choice never
/// blocks a later item.
pub fn unordered_assignment<F>(expected: usize, actual: usize, fits: F) -> Option<Vec<usize>>
where
    F: Fn(usize, usize) -> bool,
{
    if expected != actual {
        return None;
    }
    let edges: Vec<Vec<usize>> = (0..expected)
        .map(|e| (0..actual).filter(|&a| fits(e, a)).collect())
        .collect();
    let mut owner: Vec<Option<usize>> = vec![None; actual];

    for e in 0..expected {
        let mut seen = vec![false; actual];
        if !augment(e, &edges, &mut owner, &mut seen) {
            return None;
        }
    }

    let mut assignment = vec![0; expected];
    for (a, e) in owner.iter().enumerate() {
        if let Some(e) = e {
            assignment[*e] = a;
        }
    }
    Some(assignment)
}

fn augment(e: usize, edges: &[Vec<usize>], owner: &mut [Option<usize>], seen: &mut [bool]) -> bool {
    for &a in &edges[e] {
        if seen[a] {
            continue;
        }
        seen[a] = true;
        let free = match owner[a] {
            None => true,
            Some(other) => augment(other, edges, owner, seen),
        };
        if free {
            owner[a] = Some(e);
            return true;
        }
    }
    false
}

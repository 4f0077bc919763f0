//! `$$name$$` placeholders and the per-run substitution table.

use crate::error::{Result, ScenarioError};
use serde_json::{Map, Value};

/// Value of `define_reference` that asks for a generated id.
pub const GENERATE: &str = "$gen$";

/// Append-only table of reference values for one scenario run.
#[derive(Debug, Clone, Default)]
pub struct ReferenceTable {
    entries: Vec<(String, String)>,
}

impl ReferenceTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Defines a reference. Redefining it with the same value is a no-op;
    /// a different value is an error.
    pub fn define(&mut self, name: &str, value: impl Into<String>) -> Result<()> {
        let value = value.into();
        match self.get(name) {
            Some(existing) if existing == value => Ok(()),
            Some(existing) => Err(ScenarioError::Reference {
                name: name.to_string(),
                message: format!("already defined as '{}', cannot redefine as '{}'", existing, value),
            }),
            None => {
                self.entries.push((name.to_string(), value));
                Ok(())
            }
        }
    }

    /// Looks up a reference value.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Number of defined references.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is defined.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replaces every `$$name$$` of a defined reference in `text`.
    /// Unknown placeholders are left untouched.
    pub fn substitute(&self, text: &str) -> String {
        if !text.contains("$$") {
            return text.to_string();
        }
        let mut out = text.to_string();
        for (name, value) in &self.entries {
            out = out.replace(&format!("$${}$$", name), value);
        }
        out
    }

    /// Applies [`substitute`](Self::substitute) to every string in `value`.
    pub fn substitute_value(&self, value: &Value) -> Value {
        map_strings(value, &|s| self.substitute(s))
    }

    /// Puts placeholders back: occurrences of defined values become
    /// `$$name$$`, longest value first. Values shorter than three characters
    /// are left alone since they match too much.
    pub fn reverse(&self, text: &str) -> String {
        let mut by_length: Vec<&(String, String)> =
            self.entries.iter().filter(|(_, v)| v.chars().count() >= 3).collect();
        by_length.sort_by(|a, b| b.1.len().cmp(&a.1.len()));

        let mut out = text.to_string();
        for (name, value) in by_length {
            out = out.replace(value.as_str(), &format!("$${}$$", name));
        }
        out
    }

    /// Applies [`reverse`](Self::reverse) to every string in `value`.
    pub fn reverse_value(&self, value: &Value) -> Value {
        map_strings(value, &|s| self.reverse(s))
    }
}

fn map_strings(value: &Value, f: &dyn Fn(&str) -> String) -> Value {
    match value {
        Value::String(s) => Value::String(f(s)),
        Value::Array(items) => Value::Array(items.iter().map(|v| map_strings(v, f)).collect()),
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                out.insert(k.clone(), map_strings(v, f));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

/// Produces a resource id for `generate_resource_id` and `$gen$`.
///
/// Local runs derive the id from the scenario title and reference name so
/// repeated update runs rewrite nothing; remote runs use a fresh UUID so real
/// resources never collide.
pub fn generate_id(title: &str, reference: &str, prefix: Option<&str>, remote: bool) -> String {
    let suffix = if remote {
        uuid::Uuid::new_v4().simple().to_string()
    } else {
        let hash = blake3::hash(format!("{}\n{}", title, reference).as_bytes());
        hex::encode(&hash.as_bytes()[..6])
    };
    match prefix {
        Some(p) if !p.is_empty() => format!("{}-{}", p, suffix),
        _ => suffix,
    }
}

//! Renders values as block YAML that fits into an existing document.

use super::node::SlotKind;
use serde_json::Value;

/// Renders `value` as the text following a `key:` or `-` whose owner sits at
/// column `indent`.
///
/// The result starts right after the indicator (so it begins with a space or
/// a newline) and carries no trailing newline.
pub fn render_slot(value: &Value, indent: usize, kind: SlotKind) -> String {
    let child = indent + 2;
    match value {
        Value::String(s) if s.contains('\n') => match block_scalar(s, child) {
            Some(text) => format!(" {}", text),
            None => format!(" {}", double_quoted(s)),
        },
        Value::Object(map) if !map.is_empty() => match kind {
            SlotKind::Entry => format!("\n{}", render_block(value, child)),
            SlotKind::Item => compact(render_block(value, child), child),
        },
        Value::Array(items) if !items.is_empty() => match kind {
            SlotKind::Entry => format!("\n{}", render_block(value, child)),
            SlotKind::Item => compact(render_block(value, child), child),
        },
        _ => format!(" {}", scalar_text(value)),
    }
}

/// Renders `value` as complete block lines indented by `indent` columns.
pub fn render_block(value: &Value, indent: usize) -> String {
    let pad = " ".repeat(indent);
    match value {
        Value::Object(map) if !map.is_empty() => map
            .iter()
            .map(|(k, v)| {
                format!(
                    "{}{}:{}",
                    pad,
                    scalar_text(&Value::String(k.clone())),
                    render_slot(v, indent, SlotKind::Entry)
                )
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Array(items) if !items.is_empty() => items
            .iter()
            .map(|v| format!("{}-{}", pad, render_slot(v, indent, SlotKind::Item)))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => format!("{}{}", pad, render_slot(value, indent, SlotKind::Entry).trim_start()),
    }
}

// `- key: v` instead of `-\n  key: v`.
fn compact(block: String, indent: usize) -> String {
    format!(" {}", &block[indent..])
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => match serde_yaml::to_string(s) {
            Ok(text) => {
                let text = text.trim_end_matches('\n');
                if text.contains('\n') || text.is_empty() {
                    double_quoted(s)
                } else {
                    text.to_string()
                }
            }
            Err(_) => double_quoted(s),
        },
        Value::Array(_) => "[]".to_string(),
        Value::Object(_) => "{}".to_string(),
    }
}

fn double_quoted(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| format!("\"{}\"", s))
}

fn block_scalar(s: &str, indent: usize) -> Option<String> {
    let plain_lines = !s.starts_with([' ', '\t', '\n'])
        && !s.ends_with("\n\n")
        && !s.chars().any(|c| c.is_control() && c != '\n' && c != '\t');
    if !plain_lines {
        return None;
    }

    let (header, body) = match s.strip_suffix('\n') {
        Some(body) => ("|", body),
        None => ("|-", s),
    };
    let pad = " ".repeat(indent);
    let mut out = header.to_string();
    for line in body.split('\n') {
        out.push('\n');
        if !line.is_empty() {
            out.push_str(&pad);
            out.push_str(line);
        }
    }
    Some(out)
}

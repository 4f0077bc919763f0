//! Span-recording reader for the block-YAML subset used by scenario files.
//!
//! Structure (block mappings, block sequences, indentation) is recognized
//! here; individual scalars and flow collections are handed to `serde_yaml`
//! for value resolution, so quoting and typing rules match YAML 1.2.

use super::node::{Entry, Item, Location, Node, NodeKind};
use super::yaml_to_json;
use crate::error::{Result, ScenarioError};
use serde_json::Value;

/// Parses a scenario document into a node tree.
pub fn parse(source: &str) -> Result<Node> {
    Reader::new(source).parse_document()
}

struct Reader<'a> {
    src: &'a str,
    bytes: &'a [u8],
    line_starts: Vec<usize>,
}

impl<'a> Reader<'a> {
    fn new(src: &'a str) -> Self {
        let bytes = src.as_bytes();
        let mut line_starts = vec![0];
        for (i, b) in bytes.iter().enumerate() {
            if *b == b'\n' {
                line_starts.push(i + 1);
            }
        }
        Self {
            src,
            bytes,
            line_starts,
        }
    }

    fn parse_document(&self) -> Result<Node> {
        let start = if self.src.starts_with('\u{feff}') { 3 } else { 0 };
        let mut pos = match self.next_content(start) {
            Some(p) => p,
            None => return Ok(self.null_node(start)),
        };
        if self.is_marker(pos, "---") {
            pos = match self.next_content(pos + 3) {
                Some(p) => p,
                None => return Ok(self.null_node(pos + 3)),
            };
        }

        if self.is_marker(pos, "...") && self.next_content(pos + 3).is_none() {
            return Ok(self.null_node(pos));
        }

        let root = self.parse_block(pos, -1)?;

        if let Some(rest) = self.next_content(root.span.end) {
            let trailing_end_marker =
                self.is_marker(rest, "...") && self.next_content(rest + 3).is_none();
            if !trailing_end_marker {
                return Err(self.error(rest, "unexpected content after the document root"));
            }
        }
        Ok(root)
    }

    // ===== Structure =====

    fn parse_block(&self, pos: usize, parent: isize) -> Result<Node> {
        if self.is_sequence_indicator(pos) {
            return self.parse_sequence(pos);
        }
        if self.mapping_colon(pos).is_some() {
            return self.parse_mapping(pos);
        }
        self.parse_inline(pos, parent)
    }

    fn parse_mapping(&self, pos: usize) -> Result<Node> {
        let indent = self.column(pos);
        let mut entries: Vec<Entry> = Vec::new();
        let mut cursor = pos;

        let end = loop {
            let (key_end, colon) = self
                .mapping_colon(cursor)
                .ok_or_else(|| self.error(cursor, "expected a mapping key"))?;
            let key = self.key_text(cursor, key_end)?;
            if entries.iter().any(|e| e.key == key) {
                return Err(self.error(cursor, format!("duplicate key '{}'", key)));
            }

            let slot = colon + 1;
            let value = self.parse_entry_value(slot, indent)?;
            let entry = Entry {
                key,
                key_span: cursor..key_end,
                slot,
                line_start: self.line_start(cursor),
                indent,
                value,
            };
            let end = entry.end();
            entries.push(entry);

            let Some(next) = self.next_content(end) else {
                break end;
            };
            if self.line_start(next) == self.line_start(end) {
                return Err(self.error(next, "unexpected characters after a value"));
            }
            let column = self.column(next);
            if column == indent && !self.is_sequence_indicator(next) && !self.is_document_marker(next) {
                cursor = next;
                continue;
            }
            if column > indent {
                return Err(self.error(next, "bad indentation of a mapping entry"));
            }
            break end;
        };

        Ok(Node {
            span: pos..end,
            location: self.location(pos),
            indent,
            kind: NodeKind::Mapping(entries),
        })
    }

    fn parse_entry_value(&self, slot: usize, indent: usize) -> Result<Node> {
        let q = self.skip_inline_space(slot);
        if self.at_line_end_or_comment(q) {
            if let Some(next) = self.next_content(q) {
                let column = self.column(next);
                if column > indent {
                    return self.parse_block(next, indent as isize);
                }
                // `key:` followed by `- item` lines at the key's own column.
                if column == indent && self.is_sequence_indicator(next) {
                    return self.parse_sequence(next);
                }
            }
            return Ok(self.null_node(slot));
        }
        self.parse_inline(q, indent as isize)
    }

    fn parse_sequence(&self, pos: usize) -> Result<Node> {
        let indent = self.column(pos);
        let mut items = Vec::new();
        let mut cursor = pos;

        let end = loop {
            let dash = cursor;
            let slot = dash + 1;
            let q = self.skip_inline_space(slot);
            let value = if self.at_line_end_or_comment(q) {
                match self.next_content(q) {
                    Some(next) if self.column(next) > indent => {
                        self.parse_block(next, indent as isize)?
                    }
                    _ => self.null_node(slot),
                }
            } else {
                self.parse_block(q, indent as isize)?
            };

            let item = Item {
                dash,
                slot,
                line_start: self.line_start(dash),
                indent,
                value,
            };
            let end = item.end();
            items.push(item);

            let Some(next) = self.next_content(end) else {
                break end;
            };
            if self.line_start(next) == self.line_start(end) {
                return Err(self.error(next, "unexpected characters after a value"));
            }
            let column = self.column(next);
            if column == indent && self.is_sequence_indicator(next) {
                cursor = next;
                continue;
            }
            if column > indent {
                return Err(self.error(next, "bad indentation of a sequence item"));
            }
            break end;
        };

        Ok(Node {
            span: pos..end,
            location: self.location(pos),
            indent,
            kind: NodeKind::Sequence(items),
        })
    }

    // ===== Scalars =====

    fn parse_inline(&self, q: usize, parent: isize) -> Result<Node> {
        let (end, kind) = match self.bytes[q] {
            b'"' => {
                let end = self.scan_double_quoted(q)?;
                self.expect_line_clear(end)?;
                (end, NodeKind::Scalar(self.resolve(q, end, false)?))
            }
            b'\'' => {
                let end = self.scan_single_quoted(q)?;
                self.expect_line_clear(end)?;
                (end, NodeKind::Scalar(self.resolve(q, end, false)?))
            }
            b'[' | b'{' => {
                let end = self.scan_flow(q)?;
                self.expect_line_clear(end)?;
                (end, NodeKind::Flow(self.resolve(q, end, false)?))
            }
            b'|' | b'>' => {
                let end = self.scan_block_scalar(q, parent);
                (end, NodeKind::Scalar(self.resolve(q, end, true)?))
            }
            b'&' | b'*' | b'!' => {
                return Err(self.error(q, "anchors, aliases and tags are not supported"));
            }
            _ => {
                let end = self.scan_plain(q, parent);
                (end, NodeKind::Scalar(self.resolve(q, end, false)?))
            }
        };

        Ok(Node {
            span: q..end,
            location: self.location(q),
            indent: self.column(q),
            kind,
        })
    }

    fn resolve(&self, start: usize, end: usize, block: bool) -> Result<Value> {
        let text = &self.src[start..end];
        let parsed: std::result::Result<serde_yaml::Value, _> = if block {
            serde_yaml::from_str(&format!("{}\n", text))
        } else {
            serde_yaml::from_str(text)
        };
        parsed
            .map(yaml_to_json)
            .map_err(|e| self.error(start, format!("invalid scalar: {}", e)))
    }

    fn key_text(&self, start: usize, end: usize) -> Result<String> {
        if matches!(self.bytes[start], b'"' | b'\'') {
            return Ok(match self.resolve(start, end, false)? {
                Value::String(s) => s,
                other => other.to_string(),
            });
        }
        Ok(self.src[start..end].to_string())
    }

    fn scan_double_quoted(&self, q: usize) -> Result<usize> {
        let mut i = q + 1;
        while i < self.bytes.len() {
            match self.bytes[i] {
                b'\\' => i += 2,
                b'"' => return Ok(i + 1),
                _ => i += 1,
            }
        }
        Err(self.error(q, "unterminated double-quoted scalar"))
    }

    fn scan_single_quoted(&self, q: usize) -> Result<usize> {
        let mut i = q + 1;
        while i < self.bytes.len() {
            if self.bytes[i] == b'\'' {
                if self.bytes.get(i + 1) == Some(&b'\'') {
                    i += 2;
                    continue;
                }
                return Ok(i + 1);
            }
            i += 1;
        }
        Err(self.error(q, "unterminated single-quoted scalar"))
    }

    fn scan_flow(&self, q: usize) -> Result<usize> {
        let mut depth = 0usize;
        let mut i = q;
        while i < self.bytes.len() {
            match self.bytes[i] {
                b'[' | b'{' => depth += 1,
                b']' | b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(i + 1);
                    }
                }
                b'"' => {
                    i = self.scan_double_quoted(i)?;
                    continue;
                }
                b'\'' => {
                    i = self.scan_single_quoted(i)?;
                    continue;
                }
                b'#' if matches!(self.bytes[i - 1], b' ' | b'\t' | b'\n') => {
                    i = self.line_end(i);
                    continue;
                }
                _ => {}
            }
            i += 1;
        }
        Err(self.error(q, "unterminated flow collection"))
    }

    fn scan_block_scalar(&self, q: usize, parent: isize) -> usize {
        let mut end = q + 1;
        while end < self.bytes.len() && matches!(self.bytes[end], b'+' | b'-' | b'0'..=b'9') {
            end += 1;
        }

        let mut line = self.line_end(q);
        while line < self.bytes.len() {
            let start = line + 1;
            let line_end = self.line_end(start);
            let text = &self.src[start..line_end];
            if !text.trim().is_empty() {
                let indent = text.len() - text.trim_start_matches(' ').len();
                if indent as isize <= parent {
                    break;
                }
                end = start + text.trim_end_matches(['\r', ' ', '\t']).len();
            }
            line = line_end;
        }
        end
    }

    fn scan_plain(&self, q: usize, parent: isize) -> usize {
        let mut end = self.plain_line_end(q);
        let mut line = self.line_end(q);

        while line < self.bytes.len() {
            let start = line + 1;
            let line_end = self.line_end(start);
            let text = &self.src[start..line_end];
            let trimmed = text.trim_start_matches([' ', '\t']);
            if trimmed.trim_end().is_empty() {
                line = line_end;
                continue;
            }
            let indent = text.len() - trimmed.len();
            if indent as isize <= parent || trimmed.starts_with('#') {
                break;
            }
            let content = start + indent;
            if self.mapping_colon(content).is_some() || self.is_sequence_indicator(content) {
                break;
            }
            end = self.plain_line_end(content);
            line = line_end;
        }
        end
    }

    fn plain_line_end(&self, q: usize) -> usize {
        let line_end = self.line_end(q);
        let mut i = q;
        while i < line_end {
            if self.bytes[i] == b'#' && i > q && matches!(self.bytes[i - 1], b' ' | b'\t') {
                break;
            }
            i += 1;
        }
        while i > q && matches!(self.bytes[i - 1], b' ' | b'\t' | b'\r') {
            i -= 1;
        }
        i
    }

    // ===== Lexical helpers =====

    /// Finds the `:` of a `key: value` line starting at `pos`.
    fn mapping_colon(&self, pos: usize) -> Option<(usize, usize)> {
        let line_end = self.line_end(pos);
        match self.bytes[pos] {
            b'"' | b'\'' => {
                let close = if self.bytes[pos] == b'"' {
                    self.scan_double_quoted(pos).ok()?
                } else {
                    self.scan_single_quoted(pos).ok()?
                };
                if close > line_end {
                    return None;
                }
                let i = self.skip_inline_space(close);
                (i < line_end && self.bytes[i] == b':' && self.is_value_break(i + 1))
                    .then_some((close, i))
            }
            b'[' | b'{' | b'|' | b'>' | b'!' | b'&' | b'*' | b'%' | b'@' | b'`' | b'#'
            | b'?' => None,
            _ => {
                let mut i = pos;
                while i < line_end {
                    let b = self.bytes[i];
                    if b == b':' && self.is_value_break(i + 1) {
                        let mut key_end = i;
                        while key_end > pos && matches!(self.bytes[key_end - 1], b' ' | b'\t') {
                            key_end -= 1;
                        }
                        return Some((key_end, i));
                    }
                    if b == b'#' && i > pos && matches!(self.bytes[i - 1], b' ' | b'\t') {
                        return None;
                    }
                    i += 1;
                }
                None
            }
        }
    }

    fn is_sequence_indicator(&self, pos: usize) -> bool {
        self.bytes.get(pos) == Some(&b'-') && self.is_value_break(pos + 1)
    }

    fn is_value_break(&self, i: usize) -> bool {
        i >= self.bytes.len() || matches!(self.bytes[i], b' ' | b'\t' | b'\r' | b'\n')
    }

    fn is_marker(&self, pos: usize, marker: &str) -> bool {
        self.column(pos) == 0
            && self.src[pos..].starts_with(marker)
            && self.is_value_break(pos + marker.len())
    }

    // `---` or `...` at column 0 ends the block structure of the document.
    fn is_document_marker(&self, pos: usize) -> bool {
        self.is_marker(pos, "---") || self.is_marker(pos, "...")
    }

    fn at_line_end_or_comment(&self, q: usize) -> bool {
        q >= self.bytes.len() || matches!(self.bytes[q], b'\n' | b'\r' | b'#')
    }

    fn expect_line_clear(&self, end: usize) -> Result<()> {
        let i = self.skip_inline_space(end);
        if self.at_line_end_or_comment(i) {
            Ok(())
        } else {
            Err(self.error(i, "unexpected characters after a value"))
        }
    }

    fn skip_inline_space(&self, mut i: usize) -> usize {
        while i < self.bytes.len() && matches!(self.bytes[i], b' ' | b'\t') {
            i += 1;
        }
        i
    }

    /// Skips whitespace, line breaks and comments.
    fn next_content(&self, from: usize) -> Option<usize> {
        let mut i = from;
        while i < self.bytes.len() {
            match self.bytes[i] {
                b' ' | b'\t' | b'\r' | b'\n' => i += 1,
                b'#' => i = self.line_end(i),
                _ => return Some(i),
            }
        }
        None
    }

    fn line_index(&self, offset: usize) -> usize {
        match self.line_starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i - 1,
        }
    }

    fn line_start(&self, offset: usize) -> usize {
        self.line_starts[self.line_index(offset)]
    }

    fn line_end(&self, offset: usize) -> usize {
        self.bytes[offset.min(self.bytes.len())..]
            .iter()
            .position(|&b| b == b'\n')
            .map_or(self.bytes.len(), |p| offset + p)
    }

    fn column(&self, offset: usize) -> usize {
        offset - self.line_start(offset)
    }

    fn location(&self, offset: usize) -> Location {
        let line = self.line_index(offset);
        Location {
            line: line + 1,
            column: offset - self.line_starts[line] + 1,
        }
    }

    fn null_node(&self, offset: usize) -> Node {
        Node {
            span: offset..offset,
            location: self.location(offset),
            indent: self.column(offset),
            kind: NodeKind::Null,
        }
    }

    fn error(&self, offset: usize, message: impl Into<String>) -> ScenarioError {
        ScenarioError::Yaml {
            location: self.location(offset),
            message: message.into(),
        }
    }
}

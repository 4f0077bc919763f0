//! Node tree produced by the reader.
//!
//! Every node remembers the byte range it occupies in the source, and every
//! container child remembers its *slot*: the offset right after `key:` or `-`.
//! Replacing `slot..node.end()` with freshly emitted text rewrites exactly one
//! value and leaves the rest of the file untouched.

use serde_json::{Map, Value};
use std::fmt;
use std::ops::Range;

/// 1-based line and column of a node in the scenario file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, PartialOrd, Ord)]
pub struct Location {
    /// Line number, starting at 1
    pub line: usize,
    /// Column number, starting at 1
    pub column: usize,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}, column {}", self.line, self.column)
    }
}

/// One step of a [`NodePath`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    /// Mapping key
    Key(String),
    /// Sequence index
    Index(usize),
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(k) => write!(f, "{}", k),
            Self::Index(i) => write!(f, "[{}]", i),
        }
    }
}

/// Address of a node relative to the document root.
///
/// Events keep a path instead of a reference to their node; the path is
/// resolved against the (immutable) document when rewrites are produced.
#[derive(Debug, Clone, PartialEq, Eq, Default, Hash)]
pub struct NodePath(pub Vec<Segment>);

impl NodePath {
    /// The empty path, addressing the root node.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Returns a new path extended by a mapping key.
    pub fn key(&self, key: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(Segment::Key(key.into()));
        Self(segments)
    }

    /// Returns a new path extended by a sequence index.
    pub fn index(&self, index: usize) -> Self {
        let mut segments = self.0.clone();
        segments.push(Segment::Index(index));
        Self(segments)
    }

    /// Returns a new path extended by every key in `keys`.
    pub fn keys<I, S>(&self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut segments = self.0.clone();
        segments.extend(keys.into_iter().map(|k| Segment::Key(k.into())));
        Self(segments)
    }

    /// Returns this path followed by `relative`.
    pub fn join(&self, relative: &NodePath) -> Self {
        let mut segments = self.0.clone();
        segments.extend(relative.0.iter().cloned());
        Self(segments)
    }

    /// Path segments.
    pub fn segments(&self) -> &[Segment] {
        &self.0
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for segment in &self.0 {
            match segment {
                Segment::Key(k) => {
                    if !first {
                        write!(f, ".")?;
                    }
                    write!(f, "{}", k)?;
                }
                Segment::Index(i) => write!(f, "[{}]", i)?,
            }
            first = false;
        }
        Ok(())
    }
}

/// A node of the scenario document.
#[derive(Debug, Clone)]
pub struct Node {
    /// Byte range of the node's own text (empty for an omitted value).
    pub span: Range<usize>,
    /// Where the node starts.
    pub location: Location,
    /// 0-based column of the node's first character.
    pub indent: usize,
    /// Structure of the node.
    pub kind: NodeKind,
}

/// Structure of a [`Node`].
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// Block mapping (`key: value` lines)
    Mapping(Vec<Entry>),
    /// Block sequence (`- item` lines)
    Sequence(Vec<Item>),
    /// Plain, quoted or block scalar
    Scalar(Value),
    /// Flow collection (`[..]` or `{..}`), kept opaque
    Flow(Value),
    /// Value omitted after `key:` or `-`
    Null,
}

/// One `key: value` pair of a block mapping.
#[derive(Debug, Clone)]
pub struct Entry {
    /// Key text (unquoted)
    pub key: String,
    /// Byte range of the key as written
    pub key_span: Range<usize>,
    /// Offset right after the `:`
    pub slot: usize,
    /// Offset of the start of the key's line
    pub line_start: usize,
    /// 0-based column of the key
    pub indent: usize,
    /// The value
    pub value: Node,
}

/// One `- value` item of a block sequence.
#[derive(Debug, Clone)]
pub struct Item {
    /// Offset of the `-` indicator
    pub dash: usize,
    /// Offset right after the `-`
    pub slot: usize,
    /// Offset of the start of the dash's line
    pub line_start: usize,
    /// 0-based column of the dash
    pub indent: usize,
    /// The value
    pub value: Node,
}

/// Where a value sits in its parent, used to re-emit it in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    /// Offset right after `key:` or `-`
    pub offset: usize,
    /// Column of the key or dash owning the slot
    pub indent: usize,
    /// Whether the slot follows a key or a dash
    pub kind: SlotKind,
}

/// Owner of a [`Slot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    /// `key:`
    Entry,
    /// `-`
    Item,
}

impl Entry {
    /// Slot of this entry's value.
    pub fn slot(&self) -> Slot {
        Slot {
            offset: self.slot,
            indent: self.indent,
            kind: SlotKind::Entry,
        }
    }

    /// Offset of the end of the entry's text.
    pub fn end(&self) -> usize {
        self.value.span.end.max(self.slot)
    }
}

impl Item {
    /// Slot of this item's value.
    pub fn slot(&self) -> Slot {
        Slot {
            offset: self.slot,
            indent: self.indent,
            kind: SlotKind::Item,
        }
    }

    /// Offset of the end of the item's text.
    pub fn end(&self) -> usize {
        self.value.span.end.max(self.slot)
    }
}

impl Node {
    /// Builds the plain value view of this node.
    pub fn value(&self) -> Value {
        match &self.kind {
            NodeKind::Mapping(entries) => {
                let mut map = Map::new();
                for entry in entries {
                    map.insert(entry.key.clone(), entry.value.value());
                }
                Value::Object(map)
            }
            NodeKind::Sequence(items) => {
                Value::Array(items.iter().map(|i| i.value.value()).collect())
            }
            NodeKind::Scalar(v) | NodeKind::Flow(v) => v.clone(),
            NodeKind::Null => Value::Null,
        }
    }

    /// Returns true for block mappings.
    pub fn is_mapping(&self) -> bool {
        matches!(self.kind, NodeKind::Mapping(_))
    }

    /// Returns true when the node carries no value.
    pub fn is_null(&self) -> bool {
        match &self.kind {
            NodeKind::Null => true,
            NodeKind::Scalar(v) => v.is_null(),
            _ => false,
        }
    }

    /// Entries of a block mapping, empty otherwise.
    pub fn entries(&self) -> &[Entry] {
        match &self.kind {
            NodeKind::Mapping(entries) => entries,
            _ => &[],
        }
    }

    /// Items of a block sequence, empty otherwise.
    pub fn items(&self) -> &[Item] {
        match &self.kind {
            NodeKind::Sequence(items) => items,
            _ => &[],
        }
    }

    /// Looks up an entry of a block mapping by key.
    pub fn entry(&self, key: &str) -> Option<&Entry> {
        self.entries().iter().find(|e| e.key == key)
    }

    /// Looks up the value of a block mapping entry by key.
    pub fn get(&self, key: &str) -> Option<&Node> {
        self.entry(key).map(|e| &e.value)
    }

    /// Returns the string content of a scalar node.
    pub fn as_str(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Scalar(Value::String(s)) => Some(s),
            _ => None,
        }
    }

    /// Resolves a path to a node, following only block containers.
    pub fn lookup(&self, path: &NodePath) -> Option<&Node> {
        let mut node = self;
        for segment in path.segments() {
            node = match segment {
                Segment::Key(k) => node.get(k)?,
                Segment::Index(i) => &node.items().get(*i)?.value,
            };
        }
        Some(node)
    }

    /// Resolves as much of `path` as exists and returns the deepest node.
    pub fn lookup_deepest(&self, path: &NodePath) -> &Node {
        let mut node = self;
        for segment in path.segments() {
            let next = match segment {
                Segment::Key(k) => node.get(k),
                Segment::Index(i) => node.items().get(*i).map(|item| &item.value),
            };
            match next {
                Some(n) => node = n,
                None => break,
            }
        }
        node
    }
}

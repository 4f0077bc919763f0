//! Update-mode engine: turns observed drift into text edits of the scenario.
//!
//! Events describe what should change as [`Update`]s addressed by
//! [`NodePath`]. [`resolve`] maps them onto the node tree and produces a
//! [`RewriteSet`] of `(span, replacement)` edits, which is applied to the
//! source in descending offset order.

use crate::error::{Result, ScenarioError};
use crate::yaml::{render_block, render_slot, Node, NodeKind, NodePath, Segment, Slot};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::ops::Range;
use std::str::FromStr;

/// One class of mismatch that may be absorbed into the scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UpdateMode {
    /// Exit codes, error messages and written files
    Result,
    /// Request matchers and missing `api_call` events
    ApiRequests,
    /// Response stubs for newly observed requests
    ApiResponses,
    /// Response bodies observed in remote mode
    ResponsePayloads,
    /// Stdout, stderr, prompts and progress output
    Ux,
}

impl UpdateMode {
    /// Every mode, in canonical order.
    pub const ALL: [UpdateMode; 5] = [
        UpdateMode::Result,
        UpdateMode::ApiRequests,
        UpdateMode::ApiResponses,
        UpdateMode::ResponsePayloads,
        UpdateMode::Ux,
    ];

    /// Name used on the command line and in messages.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Result => "RESULT",
            Self::ApiRequests => "API_REQUESTS",
            Self::ApiResponses => "API_RESPONSES",
            Self::ResponsePayloads => "RESPONSE_PAYLOADS",
            Self::Ux => "UX",
        }
    }

    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

impl fmt::Display for UpdateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpdateMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == normalized)
            .ok_or_else(|| format!("unknown update mode '{}'", s.trim()))
    }
}

/// A set of [`UpdateMode`] flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct UpdateModes(u8);

impl UpdateModes {
    /// Strict mode: every mismatch is a failure.
    pub fn none() -> Self {
        Self(0)
    }

    /// Every mode enabled.
    pub fn all() -> Self {
        UpdateMode::ALL.into_iter().collect()
    }

    /// Returns true if `mode` is enabled.
    pub fn contains(&self, mode: UpdateMode) -> bool {
        self.0 & mode.bit() != 0
    }

    /// Enables `mode`.
    pub fn insert(&mut self, mode: UpdateMode) {
        self.0 |= mode.bit();
    }

    /// Returns a copy with `mode` enabled.
    pub fn with(mut self, mode: UpdateMode) -> Self {
        self.insert(mode);
        self
    }

    /// Returns true in strict mode.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Enabled modes in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = UpdateMode> + '_ {
        UpdateMode::ALL.into_iter().filter(|m| self.contains(*m))
    }

    /// Parses a comma separated list such as `RESULT,UX`; `all` enables every
    /// mode and an empty string means strict mode.
    pub fn parse_list(list: &str) -> std::result::Result<Self, String> {
        let list = list.trim();
        if list.eq_ignore_ascii_case("all") {
            return Ok(Self::all());
        }
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(UpdateMode::from_str)
            .collect()
    }
}

impl FromIterator<UpdateMode> for UpdateModes {
    fn from_iter<T: IntoIterator<Item = UpdateMode>>(iter: T) -> Self {
        let mut modes = Self::none();
        for mode in iter {
            modes.insert(mode);
        }
        modes
    }
}

impl fmt::Display for UpdateModes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(UpdateMode::as_str).collect();
        if names.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&names.join(","))
        }
    }
}

// ===== Path-based updates =====

/// A change to the scenario addressed by node path.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    /// What to do
    pub op: UpdateOp,
    /// Mode that authorized the change
    pub mode: UpdateMode,
}

/// Operation of an [`Update`].
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOp {
    /// Replace (or create) the value at a path
    Set { path: NodePath, value: Value },
    /// Delete a mapping entry or sequence item
    Remove { path: NodePath },
    /// Insert an item into the sequence at `path` before `index`
    /// (`index` past the end appends)
    Insert {
        path: NodePath,
        index: usize,
        value: Value,
    },
}

impl Update {
    /// Replace the value at `path`.
    pub fn set(path: NodePath, value: Value, mode: UpdateMode) -> Self {
        Self {
            op: UpdateOp::Set { path, value },
            mode,
        }
    }

    /// Delete the entry or item at `path`.
    pub fn remove(path: NodePath, mode: UpdateMode) -> Self {
        Self {
            op: UpdateOp::Remove { path },
            mode,
        }
    }

    /// Insert `value` into the sequence at `path` before `index`.
    pub fn insert(path: NodePath, index: usize, value: Value, mode: UpdateMode) -> Self {
        Self {
            op: UpdateOp::Insert { path, index, value },
            mode,
        }
    }

    /// Path the update is addressed to.
    pub fn path(&self) -> &NodePath {
        match &self.op {
            UpdateOp::Set { path, .. }
            | UpdateOp::Remove { path }
            | UpdateOp::Insert { path, .. } => path,
        }
    }
}

// ===== Text edits =====

/// A replacement of one byte range of the scenario source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRewrite {
    /// Byte range replaced (empty for an insertion)
    pub span: Range<usize>,
    /// New text
    pub replacement: String,
    /// Mode that authorized the edit
    pub mode: UpdateMode,
}

impl PendingRewrite {
    /// Creates a rewrite.
    pub fn new(span: Range<usize>, replacement: impl Into<String>, mode: UpdateMode) -> Self {
        Self {
            span,
            replacement: replacement.into(),
            mode,
        }
    }
}

/// Rewrites accumulated during a run, applied in one pass.
#[derive(Debug, Clone, Default)]
pub struct RewriteSet {
    rewrites: Vec<PendingRewrite>,
}

impl RewriteSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a rewrite.
    pub fn push(&mut self, rewrite: PendingRewrite) {
        self.rewrites.push(rewrite);
    }

    /// Number of recorded rewrites.
    pub fn len(&self) -> usize {
        self.rewrites.len()
    }

    /// Returns true if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.rewrites.is_empty()
    }

    /// Recorded rewrites in recording order.
    pub fn iter(&self) -> impl Iterator<Item = &PendingRewrite> {
        self.rewrites.iter()
    }

    /// Modes that contributed at least one rewrite.
    pub fn modes(&self) -> UpdateModes {
        self.rewrites.iter().map(|r| r.mode).collect()
    }

    /// Applies every rewrite to `source`.
    ///
    /// Edits are applied in descending start offset so earlier offsets stay
    /// valid. At equal offsets a replacement goes before an insertion, and
    /// insertions keep their recording order in the output. Identical edits
    /// are applied once; overlapping edits are a [`ScenarioError::RewriteConflict`].
    pub fn apply(&self, source: &str) -> Result<String> {
        let mut ordered: Vec<(usize, &PendingRewrite)> = Vec::new();
        for (i, rewrite) in self.rewrites.iter().enumerate() {
            let duplicate = ordered
                .iter()
                .any(|(_, r)| r.span == rewrite.span && r.replacement == rewrite.replacement);
            if !duplicate {
                ordered.push((i, rewrite));
            }
        }

        for (a, (_, first)) in ordered.iter().enumerate() {
            for (_, second) in &ordered[a + 1..] {
                if overlaps(&first.span, &second.span) {
                    return Err(ScenarioError::RewriteConflict {
                        first: first.span.clone(),
                        second: second.span.clone(),
                    });
                }
            }
        }

        ordered.sort_by(|(ia, a), (ib, b)| {
            b.span
                .start
                .cmp(&a.span.start)
                .then_with(|| b.span.len().cmp(&a.span.len()))
                .then_with(|| ib.cmp(ia))
        });

        let mut text = source.to_string();
        for (_, rewrite) in ordered {
            let end = rewrite.span.end.min(text.len());
            let start = rewrite.span.start.min(end);
            text.replace_range(start..end, &rewrite.replacement);
        }
        Ok(text)
    }
}

fn overlaps(a: &Range<usize>, b: &Range<usize>) -> bool {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => false,
        (true, false) => b.start < a.start && a.start < b.end,
        (false, true) => a.start < b.start && b.start < a.end,
        (false, false) => a.start < b.end && b.start < a.end,
    }
}

// ===== Resolution =====

#[derive(Debug, Clone)]
enum RelOp {
    Set(Value),
    Remove,
    Insert(usize, Value),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum GroupKey {
    Replace(NodePath),
    NewKey(NodePath, String),
    NewItem(NodePath, usize),
}

struct Group {
    key: GroupKey,
    order: usize,
    mode: UpdateMode,
    ops: Vec<(Vec<Segment>, RelOp)>,
}

struct Reached<'a> {
    depth: usize,
    node: &'a Node,
    slot: Option<Slot>,
}

/// Resolves path-based updates against the document tree.
pub fn resolve(root: &Node, source: &str, updates: &[Update]) -> Result<RewriteSet> {
    let mut rewrites: Vec<(usize, PendingRewrite)> = Vec::new();
    let mut groups: Vec<Group> = Vec::new();
    let mut index: HashMap<GroupKey, usize> = HashMap::new();

    let mut group = |key: GroupKey, order: usize, mode: UpdateMode, rel: Vec<Segment>, op: RelOp| {
        let at = *index.entry(key.clone()).or_insert_with(|| {
            groups.push(Group {
                key,
                order,
                mode,
                ops: Vec::new(),
            });
            groups.len() - 1
        });
        groups[at].ops.push((rel, op));
    };

    for (order, update) in updates.iter().enumerate() {
        let path = update.path();
        let reached = walk(root, path);
        let segments = path.segments();
        let prefix = NodePath(segments[..reached.depth].to_vec());
        let rest = segments[reached.depth..].to_vec();

        match &update.op {
            UpdateOp::Set { value, .. } => {
                if rest.is_empty() || !is_block(reached.node) {
                    group(GroupKey::Replace(prefix), order, update.mode, rest, RelOp::Set(value.clone()));
                } else {
                    let (key, rel) = new_child_key(&prefix, &rest);
                    group(key, order, update.mode, rel, RelOp::Set(value.clone()));
                }
            }
            UpdateOp::Remove { .. } => {
                if !rest.is_empty() {
                    if !is_block(reached.node) {
                        group(GroupKey::Replace(prefix), order, update.mode, rest, RelOp::Remove);
                    }
                    continue;
                }
                let Some((last, parent_path)) = segments.split_last() else {
                    continue;
                };
                let parent_path = NodePath(parent_path.to_vec());
                let parent = walk(root, &parent_path).node;
                match line_removal(source, parent, last) {
                    Some(span) => rewrites.push((order, PendingRewrite::new(span, "", update.mode))),
                    None => group(
                        GroupKey::Replace(parent_path),
                        order,
                        update.mode,
                        vec![last.clone()],
                        RelOp::Remove,
                    ),
                }
            }
            UpdateOp::Insert { index: at, value, .. } => {
                if rest.is_empty() {
                    if let Some(rewrite) = item_insertion(source, reached.node, *at, value, update.mode) {
                        rewrites.push((order, rewrite));
                        continue;
                    }
                    group(
                        GroupKey::Replace(prefix),
                        order,
                        update.mode,
                        rest,
                        RelOp::Insert(*at, value.clone()),
                    );
                } else if !is_block(reached.node) {
                    group(GroupKey::Replace(prefix), order, update.mode, rest, RelOp::Insert(*at, value.clone()));
                } else {
                    let (key, rel) = new_child_key(&prefix, &rest);
                    group(key, order, update.mode, rel, RelOp::Insert(*at, value.clone()));
                }
            }
        }
    }

    for g in groups {
        if let Some(rewrite) = render_group(root, source, &g)? {
            rewrites.push((g.order, rewrite));
        }
    }

    rewrites.sort_by_key(|(order, _)| *order);
    let mut set = RewriteSet::new();
    for (_, rewrite) in rewrites {
        set.push(rewrite);
    }
    Ok(set)
}

fn is_block(node: &Node) -> bool {
    matches!(node.kind, NodeKind::Mapping(_) | NodeKind::Sequence(_))
}

fn new_child_key(prefix: &NodePath, rest: &[Segment]) -> (GroupKey, Vec<Segment>) {
    let rel = rest[1..].to_vec();
    match &rest[0] {
        Segment::Key(k) => (GroupKey::NewKey(prefix.clone(), k.clone()), rel),
        Segment::Index(i) => (GroupKey::NewItem(prefix.clone(), *i), rel),
    }
}

/// Follows `path` through block containers as far as it exists.
fn walk<'a>(root: &'a Node, path: &NodePath) -> Reached<'a> {
    let mut reached = Reached {
        depth: 0,
        node: root,
        slot: None,
    };
    for segment in path.segments() {
        let next = match segment {
            Segment::Key(k) => reached.node.entry(k).map(|e| (&e.value, e.slot())),
            Segment::Index(i) => reached.node.items().get(*i).map(|it| (&it.value, it.slot())),
        };
        match next {
            Some((node, slot)) => {
                reached.depth += 1;
                reached.node = node;
                reached.slot = Some(slot);
            }
            None => break,
        }
    }
    reached
}

fn render_group(root: &Node, source: &str, group: &Group) -> Result<Option<PendingRewrite>> {
    match &group.key {
        GroupKey::Replace(path) => {
            let reached = walk(root, path);
            let node = reached.node;
            let before = node.value();
            let after = apply_ops(before.clone(), &group.ops, &node.span)?;
            if after == before {
                return Ok(None);
            }
            let rewrite = match reached.slot {
                Some(slot) => PendingRewrite::new(
                    slot.offset..node.span.end.max(slot.offset),
                    render_slot(&after, slot.indent, slot.kind),
                    group.mode,
                ),
                None => PendingRewrite::new(node.span.clone(), render_block(&after, 0), group.mode),
            };
            Ok(Some(rewrite))
        }
        GroupKey::NewKey(path, key) => {
            let mapping = walk(root, path).node;
            let value = apply_ops(Value::Null, &group.ops, &mapping.span)?;
            let mut entry = Map::new();
            entry.insert(key.clone(), value);
            let at = eol(source, mapping.span.end);
            Ok(Some(PendingRewrite::new(
                at..at,
                format!("\n{}", render_block(&Value::Object(entry), mapping.indent)),
                group.mode,
            )))
        }
        GroupKey::NewItem(path, _) => {
            let sequence = walk(root, path).node;
            let value = apply_ops(Value::Null, &group.ops, &sequence.span)?;
            let at = eol(source, sequence.span.end);
            Ok(Some(PendingRewrite::new(
                at..at,
                format!("\n{}", render_block(&json!([value]), sequence.indent)),
                group.mode,
            )))
        }
    }
}

fn apply_ops(mut value: Value, ops: &[(Vec<Segment>, RelOp)], span: &Range<usize>) -> Result<Value> {
    let mut assigned: HashMap<&[Segment], &Value> = HashMap::new();
    // Indices name slots of the declared sequence; earlier inserts shift them.
    let mut inserted: Vec<(&[Segment], usize)> = Vec::new();
    for (rel, op) in ops {
        match op {
            RelOp::Set(v) => {
                if let Some(previous) = assigned.insert(rel.as_slice(), v) {
                    if previous != v {
                        return Err(ScenarioError::RewriteConflict {
                            first: span.clone(),
                            second: span.clone(),
                        });
                    }
                }
                *value_at(&mut value, rel) = v.clone();
            }
            RelOp::Remove => remove_at(&mut value, rel),
            RelOp::Insert(at, v) => {
                let shift = inserted
                    .iter()
                    .filter(|(r, earlier)| *r == rel.as_slice() && earlier <= at)
                    .count();
                inserted.push((rel.as_slice(), *at));
                let items = ensure_array(value_at(&mut value, rel));
                let slot = (*at + shift).min(items.len());
                items.insert(slot, v.clone());
            }
        }
    }
    Ok(value)
}

fn value_at<'v>(mut value: &'v mut Value, rel: &[Segment]) -> &'v mut Value {
    for segment in rel {
        value = match segment {
            Segment::Key(k) => ensure_object(value).entry(k.clone()).or_insert(Value::Null),
            Segment::Index(i) => {
                let items = ensure_array(value);
                while items.len() <= *i {
                    items.push(Value::Null);
                }
                &mut items[*i]
            }
        };
    }
    value
}

fn remove_at(value: &mut Value, rel: &[Segment]) {
    let Some((last, parent)) = rel.split_last() else {
        *value = Value::Null;
        return;
    };
    let mut node = value;
    for segment in parent {
        let next = match (segment, node) {
            (Segment::Key(k), Value::Object(map)) => map.get_mut(k),
            (Segment::Index(i), Value::Array(items)) => items.get_mut(*i),
            _ => None,
        };
        match next {
            Some(n) => node = n,
            None => return,
        }
    }
    match (last, node) {
        (Segment::Key(k), Value::Object(map)) => {
            map.shift_remove(k);
        }
        (Segment::Index(i), Value::Array(items)) if *i < items.len() => {
            items.remove(*i);
        }
        _ => {}
    }
}

fn ensure_object(value: &mut Value) -> &mut Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => {
            *other = Value::Object(Map::new());
            ensure_object(other)
        }
    }
}

fn ensure_array(value: &mut Value) -> &mut Vec<Value> {
    match value {
        Value::Array(items) => items,
        other => {
            *other = Value::Array(Vec::new());
            ensure_array(other)
        }
    }
}

/// Span covering whole lines of a child, if the child starts its own line.
fn line_removal(source: &str, parent: &Node, child: &Segment) -> Option<Range<usize>> {
    let (line_start, text_start, end) = match (child, &parent.kind) {
        (Segment::Key(k), NodeKind::Mapping(_)) => {
            let entry = parent.entry(k)?;
            (entry.line_start, entry.key_span.start, entry.end())
        }
        (Segment::Index(i), NodeKind::Sequence(items)) => {
            let item = items.get(*i)?;
            (item.line_start, item.dash, item.end())
        }
        _ => return None,
    };
    if !source[line_start..text_start].trim().is_empty() {
        return None;
    }
    let stop = eol(source, end);
    Some(line_start..(stop + 1).min(source.len()))
}

fn item_insertion(
    source: &str,
    node: &Node,
    at: usize,
    value: &Value,
    mode: UpdateMode,
) -> Option<PendingRewrite> {
    let NodeKind::Sequence(items) = &node.kind else {
        return None;
    };
    let text = render_block(&json!([value]), node.indent);
    match items.get(at) {
        Some(item) if source[item.line_start..item.dash].trim().is_empty() => Some(
            PendingRewrite::new(item.line_start..item.line_start, format!("{}\n", text), mode),
        ),
        Some(_) => None,
        None => {
            let end = eol(source, node.span.end);
            Some(PendingRewrite::new(end..end, format!("\n{}", text), mode))
        }
    }
}

fn eol(source: &str, offset: usize) -> usize {
    source[offset.min(source.len())..]
        .find('\n')
        .map_or(source.len(), |p| offset + p)
}

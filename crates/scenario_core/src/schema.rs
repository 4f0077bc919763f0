//! Typed view of a scenario document.
//!
//! The node tree is walked once; every action keeps its index, location and
//! path so failures and rewrites can point back into the file.

use crate::assertions::scalar_string;
use crate::document::ScenarioDocument;
use crate::error::{Result, ScenarioError};
use crate::events::{parse_events, DeclaredEvent, Event};
use crate::references::GENERATE;
use crate::yaml::{Location, Node, NodeKind, NodePath};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// A release track a scenario can run under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReleaseTrack {
    /// `ALPHA`
    Alpha,
    /// `BETA`
    Beta,
    /// `GA`
    Ga,
}

impl ReleaseTrack {
    /// Every track, most stable first.
    pub const ALL: [ReleaseTrack; 3] = [ReleaseTrack::Ga, ReleaseTrack::Beta, ReleaseTrack::Alpha];

    /// Name as written in `release_tracks`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Alpha => "ALPHA",
            Self::Beta => "BETA",
            Self::Ga => "GA",
        }
    }

    /// Command token prepended to argv. GA commands have none.
    pub fn prefix(self) -> Option<&'static str> {
        match self {
            Self::Alpha => Some("alpha"),
            Self::Beta => Some("beta"),
            Self::Ga => None,
        }
    }
}

impl fmt::Display for ReleaseTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReleaseTrack {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ALPHA" => Ok(Self::Alpha),
            "BETA" => Ok(Self::Beta),
            "GA" => Ok(Self::Ga),
            other => Err(format!("unknown release track '{}'", other)),
        }
    }
}

/// A parsed scenario.
#[derive(Debug, Clone)]
pub struct Scenario {
    /// `title`
    pub title: String,
    /// `release_tracks`, in declared order
    pub release_tracks: Vec<ReleaseTrack>,
    /// `summary`
    pub summary: Option<String>,
    /// `actions`
    pub actions: Vec<DeclaredAction>,
}

/// An action with its position in the `actions` list.
#[derive(Debug, Clone)]
pub struct DeclaredAction {
    /// Index in `actions`
    pub index: usize,
    /// Where the item starts
    pub location: Location,
    /// Absolute path of the item
    pub path: NodePath,
    /// The parsed action
    pub action: Action,
}

/// One step of a scenario.
#[derive(Debug, Clone)]
pub enum Action {
    /// Sets (or unsets, for `None`) properties, in order
    SetProperty(Vec<(String, Option<String>)>),
    /// Defines a reference
    DefineReference {
        /// Reference name
        reference: String,
        /// Value, `$$refs$$` allowed
        value: ReferenceValue,
    },
    /// Defines a reference holding a generated resource id
    GenerateResourceId {
        /// Reference name
        reference: String,
        /// Prefix of the id
        prefix: Option<String>,
    },
    /// Writes a file into the sandbox
    WriteFile {
        /// Path relative to the sandbox
        path: String,
        /// Text to write
        contents: String,
    },
    /// Copies a file from next to the scenario into the sandbox
    LoadResource {
        /// Path relative to the scenario's directory
        path: String,
        /// Path relative to the sandbox, defaults to the file name
        destination: Option<String>,
        /// Reference defined as the destination path
        reference: Option<String>,
    },
    /// Runs a command and checks its events
    ExecuteCommand(CommandAction),
}

/// Value of a `define_reference`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferenceValue {
    /// A literal
    Literal(String),
    /// `$gen$`: a generated resource id
    Generated,
}

/// Payload of `execute_command`.
#[derive(Debug, Clone)]
pub struct CommandAction {
    /// Command line after the release-track token
    pub command: String,
    /// Lines fed to the command before any `user_input` event
    pub stdin: Vec<String>,
    /// Declared events
    pub events: Vec<DeclaredEvent>,
    /// Absolute path of the `events` list
    pub events_path: NodePath,
}

impl Action {
    /// YAML key of the action.
    pub fn key(&self) -> &'static str {
        match self {
            Self::SetProperty(_) => "set_property",
            Self::DefineReference { .. } => "define_reference",
            Self::GenerateResourceId { .. } => "generate_resource_id",
            Self::WriteFile { .. } => "write_file",
            Self::LoadResource { .. } => "load_resource",
            Self::ExecuteCommand(_) => "execute_command",
        }
    }
}

const TOP_LEVEL_KEYS: &[&str] = &["title", "release_tracks", "summary", "actions"];

impl Scenario {
    /// Parses the scenario held by a document.
    pub fn from_document(document: &ScenarioDocument) -> Result<Self> {
        Self::parse(document.root())
    }

    /// Parses a scenario from its root node.
    pub fn parse(root: &Node) -> Result<Self> {
        if !root.is_mapping() {
            return Err(ScenarioError::schema(root.location, "a scenario must be a mapping"));
        }
        for entry in root.entries() {
            if !TOP_LEVEL_KEYS.contains(&entry.key.as_str()) {
                return Err(ScenarioError::schema(
                    entry.value.location,
                    format!("unknown scenario key '{}'", entry.key),
                ));
            }
        }

        let title = match root.get("title").map(Node::value) {
            Some(Value::String(title)) if !title.trim().is_empty() => title,
            _ => return Err(ScenarioError::schema(root.location, "scenario needs a title")),
        };
        let summary = root.get("summary").map(Node::value).filter(|v| !v.is_null()).map(|v| scalar_string(&v));
        let release_tracks = parse_tracks(root)?;

        let actions_node = root
            .get("actions")
            .ok_or_else(|| ScenarioError::schema(root.location, "scenario needs actions"))?;
        let actions = parse_actions(actions_node)?;

        Ok(Self {
            title,
            release_tracks,
            summary,
            actions,
        })
    }

    /// Fails unless `track` is listed in `release_tracks`.
    pub fn check_track(&self, track: ReleaseTrack) -> Result<()> {
        if self.release_tracks.contains(&track) {
            return Ok(());
        }
        Err(ScenarioError::ReleaseTrack {
            requested: track.to_string(),
            declared: self.release_tracks.iter().map(ToString::to_string).collect(),
        })
    }

    /// Number of `execute_command` actions.
    pub fn command_count(&self) -> usize {
        self.actions
            .iter()
            .filter(|a| matches!(a.action, Action::ExecuteCommand(_)))
            .count()
    }
}

fn parse_tracks(root: &Node) -> Result<Vec<ReleaseTrack>> {
    let node = root
        .get("release_tracks")
        .ok_or_else(|| ScenarioError::schema(root.location, "scenario needs release_tracks"))?;
    let names = match node.value() {
        Value::Array(items) => items.iter().map(scalar_string).collect::<Vec<_>>(),
        Value::String(s) => vec![s],
        _ => return Err(ScenarioError::schema(node.location, "release_tracks must be a list")),
    };
    let mut tracks = Vec::new();
    for name in names {
        let track = name.parse().map_err(|e: String| ScenarioError::schema(node.location, e))?;
        if !tracks.contains(&track) {
            tracks.push(track);
        }
    }
    if tracks.is_empty() {
        return Err(ScenarioError::schema(node.location, "release_tracks must not be empty"));
    }
    Ok(tracks)
}

fn parse_actions(node: &Node) -> Result<Vec<DeclaredAction>> {
    let base = NodePath::root().key("actions");
    match &node.kind {
        NodeKind::Sequence(items) => items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                let path = base.index(index);
                Ok(DeclaredAction {
                    index,
                    location: item.value.location,
                    action: parse_action(&item.value, &path)?,
                    path,
                })
            })
            .collect(),
        NodeKind::Flow(Value::Array(items)) if items.is_empty() => Ok(Vec::new()),
        NodeKind::Null => Ok(Vec::new()),
        _ => Err(ScenarioError::schema(node.location, "actions must be a block list")),
    }
}

fn parse_action(node: &Node, path: &NodePath) -> Result<Action> {
    let location = node.location;
    let entries = node.entries();
    let [entry] = entries else {
        return Err(ScenarioError::schema(location, "an action must be a mapping with exactly one key"));
    };
    let payload = &entry.value;
    let value = payload.value();
    let at = payload.location;

    match entry.key.as_str() {
        "set_property" => parse_set_property(&value, at),
        "define_reference" => parse_define_reference(&value, at),
        "generate_resource_id" => {
            let map = mapping(&value, "generate_resource_id", at)?;
            check_keys(map, &["reference", "prefix"], "generate_resource_id", at)?;
            Ok(Action::GenerateResourceId {
                reference: required(map, "reference", "generate_resource_id", at)?,
                prefix: optional(map, "prefix"),
            })
        }
        "write_file" => {
            let map = mapping(&value, "write_file", at)?;
            check_keys(map, &["path", "contents"], "write_file", at)?;
            Ok(Action::WriteFile {
                path: required(map, "path", "write_file", at)?,
                contents: optional(map, "contents").unwrap_or_default(),
            })
        }
        "load_resource" => {
            let map = mapping(&value, "load_resource", at)?;
            check_keys(map, &["path", "destination", "reference"], "load_resource", at)?;
            Ok(Action::LoadResource {
                path: required(map, "path", "load_resource", at)?,
                destination: optional(map, "destination"),
                reference: optional(map, "reference"),
            })
        }
        "execute_command" | "execute" => {
            parse_command(payload, &value, path.key(entry.key.clone())).map(Action::ExecuteCommand)
        }
        other => Err(ScenarioError::schema(location, format!("unknown action '{}'", other))),
    }
}

fn parse_set_property(value: &Value, at: Location) -> Result<Action> {
    let pairs = match value {
        Value::String(text) => {
            let (name, value) = text
                .split_once('=')
                .ok_or_else(|| ScenarioError::schema(at, "set_property expects 'section/name=value'"))?;
            vec![(name.trim().to_string(), Some(value.trim().to_string()))]
        }
        Value::Object(map) if !map.is_empty() => map
            .iter()
            .map(|(name, v)| (name.clone(), (!v.is_null()).then(|| scalar_string(v))))
            .collect(),
        _ => return Err(ScenarioError::schema(at, "set_property expects a mapping of properties")),
    };
    for (name, _) in &pairs {
        if !name.contains('/') {
            return Err(ScenarioError::schema(
                at,
                format!("property '{}' must be written as section/name", name),
            ));
        }
    }
    Ok(Action::SetProperty(pairs))
}

fn parse_define_reference(value: &Value, at: Location) -> Result<Action> {
    let (reference, raw) = match value {
        Value::String(text) => {
            let (name, value) = text
                .split_once('=')
                .ok_or_else(|| ScenarioError::schema(at, "define_reference expects 'name=value'"))?;
            (name.trim().to_string(), value.trim().to_string())
        }
        Value::Object(map) => {
            check_keys(map, &["reference", "value"], "define_reference", at)?;
            (
                required(map, "reference", "define_reference", at)?,
                required(map, "value", "define_reference", at)?,
            )
        }
        _ => return Err(ScenarioError::schema(at, "define_reference expects a mapping")),
    };
    if reference.is_empty() {
        return Err(ScenarioError::schema(at, "define_reference needs a reference name"));
    }
    let value = if raw == GENERATE {
        ReferenceValue::Generated
    } else {
        ReferenceValue::Literal(raw)
    };
    Ok(Action::DefineReference { reference, value })
}

fn parse_command(payload: &Node, value: &Value, path: NodePath) -> Result<CommandAction> {
    let at = payload.location;
    let map = match value {
        Value::Object(map) => map,
        _ => {
            return Err(ScenarioError::schema(
                at,
                "execute_command expects a mapping with a 'command' key",
            ))
        }
    };
    check_keys(map, &["command", "stdin", "events"], "execute_command", at)?;
    let command = required(map, "command", "execute_command", at)?;
    if command.trim().is_empty() {
        return Err(ScenarioError::schema(at, "execute_command needs a non-empty command"));
    }
    let stdin = match map.get("stdin") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(lines)) => lines.iter().map(scalar_string).collect(),
        Some(other) => scalar_string(other).lines().map(str::to_string).collect(),
    };

    let events = match &payload.kind {
        NodeKind::Mapping(_) => parse_events(payload.get("events"))?,
        _ => match map.get("events") {
            Some(Value::Array(items)) => items
                .iter()
                .enumerate()
                .map(|(index, v)| {
                    Ok(DeclaredEvent {
                        index,
                        location: at,
                        event: Event::from_value(v, at)?,
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            None | Some(Value::Null) => Vec::new(),
            Some(_) => return Err(ScenarioError::schema(at, "events must be a list")),
        },
    };

    Ok(CommandAction {
        command,
        stdin,
        events,
        events_path: path.key("events"),
    })
}

fn mapping<'v>(value: &'v Value, action: &str, at: Location) -> Result<&'v Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| ScenarioError::schema(at, format!("{} expects a mapping", action)))
}

fn check_keys(map: &Map<String, Value>, allowed: &[&str], action: &str, at: Location) -> Result<()> {
    match map.keys().find(|k| !allowed.contains(&k.as_str())) {
        Some(key) => Err(ScenarioError::schema(at, format!("unknown {} key '{}'", action, key))),
        None => Ok(()),
    }
}

fn required(map: &Map<String, Value>, key: &str, action: &str, at: Location) -> Result<String> {
    optional(map, key).ok_or_else(|| ScenarioError::schema(at, format!("{} needs '{}'", action, key)))
}

fn optional(map: &Map<String, Value>, key: &str) -> Option<String> {
    map.get(key).filter(|v| !v.is_null()).map(scalar_string)
}

/// Splits a command line into words. Single and double quotes group words;
/// a backslash escapes the next character outside single quotes.
pub fn split_command(command: &str) -> std::result::Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut chars = command.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => word.push(c),
                        None => return Err("unterminated single quote".to_string()),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\' | '$' | '`')) => word.push(c),
                            Some(c) => {
                                word.push('\\');
                                word.push(c);
                            }
                            None => return Err("unterminated double quote".to_string()),
                        },
                        Some(c) => word.push(c),
                        None => return Err("unterminated double quote".to_string()),
                    }
                }
            }
            '\\' => {
                in_word = true;
                match chars.next() {
                    Some(c) => word.push(c),
                    None => return Err("trailing backslash".to_string()),
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut word));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                word.push(c);
            }
        }
    }
    if in_word {
        words.push(word);
    }
    Ok(words)
}

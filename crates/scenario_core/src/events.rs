//! Expectation events and how each one checks what the command did.
//!
//! Every entry of an action's `events` list parses into an [`Event`]. The
//! session feeds observations to events in declared order; an event answers
//! with a [`MatchOutcome`] listing [`Finding`]s. A finding names the field it
//! is about (relative to the event item), the update mode that may rewrite it
//! and the change that would make the scenario agree with what was observed.
//! When an observation has no matching event, [`synthesize`] records one.

use crate::assertions::{json_subset, merge_subset, scalar_string, unordered_assignment, MatchOptions, Matcher};
use crate::capture::{FileContents, UxElement};
use crate::error::{Result, ScenarioError};
use crate::http::batch::{self, BatchResponsePart};
use crate::http::{canonical_uri, HttpRequest, HttpResponse};
use crate::references::ReferenceTable;
use crate::updates::{Update, UpdateMode, UpdateModes};
use crate::yaml::{Location, Node, NodeKind, NodePath};

/// Reference that operation responses are tracked under.
pub const OPERATION_REFERENCE: &str = "operation";
use serde_json::{json, Map, Value};
use std::fmt;

/// Response headers that change on every call and are never recorded.
pub const VOLATILE_HEADERS: &[&str] = &[
    "x-google-",
    "alt-svc",
    "content-length",
    "content-location",
    "date",
    "expires",
    "server",
    "transfer-encoding",
    "vary",
    "x-content-type-options",
    "x-frame-options",
    "x-xss-protection",
];

// ===== Kinds =====

/// The kind of an event, independent of its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// `expect_stdout`
    Stdout,
    /// `expect_stderr`
    Stderr,
    /// `expect_exit_code` / `expect_exit`
    Exit,
    /// `user_input`
    UserInput,
    /// Prompts and progress indicators
    Ux(UxElement),
    /// `expect_file_written`
    FileWritten,
    /// `api_call`
    ApiCall,
}

impl EventKind {
    /// Resolves a YAML event key.
    pub fn from_key(key: &str) -> Option<Self> {
        let kind = match key {
            "expect_stdout" => Self::Stdout,
            "expect_stderr" => Self::Stderr,
            "expect_exit_code" | "expect_exit" => Self::Exit,
            "user_input" => Self::UserInput,
            "expect_prompt" => Self::Ux(UxElement::Prompt),
            "expect_prompt_continue" => Self::Ux(UxElement::PromptContinue),
            "expect_prompt_choice" => Self::Ux(UxElement::PromptChoice),
            "expect_progress_bar" => Self::Ux(UxElement::ProgressBar),
            "expect_progress_tracker" => Self::Ux(UxElement::ProgressTracker),
            "expect_file_written" => Self::FileWritten,
            "api_call" => Self::ApiCall,
            _ => return None,
        };
        Some(kind)
    }

    /// Canonical YAML key.
    pub fn key(self) -> &'static str {
        match self {
            Self::Stdout => "expect_stdout",
            Self::Stderr => "expect_stderr",
            Self::Exit => "expect_exit_code",
            Self::UserInput => "user_input",
            Self::Ux(UxElement::Prompt) => "expect_prompt",
            Self::Ux(UxElement::PromptContinue) => "expect_prompt_continue",
            Self::Ux(UxElement::PromptChoice) => "expect_prompt_choice",
            Self::Ux(UxElement::ProgressBar) => "expect_progress_bar",
            Self::Ux(UxElement::ProgressTracker) => "expect_progress_tracker",
            Self::FileWritten => "expect_file_written",
            Self::ApiCall => "api_call",
        }
    }

    /// Mode that may rewrite events of this kind.
    pub fn update_mode(self) -> UpdateMode {
        match self {
            Self::Exit | Self::FileWritten => UpdateMode::Result,
            Self::ApiCall => UpdateMode::ApiRequests,
            Self::Stdout | Self::Stderr | Self::UserInput | Self::Ux(_) => UpdateMode::Ux,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

// ===== Observations =====

/// Something the command did that events assert on.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    /// A run of stdout writes
    Stdout(String),
    /// A run of stderr writes
    Stderr(String),
    /// The command finished
    Exit {
        /// Exit code
        code: i32,
        /// Error message of a handled error
        message: Option<String>,
    },
    /// The command read a line outside of a prompt
    UserInput,
    /// A structured UX element on stderr
    Ux {
        /// Element kind
        element: UxElement,
        /// Fields besides `"ux"`
        data: Map<String, Value>,
    },
    /// The command wrote a file
    FileWritten {
        /// Path relative to the sandbox, `/`-separated
        path: String,
        /// What was written
        contents: FileContents,
        /// Whether the file was written as private
        private: bool,
    },
    /// The command sent an HTTP request
    ApiRequest(HttpRequest),
}

impl Observation {
    /// Kind of event that asserts on this observation.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Stdout(_) => EventKind::Stdout,
            Self::Stderr(_) => EventKind::Stderr,
            Self::Exit { .. } => EventKind::Exit,
            Self::UserInput => EventKind::UserInput,
            Self::Ux { element, .. } => EventKind::Ux(*element),
            Self::FileWritten { .. } => EventKind::FileWritten,
            Self::ApiRequest(_) => EventKind::ApiCall,
        }
    }
}

// ===== Findings =====

/// Whether a finding fails the run when its mode is off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// A mismatch
    Failure,
    /// Something worth recording, never a failure
    Advisory,
}

/// Rewrite that would resolve a finding.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// Replace (or create) the field
    Set(Value),
    /// Delete the field
    Remove,
}

/// One difference between an event and an observation.
#[derive(Debug, Clone, PartialEq)]
pub struct Finding {
    /// Field the change applies to, relative to the event item
    pub field: NodePath,
    /// Human-readable one-liner
    pub summary: String,
    /// Declared value, for diffs
    pub expected: Value,
    /// Observed value, for diffs
    pub actual: Value,
    /// Rewrite resolving the finding, if one exists
    pub change: Option<Change>,
    /// Mode that authorizes the rewrite
    pub mode: UpdateMode,
    /// Whether this is a mismatch
    pub severity: Severity,
}

impl Finding {
    fn failure(field: NodePath, mode: UpdateMode, summary: impl Into<String>, change: Option<Change>) -> Self {
        Self {
            field,
            summary: summary.into(),
            expected: Value::Null,
            actual: Value::Null,
            change,
            mode,
            severity: Severity::Failure,
        }
    }

    fn advisory(field: NodePath, mode: UpdateMode, summary: impl Into<String>, value: Value) -> Self {
        Self {
            actual: value.clone(),
            severity: Severity::Advisory,
            ..Self::failure(field, mode, summary, Some(Change::Set(value)))
        }
    }

    fn values(mut self, expected: Value, actual: Value) -> Self {
        self.expected = expected;
        self.actual = actual;
        self
    }

    /// Whether the finding's rewrite is authorized by `modes`.
    pub fn applies(&self, modes: UpdateModes) -> bool {
        self.change.is_some() && modes.contains(self.mode)
    }

    /// Whether the finding fails the run under `modes`.
    pub fn fails(&self, modes: UpdateModes) -> bool {
        self.severity == Severity::Failure && !self.applies(modes)
    }
}

/// Result of checking an event against an observation.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    /// Nothing to report
    Matched,
    /// Matched, with advisory rewrites
    Partial(Vec<Finding>),
    /// At least one mismatch
    Mismatched(Vec<Finding>),
}

impl MatchOutcome {
    /// Classifies a list of findings.
    pub fn from_findings(findings: Vec<Finding>) -> Self {
        if findings.is_empty() {
            Self::Matched
        } else if findings.iter().all(|f| f.severity == Severity::Advisory) {
            Self::Partial(findings)
        } else {
            Self::Mismatched(findings)
        }
    }

    /// Returns true unless there was a mismatch.
    pub fn is_match(&self) -> bool {
        !matches!(self, Self::Mismatched(_))
    }

    /// Every finding.
    pub fn findings(&self) -> &[Finding] {
        match self {
            Self::Matched => &[],
            Self::Partial(f) | Self::Mismatched(f) => f,
        }
    }

    /// Rewrites authorized by `modes`, addressed below `base` (the path of
    /// the event item). `None` when no rewrite applies.
    pub fn updates(&self, base: &NodePath, modes: UpdateModes) -> Option<Vec<Update>> {
        let updates: Vec<Update> = self
            .findings()
            .iter()
            .filter(|f| f.applies(modes))
            .filter_map(|f| {
                let path = base.join(&f.field);
                match f.change.as_ref()? {
                    Change::Set(value) => Some(Update::set(path, value.clone(), f.mode)),
                    Change::Remove => Some(Update::remove(path, f.mode)),
                }
            })
            .collect();
        (!updates.is_empty()).then_some(updates)
    }
}

/// What checks need besides the event and the observation.
#[derive(Debug, Clone, Copy)]
pub struct MatchContext<'a> {
    /// References defined so far
    pub refs: &'a ReferenceTable,
    /// Literal comparison options
    pub options: MatchOptions,
}

impl MatchContext<'_> {
    fn matcher(&self, declared: &Value) -> std::result::Result<Matcher, String> {
        Matcher::from_value(&self.refs.substitute_value(declared))
    }
}

// ===== Events =====

/// A declared expectation.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// `expect_stdout: <matcher>`
    Stdout(Value),
    /// `expect_stderr: <matcher>`
    Stderr(Value),
    /// `expect_exit_code` / `expect_exit`
    Exit(ExitExpectation),
    /// `user_input: [lines]`
    UserInput(Vec<String>),
    /// Prompts and progress indicators
    Ux(UxExpectation),
    /// `expect_file_written`
    FileWritten(FileExpectation),
    /// `api_call`
    ApiCall(Box<ApiCallExpectation>),
}

/// Payload of an exit event.
#[derive(Debug, Clone, PartialEq)]
pub struct ExitExpectation {
    /// Key as written
    pub key: String,
    /// Expected exit code
    pub code: i64,
    /// Matcher for the error message, when declared
    pub message: Option<Value>,
    /// Whether the payload is a `{code, message}` mapping
    pub mapping: bool,
}

/// Payload of a prompt or progress event.
#[derive(Debug, Clone, PartialEq)]
pub struct UxExpectation {
    /// Element the event expects
    pub element: UxElement,
    /// Declared attribute matchers, in order
    pub fields: Vec<(String, Value)>,
    /// Reply fed to a prompt
    pub user_input: Option<String>,
}

impl UxExpectation {
    /// Reply the prompt receives: the declared one or the element's default.
    pub fn reply(&self) -> String {
        self.user_input
            .clone()
            .unwrap_or_else(|| default_reply(self.element).to_string())
    }
}

/// Payload of `expect_file_written`.
#[derive(Debug, Clone, PartialEq)]
pub struct FileExpectation {
    /// Matcher for the sandbox-relative path
    pub path: Value,
    /// Matcher for text contents
    pub contents: Option<Value>,
    /// Hex of binary contents
    pub binary_contents: Option<String>,
    /// Whether the file must be private
    pub is_private: Option<bool>,
}

/// Reply a prompt gets when the scenario declares none.
pub fn default_reply(element: UxElement) -> &'static str {
    match element {
        UxElement::PromptContinue => "y",
        _ => "",
    }
}

impl Event {
    /// Parses one item of an `events` list.
    pub fn parse(node: &Node) -> Result<Self> {
        Self::from_value(&node.value(), node.location)
    }

    /// Parses an event from its plain value; `location` is used for errors.
    pub fn from_value(value: &Value, location: Location) -> Result<Self> {
        let Value::Object(map) = value else {
            return Err(ScenarioError::schema(location, "an event must be a mapping with one key"));
        };
        let (Some((key, payload)), 1) = (map.iter().next(), map.len()) else {
            return Err(ScenarioError::schema(location, "an event must have exactly one key"));
        };
        let kind = EventKind::from_key(key)
            .ok_or_else(|| ScenarioError::schema(location, format!("unknown event '{}'", key)))?;

        let event = match kind {
            EventKind::Stdout => Self::Stdout(validated(payload, location)?),
            EventKind::Stderr => Self::Stderr(validated(payload, location)?),
            EventKind::Exit => Self::Exit(parse_exit(key, payload, location)?),
            EventKind::UserInput => Self::UserInput(parse_lines(payload)),
            EventKind::Ux(element) => Self::Ux(parse_ux(element, payload, location)?),
            EventKind::FileWritten => Self::FileWritten(parse_file(payload, location)?),
            EventKind::ApiCall => Self::ApiCall(Box::new(ApiCallExpectation::parse(payload, location)?)),
        };
        Ok(event)
    }

    /// Kind of the event.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Stdout(_) => EventKind::Stdout,
            Self::Stderr(_) => EventKind::Stderr,
            Self::Exit(_) => EventKind::Exit,
            Self::UserInput(_) => EventKind::UserInput,
            Self::Ux(ux) => EventKind::Ux(ux.element),
            Self::FileWritten(_) => EventKind::FileWritten,
            Self::ApiCall(_) => EventKind::ApiCall,
        }
    }

    /// YAML key as written.
    pub fn key(&self) -> &str {
        match self {
            Self::Exit(exit) => &exit.key,
            other => other.kind().key(),
        }
    }

    /// Whether matching this event moves the queue forward. A repeatable
    /// `api_call` stays available for the requests that follow it.
    pub fn consumes_observation(&self) -> bool {
        !matches!(self, Self::ApiCall(call) if call.repeatable)
    }

    /// Checks the event against an observation of the same kind.
    pub fn check(&self, observation: &Observation, ctx: &MatchContext<'_>) -> MatchOutcome {
        let key = NodePath::root().key(self.key());
        let findings = match (self, observation) {
            (Self::Stdout(declared), Observation::Stdout(text))
            | (Self::Stderr(declared), Observation::Stderr(text)) => {
                check_value(declared, &Value::String(text.clone()), key, UpdateMode::Ux, ctx)
                    .into_iter()
                    .collect()
            }
            (Self::Exit(exit), Observation::Exit { code, message }) => exit.check(*code, message.as_deref(), ctx),
            (Self::UserInput(lines), Observation::UserInput) => {
                if lines.is_empty() {
                    vec![Finding::failure(
                        key,
                        UpdateMode::Ux,
                        "the command read input but the event provides no lines",
                        Some(Change::Set(json!([""]))),
                    )]
                } else {
                    Vec::new()
                }
            }
            (Self::Ux(ux), Observation::Ux { element, data }) if ux.element == *element => ux.check(data, ctx),
            (Self::FileWritten(file), Observation::FileWritten { path, contents, private }) => {
                file.check(path, contents, *private, ctx)
            }
            (Self::ApiCall(call), Observation::ApiRequest(request)) => call.check_request(request, ctx),
            _ => vec![Finding::failure(
                key,
                self.kind().update_mode(),
                format!("expected {} but observed {}", self.kind(), observation.kind()),
                None,
            )],
        };
        MatchOutcome::from_findings(findings)
    }
}

/// An event with its position in the action's `events` list.
#[derive(Debug, Clone, PartialEq)]
pub struct DeclaredEvent {
    /// Index in the `events` list
    pub index: usize,
    /// Where the item starts
    pub location: Location,
    /// The parsed event
    pub event: Event,
}

/// Parses an `events` list. A missing or null list has no events.
pub fn parse_events(node: Option<&Node>) -> Result<Vec<DeclaredEvent>> {
    let Some(node) = node.filter(|n| !n.is_null()) else {
        return Ok(Vec::new());
    };
    match &node.kind {
        NodeKind::Sequence(items) => items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                Ok(DeclaredEvent {
                    index,
                    location: item.value.location,
                    event: Event::parse(&item.value)?,
                })
            })
            .collect(),
        NodeKind::Flow(Value::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(index, value)| {
                Ok(DeclaredEvent {
                    index,
                    location: node.location,
                    event: Event::from_value(value, node.location)?,
                })
            })
            .collect(),
        _ => Err(ScenarioError::schema(
            node.location,
            "events must be a list",
        )),
    }
}

/// Records an event for an observation that had none. `response` is the
/// response served for an API request, included when it should be recorded.
pub fn synthesize(observation: &Observation, response: Option<&HttpResponse>) -> Value {
    let payload = match observation {
        Observation::Stdout(text) | Observation::Stderr(text) => Value::String(text.clone()),
        Observation::Exit { code, message: Some(message) } => {
            return json!({ "expect_exit": { "code": code, "message": message } });
        }
        Observation::Exit { code, message: None } => json!(code),
        Observation::UserInput => json!([""]),
        Observation::Ux { element, data } => {
            let mut out = Map::new();
            for field in element.data_fields() {
                if let Some(value) = data.get(*field).filter(|v| !v.is_null()) {
                    out.insert((*field).to_string(), value.clone());
                }
            }
            if element.takes_input() {
                out.insert("user_input".to_string(), json!(default_reply(*element)));
            }
            Value::Object(out)
        }
        Observation::FileWritten { path, contents, private } => {
            let mut out = Map::new();
            out.insert("path".to_string(), json!(path));
            match contents {
                FileContents::Text(text) => out.insert("contents".to_string(), json!(text)),
                FileContents::Binary(bytes) => out.insert("binary_contents".to_string(), json!(hex::encode(bytes))),
            };
            if *private {
                out.insert("is_private".to_string(), json!(true));
            }
            Value::Object(out)
        }
        Observation::ApiRequest(request) => return ApiCallExpectation::synthesize(request, response),
    };
    let mut event = Map::new();
    event.insert(observation.kind().key().to_string(), payload);
    Value::Object(event)
}

fn validated(declared: &Value, location: Location) -> Result<Value> {
    Matcher::from_value(declared).map_err(|e| ScenarioError::schema(location, e))?;
    Ok(declared.clone())
}

fn parse_lines(payload: &Value) -> Vec<String> {
    match payload {
        Value::Array(lines) => lines.iter().map(scalar_string).collect(),
        Value::Null => Vec::new(),
        other => vec![scalar_string(other)],
    }
}

// Checks one declared matcher; a mismatch becomes a finding at `field`.
fn check_value(
    declared: &Value,
    actual: &Value,
    field: NodePath,
    mode: UpdateMode,
    ctx: &MatchContext<'_>,
) -> Option<Finding> {
    let matcher = match ctx.matcher(declared) {
        Ok(m) => m,
        Err(e) => return Some(Finding::failure(field, mode, e, None)),
    };
    let difference = matcher.check(actual, ctx.options).err()?;
    let change = if actual.is_null() {
        Change::Remove
    } else {
        Change::Set(difference.proposed)
    };
    Some(
        Finding::failure(field.clone(), mode, format!("{}: {}", field, difference.summary), Some(change))
            .values(difference.expected, difference.actual),
    )
}

// ===== Exit =====

fn parse_exit(key: &str, payload: &Value, location: Location) -> Result<ExitExpectation> {
    let int = |v: &Value| {
        v.as_i64()
            .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
            .ok_or_else(|| ScenarioError::schema(location, format!("{} needs an integer exit code", key)))
    };
    match payload {
        Value::Object(map) => {
            let code = map.get("code").map(int).transpose()?.unwrap_or(0);
            let message = map.get("message").map(|m| validated(m, location)).transpose()?;
            Ok(ExitExpectation {
                key: key.to_string(),
                code,
                message,
                mapping: true,
            })
        }
        scalar => Ok(ExitExpectation {
            key: key.to_string(),
            code: int(scalar)?,
            message: None,
            mapping: false,
        }),
    }
}

impl ExitExpectation {
    fn check(&self, code: i32, message: Option<&str>, ctx: &MatchContext<'_>) -> Vec<Finding> {
        let key = NodePath::root().key(&self.key);
        let mut findings = Vec::new();
        if self.code != i64::from(code) {
            let field = if self.mapping { key.key("code") } else { key.clone() };
            findings.push(
                Finding::failure(
                    field,
                    UpdateMode::Result,
                    format!("exit code: expected {}, got {}", self.code, code),
                    Some(Change::Set(json!(code))),
                )
                .values(json!(self.code), json!(code)),
            );
        }
        if let Some(declared) = &self.message {
            let actual = message.map_or(Value::Null, |m| Value::String(m.to_string()));
            findings.extend(check_value(declared, &actual, key.key("message"), UpdateMode::Result, ctx));
        }
        findings
    }
}

// ===== UX =====

fn parse_ux(element: UxElement, payload: &Value, location: Location) -> Result<UxExpectation> {
    let mut fields = Vec::new();
    let mut user_input = None;
    match payload {
        Value::Object(map) => {
            for (name, declared) in map {
                if name == "user_input" {
                    if !element.takes_input() {
                        return Err(ScenarioError::schema(
                            location,
                            format!("{} does not take user_input", EventKind::Ux(element)),
                        ));
                    }
                    user_input = Some(scalar_string(declared));
                } else {
                    fields.push((name.clone(), validated(declared, location)?));
                }
            }
        }
        Value::Null => {}
        other => fields.push(("message".to_string(), validated(other, location)?)),
    }
    Ok(UxExpectation {
        element,
        fields,
        user_input,
    })
}

impl UxExpectation {
    fn check(&self, data: &Map<String, Value>, ctx: &MatchContext<'_>) -> Vec<Finding> {
        let key = NodePath::root().key(EventKind::Ux(self.element).key());
        let mut findings: Vec<Finding> = self
            .fields
            .iter()
            .filter_map(|(name, declared)| {
                let actual = data.get(name).cloned().unwrap_or(Value::Null);
                check_value(declared, &actual, key.key(name), UpdateMode::Ux, ctx)
            })
            .collect();
        if self.element.takes_input() && self.user_input.is_none() {
            findings.push(Finding::advisory(
                key.key("user_input"),
                UpdateMode::Ux,
                "prompt answered with the default reply",
                json!(default_reply(self.element)),
            ));
        }
        findings
    }
}

// ===== Files =====

fn parse_file(payload: &Value, location: Location) -> Result<FileExpectation> {
    let Value::Object(map) = payload else {
        return Ok(FileExpectation {
            path: validated(payload, location)?,
            contents: None,
            binary_contents: None,
            is_private: None,
        });
    };
    let path = map
        .get("path")
        .ok_or_else(|| ScenarioError::schema(location, "expect_file_written needs a path"))?;
    Ok(FileExpectation {
        path: validated(path, location)?,
        contents: map.get("contents").map(|c| validated(c, location)).transpose()?,
        binary_contents: map.get("binary_contents").map(scalar_string),
        is_private: map.get("is_private").and_then(Value::as_bool),
    })
}

impl FileExpectation {
    fn check(&self, path: &str, contents: &FileContents, private: bool, ctx: &MatchContext<'_>) -> Vec<Finding> {
        let key = NodePath::root().key("expect_file_written");
        let mode = UpdateMode::Result;
        let mut findings = Vec::new();

        let shown = json!(path.replace('\\', "/"));
        findings.extend(check_value(&self.path, &shown, key.key("path"), mode, ctx));

        if let Some(declared) = &self.contents {
            let text = String::from_utf8_lossy(contents.as_bytes()).into_owned();
            findings.extend(check_value(declared, &json!(text), key.key("contents"), mode, ctx));
        }
        if let Some(declared) = &self.binary_contents {
            let actual = hex::encode(contents.as_bytes());
            if !declared.eq_ignore_ascii_case(&actual) {
                findings.push(
                    Finding::failure(
                        key.key("binary_contents"),
                        mode,
                        "binary_contents: file bytes differ",
                        Some(Change::Set(json!(actual))),
                    )
                    .values(json!(declared), json!(actual)),
                );
            }
        }
        if self.is_private.unwrap_or(false) != private {
            findings.push(
                Finding::failure(
                    key.key("is_private"),
                    mode,
                    format!("is_private: expected {}, got {}", !private, private),
                    Some(Change::Set(json!(private))),
                )
                .values(json!(!private), json!(private)),
            );
        }
        findings
    }
}

// ===== API calls =====

/// Payload of an `api_call` event.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiCallExpectation {
    /// `expect_request`
    pub request: RequestExpectation,
    /// `expect_response`
    pub response: Option<ResponseExpectation>,
    /// `return_response` as declared
    pub reply: Option<Value>,
    /// May absorb consecutive equivalent requests
    pub repeatable: bool,
    /// A missing `return_response` is served a default response
    pub optional: bool,
}

/// `expect_request`, also used for each batch sub-request.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestExpectation {
    /// URI, possibly with `$$refs$$`
    pub uri: String,
    /// Method, `GET` when omitted
    pub method: Option<String>,
    /// Header matchers
    pub headers: Vec<(String, Value)>,
    /// Body expectation
    pub body: BodyExpectation,
    /// Sub-request expectations of a multipart batch
    pub batch: Option<Vec<RequestExpectation>>,
}

/// `expect_response`.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseExpectation {
    /// Header matchers
    pub headers: Vec<(String, Value)>,
    /// Body expectation
    pub body: BodyExpectation,
    /// `(dotted field, reference name)` pairs captured from the JSON body
    pub extract_references: Vec<(String, String)>,
}

/// What a request or response body must look like.
#[derive(Debug, Clone, PartialEq)]
pub enum BodyExpectation {
    /// Absent or `{}`: anything goes
    Unchecked,
    /// `null`: the body must be empty
    Empty,
    /// `{text: <matcher>, json: <subset>}`
    Content {
        /// Matcher for the raw text
        text: Option<Value>,
        /// JSON subset; `Some(Null)` means "not JSON"
        json: Option<Value>,
    },
}

impl ApiCallExpectation {
    fn parse(payload: &Value, location: Location) -> Result<Self> {
        let schema = |msg: &str| ScenarioError::schema(location, msg.to_string());
        let map = payload.as_object().ok_or_else(|| schema("api_call must be a mapping"))?;
        let request = map
            .get("expect_request")
            .ok_or_else(|| schema("api_call needs expect_request"))?;
        let response = match map.get("expect_response") {
            Some(Value::Object(r)) => Some(ResponseExpectation {
                headers: parse_headers(r.get("headers"), location)?,
                body: parse_body(r.get("body"), location)?,
                extract_references: parse_extractions(r.get("extract_references"), location)?,
            }),
            Some(Value::Null) | None => None,
            Some(_) => return Err(schema("expect_response must be a mapping")),
        };
        let reply = map.get("return_response").filter(|r| !r.is_null()).cloned();
        if let Some(reply) = &reply {
            ResponseStub::parse(reply).map_err(|e| ScenarioError::schema(location, e))?;
        }
        Ok(Self {
            request: RequestExpectation::parse(request, location)?,
            response,
            reply,
            repeatable: map.get("repeatable").and_then(Value::as_bool).unwrap_or(false),
            optional: map.get("optional").and_then(Value::as_bool).unwrap_or(false),
        })
    }

    /// Checks the request side.
    pub fn check_request(&self, request: &HttpRequest, ctx: &MatchContext<'_>) -> Vec<Finding> {
        let base = NodePath::root().keys(["api_call", "expect_request"]);
        self.request.check(request, &base, ctx)
    }

    /// Whether the request satisfies the request side with no mismatch.
    pub fn accepts(&self, request: &HttpRequest, ctx: &MatchContext<'_>) -> bool {
        self.request.fits(request, ctx)
    }

    /// The response played back for `request`, plus a finding when the
    /// event has no response and is not optional. `default_status` is the
    /// status of a minted stand-in response.
    pub fn respond(
        &self,
        request: &HttpRequest,
        ctx: &MatchContext<'_>,
        default_status: u16,
    ) -> (HttpResponse, Option<Finding>) {
        let Some(reply) = &self.reply else {
            let minted = HttpResponse::new(default_status, Vec::new());
            if self.optional {
                return (minted, None);
            }
            let finding = Finding::failure(
                NodePath::root().keys(["api_call", "return_response"]),
                UpdateMode::ApiResponses,
                format!("no response recorded for {}", request),
                Some(Change::Set(record_response(&minted, None))),
            );
            return (minted, Some(finding));
        };

        let stub = match ResponseStub::parse(&ctx.refs.substitute_value(reply)) {
            Ok(stub) => stub,
            Err(e) => {
                let finding = Finding::failure(
                    NodePath::root().keys(["api_call", "return_response"]),
                    UpdateMode::ApiResponses,
                    e,
                    None,
                );
                return (HttpResponse::new(default_status, Vec::new()), Some(finding));
            }
        };

        match (&stub.batch, batch::parse_request(request)) {
            (Some(subs), Ok(parts)) => {
                let order = self.batch_order(request, ctx);
                let replies = parts
                    .iter()
                    .enumerate()
                    .map(|(a, part)| {
                        let e = order.iter().position(|&x| x == a).unwrap_or(a);
                        let response = subs
                            .get(e)
                            .map(ResponseStub::to_response)
                            .unwrap_or_else(|| HttpResponse::new(default_status, Vec::new()));
                        BatchResponsePart {
                            content_id: part.content_id.clone(),
                            response,
                        }
                    })
                    .collect::<Vec<_>>();
                let mut response = batch::encode_response(&replies);
                response.status = stub.status;
                (response, None)
            }
            _ => (stub.to_response(), None),
        }
    }

    /// Checks `expect_response` against the response the command got.
    pub fn check_response(&self, response: &HttpResponse, ctx: &MatchContext<'_>) -> Vec<Finding> {
        let Some(expected) = &self.response else {
            return Vec::new();
        };
        let base = NodePath::root().keys(["api_call", "expect_response"]);
        let mode = UpdateMode::ResponsePayloads;
        let mut findings = check_headers(&expected.headers, &response.headers, &base, mode, ctx);
        findings.extend(check_body(&expected.body, &response.body, &base.key("body"), mode, ctx));
        findings
    }

    /// Records a real response into `return_response` when it differs from
    /// what is declared.
    pub fn record_real_response(
        &self,
        request: &HttpRequest,
        response: &HttpResponse,
        ctx: &MatchContext<'_>,
    ) -> Option<Finding> {
        let order = self.request.batch.as_ref().map(|_| self.batch_order(request, ctx));
        let recorded = ctx.refs.reverse_value(&record_response(response, order.as_deref().map(|o| (request, o))));
        if self.reply.as_ref() == Some(&recorded) {
            return None;
        }
        Some(Finding::advisory(
            NodePath::root().keys(["api_call", "return_response"]),
            UpdateMode::ResponsePayloads,
            "response payload recorded",
            recorded,
        ))
    }

    /// Checks the `repeatable` flag against whether the event was reused.
    pub fn check_repeatable(&self, was_repeated: bool) -> Option<Finding> {
        if self.repeatable == was_repeated {
            return None;
        }
        let change = if was_repeated {
            Change::Set(json!(true))
        } else {
            Change::Remove
        };
        Some(
            Finding::failure(
                NodePath::root().keys(["api_call", "repeatable"]),
                UpdateMode::ApiRequests,
                format!("repeatable: expected {}, got {}", self.repeatable, was_repeated),
                Some(change),
            )
            .values(json!(self.repeatable), json!(was_repeated)),
        )
    }

    /// Values captured by `extract_references`, in declared order.
    pub fn extract_references(&self, response: &HttpResponse) -> std::result::Result<Vec<(String, String)>, String> {
        let Some(expected) = &self.response else {
            return Ok(Vec::new());
        };
        if expected.extract_references.is_empty() {
            return Ok(Vec::new());
        }
        let body: Value = serde_json::from_slice(&response.body)
            .map_err(|e| format!("cannot extract references from a non-JSON response: {}", e))?;
        expected
            .extract_references
            .iter()
            .map(|(field, reference)| {
                let found = lookup_dotted(&body, field)
                    .filter(|v| !v.is_null())
                    .ok_or_else(|| format!("field '{}' not found in response", field))?;
                Ok((reference.clone(), scalar_string(found)))
            })
            .collect()
    }

    /// For a JSON operation response (`kind` ending in `#operation`) on a
    /// call with no `expect_response`: the operation name to track as the
    /// [`OPERATION_REFERENCE`] and the finding that declares its extraction.
    pub fn operation_extraction(&self, response: &HttpResponse) -> Option<(String, Finding)> {
        if self.response.is_some() {
            return None;
        }
        let body: Value = serde_json::from_slice(&response.body).ok()?;
        if !body.get("kind").and_then(Value::as_str)?.ends_with("#operation") {
            return None;
        }
        let name = body.get("name").and_then(Value::as_str).filter(|n| !n.is_empty())?;
        let declared = json!({
            "extract_references": [{"field": "name", "reference": OPERATION_REFERENCE}],
            "body": {"json": {}},
        });
        let finding = Finding::failure(
            NodePath::root().keys(["api_call", "expect_response"]),
            UpdateMode::ApiRequests,
            format!("operation {} has no reference extraction", name),
            Some(Change::Set(declared)),
        );
        Some((name.to_string(), finding))
    }

    // order[e] = index of the client part matched to batch expectation e.
    fn batch_order(&self, request: &HttpRequest, ctx: &MatchContext<'_>) -> Vec<usize> {
        let subs = self.request.batch.as_deref().unwrap_or(&[]);
        match batch::parse_request(request) {
            Ok(parts) => unordered_assignment(subs.len(), parts.len(), |e, a| subs[e].fits(&parts[a].request, ctx))
            .unwrap_or_else(|| (0..subs.len()).collect()),
            Err(_) => (0..subs.len()).collect(),
        }
    }

    /// Records an `api_call` for a request that had no event.
    pub fn synthesize(request: &HttpRequest, response: Option<&HttpResponse>) -> Value {
        let mut call = Map::new();
        let mut order = None;
        let expect_request = match batch::parse_request(request) {
            Ok(parts) => {
                let sorted = sorted_parts(&parts.iter().map(|p| &p.request).collect::<Vec<_>>());
                let subs = sorted.iter().map(|&i| record_request(&parts[i].request)).collect::<Vec<_>>();
                order = Some(sorted);
                json!({ "uri": request.uri, "method": request.method, "batch": subs })
            }
            Err(_) => record_request(request),
        };
        call.insert("expect_request".to_string(), expect_request);
        if let Some(response) = response {
            let pairing = order.as_deref().map(|o| (request, o));
            call.insert("return_response".to_string(), record_response(response, pairing));
        }
        json!({ "api_call": Value::Object(call) })
    }
}

impl RequestExpectation {
    fn parse(value: &Value, location: Location) -> Result<Self> {
        let map = value
            .as_object()
            .ok_or_else(|| ScenarioError::schema(location, "expect_request must be a mapping"))?;
        let uri = map
            .get("uri")
            .map(scalar_string)
            .ok_or_else(|| ScenarioError::schema(location, "expect_request needs a uri"))?;
        let batch = match map.get("batch") {
            Some(Value::Array(items)) => Some(
                items
                    .iter()
                    .map(|item| Self::parse(item, location))
                    .collect::<Result<Vec<_>>>()?,
            ),
            Some(Value::Null) | None => None,
            Some(_) => return Err(ScenarioError::schema(location, "batch must be a list of requests")),
        };
        Ok(Self {
            uri,
            method: map.get("method").map(scalar_string),
            headers: parse_headers(map.get("headers"), location)?,
            body: parse_body(map.get("body"), location)?,
            batch,
        })
    }

    // Advisory findings such as an undeclared body do not break a fit.
    fn fits(&self, request: &HttpRequest, ctx: &MatchContext<'_>) -> bool {
        self.check(request, &NodePath::root(), ctx)
            .iter()
            .all(|f| f.severity == Severity::Advisory)
    }

    fn check(&self, request: &HttpRequest, base: &NodePath, ctx: &MatchContext<'_>) -> Vec<Finding> {
        let mode = UpdateMode::ApiRequests;
        let mut findings = Vec::new();

        let expected_uri = canonical_uri(&ctx.refs.substitute(&self.uri));
        let actual_uri = canonical_uri(&request.uri);
        if expected_uri != actual_uri {
            findings.push(
                Finding::failure(
                    base.key("uri"),
                    mode,
                    format!("uri: expected {}, got {}", expected_uri, actual_uri),
                    Some(Change::Set(json!(request.uri))),
                )
                .values(json!(expected_uri), json!(actual_uri)),
            );
        }

        let expected_method = self.method.as_deref().unwrap_or("GET");
        if !expected_method.eq_ignore_ascii_case(&request.method) {
            findings.push(
                Finding::failure(
                    base.key("method"),
                    mode,
                    format!("method: expected {}, got {}", expected_method, request.method),
                    Some(Change::Set(json!(request.method))),
                )
                .values(json!(expected_method), json!(request.method)),
            );
        }

        findings.extend(check_headers(&self.headers, &request.headers, base, mode, ctx));

        match &self.batch {
            Some(subs) => findings.extend(check_batch(subs, request, base, ctx)),
            None => findings.extend(check_body(&self.body, &request.body, &base.key("body"), mode, ctx)),
        }
        findings
    }
}

fn check_batch(subs: &[RequestExpectation], request: &HttpRequest, base: &NodePath, ctx: &MatchContext<'_>) -> Vec<Finding> {
    let mode = UpdateMode::ApiRequests;
    let parts = match batch::parse_request(request) {
        Ok(parts) => parts,
        Err(e) => {
            return vec![Finding::failure(
                base.key("batch"),
                mode,
                format!("batch: {}", e),
                Some(Change::Remove),
            )];
        }
    };
    let fits = |e: usize, a: usize| subs[e].fits(&parts[a].request, ctx);
    if unordered_assignment(subs.len(), parts.len(), fits).is_some() {
        return Vec::new();
    }

    let requests: Vec<&HttpRequest> = parts.iter().map(|p| &p.request).collect();
    let observed: Vec<Value> = sorted_parts(&requests)
        .into_iter()
        .map(|i| record_request(requests[i]))
        .collect();
    let shown: Vec<String> = requests.iter().map(|r| r.to_string()).collect();
    vec![Finding::failure(
        base.key("batch"),
        mode,
        format!("batch: sub-requests [{}] do not match the declared batch", shown.join(", ")),
        Some(Change::Set(Value::Array(observed.clone()))),
    )
    .values(Value::Array(subs.iter().map(|s| json!(s.uri)).collect()), Value::Array(observed))]
}

// Indices of batch parts sorted by (method, uri), so recordings are stable.
fn sorted_parts(requests: &[&HttpRequest]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..requests.len()).collect();
    order.sort_by(|&a, &b| {
        (&requests[a].method, &requests[a].uri).cmp(&(&requests[b].method, &requests[b].uri))
    });
    order
}

fn parse_headers(value: Option<&Value>, location: Location) -> Result<Vec<(String, Value)>> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Object(map)) => map
            .iter()
            .map(|(name, declared)| Ok((name.clone(), validated(declared, location)?)))
            .collect(),
        Some(_) => Err(ScenarioError::schema(location, "headers must be a mapping")),
    }
}

fn parse_body(value: Option<&Value>, location: Location) -> Result<BodyExpectation> {
    match value {
        None => Ok(BodyExpectation::Unchecked),
        Some(Value::Null) => Ok(BodyExpectation::Empty),
        Some(Value::Object(map)) if map.is_empty() => Ok(BodyExpectation::Unchecked),
        Some(Value::Object(map)) => {
            if let Some(unknown) = map.keys().find(|k| *k != "text" && *k != "json") {
                return Err(ScenarioError::schema(
                    location,
                    format!("body supports 'text' and 'json', not '{}'", unknown),
                ));
            }
            let text = map.get("text").map(|t| validated(t, location)).transpose()?;
            Ok(BodyExpectation::Content {
                text,
                json: map.get("json").cloned(),
            })
        }
        Some(other) => Ok(BodyExpectation::Content {
            text: Some(validated(other, location)?),
            json: None,
        }),
    }
}

fn parse_extractions(value: Option<&Value>, location: Location) -> Result<Vec<(String, String)>> {
    let Some(Value::Array(items)) = value else {
        return Ok(Vec::new());
    };
    items
        .iter()
        .map(|item| {
            let field = item.get("field").map(scalar_string);
            let reference = item.get("reference").map(scalar_string);
            match (field, reference) {
                (Some(f), Some(r)) => Ok((f, r)),
                _ => Err(ScenarioError::schema(
                    location,
                    "extract_references entries need 'field' and 'reference'",
                )),
            }
        })
        .collect()
}

fn check_headers(
    declared: &[(String, Value)],
    actual: &[(String, String)],
    base: &NodePath,
    mode: UpdateMode,
    ctx: &MatchContext<'_>,
) -> Vec<Finding> {
    declared
        .iter()
        .filter_map(|(name, matcher)| {
            let found = actual
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map_or(Value::Null, |(_, v)| Value::String(v.clone()));
            check_value(matcher, &found, base.keys(["headers", name.as_str()]), mode, ctx)
        })
        .collect()
}

fn check_body(
    expected: &BodyExpectation,
    actual: &[u8],
    field: &NodePath,
    mode: UpdateMode,
    ctx: &MatchContext<'_>,
) -> Vec<Finding> {
    let text = String::from_utf8_lossy(actual).into_owned();
    let parsed = serde_json::from_slice::<Value>(actual).ok();

    match expected {
        BodyExpectation::Unchecked if actual.is_empty() => Vec::new(),
        BodyExpectation::Unchecked => vec![Finding::advisory(
            field.clone(),
            mode,
            "body recorded",
            record_body(actual),
        )],
        BodyExpectation::Empty if actual.is_empty() => Vec::new(),
        BodyExpectation::Empty => vec![Finding::failure(
            field.clone(),
            mode,
            format!("{}: expected no body, got {} bytes", field, actual.len()),
            Some(Change::Set(record_body(actual))),
        )
        .values(Value::Null, json!(text))],
        BodyExpectation::Content { text: matcher, json } => {
            let mut findings = Vec::new();
            if let Some(declared) = matcher {
                findings.extend(check_value(declared, &json!(text), field.key("text"), mode, ctx));
            }
            match (json, &parsed) {
                (None, _) => {}
                (Some(Value::Null), None) => {}
                (Some(Value::Null), Some(found)) => findings.push(
                    Finding::failure(
                        field.key("json"),
                        mode,
                        format!("{}: expected a non-JSON body", field),
                        Some(Change::Set(found.clone())),
                    )
                    .values(Value::Null, found.clone()),
                ),
                (Some(declared), None) => findings.push(
                    Finding::failure(
                        field.clone(),
                        mode,
                        format!("{}: expected a JSON body, got {}", field, text),
                        Some(Change::Set(record_body(actual))),
                    )
                    .values(declared.clone(), json!(text)),
                ),
                (Some(declared), Some(found)) => {
                    findings.extend(check_json(declared, found, &field.key("json"), mode, ctx));
                }
            }
            findings
        }
    }
}

// One finding per differing top-level key; each proposes the whole merged
// subset so the rewrite is the same whichever finding applies it.
fn check_json(declared: &Value, found: &Value, field: &NodePath, mode: UpdateMode, ctx: &MatchContext<'_>) -> Vec<Finding> {
    let expected = ctx.refs.substitute_value(declared);
    let merged = merge_subset(declared, found);
    let differing: Vec<(String, Value, Value)> = match (&expected, found) {
        (Value::Object(e), Value::Object(a)) => e
            .iter()
            .filter_map(|(key, value)| {
                let actual = a.get(key).cloned().unwrap_or(Value::Null);
                let path = json_subset(value, &actual, ctx.options).err()?;
                let label = if path == "(root)" { key.clone() } else { format!("{}.{}", key, path) };
                Some((label, value.clone(), actual))
            })
            .collect(),
        _ => match json_subset(&expected, found, ctx.options) {
            Ok(()) => Vec::new(),
            Err(path) => vec![(path, expected.clone(), found.clone())],
        },
    };
    differing
        .into_iter()
        .map(|(label, e, a)| {
            Finding::failure(
                field.clone(),
                mode,
                format!("{}.{}: expected {}, got {}", field, label, e, a),
                Some(Change::Set(merged.clone())),
            )
            .values(e, a)
        })
        .collect()
}

fn record_request(request: &HttpRequest) -> Value {
    let mut out = Map::new();
    out.insert("uri".to_string(), json!(request.uri));
    out.insert("method".to_string(), json!(request.method));
    if !request.body.is_empty() {
        out.insert("body".to_string(), record_body(&request.body));
    }
    Value::Object(out)
}

fn record_body(body: &[u8]) -> Value {
    match serde_json::from_slice::<Value>(body) {
        Ok(parsed) if parsed.is_object() || parsed.is_array() => json!({ "json": parsed }),
        _ => json!({ "text": String::from_utf8_lossy(body) }),
    }
}

fn record_payload(body: &[u8]) -> Value {
    match serde_json::from_slice::<Value>(body) {
        Ok(parsed) if parsed.is_object() || parsed.is_array() => parsed,
        _ => Value::String(String::from_utf8_lossy(body).into_owned()),
    }
}

fn record_headers(response: &HttpResponse) -> Value {
    let mut headers: Vec<(String, String)> = response
        .headers
        .iter()
        .filter(|(name, _)| {
            let lower = name.to_ascii_lowercase();
            !VOLATILE_HEADERS.iter().any(|v| lower.starts_with(v))
        })
        .map(|(name, value)| (name.to_ascii_lowercase(), value.clone()))
        .collect();
    headers.sort();
    let mut out = Map::new();
    out.insert("status".to_string(), json!(response.status));
    for (name, value) in headers {
        out.insert(name, json!(value));
    }
    Value::Object(out)
}

// `pairing` is the batch request and, per recorded sub-request, the index of
// the client part it stands for.
fn record_response(response: &HttpResponse, pairing: Option<(&HttpRequest, &[usize])>) -> Value {
    if let (Some((request, order)), Ok(parts)) = (pairing, batch::parse_response(response)) {
        let requests = batch::parse_request(request).unwrap_or_default();
        let recorded: Vec<Value> = order
            .iter()
            .map(|&a| {
                let id = requests.get(a).and_then(|r| r.content_id.as_deref());
                let part = parts
                    .iter()
                    .find(|p| id.is_some() && p.content_id.as_deref() == id)
                    .or_else(|| parts.get(a));
                match part {
                    Some(p) => json!({ "headers": record_headers(&p.response), "body": record_payload(&p.response.body) }),
                    None => Value::Null,
                }
            })
            .collect();
        return json!({ "headers": { "status": response.status }, "batch": recorded });
    }
    json!({ "headers": record_headers(response), "body": record_payload(&response.body) })
}

/// A `return_response` ready to be served.
#[derive(Debug, Clone, PartialEq)]
struct ResponseStub {
    status: u16,
    headers: Vec<(String, String)>,
    body: Value,
    batch: Option<Vec<ResponseStub>>,
}

impl ResponseStub {
    fn parse(value: &Value) -> std::result::Result<Self, String> {
        let map = value
            .as_object()
            .ok_or_else(|| "return_response must be a mapping".to_string())?;
        let mut status = 200;
        let mut headers = Vec::new();
        if let Some(declared) = map.get("headers").and_then(Value::as_object) {
            for (name, value) in declared {
                if name.eq_ignore_ascii_case("status") {
                    status = scalar_string(value)
                        .trim()
                        .parse()
                        .map_err(|_| format!("invalid response status '{}'", value))?;
                } else {
                    headers.push((name.clone(), scalar_string(value)));
                }
            }
        }
        let batch = match map.get("batch") {
            Some(Value::Array(items)) => Some(items.iter().map(Self::parse).collect::<std::result::Result<Vec<_>, _>>()?),
            _ => None,
        };
        Ok(Self {
            status,
            headers,
            body: map.get("body").cloned().unwrap_or(Value::Null),
            batch,
        })
    }

    fn to_response(&self) -> HttpResponse {
        let body = match &self.body {
            Value::Null => Vec::new(),
            Value::String(s) => s.as_bytes().to_vec(),
            other => other.to_string().into_bytes(),
        };
        let mut response = HttpResponse::new(self.status, body);
        response.headers = self.headers.clone();
        response
    }
}

fn lookup_dotted<'v>(value: &'v Value, field: &str) -> Option<&'v Value> {
    field.split('.').try_fold(value, |current, part| match current {
        Value::Array(items) => items.get(part.parse::<usize>().ok()?),
        other => other.get(part),
    })
}

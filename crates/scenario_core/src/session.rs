//! One command invocation: the ambient context the command runs in, and the
//! routing of everything it does to the action's events.
//!
//! A [`Session`] is created per `execute_command` action and consumed by
//! [`Session::finish`]. It implements [`Ambient`] and [`Transport`], so the
//! command's output, prompts, file writes and HTTP calls all land here and
//! are matched against the declared events in order.

use crate::assertions::MatchOptions;
use crate::capture::{display_path, sandboxed_path, Ambient, FileContents, LogLevel, UxElement};
use crate::error::Result;
use crate::events::{
    default_reply, synthesize, ApiCallExpectation, Change, DeclaredEvent, Event, EventKind, Finding, MatchContext,
    MatchOutcome, Observation, OPERATION_REFERENCE,
};
use crate::failures::{Failure, FailureCollector, FailureKind, Proposal};
use crate::http::{HttpRequest, HttpResponse, Transport, TransportError};
use crate::references::ReferenceTable;
use crate::updates::{Update, UpdateMode, UpdateModes};
use crate::yaml::NodePath;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::Path;
use tracing::{debug, error, info, warn};

/// Where HTTP responses come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// Recorded responses are played back
    #[default]
    Local,
    /// Requests go to a real upstream and its responses are recorded
    Remote,
}

/// Knobs shared by every session of a run.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Literal comparison options
    pub matching: MatchOptions,
    /// Unmatched HTTP traffic is a failure
    pub strict_http: bool,
    /// Status of minted stand-in responses
    pub default_status: u16,
    /// Local playback or remote recording
    pub mode: ExecutionMode,
    /// Value of [`Ambient::now`]
    pub now: u64,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            matching: MatchOptions::default(),
            strict_http: true,
            default_status: 200,
            mode: ExecutionMode::Local,
            now: 1_500_000_000,
        }
    }
}

/// Run-wide state a session borrows.
pub struct SessionEnv<'a> {
    /// References defined so far
    pub refs: &'a mut ReferenceTable,
    /// Properties set by `set_property`
    pub properties: &'a BTreeMap<String, String>,
    /// Directory the command may write to
    pub sandbox: &'a Path,
    /// Real transport for remote mode
    pub upstream: Option<&'a mut dyn Transport>,
    /// Shared options
    pub options: &'a SessionOptions,
    /// Enabled update modes
    pub modes: UpdateModes,
    /// Release track being run
    pub track: Option<String>,
}

/// What a finished session hands back.
#[derive(Debug, Default)]
pub struct SessionOutcome {
    /// Failures in observation order
    pub failures: Vec<Failure>,
    /// Rewrites authorized by the enabled modes
    pub updates: Vec<Update>,
    /// Everything the command wrote to stdout
    pub stdout: String,
    /// Everything the command wrote to stderr
    pub stderr: String,
    /// Exit code, `None` after a crash
    pub exit_code: Option<i32>,
}

// The api_call absorbing consecutive equivalent requests.
struct Repeat {
    slot: usize,
    request: HttpRequest,
    response_body: Vec<u8>,
    repeated: bool,
}

/// The per-action session.
pub struct Session<'a> {
    action_index: usize,
    events_path: NodePath,
    queue: Vec<DeclaredEvent>,
    declared: usize,
    cursor: usize,
    env: SessionEnv<'a>,

    stdout: String,
    stderr: String,
    stdout_log: String,
    stderr_log: String,
    stdin: VecDeque<String>,
    reply: Option<String>,
    repeat: Option<Repeat>,
    exit_code: Option<i32>,
    crashed: bool,

    failures: FailureCollector,
    updates: Vec<Update>,
}

impl<'a> Session<'a> {
    /// Creates a session for the action at `action_index` whose events list
    /// lives at `events_path`. `stdin` lines are read before any event is
    /// consulted.
    pub fn new(
        action_index: usize,
        events_path: NodePath,
        events: Vec<DeclaredEvent>,
        stdin: Vec<String>,
        env: SessionEnv<'a>,
    ) -> Self {
        let declared = events.iter().map(|e| e.index + 1).max().unwrap_or(0);
        Self {
            action_index,
            events_path,
            queue: events,
            declared,
            cursor: 0,
            env,
            stdout: String::new(),
            stderr: String::new(),
            stdout_log: String::new(),
            stderr_log: String::new(),
            stdin: stdin.into(),
            reply: None,
            repeat: None,
            exit_code: None,
            crashed: false,
            failures: FailureCollector::new(),
            updates: Vec::new(),
        }
    }

    /// Records the command's exit.
    pub fn exit(&mut self, code: i32, message: Option<String>) {
        self.flush();
        self.end_repeat();
        debug!(action = self.action_index, code, "Command exited");

        let observation = Observation::Exit { code, message };
        let declared_exit = (self.cursor..self.queue.len()).find(|&i| self.queue[i].event.kind() == EventKind::Exit);
        match declared_exit {
            Some(at) => {
                for skipped in self.cursor..at {
                    self.extra(skipped);
                }
                self.cursor = at + 1;
                let outcome = self.check(at, &observation);
                self.settle(Some(at), &outcome);
            }
            None if code != 0 => self.record_missing(&observation, None),
            None => {}
        }
        self.exit_code = Some(code);
    }

    /// Records that the command panicked.
    pub fn crash(&mut self, message: impl Into<String>) {
        self.flush();
        let message = message.into();
        error!(action = self.action_index, message = %message, "Command crashed");
        let failure = Failure::new(FailureKind::CommandCrash, self.action_index, message);
        self.push_failure(failure);
        self.crashed = true;
    }

    /// Closes the session: flushes output and reports unconsumed events.
    pub fn finish(mut self) -> SessionOutcome {
        self.flush();
        self.end_repeat();
        if !self.crashed {
            for slot in self.cursor..self.queue.len() {
                self.extra(slot);
            }
        }
        SessionOutcome {
            failures: self.failures.into_vec(),
            updates: self.updates,
            stdout: self.stdout_log,
            stderr: self.stderr_log,
            exit_code: self.exit_code,
        }
    }

    fn ctx(&self) -> MatchContext<'_> {
        MatchContext {
            refs: &*self.env.refs,
            options: self.env.options.matching,
        }
    }

    fn check(&self, slot: usize, observation: &Observation) -> MatchOutcome {
        self.queue[slot].event.check(observation, &self.ctx())
    }

    fn api_call(&self, slot: usize) -> Option<ApiCallExpectation> {
        match &self.queue[slot].event {
            Event::ApiCall(call) => Some((**call).clone()),
            _ => None,
        }
    }

    // ===== Event routing =====

    // Consumes the current event when it has the observed kind.
    fn take(&mut self, kind: EventKind) -> Option<usize> {
        // Repeatable calls ahead of the cursor may match zero times.
        let slot = (self.cursor..self.queue.len()).find(|&s| self.queue[s].event.consumes_observation())?;
        if self.queue[slot].event.kind() != kind {
            return None;
        }
        self.cursor = slot + 1;
        Some(slot)
    }

    // Like `take` for requests, skipping repeatable calls that do not accept
    // the request.
    fn take_api_call(&mut self, request: &HttpRequest) -> Option<usize> {
        loop {
            let slot = self.cursor;
            let Event::ApiCall(call) = &self.queue.get(slot)?.event else {
                return None;
            };
            if call.repeatable && !call.accepts(request, &self.ctx()) {
                debug!(event = self.queue[slot].index, "Skipping repeatable api_call");
                self.cursor += 1;
                continue;
            }
            self.cursor += 1;
            return Some(slot);
        }
    }

    // Handles a non-HTTP observation end to end.
    fn observe(&mut self, observation: Observation) {
        self.end_repeat();
        match self.take(observation.kind()) {
            Some(slot) => {
                let outcome = self.check(slot, &observation);
                self.settle(Some(slot), &outcome);
            }
            None => self.record_missing(&observation, None),
        }
    }

    // Turns an outcome into rewrites and failures.
    fn settle(&mut self, slot: Option<usize>, outcome: &MatchOutcome) {
        self.settle_findings(slot, outcome.findings());
    }

    fn settle_findings(&mut self, slot: Option<usize>, findings: &[Finding]) {
        let Some(slot) = slot else { return };
        let declared = &self.queue[slot];
        let base = self.events_path.index(declared.index);
        let (index, location) = (declared.index, declared.location);
        let modes = self.env.modes;

        for finding in findings {
            if finding.applies(modes) {
                let path = base.join(&finding.field);
                let update = match &finding.change {
                    Some(Change::Set(value)) => Update::set(path, self.env.refs.reverse_value(value), finding.mode),
                    _ => Update::remove(path, finding.mode),
                };
                self.updates.push(update);
            } else if finding.fails(modes) {
                let failure = Failure::from_finding(FailureKind::AssertionFailure, self.action_index, &base, finding)
                    .at_event(Some(index), Some(location));
                self.push_failure(failure);
            }
        }
    }

    // An observation arrived with no event for it: record one at the
    // current position.
    fn record_missing(&mut self, observation: &Observation, response: Option<&HttpResponse>) {
        let kind = observation.kind();
        let mode = kind.update_mode();
        let value = self.env.refs.reverse_value(&synthesize(observation, response));
        let index = self.queue.get(self.cursor).map_or(self.declared, |e| e.index);

        if self.env.modes.contains(mode) {
            info!(action = self.action_index, event = %kind, at = index, "Recording missing event");
            self.updates.push(Update::insert(self.events_path.clone(), index, value, mode));
            return;
        }

        let (failure_kind, summary) = match observation {
            Observation::ApiRequest(request) => {
                if !self.env.options.strict_http {
                    warn!(request = %request, "Tolerating unmatched request");
                    return;
                }
                (FailureKind::UnmatchedTraffic, format!("unexpected request: {}", request))
            }
            other => (FailureKind::AssertionFailure, format!("unexpected {}", describe(other))),
        };
        let mut failure = Failure::new(failure_kind, self.action_index, summary);
        failure.actual = value.clone();
        failure.proposal = Some(Proposal {
            mode,
            path: self.events_path.index(index),
            change: Change::Set(value),
        });
        self.push_failure(failure);
    }

    // A declared event that was never observed.
    fn extra(&mut self, slot: usize) {
        let declared = &self.queue[slot];
        if let Event::ApiCall(call) = &declared.event {
            if call.repeatable {
                return;
            }
        }
        let kind = declared.event.kind();
        let mode = kind.update_mode();
        let path = self.events_path.index(declared.index);
        let (index, location) = (declared.index, declared.location);
        let summary = format!("{} was never observed", declared.event.key());

        if self.env.modes.contains(mode) {
            info!(action = self.action_index, event = index, "Removing unobserved event");
            self.updates.push(Update::remove(path, mode));
            return;
        }
        let mut failure = Failure::new(FailureKind::MissingEvent, self.action_index, summary)
            .at_event(Some(index), Some(location));
        failure.proposal = Some(Proposal {
            mode,
            path,
            change: Change::Remove,
        });
        self.push_failure(failure);
    }

    fn push_failure(&mut self, failure: Failure) {
        let failure = match &self.env.track {
            Some(track) => failure.on_track(track.clone()),
            None => failure,
        };
        self.failures.push(failure);
    }

    // ===== Streams =====

    fn flush(&mut self) {
        self.flush_stdout();
        self.flush_stderr();
    }

    fn flush_stdout(&mut self) {
        if self.stdout.is_empty() {
            return;
        }
        let text = std::mem::take(&mut self.stdout);
        self.observe(Observation::Stdout(text));
    }

    fn flush_stderr(&mut self) {
        if self.stderr.is_empty() {
            return;
        }
        let text = std::mem::take(&mut self.stderr);
        self.observe(Observation::Stderr(text));
    }

    fn handle_ux(&mut self, element: UxElement, data: Map<String, Value>) {
        self.flush();
        let observation = Observation::Ux { element, data };
        self.end_repeat();
        let reply = match self.take(observation.kind()) {
            Some(slot) => {
                let outcome = self.check(slot, &observation);
                self.settle(Some(slot), &outcome);
                match &self.queue[slot].event {
                    Event::Ux(ux) => ux.reply(),
                    _ => default_reply(element).to_string(),
                }
            }
            None => {
                self.record_missing(&observation, None);
                default_reply(element).to_string()
            }
        };
        if element.takes_input() {
            self.reply = Some(reply);
        }
    }

    // ===== HTTP =====

    fn round_trip_local(&mut self, request: HttpRequest) -> std::result::Result<HttpResponse, TransportError> {
        if let Some(slot) = self.repeat.as_ref().map(|r| r.slot) {
            if let Some(call) = self.api_call(slot).filter(|c| c.accepts(&request, &self.ctx())) {
                debug!(request = %request, "Reusing repeatable api_call");
                let (response, _) = call.respond(&request, &self.ctx(), self.env.options.default_status);
                self.after_response(slot, &call, &response);
                return Ok(response);
            }
        }
        self.repeat = None;

        let observation = Observation::ApiRequest(request.clone());
        let Some(slot) = self.take_api_call(&request) else {
            let minted = HttpResponse::new(self.env.options.default_status, Vec::new());
            let recorded = self.env.modes.contains(UpdateMode::ApiResponses).then_some(&minted);
            self.record_missing(&observation, recorded);
            return Ok(minted);
        };
        let Some(call) = self.api_call(slot) else {
            return Err(TransportError::Unmatched(request.to_string()));
        };

        let outcome = self.check(slot, &observation);
        self.settle(Some(slot), &outcome);
        let (response, missing) = call.respond(&request, &self.ctx(), self.env.options.default_status);
        if let Some(finding) = missing {
            self.settle_findings(Some(slot), &[finding]);
        }
        self.after_response(slot, &call, &response);
        if call.repeatable {
            self.repeat = Some(Repeat {
                slot,
                request,
                response_body: response.body.clone(),
                repeated: false,
            });
        }
        Ok(response)
    }

    fn round_trip_remote(&mut self, request: HttpRequest) -> std::result::Result<HttpResponse, TransportError> {
        let upstream = self
            .env
            .upstream
            .as_deref_mut()
            .ok_or_else(|| TransportError::Upstream("no upstream transport configured".to_string()))?;
        let response = upstream.round_trip(request.clone())?;

        if let Some(repeat) = self.repeat.as_mut() {
            if same_call(repeat, &request, &response) {
                repeat.repeated = true;
                let slot = repeat.slot;
                debug!(request = %request, "Reusing api_call for identical request");
                if let Some(call) = self.api_call(slot) {
                    self.after_response(slot, &call, &response);
                }
                return Ok(response);
            }
        }
        self.end_repeat();

        let observation = Observation::ApiRequest(request.clone());
        let Some(slot) = self.take_api_call(&request) else {
            self.record_missing(&observation, Some(&response));
            return Ok(response);
        };
        let Some(call) = self.api_call(slot) else {
            return Ok(response);
        };

        let outcome = self.check(slot, &observation);
        self.settle(Some(slot), &outcome);
        if self.env.modes.contains(UpdateMode::ResponsePayloads) {
            let recorded = call.record_real_response(&request, &response, &self.ctx());
            self.settle_findings(Some(slot), &recorded.into_iter().collect::<Vec<_>>());
        }
        self.after_response(slot, &call, &response);
        self.repeat = Some(Repeat {
            slot,
            request,
            response_body: response.body.clone(),
            repeated: false,
        });
        Ok(response)
    }

    // Response-side checks and reference extraction.
    fn after_response(&mut self, slot: usize, call: &ApiCallExpectation, response: &HttpResponse) {
        let findings = call.check_response(response, &self.ctx());
        self.settle_findings(Some(slot), &findings);

        // The first operation of the scenario is tracked by name.
        if self.env.refs.get(OPERATION_REFERENCE).is_none() {
            if let Some((name, finding)) = call.operation_extraction(response) {
                self.settle_findings(Some(slot), &[finding]);
                if let Err(e) = self.env.refs.define(OPERATION_REFERENCE, name) {
                    warn!(error = %e, "Cannot track operation");
                }
            }
        }

        let extracted = match call.extract_references(response) {
            Ok(pairs) => pairs,
            Err(message) => {
                let failure = Failure::new(FailureKind::AssertionFailure, self.action_index, message)
                    .at_event(Some(self.queue[slot].index), Some(self.queue[slot].location));
                self.push_failure(failure);
                return;
            }
        };
        for (name, value) in extracted {
            if let Err(e) = self.env.refs.define(&name, value) {
                let failure = Failure::new(FailureKind::AssertionFailure, self.action_index, e.to_string())
                    .at_event(Some(self.queue[slot].index), Some(self.queue[slot].location));
                self.push_failure(failure);
            }
        }
    }

    // Ends a run of repetitions. Remote runs assert the `repeatable` flag.
    fn end_repeat(&mut self) {
        let Some(repeat) = self.repeat.take() else {
            return;
        };
        if self.env.options.mode != ExecutionMode::Remote {
            return;
        }
        if let Some(call) = self.api_call(repeat.slot) {
            let finding = call.check_repeatable(repeat.repeated);
            self.settle_findings(Some(repeat.slot), &finding.into_iter().collect::<Vec<_>>());
        }
    }
}

fn same_call(repeat: &Repeat, request: &HttpRequest, response: &HttpResponse) -> bool {
    repeat.request.uri == request.uri
        && repeat.request.method == request.method
        && repeat.request.body == request.body
        && repeat.response_body == response.body
}

fn describe(observation: &Observation) -> String {
    match observation {
        Observation::Stdout(text) => format!("stdout {:?}", text),
        Observation::Stderr(text) => format!("stderr {:?}", text),
        Observation::Exit { code, .. } => format!("exit code {}", code),
        Observation::UserInput => "read of user input".to_string(),
        Observation::Ux { element, .. } => format!("{} element", element),
        Observation::FileWritten { path, .. } => format!("write of file {}", path),
        Observation::ApiRequest(request) => format!("request {}", request),
    }
}

impl Transport for Session<'_> {
    fn round_trip(&mut self, request: HttpRequest) -> std::result::Result<HttpResponse, TransportError> {
        self.flush();
        debug!(request = %request, "Intercepted request");
        match self.env.options.mode {
            ExecutionMode::Local => self.round_trip_local(request),
            ExecutionMode::Remote => self.round_trip_remote(request),
        }
    }
}

impl Ambient for Session<'_> {
    fn write_stdout(&mut self, text: &str) {
        self.flush_stderr();
        self.stdout.push_str(text);
        self.stdout_log.push_str(text);
    }

    fn write_stderr(&mut self, text: &str) {
        self.stderr_log.push_str(text);
        if let Some((element, data)) = parse_ux(text) {
            self.handle_ux(element, data);
            return;
        }
        self.flush_stdout();
        self.stderr.push_str(text);
    }

    fn log(&mut self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => debug!(target: "command", "{}", message),
            LogLevel::Info => info!(target: "command", "{}", message),
            LogLevel::Warning => {
                warn!(target: "command", "{}", message);
                self.write_stderr(&format!("WARNING: {}\n", message));
            }
            LogLevel::Error => {
                error!(target: "command", "{}", message);
                self.write_stderr(&format!("ERROR: {}\n", message));
            }
        }
    }

    fn read_line(&mut self) -> Option<String> {
        if let Some(reply) = self.reply.take() {
            return Some(reply);
        }
        if let Some(line) = self.stdin.pop_front() {
            return Some(line);
        }

        self.flush();
        self.end_repeat();
        let observation = Observation::UserInput;
        match self.take(EventKind::UserInput) {
            Some(slot) => {
                let outcome = self.check(slot, &observation);
                self.settle(Some(slot), &outcome);
                if let Event::UserInput(lines) = &self.queue[slot].event {
                    self.stdin.extend(lines.iter().cloned());
                }
            }
            None => self.record_missing(&observation, None),
        }
        if self.stdin.is_empty() && self.env.modes.contains(UpdateMode::Ux) {
            self.stdin.push_back(String::new());
        }
        self.stdin.pop_front()
    }

    fn write_file(&mut self, path: &Path, contents: FileContents, private: bool) -> Result<()> {
        let target = sandboxed_path(self.env.sandbox, path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, contents.as_bytes())?;
        self.flush();
        self.observe(Observation::FileWritten {
            path: display_path(self.env.sandbox, &target),
            contents,
            private,
        });
        Ok(())
    }

    fn working_dir(&self) -> &Path {
        self.env.sandbox
    }

    fn property(&self, name: &str) -> Option<String> {
        self.env.properties.get(name).cloned()
    }

    fn properties(&self) -> BTreeMap<String, String> {
        self.env.properties.clone()
    }

    fn transport(&mut self) -> &mut dyn Transport {
        self
    }

    fn now(&self) -> u64 {
        self.env.options.now
    }
}

// Structured UX lines are single JSON objects with a known "ux" name.
fn parse_ux(text: &str) -> Option<(UxElement, Map<String, Value>)> {
    let trimmed = text.trim();
    if !trimmed.starts_with("{\"ux\"") {
        return None;
    }
    let mut data = match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) => map,
        _ => {
            warn!(text = trimmed, "Undecodable UX element on stderr");
            return None;
        }
    };
    let element = data.get("ux").and_then(Value::as_str).and_then(UxElement::from_name)?;
    data.remove("ux");
    Some((element, data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::parse_events;
    use crate::updates::UpdateOp;
    use crate::yaml::parse;
    use serde_json::json;
    use tempfile::TempDir;

    struct Fixture {
        refs: ReferenceTable,
        properties: BTreeMap<String, String>,
        options: SessionOptions,
        dir: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                refs: ReferenceTable::new(),
                properties: BTreeMap::new(),
                options: SessionOptions::default(),
                dir: TempDir::new().unwrap(),
            }
        }

        fn session(&mut self, events_yaml: &str, modes: UpdateModes) -> Session<'_> {
            let root = parse(events_yaml).unwrap();
            let events = parse_events(Some(&root)).unwrap();
            Session::new(
                0,
                NodePath::root().key("events"),
                events,
                Vec::new(),
                SessionEnv {
                    refs: &mut self.refs,
                    properties: &self.properties,
                    sandbox: self.dir.path(),
                    upstream: None,
                    options: &self.options,
                    modes,
                    track: None,
                },
            )
        }
    }

    #[test]
    fn test_matching_sequence_passes() {
        let mut fx = Fixture::new();
        let mut session = fx.session(
            "- expect_stdout: \"hello\\n\"\n- expect_stderr: \"WARNING: careful\\n\"\n- expect_exit_code: 0\n",
            UpdateModes::none(),
        );
        session.write_stdout("hel");
        session.write_stdout("lo\n");
        session.log(LogLevel::Warning, "careful");
        session.exit(0, None);
        let outcome = session.finish();
        assert!(outcome.failures.is_empty(), "{:?}", outcome.failures);
        assert!(outcome.updates.is_empty());
        assert_eq!(outcome.stdout, "hello\n");
    }

    #[test]
    fn test_swapped_events_fail() {
        let mut fx = Fixture::new();
        let mut session = fx.session("- expect_stderr: b\n- expect_stdout: a\n", UpdateModes::none());
        session.write_stdout("a");
        session.write_stderr("b");
        session.exit(0, None);
        let outcome = session.finish();
        assert!(!outcome.failures.is_empty());
        assert!(outcome
            .failures
            .iter()
            .any(|f| f.kind == FailureKind::AssertionFailure && f.summary.contains("unexpected stdout")));
    }

    #[test]
    fn test_nonzero_exit_without_event_fails() {
        let mut fx = Fixture::new();
        let mut session = fx.session("[]", UpdateModes::none());
        session.exit(3, None);
        let outcome = session.finish();
        assert_eq!(outcome.failures.len(), 1);
        assert!(outcome.failures[0].summary.contains("exit code 3"));
    }

    #[test]
    fn test_exit_skips_to_declared_exit_and_updates() {
        let mut fx = Fixture::new();
        let modes = UpdateModes::none().with(UpdateMode::Result).with(UpdateMode::Ux);
        let mut session = fx.session("- expect_stdout: never\n- expect_exit_code: 0\n", modes);
        session.exit(2, None);
        let outcome = session.finish();
        assert!(outcome.failures.is_empty());
        assert_eq!(
            outcome.updates,
            vec![
                Update::remove(NodePath::root().key("events").index(0), UpdateMode::Ux),
                Update::set(
                    NodePath::root().key("events").index(1).key("expect_exit_code"),
                    json!(2),
                    UpdateMode::Result
                ),
            ]
        );
    }

    #[test]
    fn test_prompt_reply_is_fed_back() {
        let mut fx = Fixture::new();
        let mut session = fx.session(
            "- expect_prompt_continue:\n    message: Proceed?\n    user_input: n\n",
            UpdateModes::none(),
        );
        assert!(!session.prompt_continue("Proceed?"));
        session.exit(0, None);
        assert!(session.finish().failures.is_empty());
    }

    #[test]
    fn test_missing_prompt_is_recorded_with_default_reply() {
        let mut fx = Fixture::new();
        let mut session = fx.session("[]", UpdateModes::none().with(UpdateMode::Ux));
        assert!(session.prompt_continue("Proceed?"));
        session.exit(0, None);
        let outcome = session.finish();
        let UpdateOp::Insert { index, value, .. } = &outcome.updates[0].op else {
            panic!("expected an insertion");
        };
        assert_eq!(*index, 0);
        assert_eq!(value["expect_prompt_continue"]["user_input"], json!("y"));
    }

    #[test]
    fn test_user_input_lines_are_queued() {
        let mut fx = Fixture::new();
        let mut session = fx.session("- user_input:\n    - first\n    - second\n", UpdateModes::none());
        assert_eq!(session.read_line().as_deref(), Some("first"));
        assert_eq!(session.read_line().as_deref(), Some("second"));
        session.exit(0, None);
        assert!(session.finish().failures.is_empty());
    }

    #[test]
    fn test_file_write_is_sandboxed_and_observed() {
        let mut fx = Fixture::new();
        let mut session = fx.session(
            "- expect_file_written:\n    path: out/a.txt\n    contents: hi\n",
            UpdateModes::none(),
        );
        session
            .write_file(Path::new("out/a.txt"), FileContents::Text("hi".into()), false)
            .unwrap();
        assert!(session
            .write_file(Path::new("../escape.txt"), FileContents::Text("x".into()), false)
            .is_err());
        session.exit(0, None);
        assert!(session.finish().failures.is_empty());
        assert_eq!(fs::read_to_string(fx.dir.path().join("out/a.txt")).unwrap(), "hi");
    }

    #[test]
    fn test_unmatched_request_is_unmatched_traffic() {
        let mut fx = Fixture::new();
        let mut session = fx.session(
            "- api_call:\n    expect_request:\n      uri: /a\n    return_response:\n      body: {ok: true}\n",
            UpdateModes::none(),
        );
        let first = session.transport().round_trip(HttpRequest::new("GET", "/a")).unwrap();
        assert_eq!(first.body_text(), Some(r#"{"ok":true}"#));
        session.transport().round_trip(HttpRequest::new("GET", "/b")).unwrap();
        session.exit(0, None);
        let outcome = session.finish();
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].kind, FailureKind::UnmatchedTraffic);
        assert!(outcome.failures[0].summary.contains("GET /b"));
    }

    #[test]
    fn test_repeatable_call_absorbs_consecutive_requests() {
        let mut fx = Fixture::new();
        let mut session = fx.session(
            concat!(
                "- api_call:\n",
                "    expect_request:\n",
                "      uri: /op\n",
                "    return_response:\n",
                "      body: {done: false}\n",
                "    repeatable: true\n",
                "- api_call:\n",
                "    expect_request:\n",
                "      uri: /result\n",
                "    return_response:\n",
                "      body: {name: x}\n",
            ),
            UpdateModes::none(),
        );
        for _ in 0..3 {
            session.transport().round_trip(HttpRequest::new("GET", "/op")).unwrap();
        }
        session.transport().round_trip(HttpRequest::new("GET", "/result")).unwrap();
        session.exit(0, None);
        assert!(session.finish().failures.is_empty());
    }

    #[test]
    fn test_unused_repeatable_call_is_skipped() {
        let mut fx = Fixture::new();
        let mut session = fx.session(
            concat!(
                "- api_call:\n",
                "    expect_request:\n",
                "      uri: /op\n",
                "    repeatable: true\n",
                "    optional: true\n",
                "- api_call:\n",
                "    expect_request:\n",
                "      uri: /result\n",
                "    return_response:\n",
                "      body: {name: x}\n",
            ),
            UpdateModes::none(),
        );
        session.transport().round_trip(HttpRequest::new("GET", "/result")).unwrap();
        session.exit(0, None);
        assert!(session.finish().failures.is_empty());
    }

    #[test]
    fn test_unused_repeatable_call_before_output() {
        let mut fx = Fixture::new();
        let mut session = fx.session(
            concat!(
                "- api_call:\n",
                "    expect_request:\n",
                "      uri: /op\n",
                "    repeatable: true\n",
                "- expect_stdout: done\n",
            ),
            UpdateModes::none(),
        );
        session.write_stdout("done");
        session.exit(0, None);
        assert!(session.finish().failures.is_empty());
    }

    #[test]
    fn test_extracted_reference_is_defined() {
        let mut fx = Fixture::new();
        {
            let mut session = fx.session(
                concat!(
                    "- api_call:\n",
                    "    expect_request:\n",
                    "      uri: /create\n",
                    "      method: POST\n",
                    "    expect_response:\n",
                    "      extract_references:\n",
                    "        - field: name\n",
                    "          reference: op\n",
                    "    return_response:\n",
                    "      body: {name: operations/123}\n",
                ),
                UpdateModes::none(),
            );
            session.transport().round_trip(HttpRequest::new("POST", "/create")).unwrap();
            session.exit(0, None);
            assert!(session.finish().failures.is_empty());
        }
        assert_eq!(fx.refs.get("op"), Some("operations/123"));
    }

    const OPERATION_CALL: &str = concat!(
        "- api_call:\n",
        "    expect_request:\n",
        "      uri: /items\n",
        "      method: POST\n",
        "    return_response:\n",
        "      body: {kind: 'compute#operation', name: operation-42}\n",
    );

    #[test]
    fn test_operation_response_declares_its_extraction() {
        let mut fx = Fixture::new();
        let modes = UpdateModes::none().with(UpdateMode::ApiRequests);
        let outcome = {
            let mut session = fx.session(OPERATION_CALL, modes);
            session.transport().round_trip(HttpRequest::new("POST", "/items")).unwrap();
            session.exit(0, None);
            session.finish()
        };
        assert!(outcome.failures.is_empty(), "{:?}", outcome.failures);
        assert_eq!(
            outcome.updates,
            vec![Update::set(
                NodePath::root().key("events").index(0).keys(["api_call", "expect_response"]),
                json!({
                    "extract_references": [{"field": "name", "reference": "operation"}],
                    "body": {"json": {}}
                }),
                UpdateMode::ApiRequests
            )]
        );
        assert_eq!(fx.refs.get("operation"), Some("operation-42"));
    }

    #[test]
    fn test_operation_without_extraction_fails_strict_replay() {
        let mut fx = Fixture::new();
        let outcome = {
            let mut session = fx.session(OPERATION_CALL, UpdateModes::none());
            session.transport().round_trip(HttpRequest::new("POST", "/items")).unwrap();
            session.exit(0, None);
            session.finish()
        };
        assert_eq!(outcome.failures.len(), 1);
        assert!(outcome.failures[0].summary.contains("operation-42"), "{}", outcome.failures[0].summary);
        assert!(outcome.updates.is_empty());
    }

    #[test]
    fn test_crash_suppresses_missing_events() {
        let mut fx = Fixture::new();
        let mut session = fx.session("- expect_stdout: x\n- expect_exit_code: 0\n", UpdateModes::none());
        session.crash("index out of bounds");
        let outcome = session.finish();
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].kind, FailureKind::CommandCrash);
        assert_eq!(outcome.exit_code, None);
    }
}

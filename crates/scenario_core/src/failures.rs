//! Failure records aggregated over a run.
//!
//! Mismatches are data, not errors: each one becomes a [`Failure`] and the
//! run keeps going so a single report lists everything that went wrong.

use crate::error::{Result, ScenarioError};
use crate::events::{Change, Finding};
use crate::updates::UpdateMode;
use crate::yaml::{render_block, Location, NodePath};
use serde_json::Value;
use std::fmt;

/// Class of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// An event did not match what was observed
    AssertionFailure,
    /// An HTTP request had no pending `api_call`
    UnmatchedTraffic,
    /// An event was never observed
    MissingEvent,
    /// The command panicked
    CommandCrash,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AssertionFailure => "assertion failure",
            Self::UnmatchedTraffic => "unmatched traffic",
            Self::MissingEvent => "missing event",
            Self::CommandCrash => "command crash",
        };
        f.write_str(name)
    }
}

/// Rewrite that would have resolved a failure had its mode been enabled.
#[derive(Debug, Clone, PartialEq)]
pub struct Proposal {
    /// Mode that must be enabled
    pub mode: UpdateMode,
    /// Absolute path of the rewritten field
    pub path: NodePath,
    /// The rewrite
    pub change: Change,
}

/// One problem found during a run.
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    /// Class of the problem
    pub kind: FailureKind,
    /// Release track being run
    pub track: Option<String>,
    /// Index of the action in `actions`
    pub action_index: usize,
    /// Index of the declared event, if the failure is about one
    pub event_index: Option<usize>,
    /// Where the event or action starts
    pub location: Option<Location>,
    /// Human-readable one-liner
    pub summary: String,
    /// Declared value
    pub expected: Value,
    /// Observed value
    pub actual: Value,
    /// Rewrite that would fix it
    pub proposal: Option<Proposal>,
}

impl Failure {
    /// Creates a failure with no values attached.
    pub fn new(kind: FailureKind, action_index: usize, summary: impl Into<String>) -> Self {
        Self {
            kind,
            track: None,
            action_index,
            event_index: None,
            location: None,
            summary: summary.into(),
            expected: Value::Null,
            actual: Value::Null,
            proposal: None,
        }
    }

    /// Builds a failure from an event finding. `base` is the absolute path of
    /// the event item.
    pub fn from_finding(kind: FailureKind, action_index: usize, base: &NodePath, finding: &Finding) -> Self {
        let mut failure = Self::new(kind, action_index, finding.summary.clone());
        failure.expected = finding.expected.clone();
        failure.actual = finding.actual.clone();
        failure.proposal = finding.change.clone().map(|change| Proposal {
            mode: finding.mode,
            path: base.join(&finding.field),
            change,
        });
        failure
    }

    /// Sets the event the failure is about.
    pub fn at_event(mut self, event_index: Option<usize>, location: Option<Location>) -> Self {
        self.event_index = event_index;
        self.location = location;
        self
    }

    /// Sets the release track.
    pub fn on_track(mut self, track: impl Into<String>) -> Self {
        self.track = Some(track.into());
        self
    }

    /// YAML rendering of expected vs actual, empty when neither is known.
    pub fn diff(&self) -> String {
        if self.expected.is_null() && self.actual.is_null() {
            return String::new();
        }
        let mut out = String::new();
        for (label, value) in [("expected", &self.expected), ("actual", &self.actual)] {
            out.push_str(label);
            out.push(':');
            match value {
                Value::Object(m) if !m.is_empty() => {
                    out.push('\n');
                    out.push_str(&render_block(value, 2));
                }
                Value::Array(a) if !a.is_empty() => {
                    out.push('\n');
                    out.push_str(&render_block(value, 2));
                }
                Value::String(s) if s.contains('\n') => {
                    out.push_str(" |\n");
                    for line in s.lines() {
                        out.push_str("  ");
                        out.push_str(line);
                        out.push('\n');
                    }
                    continue;
                }
                other => {
                    out.push(' ');
                    out.push_str(&other.to_string());
                }
            }
            out.push('\n');
        }
        out
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(track) = &self.track {
            write!(f, "[{}] ", track)?;
        }
        write!(f, "action {}", self.action_index)?;
        if let Some(event) = self.event_index {
            write!(f, ", event {}", event)?;
        }
        if let Some(location) = self.location {
            write!(f, " ({})", location)?;
        }
        write!(f, ": {}: {}", self.kind, self.summary)?;
        if let Some(proposal) = &self.proposal {
            write!(f, " (re-run with --update {} to rewrite {})", proposal.mode, proposal.path)?;
        }
        Ok(())
    }
}

/// Collects failures over a run.
#[derive(Debug, Clone, Default)]
pub struct FailureCollector {
    failures: Vec<Failure>,
}

impl FailureCollector {
    /// Creates an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a failure.
    pub fn push(&mut self, failure: Failure) {
        tracing::debug!(failure = %failure, "Recorded failure");
        self.failures.push(failure);
    }

    /// Number of failures.
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    /// Returns true if nothing failed.
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Recorded failures in order.
    pub fn iter(&self) -> impl Iterator<Item = &Failure> {
        self.failures.iter()
    }

    /// Takes the recorded failures.
    pub fn into_vec(self) -> Vec<Failure> {
        self.failures
    }

    /// `Ok` when nothing failed, else [`ScenarioError::AssertionFailure`].
    pub fn into_result(self) -> Result<()> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(ScenarioError::AssertionFailure {
                failures: self.failures,
            })
        }
    }
}

impl Extend<Failure> for FailureCollector {
    fn extend<I: IntoIterator<Item = Failure>>(&mut self, iter: I) {
        for failure in iter {
            self.push(failure);
        }
    }
}

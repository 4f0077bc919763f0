//! Error types for scenario_core operations.

use crate::failures::Failure;
use crate::yaml::Location;
use std::path::PathBuf;
use thiserror::Error;

/// Core error type for scenario loading, execution and rewriting.
#[derive(Error, Debug)]
pub enum ScenarioError {
    /// The scenario file is malformed or missing required fields.
    #[error("schema error at {location}: {message}")]
    Schema {
        /// Where in the scenario file the problem was found
        location: Location,
        /// Description of the problem
        message: String,
    },

    /// The YAML text itself could not be read.
    #[error("yaml error at {location}: {message}")]
    Yaml {
        /// Where the reader stopped
        location: Location,
        /// Description of the problem
        message: String,
    },

    /// The requested release track is not declared by the scenario.
    #[error("release track {requested} is not declared by the scenario (declared: {})", declared.join(", "))]
    ReleaseTrack {
        /// Track the caller asked for
        requested: String,
        /// Tracks listed in `release_tracks`
        declared: Vec<String>,
    },

    /// One or more events did not match in strict mode.
    #[error("{} assertion failure(s)", failures.len())]
    AssertionFailure {
        /// Every failure recorded during the run
        failures: Vec<Failure>,
    },

    /// An HTTP request reached the interceptor with no pending `api_call`.
    #[error("unmatched HTTP traffic: {request}")]
    UnmatchedTraffic {
        /// `METHOD uri` of the request
        request: String,
    },

    /// A non-repeatable event was never consumed.
    #[error("event {event_index} of action {action_index} was never observed")]
    MissingEvent {
        /// Index of the action in `actions`
        action_index: usize,
        /// Index of the event in the action's `events`
        event_index: usize,
    },

    /// Two pending rewrites target overlapping spans with different text.
    #[error("conflicting rewrites at bytes {first:?} and {second:?}")]
    RewriteConflict {
        /// Span of the first rewrite
        first: std::ops::Range<usize>,
        /// Span of the second rewrite
        second: std::ops::Range<usize>,
    },

    /// A reference was redefined with a different value.
    #[error("reference {name}: {message}")]
    Reference {
        /// Reference name (without `$$`)
        name: String,
        /// Description of the problem
        message: String,
    },

    /// The command under test panicked before producing an exit code.
    #[error("command crashed: {message}")]
    CommandCrash {
        /// Panic payload or error text
        message: String,
    },

    /// A command tried to write outside its sandbox.
    #[error("command is attempting to write file outside of the sandbox: [{}]", path.display())]
    Sandbox {
        /// The offending path
        path: PathBuf,
    },

    /// The upstream transport failed in remote mode.
    #[error("transport error: {0}")]
    Transport(String),

    /// Configuration error (loading, parsing, invalid values).
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ScenarioError {
    /// Creates a schema error at the given location.
    pub fn schema(location: Location, message: impl Into<String>) -> Self {
        Self::Schema {
            location,
            message: message.into(),
        }
    }

    /// Returns a user-friendly recovery suggestion for the error, if available.
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            Self::Schema { .. } => {
                Some("Check the scenario against the schema with 'scenario validate <file>'.")
            }
            Self::ReleaseTrack { .. } => {
                Some("Add the track to release_tracks or run one of the declared tracks.")
            }
            Self::AssertionFailure { .. } => Some(
                "Re-run with --update RESULT,UX,API_REQUESTS to absorb the differences into the scenario.",
            ),
            Self::UnmatchedTraffic { .. } => {
                Some("Add an api_call event or re-run with --update API_REQUESTS.")
            }
            Self::RewriteConflict { .. } => Some(
                "The scenario behaves differently across release tracks; split it per track.",
            ),
            Self::Sandbox { .. } => {
                Some("Commands may only write below the working directory of the run.")
            }
            _ => None,
        }
    }
}

/// Convenience Result type for scenario_core operations.
pub type Result<T> = std::result::Result<T, ScenarioError>;

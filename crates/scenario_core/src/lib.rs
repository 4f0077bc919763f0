//! Scenario Core Library
//!
//! A YAML-scripted test runner for command-line clients, providing:
//! - Source-preserving scenario documents
//! - Event expectations over output, prompts, files and HTTP traffic
//! - Recorded HTTP playback with batch support
//! - Update modes that rewrite the scenario to absorb observed drift
//!
//! # Quick Start
//!
//! ```
//! use scenario_core::{Scenario, ScenarioDocument, ReleaseTrack};
//!
//! let doc = ScenarioDocument::parse("\
//! title: list instances
//! release_tracks: [GA, BETA]
//! actions:
//! - execute_command:
//!     command: compute instances list
//!     events:
//!     - expect_exit_code: 0
//! ").unwrap();
//!
//! let scenario = Scenario::from_document(&doc).unwrap();
//! assert_eq!(scenario.release_tracks, vec![ReleaseTrack::Ga, ReleaseTrack::Beta]);
//! assert_eq!(scenario.command_count(), 1);
//! ```
//!
//! # Features
//!
//! ## Byte-exact Round Trip
//!
//! Documents keep their source text; serializing an unmodified document
//! returns it unchanged, comments included:
//!
//! ```
//! use scenario_core::ScenarioDocument;
//!
//! let source = "title: t  # keep me\nrelease_tracks: [GA]\nactions: []\n";
//! let doc = ScenarioDocument::parse(source).unwrap();
//! assert_eq!(doc.serialize(), source);
//! ```
//!
//! ## Running Commands
//!
//! The command under test implements [`CommandSurface`] and talks to the
//! world only through the [`Ambient`] it is handed:
//!
//! ```
//! use scenario_core::{Ambient, CommandError, CommandSurface};
//!
//! struct Hello;
//!
//! impl CommandSurface for Hello {
//!     fn execute(&mut self, argv: &[String], ambient: &mut dyn Ambient) -> Result<i32, CommandError> {
//!         ambient.write_stdout(&format!("hello {}\n", argv.join(" ")));
//!         Ok(0)
//!     }
//! }
//! ```

mod assertions;
mod capture;
mod config;
mod document;
mod error;
mod events;
mod executor;
mod failures;
mod harness;
pub mod http;
mod references;
mod schema;
mod session;
mod updates;
pub mod yaml;

pub use assertions::{json_subset, merge_subset, unordered_assignment, values_equal, Difference, MatchOptions, Matcher};
pub use capture::{display_path, sandboxed_path, Ambient, CommandError, CommandSurface, FileContents, LogLevel, UxElement};
pub use config::{
    apply_override, ClockConfig, Config, HarnessConfig, HttpConfig, MatchingConfig, CONFIG_ENV, DEFAULT_CONFIG_FILE,
    UPDATE_MODES_ENV,
};
pub use document::ScenarioDocument;
pub use error::{Result, ScenarioError};
pub use events::{
    default_reply, parse_events, synthesize, ApiCallExpectation, BodyExpectation, Change, DeclaredEvent, Event,
    EventKind, ExitExpectation, FileExpectation, Finding, MatchContext, MatchOutcome, Observation,
    RequestExpectation, ResponseExpectation, Severity, UxExpectation, OPERATION_REFERENCE, VOLATILE_HEADERS,
};
pub use executor::{Executor, TrackOutcome};
pub use failures::{Failure, FailureCollector, FailureKind, Proposal};
pub use harness::{Harness, RunReport};
pub use http::{HttpRequest, HttpResponse, Transport, TransportError};
pub use references::{generate_id, ReferenceTable, GENERATE};
pub use schema::{split_command, Action, CommandAction, DeclaredAction, ReferenceValue, ReleaseTrack, Scenario};
pub use session::{ExecutionMode, Session, SessionEnv, SessionOptions, SessionOutcome};
pub use updates::{resolve, PendingRewrite, RewriteSet, Update, UpdateMode, UpdateModes, UpdateOp};

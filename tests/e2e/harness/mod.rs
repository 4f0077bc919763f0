//! E2E test harness for scenario runs.
//!
//! This module contains test infrastructure with builders and helpers that
//! not every scenario uses.

#![allow(dead_code)]

pub mod fake_cloud;
pub mod run;
pub mod workspace;

// Re-export commonly used types
pub use fake_cloud::{FakeCloud, Invocation, Script};
pub use run::{RunOutcome, ScenarioRun};
pub use workspace::TestWorkspace;

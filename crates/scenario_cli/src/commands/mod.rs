//! CLI commands.

pub mod run;
pub mod tracks;
pub mod validate;

use console::style;
use scenario_core::ScenarioError;

/// Prints the recovery hint of a core error, if it has one.
pub fn print_suggestion(error: &ScenarioError) {
    if let Some(hint) = error.recovery_suggestion() {
        eprintln!("  {} {}", style("hint:").cyan(), hint);
    }
}

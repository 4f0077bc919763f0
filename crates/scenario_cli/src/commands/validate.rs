//! Scenario validation command.

use super::print_suggestion;
use anyhow::{bail, Result};
use console::style;
use scenario_core::{Scenario, ScenarioDocument};
use std::path::{Path, PathBuf};

/// Load and schema-check every file.
pub fn run(paths: &[PathBuf]) -> Result<()> {
    let mut invalid = 0;
    for path in paths {
        match check(path) {
            Ok(scenario) => {
                let tracks: Vec<String> = scenario.release_tracks.iter().map(ToString::to_string).collect();
                println!(
                    "{} {}: {} [{}] {} action(s)",
                    style("✓").green(),
                    path.display(),
                    style(&scenario.title).bold(),
                    tracks.join(", "),
                    style(scenario.actions.len()).cyan()
                );
            }
            Err(e) => {
                invalid += 1;
                println!("{} {}: {}", style("×").red(), path.display(), e);
                print_suggestion(&e);
            }
        }
    }

    if invalid > 0 {
        bail!("{} of {} scenario file(s) are invalid", invalid, paths.len());
    }
    Ok(())
}

fn check(path: &Path) -> scenario_core::Result<Scenario> {
    let document = ScenarioDocument::load(path)?;
    Scenario::from_document(&document)
}

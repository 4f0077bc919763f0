//! Release track listing command.

use anyhow::{Context, Result};
use scenario_core::{Scenario, ScenarioDocument};
use std::path::Path;

/// Print the declared release tracks, one per line.
pub fn run(path: &Path) -> Result<()> {
    let document =
        ScenarioDocument::load(path).with_context(|| format!("failed to load {}", path.display()))?;
    let scenario = Scenario::from_document(&document)?;
    for track in &scenario.release_tracks {
        println!("{}", track);
    }
    Ok(())
}

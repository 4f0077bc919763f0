//! Scenario run command.

use super::print_suggestion;
use crate::process::ProcessSurface;
use anyhow::{anyhow, bail, Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use scenario_core::{Config, Harness, ReleaseTrack, RunReport, Scenario, ScenarioDocument, UpdateModes};
use std::path::PathBuf;
use std::time::Duration;

/// Arguments of `scenario run`.
pub struct RunArgs {
    pub path: PathBuf,
    pub program: PathBuf,
    pub track: Option<String>,
    pub all_tracks: bool,
    pub update: Option<String>,
    pub config: Option<PathBuf>,
}

/// Run a scenario against an external program.
pub fn run(args: RunArgs) -> Result<()> {
    let config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let modes = args
        .update
        .as_deref()
        .map(UpdateModes::parse_list)
        .transpose()
        .map_err(|e| anyhow!("invalid --update: {}", e))?;
    let path = config.scenario_path(&args.path);

    let track = if args.all_tracks {
        None
    } else {
        match &args.track {
            Some(name) => Some(name.parse::<ReleaseTrack>().map_err(|e| anyhow!(e))?),
            None => Some(first_track(&path)?),
        }
    };

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
    spinner.set_message(format!("Running {}...", path.display()));
    spinner.enable_steady_tick(Duration::from_millis(100));

    let harness = Harness::new(config);
    let mut surface = ProcessSurface::new(&args.program);
    let result = harness.run_scenario(&path, track, modes, &mut surface);
    spinner.finish_and_clear();

    let report = match result {
        Ok(report) => report,
        Err(e) => {
            eprintln!("{} {}", style("error:").red().bold(), e);
            print_suggestion(&e);
            return Err(e.into());
        }
    };

    print_report(&report);
    if !report.passed {
        bail!("scenario {} failed", report.path.display());
    }
    Ok(())
}

fn first_track(path: &std::path::Path) -> Result<ReleaseTrack> {
    let document = ScenarioDocument::load(path).with_context(|| format!("failed to load {}", path.display()))?;
    let scenario = Scenario::from_document(&document)?;
    scenario
        .release_tracks
        .first()
        .copied()
        .ok_or_else(|| anyhow!("{} declares no release tracks", path.display()))
}

fn print_report(report: &RunReport) {
    let tracks: Vec<String> = report.tracks.iter().map(ToString::to_string).collect();

    println!();
    println!("{}", style("Scenario Report:").bold());
    println!("  File:             {}", report.path.display());
    println!("  Tracks:           {}", style(tracks.join(", ")).cyan());
    println!("  Update modes:     {}", style(report.modes).cyan());
    println!("  Commands run:     {}", style(report.commands_run).cyan());
    if report.rewrites_applied > 0 {
        println!("  Rewrites applied: {}", style(report.rewrites_applied).yellow());
    }

    if !report.failures.is_empty() {
        println!();
        println!("{}", style("Failures:").bold());
        for failure in &report.failures {
            println!("  {} {}", style("×").red(), failure);
            for line in failure.diff().lines() {
                println!("      {}", style(line).dim());
            }
        }
    }

    println!();
    if report.passed {
        println!("{} {}", style("✓").green(), style("Scenario passed").green());
        if report.rewrites_applied > 0 {
            println!(
                "  {} {} was rewritten; review and commit it",
                style("⚠").yellow(),
                report.path.display()
            );
        }
    } else {
        println!(
            "{}",
            style(format!("Scenario failed with {} failure(s)", report.failures.len()))
                .red()
                .bold()
        );
    }
}

//! Entry point for test runners: run a scenario file, absorb rewrites, report.
//!
//! Runs are serialized process-wide. Each track gets its own sandbox and
//! runs against the document as left by the previous track, so rewrites are
//! resolved against the text they were observed on. The file is written once,
//! after the last track, and only when every track passed.

use crate::capture::CommandSurface;
use crate::config::Config;
use crate::document::ScenarioDocument;
use crate::error::{Result, ScenarioError};
use crate::executor::Executor;
use crate::failures::Failure;
use crate::http::Transport;
use crate::schema::{ReleaseTrack, Scenario};
use crate::updates::{self, UpdateModes};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

static RUN_LOCK: Mutex<()> = Mutex::new(());

/// Result of running a scenario file.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Scenario file that was run
    pub path: PathBuf,
    /// Tracks that were run, in order
    pub tracks: Vec<ReleaseTrack>,
    /// Update modes in effect
    pub modes: UpdateModes,
    /// Whether every track passed
    pub passed: bool,
    /// Failures of every track
    pub failures: Vec<Failure>,
    /// Number of rewrites written back to the file
    pub rewrites_applied: usize,
    /// Commands executed over all tracks
    pub commands_run: usize,
}

impl RunReport {
    /// `Ok` when the run passed, else [`ScenarioError::AssertionFailure`].
    pub fn ensure_passed(&self) -> Result<()> {
        if self.passed {
            Ok(())
        } else {
            Err(ScenarioError::AssertionFailure {
                failures: self.failures.clone(),
            })
        }
    }
}

/// Runs scenario files with a fixed configuration.
#[derive(Debug, Clone, Default)]
pub struct Harness {
    config: Config,
    sandbox_root: Option<PathBuf>,
}

impl Harness {
    /// Creates a harness.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            sandbox_root: None,
        }
    }

    /// Creates a harness from `SCENARIO_CONFIG` or `scenario.toml`.
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(Config::load()?))
    }

    /// Creates sandboxes below `root` instead of the system temp directory.
    pub fn with_sandbox_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sandbox_root = Some(root.into());
        self
    }

    /// The configuration in use.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Runs `path` for `track` (every declared track when `None`) with
    /// recorded responses. `modes` of `None` means the configured defaults.
    pub fn run_scenario(
        &self,
        path: &Path,
        track: Option<ReleaseTrack>,
        modes: Option<UpdateModes>,
        surface: &mut dyn CommandSurface,
    ) -> Result<RunReport> {
        self.run(path, track, modes, surface, None)
    }

    /// Like [`run_scenario`](Self::run_scenario), forwarding HTTP traffic to
    /// `upstream` and recording what it answers.
    pub fn run_scenario_remote(
        &self,
        path: &Path,
        track: Option<ReleaseTrack>,
        modes: Option<UpdateModes>,
        surface: &mut dyn CommandSurface,
        upstream: &mut dyn Transport,
    ) -> Result<RunReport> {
        self.run(path, track, modes, surface, Some(upstream))
    }

    fn run(
        &self,
        path: &Path,
        track: Option<ReleaseTrack>,
        modes: Option<UpdateModes>,
        surface: &mut dyn CommandSurface,
        mut upstream: Option<&mut dyn Transport>,
    ) -> Result<RunReport> {
        let _guard = RUN_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let path = self.config.scenario_path(path);
        let mut document = ScenarioDocument::load(&path)?;
        let scenario = Scenario::from_document(&document)?;
        let tracks = match track {
            Some(track) => {
                scenario.check_track(track)?;
                vec![track]
            }
            None => scenario.release_tracks.clone(),
        };
        let modes = self.config.effective_modes(modes)?;
        let scenario_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        info!(path = %path.display(), modes = %modes, "Running scenario file");

        let mut report = RunReport {
            path: path.clone(),
            tracks: tracks.clone(),
            modes,
            passed: true,
            failures: Vec::new(),
            rewrites_applied: 0,
            commands_run: 0,
        };

        // Rewrites stay in memory until every track has run.
        let mut pending = 0;
        for track in tracks {
            let scenario = Scenario::from_document(&document)?;
            let sandbox = self.sandbox()?;
            let mut executor = Executor::new(&scenario, track, &sandbox)
                .with_modes(modes)
                .with_options(self.config.session_options())
                .with_scenario_dir(&scenario_dir);
            if let Some(upstream) = upstream.as_mut() {
                executor = executor.with_upstream(&mut **upstream);
            }
            let outcome = executor.run(surface);
            if let Err(e) = fs::remove_dir_all(&sandbox) {
                warn!(sandbox = %sandbox.display(), error = %e, "Failed to remove sandbox");
            }
            let outcome = outcome?;
            report.commands_run += outcome.commands_run;

            if !outcome.passed() {
                debug!(track = %track, failures = outcome.failures.len(), "Track failed");
                report.passed = false;
                report.failures.extend(outcome.failures);
                continue;
            }
            if outcome.updates.is_empty() {
                continue;
            }

            let rewrites = updates::resolve(document.root(), document.serialize(), &outcome.updates)?;
            let before = document.serialize().to_string();
            let applied = document.apply(&rewrites)?;
            if document.serialize() != before {
                pending += applied;
                debug!(track = %track, rewrites = applied, modes = %rewrites.modes(), "Rewrites absorbed");
            }
        }

        if pending == 0 {
            return Ok(report);
        }
        if !report.passed {
            warn!(path = %path.display(), rewrites = pending, "Run failed; discarding rewrites");
            return Ok(report);
        }
        document.save()?;
        report.rewrites_applied = pending;
        info!(
            path = %path.display(),
            rewrites = pending,
            "Scenario updated; review and commit the refreshed file"
        );
        Ok(report)
    }

    fn sandbox(&self) -> Result<PathBuf> {
        let root = self.sandbox_root.clone().unwrap_or_else(std::env::temp_dir);
        let dir = root.join(format!("scenario-{}", uuid::Uuid::new_v4().simple()));
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

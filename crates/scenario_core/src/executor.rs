//! Runs a scenario's actions for one release track.
//!
//! Setup actions mutate the run state directly. Each `execute_command` gets
//! a fresh [`Session`]; a panic in the command is trapped and reported as a
//! crash. The run stops after the first action that fails.

use crate::capture::{display_path, sandboxed_path, Ambient, CommandSurface, LogLevel};
use crate::error::{Result, ScenarioError};
use crate::failures::Failure;
use crate::http::Transport;
use crate::references::{generate_id, ReferenceTable};
use crate::schema::{split_command, Action, CommandAction, DeclaredAction, ReferenceValue, ReleaseTrack, Scenario};
use crate::session::{ExecutionMode, Session, SessionEnv, SessionOptions};
use crate::updates::{Update, UpdateModes};
use std::any::Any;
use std::collections::BTreeMap;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// What one track run produced.
#[derive(Debug, Default)]
pub struct TrackOutcome {
    /// Failures that survived the enabled update modes
    pub failures: Vec<Failure>,
    /// Rewrites to apply to the scenario
    pub updates: Vec<Update>,
    /// Number of commands executed
    pub commands_run: usize,
    /// References defined by the end of the run
    pub references: ReferenceTable,
}

impl TrackOutcome {
    /// Returns true if nothing failed.
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Runs the actions of a scenario for one track.
pub struct Executor<'a> {
    scenario: &'a Scenario,
    track: ReleaseTrack,
    sandbox: PathBuf,
    scenario_dir: PathBuf,
    modes: UpdateModes,
    options: SessionOptions,
    upstream: Option<&'a mut dyn Transport>,
    refs: ReferenceTable,
    properties: BTreeMap<String, String>,
}

impl<'a> Executor<'a> {
    /// Creates an executor. Commands run inside `sandbox`.
    pub fn new(scenario: &'a Scenario, track: ReleaseTrack, sandbox: impl Into<PathBuf>) -> Self {
        Self {
            scenario,
            track,
            sandbox: sandbox.into(),
            scenario_dir: PathBuf::from("."),
            modes: UpdateModes::none(),
            options: SessionOptions::default(),
            upstream: None,
            refs: ReferenceTable::new(),
            properties: BTreeMap::new(),
        }
    }

    /// Sets the enabled update modes.
    pub fn with_modes(mut self, modes: UpdateModes) -> Self {
        self.modes = modes;
        self
    }

    /// Sets the session options.
    pub fn with_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        if self.upstream.is_some() {
            self.options.mode = ExecutionMode::Remote;
        }
        self
    }

    /// Sets the directory `load_resource` paths resolve against.
    pub fn with_scenario_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scenario_dir = dir.into();
        self
    }

    /// Forwards HTTP traffic to a real transport and switches to remote mode.
    pub fn with_upstream(mut self, upstream: &'a mut dyn Transport) -> Self {
        self.upstream = Some(upstream);
        self.options.mode = ExecutionMode::Remote;
        self
    }

    /// Runs every action in order.
    pub fn run(mut self, surface: &mut dyn CommandSurface) -> Result<TrackOutcome> {
        self.scenario.check_track(self.track)?;
        fs::create_dir_all(&self.sandbox)?;
        info!(title = %self.scenario.title, track = %self.track, "Running scenario");

        let scenario = self.scenario;
        let mut outcome = TrackOutcome::default();
        for declared in &scenario.actions {
            debug!(action = declared.index, kind = declared.action.key(), "Action");
            match &declared.action {
                Action::ExecuteCommand(command) => {
                    let (failures, updates) = self.execute(declared, command, surface)?;
                    outcome.commands_run += 1;
                    outcome.updates.extend(updates);
                    if !failures.is_empty() {
                        outcome.failures = failures;
                        info!(action = declared.index, failures = outcome.failures.len(), "Action failed");
                        break;
                    }
                }
                other => self.setup(declared, other)?,
            }
        }
        outcome.references = self.refs;
        Ok(outcome)
    }

    fn setup(&mut self, declared: &DeclaredAction, action: &Action) -> Result<()> {
        match action {
            Action::SetProperty(pairs) => {
                for (name, value) in pairs {
                    match value {
                        Some(value) => {
                            let value = self.refs.substitute(value);
                            debug!(property = %name, value = %value, "Set property");
                            self.properties.insert(name.clone(), value);
                        }
                        None => {
                            debug!(property = %name, "Unset property");
                            self.properties.remove(name);
                        }
                    }
                }
            }
            Action::DefineReference { reference, value } => {
                let value = match value {
                    ReferenceValue::Literal(text) => self.refs.substitute(text),
                    ReferenceValue::Generated => generate_id(&self.scenario.title, reference, None, self.remote()),
                };
                self.refs.define(reference, value)?;
            }
            Action::GenerateResourceId { reference, prefix } => {
                let id = generate_id(&self.scenario.title, reference, prefix.as_deref(), self.remote());
                self.refs.define(reference, id)?;
            }
            Action::WriteFile { path, contents } => {
                let target = sandboxed_path(&self.sandbox, Path::new(&self.refs.substitute(path)))?;
                write_parent(&target)?;
                fs::write(&target, self.refs.substitute(contents))?;
            }
            Action::LoadResource {
                path,
                destination,
                reference,
            } => {
                let source = self.scenario_dir.join(self.refs.substitute(path));
                let destination = match destination {
                    Some(d) => self.refs.substitute(d),
                    None => source
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .ok_or_else(|| ScenarioError::schema(declared.location, "load_resource needs a file path"))?,
                };
                let target = sandboxed_path(&self.sandbox, Path::new(&destination))?;
                write_parent(&target)?;
                fs::copy(&source, &target)?;
                if let Some(reference) = reference {
                    self.refs.define(reference, display_path(&self.sandbox, &target))?;
                }
            }
            Action::ExecuteCommand(_) => {}
        }
        Ok(())
    }

    fn execute(
        &mut self,
        declared: &DeclaredAction,
        command: &CommandAction,
        surface: &mut dyn CommandSurface,
    ) -> Result<(Vec<Failure>, Vec<Update>)> {
        let line = self.refs.substitute(&command.command);
        let words = split_command(&line).map_err(|e| ScenarioError::schema(declared.location, e))?;
        let argv: Vec<String> = self
            .track
            .prefix()
            .map(str::to_string)
            .into_iter()
            .chain(words)
            .collect();
        debug!(action = declared.index, argv = ?argv, "Executing command");

        let env = SessionEnv {
            refs: &mut self.refs,
            properties: &self.properties,
            sandbox: &self.sandbox,
            upstream: self.upstream.as_mut().map(|t| &mut **t as &mut dyn Transport),
            options: &self.options,
            modes: self.modes,
            track: Some(self.track.to_string()),
        };
        let mut session = Session::new(
            declared.index,
            command.events_path.clone(),
            command.events.clone(),
            command.stdin.clone(),
            env,
        );

        let result = panic::catch_unwind(AssertUnwindSafe(|| surface.execute(&argv, &mut session)));
        match result {
            Ok(Ok(code)) => session.exit(code, None),
            Ok(Err(error)) => {
                session.log(LogLevel::Error, &error.message);
                session.exit(error.exit_code, Some(error.message));
            }
            Err(payload) => session.crash(panic_message(payload.as_ref())),
        }

        let outcome = session.finish();
        Ok((outcome.failures, outcome.updates))
    }

    fn remote(&self) -> bool {
        self.options.mode == ExecutionMode::Remote
    }
}

fn write_parent(target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "command panicked".to_string()
    }
}

use super::fake_cloud::{FakeCloud, Invocation};
use super::workspace::TestWorkspace;
use anyhow::{Context, Result};
use scenario_core::{Config, Failure, FailureKind, Harness, ReleaseTrack, RunReport, UpdateMode, UpdateModes};

const INLINE_FILE: &str = "scenario.yaml";

enum Source {
    Fixture { name: String, file: String },
    Inline(String),
}

/// Fluent builder for one scenario run against a [`FakeCloud`]
pub struct ScenarioRun {
    name: String,
    source: Source,
    cloud: FakeCloud,
    track: Option<ReleaseTrack>,
    modes: UpdateModes,
    config: Config,
}

impl ScenarioRun {
    /// Create a new run with the given name
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            source: Source::Inline(String::new()),
            cloud: FakeCloud::new(),
            track: None,
            modes: UpdateModes::none(),
            config: Config::default(),
        }
    }

    // ===== Scenario source =====

    /// Run a single-file fixture
    pub fn from_fixture(mut self, file: &str) -> Self {
        self.source = Source::Fixture {
            name: file.to_string(),
            file: file.to_string(),
        };
        self
    }

    /// Run `file` inside a directory fixture
    pub fn from_fixture_dir(mut self, dir: &str, file: &str) -> Self {
        self.source = Source::Fixture {
            name: dir.to_string(),
            file: file.to_string(),
        };
        self
    }

    /// Run scenario text written into a fresh workspace
    pub fn with_yaml(mut self, yaml: &str) -> Self {
        self.source = Source::Inline(yaml.to_string());
        self
    }

    // ===== Run settings =====

    pub fn with_cloud(mut self, cloud: FakeCloud) -> Self {
        self.cloud = cloud;
        self
    }

    /// Run one track instead of every declared one
    pub fn on_track(mut self, track: ReleaseTrack) -> Self {
        self.track = Some(track);
        self
    }

    pub fn with_modes(mut self, modes: &[UpdateMode]) -> Self {
        self.modes = modes.iter().fold(UpdateModes::none(), |acc, mode| acc.with(*mode));
        self
    }

    /// Tolerate requests no `api_call` expects
    pub fn lenient_http(mut self) -> Self {
        self.config.http.strict = false;
        self
    }

    // ===== Execution =====

    /// Set up the workspace and run the scenario once
    pub fn run(mut self) -> Result<RunOutcome> {
        let (workspace, file) = match &self.source {
            Source::Fixture { name, file } => (TestWorkspace::from_fixture(name)?, file.clone()),
            Source::Inline(yaml) => {
                let workspace = TestWorkspace::empty()?;
                workspace.write_file(INLINE_FILE, yaml.as_bytes())?;
                (workspace, INLINE_FILE.to_string())
            }
        };
        let original = workspace.read_file(&file)?;
        let report = execute(&mut self, &workspace, &file)?;

        Ok(RunOutcome {
            report,
            workspace,
            file,
            original,
            settings: self,
        })
    }
}

fn execute(settings: &mut ScenarioRun, workspace: &TestWorkspace, file: &str) -> Result<RunReport> {
    settings.cloud.clear_invocations();
    let harness = Harness::new(settings.config.clone()).with_sandbox_root(workspace.path().join("sandboxes"));
    harness
        .run_scenario(
            &workspace.path().join(file),
            settings.track,
            Some(settings.modes),
            &mut settings.cloud,
        )
        .with_context(|| format!("scenario '{}' did not run", settings.name))
}

/// A finished run, with its workspace kept alive for inspection
pub struct RunOutcome {
    pub report: RunReport,
    workspace: TestWorkspace,
    file: String,
    original: String,
    settings: ScenarioRun,
}

impl RunOutcome {
    /// Run the same file again with the same settings
    pub fn rerun(mut self) -> Result<Self> {
        self.report = execute(&mut self.settings, &self.workspace, &self.file)?;
        Ok(self)
    }

    /// Calls the fake received during the last run
    pub fn invocations(&self) -> &[Invocation] {
        self.settings.cloud.invocations()
    }

    /// Scenario text before the first run
    pub fn original_text(&self) -> &str {
        &self.original
    }

    /// Scenario text as it is on disk now
    pub fn scenario_text(&self) -> Result<String> {
        self.workspace.read_file(&self.file)
    }

    pub fn failures_of(&self, kind: FailureKind) -> Vec<&Failure> {
        self.report.failures.iter().filter(|f| f.kind == kind).collect()
    }

    // ===== Assertions =====

    pub fn assert_passed(&self) -> &Self {
        assert!(
            self.report.passed,
            "scenario '{}' failed:\n{}",
            self.settings.name,
            self.report
                .failures
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("\n")
        );
        self
    }

    pub fn assert_failed(&self) -> &Self {
        assert!(!self.report.passed, "scenario '{}' passed unexpectedly", self.settings.name);
        self
    }

    pub fn assert_rewrites(&self, count: usize) -> &Self {
        assert_eq!(
            self.report.rewrites_applied, count,
            "scenario '{}' rewrite count",
            self.settings.name
        );
        self
    }

    /// The file on disk is byte-identical to the original
    pub fn assert_unchanged(&self) -> &Self {
        let text = self.workspace.read_file(&self.file).expect("scenario file should be readable");
        assert_eq!(text, self.original, "scenario '{}' was rewritten", self.settings.name);
        self
    }
}

//! Runs scenario commands as child processes.
//!
//! Properties are exported as `CLOUDSDK_<SECTION>_<NAME>` variables and the
//! child runs inside the sandbox. Stdout is reported before stderr; HTTP
//! traffic of the child is not intercepted and stdin is closed.

use scenario_core::{Ambient, CommandError, CommandSurface};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::debug;

/// A [`CommandSurface`] backed by an external executable.
pub struct ProcessSurface {
    program: PathBuf,
}

impl ProcessSurface {
    /// Creates a surface invoking `program`.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl CommandSurface for ProcessSurface {
    fn execute(&mut self, argv: &[String], ambient: &mut dyn Ambient) -> Result<i32, CommandError> {
        let mut command = Command::new(&self.program);
        command
            .args(argv)
            .current_dir(ambient.working_dir())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (name, value) in ambient.properties() {
            command.env(property_env(&name), value);
        }
        debug!(program = %self.program.display(), argv = ?argv, "Spawning command");

        let output = command
            .output()
            .map_err(|e| CommandError::new(format!("failed to run {}: {}", self.program.display(), e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.is_empty() {
            ambient.write_stdout(&stdout);
        }
        for line in String::from_utf8_lossy(&output.stderr).split_inclusive('\n') {
            ambient.write_stderr(line);
        }
        Ok(output.status.code().unwrap_or(1))
    }
}

/// `core/project` becomes `CLOUDSDK_CORE_PROJECT`.
pub fn property_env(name: &str) -> String {
    let mut env = String::from("CLOUDSDK");
    for part in name.split('/') {
        env.push('_');
        env.extend(part.chars().map(|c| match c {
            '-' | '.' => '_',
            c => c.to_ascii_uppercase(),
        }));
    }
    env
}

//! Configuration for scenario runs.
//!
//! Read from `scenario.toml` (or the file named by `SCENARIO_CONFIG`), with
//! every section optional. `SCENARIO_UPDATE_MODES` overrides the update modes
//! callers ask for.

use crate::assertions::MatchOptions;
use crate::error::{Result, ScenarioError};
use crate::session::SessionOptions;
use crate::updates::UpdateModes;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable naming an alternate config file.
pub const CONFIG_ENV: &str = "SCENARIO_CONFIG";

/// Environment variable overriding the requested update modes.
pub const UPDATE_MODES_ENV: &str = "SCENARIO_UPDATE_MODES";

/// Config file looked up in the current directory.
pub const DEFAULT_CONFIG_FILE: &str = "scenario.toml";

/// Complete run configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    /// Scenario lookup and default modes.
    #[serde(default)]
    pub harness: HarnessConfig,

    /// Literal comparison options.
    #[serde(default)]
    pub matching: MatchingConfig,

    /// HTTP interception.
    #[serde(default)]
    pub http: HttpConfig,

    /// Clock seen by commands.
    #[serde(default)]
    pub clock: ClockConfig,
}

impl Config {
    /// Loads the config named by `SCENARIO_CONFIG`, else `scenario.toml` in
    /// the current directory, else defaults.
    pub fn load() -> Result<Self> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::load_from(Path::new(&path)),
            None => {
                let path = Path::new(DEFAULT_CONFIG_FILE);
                if path.exists() {
                    Self::load_from(path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Loads a config file. A missing file is an error.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| ScenarioError::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::parse(&content)
    }

    /// Parses config text.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| ScenarioError::Config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Serializes the config as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ScenarioError::Config(format!("failed to serialize config: {}", e)))
    }

    fn validate(&self) -> Result<()> {
        self.harness.default_modes()?;
        if !(100..=599).contains(&self.http.default_status) {
            return Err(ScenarioError::Config(format!(
                "http.default_status must be a valid HTTP status, got {}",
                self.http.default_status
            )));
        }
        Ok(())
    }

    /// Session options derived from the config.
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            matching: MatchOptions {
                normalize_trailing_newlines: self.matching.normalize_trailing_newlines,
                collapse_whitespace: self.matching.collapse_whitespace,
            },
            strict_http: self.http.strict,
            default_status: self.http.default_status,
            now: self.clock.frozen_at,
            ..SessionOptions::default()
        }
    }

    /// Resolves a scenario path: relative paths that do not exist as given
    /// are looked up under `harness.scenario_root`.
    pub fn scenario_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() || path.exists() {
            return path.to_path_buf();
        }
        self.harness.scenario_root.join(path)
    }

    /// Update modes for a run: the caller's request unless
    /// `SCENARIO_UPDATE_MODES` says otherwise. With nothing requested, the
    /// configured defaults apply.
    pub fn effective_modes(&self, requested: Option<UpdateModes>) -> Result<UpdateModes> {
        let requested = match requested {
            Some(modes) => modes,
            None => self.harness.default_modes()?,
        };
        match std::env::var(UPDATE_MODES_ENV) {
            Ok(value) => apply_override(requested, &value),
            Err(_) => Ok(requested),
        }
    }
}

/// Applies a `SCENARIO_UPDATE_MODES` value to the requested modes.
pub fn apply_override(requested: UpdateModes, value: &str) -> Result<UpdateModes> {
    let value = value.trim();
    match value.to_ascii_lowercase().as_str() {
        "" => Ok(requested),
        "off" | "none" | "0" | "false" => Ok(UpdateModes::none()),
        "all" => Ok(UpdateModes::all()),
        _ => UpdateModes::parse_list(value).map_err(|e| ScenarioError::Config(format!("{}: {}", UPDATE_MODES_ENV, e))),
    }
}

/// `[harness]`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HarnessConfig {
    /// Directory relative scenario paths resolve against (default: tests/scenarios).
    pub scenario_root: PathBuf,

    /// Update modes used when the caller asks for none (default: empty).
    pub default_update_modes: Vec<String>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            scenario_root: PathBuf::from("tests/scenarios"),
            default_update_modes: Vec::new(),
        }
    }
}

impl HarnessConfig {
    /// Parsed `default_update_modes`.
    pub fn default_modes(&self) -> Result<UpdateModes> {
        UpdateModes::parse_list(&self.default_update_modes.join(","))
            .map_err(|e| ScenarioError::Config(format!("harness.default_update_modes: {}", e)))
    }
}

/// `[matching]`
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct MatchingConfig {
    /// Ignore trailing newlines in literal comparisons (default: false).
    pub normalize_trailing_newlines: bool,

    /// Collapse runs of whitespace in literal comparisons (default: false).
    pub collapse_whitespace: bool,
}

/// `[http]`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HttpConfig {
    /// Unmatched requests fail the run (default: true).
    pub strict: bool,

    /// Status of responses minted for unmatched requests (default: 200).
    pub default_status: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            strict: true,
            default_status: 200,
        }
    }
}

/// `[clock]`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClockConfig {
    /// Seconds since the epoch returned by `Ambient::now` (default: 1500000000).
    pub frozen_at: u64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            frozen_at: 1_500_000_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::updates::UpdateMode;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config, Config::default());
        assert!(config.http.strict);
        assert_eq!(config.clock.frozen_at, 1_500_000_000);
        let options = config.session_options();
        assert_eq!(options.default_status, 200);
        assert!(options.strict_http);
    }

    #[test]
    fn test_partial_sections() {
        let config = Config::parse(
            "[http]\nstrict = false\n\n[harness]\ndefault_update_modes = [\"RESULT\", \"UX\"]\n",
        )
        .unwrap();
        assert!(!config.http.strict);
        assert_eq!(config.http.default_status, 200);
        let modes = config.harness.default_modes().unwrap();
        assert!(modes.contains(UpdateMode::Result));
        assert!(modes.contains(UpdateMode::Ux));
        assert!(!modes.contains(UpdateMode::ApiRequests));
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            Config::parse("[http]\ndefault_status = 42\n"),
            Err(ScenarioError::Config(_))
        ));
        assert!(matches!(
            Config::parse("[harness]\ndefault_update_modes = [\"SOMETIMES\"]\n"),
            Err(ScenarioError::Config(_))
        ));
        assert!(Config::parse("[http\n").is_err());
    }

    #[test]
    fn test_load_from_file_round_trip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("scenario.toml");
        let mut config = Config::default();
        config.matching.normalize_trailing_newlines = true;
        fs::write(&path, config.to_toml().unwrap()).unwrap();
        assert_eq!(Config::load_from(&path).unwrap(), config);
        assert!(Config::load_from(&tmp.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_update_mode_override() {
        let requested = UpdateModes::none().with(UpdateMode::Result);
        assert!(apply_override(requested, "off").unwrap().is_empty());
        assert_eq!(apply_override(requested, "").unwrap(), requested);
        assert_eq!(apply_override(requested, "all").unwrap(), UpdateModes::all());
        let replaced = apply_override(requested, "UX,API_REQUESTS").unwrap();
        assert!(replaced.contains(UpdateMode::Ux));
        assert!(!replaced.contains(UpdateMode::Result));
        assert!(apply_override(requested, "BOGUS").is_err());
    }

    #[test]
    fn test_scenario_path_uses_root_for_missing_relative_paths() {
        let config = Config::default();
        assert_eq!(
            config.scenario_path(Path::new("does/not/exist.yaml")),
            PathBuf::from("tests/scenarios/does/not/exist.yaml")
        );
    }
}

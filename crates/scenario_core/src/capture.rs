//! The ambient context handed to the command under test.
//!
//! Commands never touch process globals: output, logging, prompts, file
//! writes, properties, the clock and HTTP all go through [`Ambient`], which
//! the engine implements per action and drops when the action ends.

use crate::error::{Result, ScenarioError};
use crate::http::Transport;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// Severity of a log record written by the command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Debug chatter, never shown on stderr
    Debug,
    /// Informational, never shown on stderr
    Info,
    /// Shown on stderr as `WARNING: ...`
    Warning,
    /// Shown on stderr as `ERROR: ...`
    Error,
}

/// Structured console elements, written to stderr as one JSON line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UxElement {
    /// A progress bar
    ProgressBar,
    /// A spinner-style progress tracker
    ProgressTracker,
    /// A free-form prompt
    Prompt,
    /// A yes/no confirmation
    PromptContinue,
    /// A choice between options
    PromptChoice,
}

impl UxElement {
    /// Every element.
    pub const ALL: [UxElement; 5] = [
        UxElement::ProgressBar,
        UxElement::ProgressTracker,
        UxElement::Prompt,
        UxElement::PromptContinue,
        UxElement::PromptChoice,
    ];

    /// Name written in the `"ux"` field.
    pub fn name(self) -> &'static str {
        match self {
            Self::ProgressBar => "PROGRESS_BAR",
            Self::ProgressTracker => "PROGRESS_TRACKER",
            Self::Prompt => "PROMPT",
            Self::PromptContinue => "PROMPT_CONTINUE",
            Self::PromptChoice => "PROMPT_CHOICE",
        }
    }

    /// Looks an element up by its `"ux"` name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.name() == name)
    }

    /// Data fields the element carries besides `"ux"`.
    pub fn data_fields(self) -> &'static [&'static str] {
        match self {
            Self::ProgressBar => &["message"],
            Self::ProgressTracker => &["message", "aborted_message", "status"],
            Self::Prompt => &["message", "prompt_string"],
            Self::PromptContinue => &["message", "prompt_string", "cancel_string"],
            Self::PromptChoice => &["message", "prompt_string", "choices"],
        }
    }

    /// Whether the element waits for a reply on stdin.
    pub fn takes_input(self) -> bool {
        matches!(self, Self::Prompt | Self::PromptContinue | Self::PromptChoice)
    }

    /// Renders the element as the JSON line written to stderr.
    pub fn render(self, data: &Map<String, Value>) -> String {
        let mut line = Map::new();
        line.insert("ux".to_string(), Value::String(self.name().to_string()));
        for field in self.data_fields() {
            if let Some(value) = data.get(*field) {
                line.insert((*field).to_string(), value.clone());
            }
        }
        format!("{}\n", Value::Object(line))
    }
}

impl fmt::Display for UxElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Contents of a written file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileContents {
    /// UTF-8 text
    Text(String),
    /// Anything else
    Binary(Vec<u8>),
}

impl FileContents {
    /// Raw bytes to put on disk.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(s) => s.as_bytes(),
            Self::Binary(b) => b,
        }
    }
}

/// Everything a command may touch while it runs.
pub trait Ambient {
    /// Writes to stdout.
    fn write_stdout(&mut self, text: &str);

    /// Writes to stderr.
    fn write_stderr(&mut self, text: &str);

    /// Emits a log record.
    fn log(&mut self, level: LogLevel, message: &str);

    /// Reads one line of user input, `None` at end of input.
    fn read_line(&mut self) -> Option<String>;

    /// Writes a file below the working directory.
    fn write_file(&mut self, path: &Path, contents: FileContents, private: bool) -> Result<()>;

    /// Directory relative paths resolve against.
    fn working_dir(&self) -> &Path;

    /// Looks up a property such as `core/project`.
    fn property(&self, name: &str) -> Option<String>;

    /// Every property currently set, by name.
    fn properties(&self) -> BTreeMap<String, String>;

    /// HTTP transport for API calls.
    fn transport(&mut self) -> &mut dyn Transport;

    /// Current time in seconds since the epoch.
    fn now(&self) -> u64;

    /// Shows a progress bar.
    fn progress_bar(&mut self, message: &str) {
        let data = json!({ "message": message });
        self.emit_ux(UxElement::ProgressBar, &data);
    }

    /// Shows a progress tracker with its final status.
    fn progress_tracker(&mut self, message: &str, status: &str) {
        let data = json!({ "message": message, "status": status });
        self.emit_ux(UxElement::ProgressTracker, &data);
    }

    /// Asks a yes/no question; anything but an explicit "n" continues.
    fn prompt_continue(&mut self, message: &str) -> bool {
        let data = json!({ "message": message, "prompt_string": "Do you want to continue (Y/n)?" });
        self.emit_ux(UxElement::PromptContinue, &data);
        let answer = self.read_line().unwrap_or_default();
        !answer.trim().eq_ignore_ascii_case("n")
    }

    /// Asks the user to pick one of `choices`. Returns the 0-based index, or
    /// `None` for an empty or invalid answer.
    fn prompt_choice(&mut self, message: &str, choices: &[&str]) -> Option<usize> {
        let data = json!({
            "message": message,
            "prompt_string": "Please enter your numeric choice",
            "choices": choices,
        });
        self.emit_ux(UxElement::PromptChoice, &data);
        let answer = self.read_line()?;
        let picked = answer.trim().parse::<usize>().ok()?;
        (1..=choices.len()).contains(&picked).then(|| picked - 1)
    }

    /// Asks for free-form input.
    fn prompt(&mut self, message: &str) -> String {
        let data = json!({ "message": message, "prompt_string": message });
        self.emit_ux(UxElement::Prompt, &data);
        self.read_line().unwrap_or_default()
    }

    /// Writes a structured UX element to stderr.
    fn emit_ux(&mut self, element: UxElement, data: &Value) {
        let empty = Map::new();
        let fields = data.as_object().unwrap_or(&empty);
        self.write_stderr(&element.render(fields));
    }
}

/// An error the command reports in a controlled way: it maps to an exit code
/// and a message, like a CLI's top-level error handler would.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandError {
    /// Exit code the CLI would use
    pub exit_code: i32,
    /// Message the CLI would print
    pub message: String,
}

impl CommandError {
    /// Creates an error with exit code 1.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            exit_code: 1,
            message: message.into(),
        }
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (exit {})", self.message, self.exit_code)
    }
}

impl std::error::Error for CommandError {}

/// The command surface under test: a black box turning argv into an exit code.
pub trait CommandSurface {
    /// Runs one command. `Ok(code)` is a normal exit; `Err` is a handled
    /// error. Panics are trapped by the engine.
    fn execute(&mut self, argv: &[String], ambient: &mut dyn Ambient)
        -> std::result::Result<i32, CommandError>;
}

/// Resolves `path` against `root` and rejects anything that escapes it.
pub fn sandboxed_path(root: &Path, path: &Path) -> Result<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    };

    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(ScenarioError::Sandbox { path: joined });
                }
            }
            Component::CurDir => {}
            other => normalized.push(other.as_os_str()),
        }
    }

    if normalized.starts_with(root) {
        Ok(normalized)
    } else {
        Err(ScenarioError::Sandbox { path: normalized })
    }
}

/// Path as shown to events: relative to the sandbox, with `/` separators.
pub fn display_path(root: &Path, path: &Path) -> String {
    let shown = path.strip_prefix(root).unwrap_or(path);
    shown.to_string_lossy().replace('\\', "/")
}

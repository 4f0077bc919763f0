//! A scriptable stand-in for a cloud CLI.
//!
//! Each command is a list of steps run against the [`Ambient`] the engine
//! hands in. `{name}` in any text is replaced by the first argument after the
//! command words, so `items describe foo` can request `/items/{name}`.
//! Commands registered with a leading track token (`beta items list`) apply
//! to that track only and win over the track-less registration.

use scenario_core::http::batch::{self, BatchPart};
use scenario_core::{Ambient, CommandError, CommandSurface, FileContents, HttpRequest, HttpResponse, Transport};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// One thing a scripted command does
#[derive(Debug, Clone)]
pub enum Step {
    Stdout(String),
    Stderr(String),
    /// Prints a property value, or `(unset)`
    EchoProperty(String),
    Request {
        method: String,
        uri: String,
        body: Option<String>,
    },
    /// Sends one multipart batch; parts are `(method, uri, body)` in emission order
    Batch {
        uri: String,
        parts: Vec<(String, String, Option<Vec<u8>>)>,
    },
    /// Prints a dotted field of the last JSON response
    PrintField(String),
    /// Prints a file of the working directory
    Cat(String),
    WriteFile {
        path: String,
        contents: String,
        private: bool,
    },
    /// Asks to continue; prints `Cancelled.` and stops on "n"
    Confirm(String),
    Fail {
        code: i32,
        message: String,
    },
    Panic(String),
}

/// Steps of one command plus its exit code
#[derive(Debug, Clone, Default)]
pub struct Script {
    steps: Vec<Step>,
    exit_code: i32,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stdout(mut self, text: &str) -> Self {
        self.steps.push(Step::Stdout(text.to_string()));
        self
    }

    pub fn stderr(mut self, text: &str) -> Self {
        self.steps.push(Step::Stderr(text.to_string()));
        self
    }

    pub fn echo_property(mut self, name: &str) -> Self {
        self.steps.push(Step::EchoProperty(name.to_string()));
        self
    }

    pub fn get(mut self, uri: &str) -> Self {
        self.steps.push(Step::Request {
            method: "GET".to_string(),
            uri: uri.to_string(),
            body: None,
        });
        self
    }

    pub fn post(mut self, uri: &str, body: &str) -> Self {
        self.steps.push(Step::Request {
            method: "POST".to_string(),
            uri: uri.to_string(),
            body: Some(body.to_string()),
        });
        self
    }

    pub fn delete(mut self, uri: &str) -> Self {
        self.steps.push(Step::Request {
            method: "DELETE".to_string(),
            uri: uri.to_string(),
            body: None,
        });
        self
    }

    pub fn batch(mut self, uri: &str, parts: &[(&str, &str)]) -> Self {
        self.steps.push(Step::Batch {
            uri: uri.to_string(),
            parts: parts.iter().map(|(m, u)| (m.to_string(), u.to_string(), None)).collect(),
        });
        self
    }

    /// A batch whose sub-requests carry JSON bodies
    pub fn batch_with_bodies(mut self, uri: &str, parts: &[(&str, &str, &str)]) -> Self {
        self.steps.push(Step::Batch {
            uri: uri.to_string(),
            parts: parts
                .iter()
                .map(|(m, u, b)| (m.to_string(), u.to_string(), Some(b.as_bytes().to_vec())))
                .collect(),
        });
        self
    }

    pub fn print_field(mut self, field: &str) -> Self {
        self.steps.push(Step::PrintField(field.to_string()));
        self
    }

    pub fn cat(mut self, path: &str) -> Self {
        self.steps.push(Step::Cat(path.to_string()));
        self
    }

    pub fn write_file(mut self, path: &str, contents: &str) -> Self {
        self.steps.push(Step::WriteFile {
            path: path.to_string(),
            contents: contents.to_string(),
            private: false,
        });
        self
    }

    pub fn write_private_file(mut self, path: &str, contents: &str) -> Self {
        self.steps.push(Step::WriteFile {
            path: path.to_string(),
            contents: contents.to_string(),
            private: true,
        });
        self
    }

    pub fn confirm(mut self, message: &str) -> Self {
        self.steps.push(Step::Confirm(message.to_string()));
        self
    }

    pub fn fail(mut self, code: i32, message: &str) -> Self {
        self.steps.push(Step::Fail {
            code,
            message: message.to_string(),
        });
        self
    }

    pub fn panic(mut self, message: &str) -> Self {
        self.steps.push(Step::Panic(message.to_string()));
        self
    }

    pub fn exit(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }
}

/// What one call of the fake saw and got back
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Full argv, track token included
    pub argv: Vec<String>,
    /// Properties in effect
    pub properties: BTreeMap<String, String>,
    /// Responses served, in request order
    pub responses: Vec<HttpResponse>,
}

/// In-process fake CLI implementing [`CommandSurface`]
#[derive(Debug, Clone, Default)]
pub struct FakeCloud {
    commands: Vec<(Vec<String>, Script)>,
    invocations: Vec<Invocation>,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `script` for the command words `words`
    pub fn command(mut self, words: &str, script: Script) -> Self {
        let words = words.split_whitespace().map(str::to_string).collect();
        self.commands.push((words, script));
        self
    }

    pub fn invocations(&self) -> &[Invocation] {
        &self.invocations
    }

    pub fn clear_invocations(&mut self) {
        self.invocations.clear();
    }

    // Longest registered prefix of `words`.
    fn lookup(&self, words: &[String]) -> Option<(usize, Script)> {
        self.commands
            .iter()
            .filter(|(prefix, _)| words.starts_with(prefix))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(prefix, script)| (prefix.len(), script.clone()))
    }
}

impl CommandSurface for FakeCloud {
    fn execute(&mut self, argv: &[String], ambient: &mut dyn Ambient) -> Result<i32, CommandError> {
        let words = match argv.first().map(String::as_str) {
            Some("alpha") | Some("beta") => &argv[1..],
            _ => argv,
        };
        let on_track = if words.len() < argv.len() {
            self.lookup(argv)
                .filter(|(matched, _)| *matched > 0)
                .map(|(matched, script)| (matched - 1, script))
        } else {
            None
        };
        let (matched, script) = on_track.or_else(|| self.lookup(words)).ok_or_else(|| CommandError {
            exit_code: 2,
            message: format!("unknown command: {}", words.join(" ")),
        })?;
        let name = words.get(matched).cloned().unwrap_or_default();

        let mut invocation = Invocation {
            argv: argv.to_vec(),
            properties: ambient.properties(),
            responses: Vec::new(),
        };
        let result = run_script(&script, &name, ambient, &mut invocation);
        self.invocations.push(invocation);
        result
    }
}

fn run_script(
    script: &Script,
    name: &str,
    ambient: &mut dyn Ambient,
    invocation: &mut Invocation,
) -> Result<i32, CommandError> {
    let fill = |text: &str| text.replace("{name}", name);

    for step in &script.steps {
        match step {
            Step::Stdout(text) => ambient.write_stdout(&fill(text)),
            Step::Stderr(text) => ambient.write_stderr(&fill(text)),
            Step::EchoProperty(property) => {
                let value = ambient.property(property).unwrap_or_else(|| "(unset)".to_string());
                ambient.write_stdout(&format!("{}\n", value));
            }
            Step::Request { method, uri, body } => {
                let mut request = HttpRequest::new(method.as_str(), fill(uri));
                if let Some(body) = body {
                    request = request
                        .with_header("content-type", "application/json")
                        .with_body(fill(body));
                }
                send(ambient, request, invocation)?;
            }
            Step::Batch { uri, parts } => {
                let parts: Vec<BatchPart> = parts
                    .iter()
                    .enumerate()
                    .map(|(i, (method, part_uri, body))| {
                        let mut request = HttpRequest::new(method.as_str(), fill(part_uri));
                        if let Some(body) = body {
                            request = request.with_header("content-type", "application/json").with_body(body.clone());
                        }
                        BatchPart {
                            content_id: Some((i + 1).to_string()),
                            request,
                        }
                    })
                    .collect();
                send(ambient, batch::encode_request(&fill(uri), "fake_batch", &parts), invocation)?;
            }
            Step::PrintField(field) => {
                let body = invocation
                    .responses
                    .last()
                    .and_then(HttpResponse::body_text)
                    .and_then(|text| serde_json::from_str::<Value>(text).ok())
                    .unwrap_or(Value::Null);
                let value = field.split('.').fold(&body, |value, part| &value[part]);
                let text = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                ambient.write_stdout(&format!("{}\n", text));
            }
            Step::Cat(path) => {
                let path = ambient.working_dir().join(fill(path));
                let text = fs::read_to_string(&path)
                    .map_err(|e| CommandError::new(format!("cannot read {}: {}", path.display(), e)))?;
                ambient.write_stdout(&text);
            }
            Step::WriteFile { path, contents, private } => {
                let path = fill(path);
                ambient
                    .write_file(Path::new(&path), FileContents::Text(fill(contents)), *private)
                    .map_err(|e| CommandError::new(format!("cannot write {}: {}", path, e)))?;
            }
            Step::Confirm(message) => {
                if !ambient.prompt_continue(&fill(message)) {
                    ambient.write_stdout("Cancelled.\n");
                    return Ok(0);
                }
            }
            Step::Fail { code, message } => {
                return Err(CommandError {
                    exit_code: *code,
                    message: fill(message),
                })
            }
            Step::Panic(message) => panic!("{}", message),
        }
    }
    Ok(script.exit_code)
}

fn send(ambient: &mut dyn Ambient, request: HttpRequest, invocation: &mut Invocation) -> Result<(), CommandError> {
    let response = ambient
        .transport()
        .round_trip(request)
        .map_err(|e| CommandError::new(format!("request failed: {}", e)))?;
    invocation.responses.push(response);
    Ok(())
}

//! Action descriptors and the runner that executes them.
//!
//! An [`Action`] is either a [`CommandTemplate`], a strongly typed argv with
//! named parameter slots, or a keyed callable. Argument vectors are assembled
//! from typed pieces rather than interpolated strings, so no input value can
//! ever be interpreted by a shell.

use std::fs::File;
use std::hash::{Hash, Hasher};
use std::process::{Command, Stdio};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

use crate::core::{ArcStr, Outputs, Value};
use crate::error::ActionError;
use crate::utils::panic_message;

/// Upper bound on the stderr tail kept in an [`ActionError`].
const STDERR_SNIPPET: usize = 2048;

/// Name of the file in the task workspace that receives the stdout of a
/// command.
pub const STDOUT_LOG: &str = "stdout.log";

/// A single piece of a command line.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Arg {
    /// Passed through verbatim.
    Literal(String),
    /// Value of the named input slot; lists expand to one argument per item.
    Input(String),
    /// Absolute path of the named output inside the task workspace.
    Output(String),
    /// The task workspace directory itself.
    Workspace,
}

/// External program invocation with named parameter slots.
///
/// # Example
///
/// ```rust
/// use nagare::CommandTemplate;
///
/// let cmd = CommandTemplate::new("recon-all")
///     .arg("-all")
///     .arg("-i")
///     .input("image")
///     .arg("-sd")
///     .workspace()
///     .produces("subject", "subject");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommandTemplate {
    program: String,
    args: Vec<Arg>,
    env: Vec<(String, String)>,
    produces: Vec<(String, Utf8PathBuf)>,
}

impl CommandTemplate {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            produces: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(Arg::Literal(arg.into()));
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args
            .extend(args.into_iter().map(|arg| Arg::Literal(arg.into())));
        self
    }

    pub fn input(mut self, slot: impl Into<String>) -> Self {
        self.args.push(Arg::Input(slot.into()));
        self
    }

    pub fn output(mut self, slot: impl Into<String>) -> Self {
        self.args.push(Arg::Output(slot.into()));
        self
    }

    pub fn workspace(mut self) -> Self {
        self.args.push(Arg::Workspace);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Declares where the named output lands, relative to the workspace.
    pub fn produces(mut self, slot: impl Into<String>, path: impl Into<Utf8PathBuf>) -> Self {
        self.produces.push((slot.into(), path.into()));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn output_path(&self, slot: &str, workspace: &Utf8Path) -> Option<Utf8PathBuf> {
        self.produces
            .iter()
            .find(|(name, _)| name == slot)
            .map(|(_, path)| workspace.join(path))
    }

    /// Builds the argument vector for an invocation.
    pub fn render(&self, invocation: &Invocation) -> Result<Vec<String>, ActionError> {
        let mut argv = Vec::with_capacity(self.args.len());

        for arg in &self.args {
            match arg {
                Arg::Literal(text) => argv.push(text.clone()),
                Arg::Input(slot) => invocation
                    .input(slot)
                    .ok_or_else(|| ActionError::message(format!("unknown input slot '{slot}'")))?
                    .to_args(&mut argv),
                Arg::Output(slot) => {
                    let path = self
                        .output_path(slot, invocation.workspace)
                        .ok_or_else(|| {
                            ActionError::message(format!("no path declared for output '{slot}'"))
                        })?;
                    argv.push(path.into_string());
                }
                Arg::Workspace => argv.push(invocation.workspace.to_string()),
            }
        }

        Ok(argv)
    }

    fn run(&self, invocation: &Invocation) -> Result<Outputs, ActionError> {
        let argv = self.render(invocation)?;

        tracing::debug!(task = invocation.task, program = %self.program, ?argv, "spawning");

        let stdout = File::create(invocation.workspace.join(STDOUT_LOG))
            .map_err(|e| ActionError::message(format!("couldn't create {STDOUT_LOG}: {e}")))?;

        let output = Command::new(&self.program)
            .args(&argv)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .current_dir(invocation.workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| ActionError::message(format!("couldn't spawn '{}': {e}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ActionError::new(
                output.status.code(),
                tail(&stderr, STDERR_SNIPPET).trim(),
            ));
        }

        let mut outputs = Outputs::new();

        for slot in invocation.outputs {
            let path = self
                .output_path(slot, invocation.workspace)
                .ok_or_else(|| ActionError::message(format!("no path declared for output '{slot}'")))?;

            if !path.exists() {
                return Err(ActionError::new(
                    output.status.code(),
                    format!("declared output '{slot}' was not produced at {path}"),
                ));
            }

            outputs.insert(slot.clone(), Value::path(path));
        }

        Ok(outputs)
    }
}

/// Keeps at most `max` trailing bytes of `text`, cut at a char boundary.
fn tail(text: &str, max: usize) -> &str {
    let start = text.len().saturating_sub(max);
    let start = (start..text.len())
        .find(|&i| text.is_char_boundary(i))
        .unwrap_or(text.len());

    &text[start..]
}

type ActionFnPtr = Arc<dyn Fn(&Invocation) -> anyhow::Result<Outputs> + Send + Sync>;

/// What a task does when it runs.
#[derive(Clone)]
pub enum Action {
    Command(CommandTemplate),
    Function { key: ArcStr, func: ActionFnPtr },
}

impl Action {
    pub fn command(template: CommandTemplate) -> Self {
        Action::Command(template)
    }

    /// Wraps a callable. The `key` stands in for the callable's identity when
    /// fingerprinting, so two callables sharing a key must behave the same.
    pub fn function<F>(key: impl AsRef<str>, func: F) -> Self
    where
        F: Fn(&Invocation) -> anyhow::Result<Outputs> + Send + Sync + 'static,
    {
        Action::Function {
            key: key.as_ref().into(),
            func: Arc::new(func),
        }
    }
}

impl Hash for Action {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Action::Command(template) => {
                "command".hash(state);
                template.hash(state);
            }
            Action::Function { key, .. } => {
                "function".hash(state);
                key.hash(state);
            }
        }
    }
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Command(template) => write!(f, "Action::Command({})", template.program),
            Action::Function { key, .. } => write!(f, "Action::Function({key})"),
        }
    }
}

/// Everything an action gets to see when it runs.
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    pub task: &'a str,
    /// Resolved input values, in declaration order.
    pub inputs: &'a [(String, Value)],
    /// Declared output names, in declaration order.
    pub outputs: &'a [String],
    /// Directory reserved for this task's outputs.
    pub workspace: &'a Utf8Path,
}

impl<'a> Invocation<'a> {
    pub fn input(&self, name: &str) -> Option<&'a Value> {
        self.inputs
            .iter()
            .find(|(slot, _)| slot == name)
            .map(|(_, value)| value)
    }
}

/// Executes actions on behalf of the engine.
///
/// Implementations block until the action finishes and report either every
/// declared output or an [`ActionError`].
pub trait ActionRunner: Send + Sync {
    fn run(&self, action: &Action, invocation: &Invocation) -> Result<Outputs, ActionError>;
}

/// Runs commands as child processes and callables in place.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalRunner;

impl ActionRunner for LocalRunner {
    fn run(&self, action: &Action, invocation: &Invocation) -> Result<Outputs, ActionError> {
        match action {
            Action::Command(template) => template.run(invocation),
            Action::Function { func, .. } => {
                // A panicking callable only owns its own inputs, nothing shared
                // is left half-written.
                match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| func(invocation))) {
                    Ok(result) => result.map_err(ActionError::from),
                    Err(panic) => Err(ActionError::message(panic_message(panic))),
                }
            }
        }
    }
}

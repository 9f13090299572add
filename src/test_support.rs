//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, MutexGuard};

use crate::process::{CommandOutput, CommandRunner, CommandSpec, ProcessError};

/// Scripted command runner for deterministic, process-free tests.
///
/// Responses are chosen in this order: the first matching rule (rules match
/// when every fragment occurs in the space-joined command line), then the
/// FIFO queue, then, for a permissive runner, a bare success. A strict runner
/// with nothing left to answer reports a spawn failure.
///
/// The runner is `Send + Sync` so concurrent creation and deletion tasks can
/// share it.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    state: Arc<Mutex<ScriptState>>,
}

#[derive(Debug, Default)]
struct ScriptState {
    rules: Vec<Rule>,
    responses: VecDeque<CommandOutput>,
    delays: Vec<(Vec<String>, Duration)>,
    invocations: Vec<CommandInvocation>,
    permissive: bool,
}

#[derive(Debug)]
struct Rule {
    fragments: Vec<String>,
    output: CommandOutput,
    once: bool,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Extra environment passed to the program.
    pub env: Vec<(String, String)>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }

    /// Returns the value of an environment variable passed to the program.
    #[must_use]
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }

    fn matches(&self, fragments: &[impl AsRef<str>]) -> bool {
        let line = self.command_string();
        fragments
            .iter()
            .all(|fragment| line.contains(fragment.as_ref()))
    }
}

impl ScriptedRunner {
    /// Creates a strict runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a runner that answers unscripted commands with success.
    #[must_use]
    pub fn permissive() -> Self {
        let runner = Self::default();
        runner.lock().permissive = true;
        runner
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.lock().invocations.clone()
    }

    /// Returns the invocations whose command line contains every fragment.
    #[must_use]
    pub fn invocations_matching(&self, fragments: &[&str]) -> Vec<CommandInvocation> {
        self.lock()
            .invocations
            .iter()
            .filter(|invocation| invocation.matches(fragments))
            .cloned()
            .collect()
    }

    /// Counts invocations whose command line contains every fragment.
    #[must_use]
    pub fn count_matching(&self, fragments: &[&str]) -> usize {
        self.invocations_matching(fragments).len()
    }

    /// Answers every command containing all `fragments` with this output.
    pub fn on_command(
        &self,
        fragments: &[&str],
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.add_rule(fragments, code, stdout.into(), stderr.into(), false);
    }

    /// Answers the next command containing all `fragments` with this output.
    pub fn on_command_once(
        &self,
        fragments: &[&str],
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.add_rule(fragments, code, stdout.into(), stderr.into(), true);
    }

    /// Holds every command containing all `fragments` for `delay` before
    /// answering, as a slow provider call would.
    pub fn delay_command(&self, fragments: &[&str], delay: Duration) {
        self.lock().delays.push((
            fragments.iter().map(|fragment| (*fragment).to_owned()).collect(),
            delay,
        ));
    }

    fn add_rule(&self, fragments: &[&str], code: Option<i32>, stdout: String, stderr: String, once: bool) {
        self.lock().rules.push(Rule {
            fragments: fragments.iter().map(|fragment| (*fragment).to_owned()).collect(),
            output: CommandOutput {
                code,
                stdout,
                stderr,
            },
            once,
        });
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a specific exit code.
    pub fn push_exit_code(&self, code: i32) {
        self.push_output(Some(code), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.lock().responses.push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, command: &CommandSpec) -> Result<CommandOutput, ProcessError> {
        let invocation = CommandInvocation {
            program: command.program.clone(),
            args: command.args.clone(),
            env: command.env.clone(),
        };

        let delay = self
            .lock()
            .delays
            .iter()
            .find(|(fragments, _)| invocation.matches(fragments.as_slice()))
            .map(|(_, delay)| *delay);
        if let Some(pause) = delay {
            thread::sleep(pause);
        }

        let mut state = self.lock();
        let matched = state
            .rules
            .iter()
            .position(|rule| invocation.matches(rule.fragments.as_slice()));
        state.invocations.push(invocation);

        if let Some(position) = matched {
            let once = state.rules.get(position).is_some_and(|rule| rule.once);
            if once {
                return Ok(state.rules.remove(position).output);
            }
            if let Some(rule) = state.rules.get(position) {
                return Ok(rule.output.clone());
            }
        }

        if let Some(output) = state.responses.pop_front() {
            return Ok(output);
        }

        if state.permissive {
            return Ok(CommandOutput {
                code: Some(0),
                ..CommandOutput::default()
            });
        }

        Err(ProcessError::Spawn {
            program: command.program.clone(),
            message: String::from("no scripted response available"),
        })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets (`Some`) or removes (`None`) environment variables while holding
    /// a global mutex.
    pub async fn set_vars(pairs: &[(&str, Option<&str>)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe {
                match value {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}

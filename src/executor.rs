use crate::elevation::{wrap, ElevationMechanism, SESSION_EXIT};
use crate::error::TetherError;
use crate::shell::{SessionOutcome, SessionRequest, ShellRunner};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Outcome of one lifecycle operation, from either execution strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResult {
    /// Exit status of an elevated session.
    Exited(i32),
    TimedOut(Duration),
    /// The session program could not be started at all.
    SpawnFailed(String),
    /// Error string reported by the embedded service; empty means success.
    Reported(String),
}

impl CommandResult {
    pub fn succeeded(&self) -> bool {
        match self {
            Self::Exited(code) => *code == 0,
            Self::Reported(error) => error.is_empty(),
            Self::TimedOut(_) | Self::SpawnFailed(_) => false,
        }
    }

    /// Normalizes the outcome of `operation` into a single success/failure decision.
    pub fn into_result(self, operation: &str) -> Result<(), TetherError> {
        match self {
            Self::Exited(0) => Ok(()),
            Self::Exited(code) => Err(TetherError::SessionFailed(format!(
                "{operation}: session exited with status {code}"
            ))),
            Self::TimedOut(timeout) => Err(TetherError::SessionTimeout(timeout)),
            Self::SpawnFailed(message) => Err(TetherError::SessionFailed(format!(
                "{operation}: {message}"
            ))),
            Self::Reported(error) if error.is_empty() => Ok(()),
            Self::Reported(error) => Err(TetherError::EmbeddedService(error)),
        }
    }
}

/// Runs commands through one elevated session per call.
///
/// Only the session's own exit status is observed. A wrapped command that fails without
/// determining that status goes unnoticed, so callers put the decisive check last.
#[derive(Clone)]
pub struct ElevatedExecutor {
    runner: Arc<dyn ShellRunner>,
    timeout: Duration,
}

impl ElevatedExecutor {
    pub fn new(runner: Arc<dyn ShellRunner>, timeout: Duration) -> Self {
        Self { runner, timeout }
    }

    pub fn session_request(
        &self,
        mechanism: ElevationMechanism,
        commands: &[String],
    ) -> SessionRequest {
        let mut script: Vec<String> = commands.iter().map(|raw| wrap(mechanism, raw)).collect();
        script.push(SESSION_EXIT.to_string());
        SessionRequest {
            argv: mechanism.session_argv(),
            script,
            timeout: self.timeout,
        }
    }

    pub fn run(&self, mechanism: ElevationMechanism, commands: &[String]) -> CommandResult {
        let request = self.session_request(mechanism, commands);
        debug!(mechanism = %mechanism, lines = request.script.len(), "opening elevated session");
        let result = match self.runner.run(&request) {
            Ok(SessionOutcome::Exited { status_code }) => CommandResult::Exited(status_code),
            Ok(SessionOutcome::TimedOut) => CommandResult::TimedOut(self.timeout),
            Err(err) => CommandResult::SpawnFailed(format!(
                "failed to open `{}` session: {err}",
                request.render()
            )),
        };
        debug!(
            mechanism = %mechanism,
            succeeded = result.succeeded(),
            ?result,
            "elevated session finished"
        );
        result
    }
}

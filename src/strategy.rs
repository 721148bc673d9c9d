use crate::elevation::ElevationMechanism;
use crate::embedded::{EmbeddedService, PortForwarder};
use crate::error::{Result, TetherError};
use crate::executor::{CommandResult, ElevatedExecutor};
use serde::Serialize;
use std::path::PathBuf;

pub const CLIENT_ID: &str = "agent";
pub const TERMINAL_KIND: &str = "sh";

const SHELL_META: &[char] = &[
    '\'', '"', '`', ';', '&', '|', '$', '\\', '<', '>', '(', ')', '{', '}',
];

/// A remote address ends up unquoted inside elevated shell lines, so it must be one plain word.
pub fn check_remote(remote: &str) -> std::result::Result<(), String> {
    if remote.is_empty() {
        return Err("remote address must not be empty".to_string());
    }
    if let Some(bad) = remote
        .chars()
        .find(|c| c.is_whitespace() || c.is_control() || SHELL_META.contains(c))
    {
        return Err(format!("remote address contains forbidden character {bad:?}"));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Elevated,
    Embedded,
    Unavailable,
}

/// Capability set shared by both execution strategies.
pub trait ExecutionStrategy: Send {
    fn kind(&self) -> StrategyKind;
    /// Launches the agent, returning the local listen port when the strategy knows it.
    fn start(&mut self, remote: &str) -> Result<Option<u16>>;
    fn stop(&mut self) -> Result<()>;
    fn set_debug(&mut self, enabled: bool) -> Result<()>;
    fn detailed_status(&self) -> String;
}

/// Where the agent binary lives and how it is launched and found again.
#[derive(Debug, Clone)]
pub struct AgentLaunch {
    pub binary_path: PathBuf,
    pub liveness_delay_secs: u64,
}

impl AgentLaunch {
    pub fn process_name(&self) -> String {
        self.binary_path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| self.binary_path.to_string_lossy().to_string())
    }

    /// `pgrep`/`pkill` pattern for the agent. The bracketed first character keeps the pattern
    /// from matching the command line of the wrapper that carries it.
    pub fn process_pattern(&self) -> String {
        let name = self.process_name();
        let mut chars = name.chars();
        match chars.next() {
            Some(first) if first.is_ascii_alphanumeric() => {
                format!("'[{first}]{}'", chars.as_str())
            }
            _ => format!("'{name}'"),
        }
    }

    pub fn launch_command(&self, remote: &str) -> String {
        format!(
            "{} --name={CLIENT_ID} --remote={remote} --terminal={TERMINAL_KIND} --auto-exit=false",
            self.binary_path.display()
        )
    }

    /// Diagnostic preamble, background launch, then the liveness check that decides the
    /// session's exit status.
    pub fn start_script(&self, mechanism: ElevationMechanism, remote: &str) -> Vec<String> {
        vec![
            "echo '=== agent start (elevated) ==='".to_string(),
            format!("echo 'elevation: {mechanism}'"),
            format!("echo 'binary: {}'", self.binary_path.display()),
            format!("echo 'remote: {remote}'"),
            format!("{} > /dev/null 2>&1 &", self.launch_command(remote)),
            format!("sleep {}", self.liveness_delay_secs),
            format!("pgrep -f {} > /dev/null", self.process_pattern()),
        ]
    }

    pub fn stop_script(&self) -> Vec<String> {
        vec![format!("pkill -f {}", self.process_pattern())]
    }
}

/// Property writes and adbd restart that toggle network debugging.
pub fn debug_script(enabled: bool, port: u16) -> Vec<String> {
    let value = if enabled {
        port.to_string()
    } else {
        "-1".to_string()
    };
    vec![
        format!("setprop service.adb.tcp.port {value}"),
        format!("setprop persist.adb.tcp.port {value}"),
        "stop adbd".to_string(),
        "start adbd".to_string(),
    ]
}

pub struct ElevatedStrategy {
    mechanism: ElevationMechanism,
    executor: ElevatedExecutor,
    agent: AgentLaunch,
    debug_port: u16,
}

impl ElevatedStrategy {
    pub fn new(
        mechanism: ElevationMechanism,
        executor: ElevatedExecutor,
        agent: AgentLaunch,
        debug_port: u16,
    ) -> Self {
        Self {
            mechanism,
            executor,
            agent,
            debug_port,
        }
    }
}

impl ExecutionStrategy for ElevatedStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Elevated
    }

    fn start(&mut self, remote: &str) -> Result<Option<u16>> {
        let script = self.agent.start_script(self.mechanism, remote);
        self.executor
            .run(self.mechanism, &script)
            .into_result("start")?;
        Ok(None)
    }

    fn stop(&mut self) -> Result<()> {
        let script = self.agent.stop_script();
        self.executor.run(self.mechanism, &script).into_result("stop")
    }

    fn set_debug(&mut self, enabled: bool) -> Result<()> {
        let script = debug_script(enabled, self.debug_port);
        let operation = if enabled { "enable debug" } else { "disable debug" };
        self.executor
            .run(self.mechanism, &script)
            .into_result(operation)
    }

    fn detailed_status(&self) -> String {
        format!(
            "elevated via {}\nagent binary: {}\nprocess pattern: {}",
            self.mechanism,
            self.agent.binary_path.display(),
            self.agent.process_pattern()
        )
    }
}

pub struct EmbeddedStrategy {
    service: Box<dyn EmbeddedService>,
    forwarder: Box<dyn PortForwarder>,
    password: String,
}

impl EmbeddedStrategy {
    pub fn new(
        service: Box<dyn EmbeddedService>,
        forwarder: Box<dyn PortForwarder>,
        password: String,
    ) -> Self {
        Self {
            service,
            forwarder,
            password,
        }
    }
}

impl ExecutionStrategy for EmbeddedStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Embedded
    }

    fn start(&mut self, remote: &str) -> Result<Option<u16>> {
        let error = self
            .service
            .start_service(CLIENT_ID, remote, TERMINAL_KIND, &self.password);
        CommandResult::Reported(error).into_result("start")?;
        let port = u16::try_from(self.service.local_port())
            .ok()
            .filter(|port| *port > 0);
        Ok(port)
    }

    fn stop(&mut self) -> Result<()> {
        CommandResult::Reported(self.service.stop_service()).into_result("stop")
    }

    fn set_debug(&mut self, enabled: bool) -> Result<()> {
        let outcome = if enabled {
            self.forwarder.start_forward().map(|_| ())
        } else {
            self.forwarder.stop_forward()
        };
        outcome.map_err(TetherError::EmbeddedService)
    }

    fn detailed_status(&self) -> String {
        self.service.detailed_status()
    }
}

/// Stands in when the elevated strategy is required but no mechanism was detected.
pub struct UnavailableStrategy;

impl UnavailableStrategy {
    fn error() -> TetherError {
        TetherError::ElevationUnavailable(
            "elevated execution requested but no elevation mechanism was detected".to_string(),
        )
    }
}

impl ExecutionStrategy for UnavailableStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Unavailable
    }

    fn start(&mut self, _remote: &str) -> Result<Option<u16>> {
        Err(Self::error())
    }

    fn stop(&mut self) -> Result<()> {
        Err(Self::error())
    }

    fn set_debug(&mut self, _enabled: bool) -> Result<()> {
        Err(Self::error())
    }

    fn detailed_status(&self) -> String {
        "no elevation mechanism available".to_string()
    }
}

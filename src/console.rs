//! Line-oriented operator console over a [`ControllerHandle`].

use crate::error::{Result, TetherError};
use crate::worker::{ControllerHandle, LifecycleEvent};
use std::io::{BufRead, Write};
use std::sync::mpsc::Receiver;
use std::thread::{self, JoinHandle};

const HELP: &str = "commands:
  detect              probe for an elevation mechanism
  start [remote]      launch the agent (blank remote uses the configured default)
  stop                stop the agent
  debug on|off        toggle network debugging
  status              print the current status
  help                show this message
  quit                leave the console";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Detect,
    Start(Option<String>),
    Stop,
    Debug(bool),
    Status,
    Help,
    Quit,
}

pub fn parse_line(line: &str) -> std::result::Result<Option<ConsoleCommand>, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let rest: Vec<&str> = words.collect();
    let command = match (verb, rest.as_slice()) {
        ("detect", []) => ConsoleCommand::Detect,
        ("start", []) => ConsoleCommand::Start(None),
        ("start", [remote]) => ConsoleCommand::Start(Some(remote.to_string())),
        ("stop", []) => ConsoleCommand::Stop,
        ("debug", ["on"]) => ConsoleCommand::Debug(true),
        ("debug", ["off"]) => ConsoleCommand::Debug(false),
        ("status", []) => ConsoleCommand::Status,
        ("help", []) => ConsoleCommand::Help,
        ("quit", []) | ("exit", []) => ConsoleCommand::Quit,
        _ => return Err(format!("unrecognized command: {}", line.trim())),
    };
    Ok(Some(command))
}

pub fn describe_event(event: &LifecycleEvent) -> String {
    match event {
        LifecycleEvent::ElevationDetected { label, .. } => format!("[event] elevation {label}"),
        LifecycleEvent::StateChanged { state } => format!(
            "[event] agent {}, debug {}",
            if state.running { "running" } else { "stopped" },
            if state.debug_enabled { "enabled" } else { "disabled" }
        ),
        LifecycleEvent::OperationFailed {
            operation,
            kind,
            message,
        } => format!("[event] {operation} failed ({kind}): {message}"),
    }
}

/// Prints every event on its own thread until the worker goes away.
pub fn spawn_event_printer(events: Receiver<LifecycleEvent>) -> Result<JoinHandle<()>> {
    let join = thread::Builder::new()
        .name("tether-events".to_string())
        .spawn(move || {
            for event in events {
                println!("{}", describe_event(&event));
            }
        })?;
    Ok(join)
}

pub struct Console<'a> {
    handle: &'a ControllerHandle,
    default_remote: String,
}

impl<'a> Console<'a> {
    pub fn new(handle: &'a ControllerHandle, default_remote: String) -> Self {
        Self {
            handle,
            default_remote,
        }
    }

    /// Reads commands from `input` until `quit` or end of input. Operation failures are
    /// printed and the session continues; only worker loss ends it early.
    pub fn run<R: BufRead, W: Write>(&self, input: R, mut out: W) -> Result<()> {
        writeln!(out, "tether console; type `help` for commands")?;
        for line in input.lines() {
            let line = line?;
            let command = match parse_line(&line) {
                Ok(Some(command)) => command,
                Ok(None) => continue,
                Err(message) => {
                    writeln!(out, "{message}")?;
                    continue;
                }
            };
            if command == ConsoleCommand::Quit {
                break;
            }
            match self.execute(command) {
                Ok(text) => writeln!(out, "{text}")?,
                Err(err @ TetherError::Worker(_)) => return Err(err),
                Err(err) => writeln!(out, "error [{}]: {err}", err.kind())?,
            }
            out.flush()?;
        }
        Ok(())
    }

    fn execute(&self, command: ConsoleCommand) -> Result<String> {
        match command {
            ConsoleCommand::Detect => Ok(format!("elevation: {}", self.handle.detect()?.label())),
            ConsoleCommand::Start(remote) => {
                let remote = match remote {
                    Some(remote) => remote,
                    None => self.default_remote.clone(),
                };
                let state = self.handle.start(&remote)?;
                Ok(match state.listen_port {
                    Some(port) => format!(
                        "agent running ({}, local port {port})",
                        state.remote_address
                    ),
                    None => format!("agent running ({})", state.remote_address),
                })
            }
            ConsoleCommand::Stop => {
                self.handle.stop()?;
                Ok("agent stopped".to_string())
            }
            ConsoleCommand::Debug(enabled) => {
                self.handle.set_debug(enabled)?;
                Ok(format!(
                    "debug {}",
                    if enabled { "enabled" } else { "disabled" }
                ))
            }
            ConsoleCommand::Status => Ok(self.handle.status()?.render()),
            ConsoleCommand::Help => Ok(HELP.to_string()),
            ConsoleCommand::Quit => Ok(String::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StrategyPreference;
    use crate::controller::tests::{build, FakeForwarder, FakeService};
    use crate::controller::ServiceLifecycleState;
    use crate::elevation::ElevationMechanism;
    use crate::shell::fake::ScriptedShell;
    use crate::shell::SessionOutcome;
    use crate::worker::spawn;
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    fn handle(log: Arc<Mutex<Vec<String>>>, forward_fails: bool) -> ControllerHandle {
        let shell = Arc::new(ScriptedShell::new(|_| {
            Ok(SessionOutcome::Exited { status_code: 1 })
        }));
        let controller = build(
            shell,
            ElevationMechanism::PRIORITY.to_vec(),
            FakeService::new(log.clone()),
            FakeForwarder {
                log,
                fail: forward_fails,
            },
            StrategyPreference::Auto,
        );
        spawn(controller).unwrap().0
    }

    fn run(script: &str, log: Arc<Mutex<Vec<String>>>, forward_fails: bool) -> String {
        let handle = handle(log, forward_fails);
        let console = Console::new(&handle, "https://default".to_string());
        let mut out = Vec::new();
        console.run(Cursor::new(script), &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn parses_console_grammar() {
        assert_eq!(parse_line("  "), Ok(None));
        assert_eq!(
            parse_line("start https://host"),
            Ok(Some(ConsoleCommand::Start(Some("https://host".to_string()))))
        );
        assert_eq!(parse_line("debug off"), Ok(Some(ConsoleCommand::Debug(false))));
        assert!(parse_line("debug maybe").is_err());
        assert!(parse_line("launch").is_err());
    }

    #[test]
    fn session_runs_until_quit() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let text = run(
            "detect\nstart https://host\ndebug on\nstatus\nquit\nstop\n",
            log.clone(),
            false,
        );
        assert!(text.contains("elevation: probe_inconclusive"));
        assert!(text.contains("agent running (https://host, local port 8080)"));
        assert!(text.contains("debug enabled"));
        assert!(text.contains("agent: running"));
        assert!(!text.contains("agent stopped"));
        assert_eq!(
            log.lock().unwrap().as_slice(),
            ["start_service(agent,https://host,sh,)", "start_forward"]
        );
    }

    #[test]
    fn blank_start_uses_default_remote() {
        let log = Arc::new(Mutex::new(Vec::new()));
        run("start\n", log.clone(), false);
        assert_eq!(
            log.lock().unwrap().as_slice(),
            ["start_service(agent,https://default,sh,)"]
        );
    }

    #[test]
    fn failures_are_printed_and_session_continues() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let text = run("debug on\nbogus\nhelp\n", log, true);
        assert!(text.contains(
            "error [embedded_service_error]: embedded service error: unable to determine debug port"
        ));
        assert!(text.contains("unrecognized command: bogus"));
        assert!(text.contains("debug on|off"));
    }

    #[test]
    fn describes_events() {
        let state = ServiceLifecycleState {
            running: true,
            ..ServiceLifecycleState::default()
        };
        assert_eq!(
            describe_event(&LifecycleEvent::StateChanged { state }),
            "[event] agent running, debug disabled"
        );
    }
}

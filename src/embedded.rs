//! Non-privileged execution: the embedded service boundary and its bundled implementations.
//!
//! The boundary speaks in error strings: an empty string is success.

use crate::shell::exit_code;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

pub const PORT_PROPERTY: &str = "service.adb.tcp.port";

pub trait EmbeddedService: Send {
    fn start_service(
        &mut self,
        client_name: &str,
        remote: &str,
        terminal: &str,
        password: &str,
    ) -> String;
    fn stop_service(&mut self) -> String;
    fn detailed_status(&self) -> String;
    fn local_port(&self) -> i64;
}

/// Forwards the device debug port on the non-privileged path.
pub trait PortForwarder: Send {
    /// Returns the port now being forwarded.
    fn start_forward(&mut self) -> Result<u16, String>;
    fn stop_forward(&mut self) -> Result<(), String>;
}

/// First port in `[start, start + len)` that accepts a local bind, or `start` if none does.
pub fn find_available_port(start: u16, len: u16) -> u16 {
    (0..len)
        .filter_map(|offset| start.checked_add(offset))
        .find(|port| TcpListener::bind(("127.0.0.1", *port)).is_ok())
        .unwrap_or(start)
}

struct RunningAgent {
    child: Child,
    client_name: String,
    remote: String,
    terminal: String,
    authenticated: bool,
    port: u16,
}

/// Runs the agent binary as an unprivileged child process.
///
/// Agent output goes to `log_path` rather than to pipes read by this process, so the agent keeps
/// running after a one-shot CLI invocation exits.
pub struct LocalAgentService {
    binary_path: PathBuf,
    log_path: PathBuf,
    port_range_start: u16,
    port_range_len: u16,
    startup_grace: Duration,
    running: Option<RunningAgent>,
}

fn open_log(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

impl LocalAgentService {
    pub fn new(
        binary_path: PathBuf,
        log_path: PathBuf,
        port_range_start: u16,
        port_range_len: u16,
        startup_grace: Duration,
    ) -> Self {
        Self {
            binary_path,
            log_path,
            port_range_start,
            port_range_len,
            startup_grace,
            running: None,
        }
    }

    fn reap_exited(&mut self) {
        let exited = match self.running.as_mut() {
            Some(agent) => matches!(agent.child.try_wait(), Ok(Some(_))),
            None => false,
        };
        if exited {
            debug!("previous agent process has exited");
            self.running = None;
        }
    }
}

impl EmbeddedService for LocalAgentService {
    fn start_service(
        &mut self,
        client_name: &str,
        remote: &str,
        terminal: &str,
        password: &str,
    ) -> String {
        self.reap_exited();
        if self.running.is_some() {
            return "service is already running".to_string();
        }
        if client_name.is_empty() {
            return "client name must not be empty".to_string();
        }
        if remote.is_empty() {
            return "remote server address must not be empty".to_string();
        }
        if !self.binary_path.is_file() {
            return format!("agent binary not found at {}", self.binary_path.display());
        }

        let log = open_log(&self.log_path).and_then(|log| Ok((log.try_clone()?, log)));
        let (stdout, stderr) = match log {
            Ok(pair) => pair,
            Err(err) => {
                return format!("cannot open agent log {}: {err}", self.log_path.display());
            }
        };

        let port = find_available_port(self.port_range_start, self.port_range_len);
        let mut cmd = Command::new(&self.binary_path);
        cmd.arg(format!("--name={client_name}"))
            .arg(format!("--remote={remote}"))
            .arg(format!("--terminal={terminal}"))
            .arg("--auto-exit=false")
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        if !password.is_empty() {
            cmd.arg(format!("--pass={password}"));
        }
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => return format!("failed to launch agent: {err}"),
        };
        thread::sleep(self.startup_grace);
        match child.try_wait() {
            Ok(Some(status)) => {
                return format!(
                    "agent exited during startup with status {}",
                    exit_code(status)
                );
            }
            Ok(None) => {}
            Err(err) => {
                let _ = child.kill();
                return format!("failed to poll agent process: {err}");
            }
        }

        info!(
            pid = child.id(),
            port,
            remote,
            log = %self.log_path.display(),
            "local agent started"
        );
        self.running = Some(RunningAgent {
            child,
            client_name: client_name.to_string(),
            remote: remote.to_string(),
            terminal: terminal.to_string(),
            authenticated: !password.is_empty(),
            port,
        });
        String::new()
    }

    fn stop_service(&mut self) -> String {
        let Some(mut agent) = self.running.take() else {
            return "service is not running".to_string();
        };
        if let Err(err) = agent.child.kill() {
            let message = format!("failed to stop agent: {err}");
            self.running = Some(agent);
            return message;
        }
        let _ = agent.child.wait();
        info!("local agent stopped");
        String::new()
    }

    fn detailed_status(&self) -> String {
        match &self.running {
            None => "service is not running".to_string(),
            Some(agent) => format!(
                "service is running\nclient name: {}\nremote server: {}\nlocal port: {}\nterminal: {}\nauthentication: {}",
                agent.client_name,
                agent.remote,
                agent.port,
                agent.terminal,
                if agent.authenticated { "enabled" } else { "disabled" }
            ),
        }
    }

    fn local_port(&self) -> i64 {
        self.running
            .as_ref()
            .map(|agent| i64::from(agent.port))
            .unwrap_or(0)
    }
}

type PropertyReader = Box<dyn Fn(&str) -> Option<String> + Send>;

/// Resolves the device debug port and forwards it under a named endpoint.
///
/// The transport carrying the forward lives outside this crate; this type owns the port
/// resolution and the bookkeeping.
pub struct DebugPortForwarder {
    default_port: u16,
    endpoint: String,
    read_property: PropertyReader,
    active: Option<u16>,
}

impl DebugPortForwarder {
    pub fn new(default_port: u16, endpoint: String) -> Self {
        Self::with_reader(default_port, endpoint, Box::new(read_system_property))
    }

    pub fn with_reader(default_port: u16, endpoint: String, read_property: PropertyReader) -> Self {
        Self {
            default_port,
            endpoint,
            read_property,
            active: None,
        }
    }

    fn debug_port(&self) -> Result<u16, String> {
        let Some(value) = (self.read_property)(PORT_PROPERTY) else {
            return Ok(self.default_port);
        };
        let value = value.trim();
        if value.is_empty() {
            return Ok(self.default_port);
        }
        match value.parse::<i64>() {
            Ok(port) if port > 0 && port <= i64::from(u16::MAX) => Ok(port as u16),
            Ok(_) => Err("unable to determine debug port".to_string()),
            Err(_) => Ok(self.default_port),
        }
    }
}

impl PortForwarder for DebugPortForwarder {
    fn start_forward(&mut self) -> Result<u16, String> {
        let port = self.debug_port()?;
        info!(port, endpoint = %self.endpoint, "forwarding debug port");
        self.active = Some(port);
        Ok(port)
    }

    fn stop_forward(&mut self) -> Result<(), String> {
        if let Some(port) = self.active.take() {
            info!(port, endpoint = %self.endpoint, "debug port forward stopped");
        }
        Ok(())
    }
}

fn read_system_property(name: &str) -> Option<String> {
    let output = Command::new("getprop").arg(name).output().ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .map(|line| line.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forwarder(value: Option<&'static str>) -> DebugPortForwarder {
        DebugPortForwarder::with_reader(
            5555,
            "agent-adb".to_string(),
            Box::new(move |_: &str| value.map(|v| v.to_string())),
        )
    }

    #[test]
    fn debug_port_falls_back_to_default() {
        assert_eq!(forwarder(None).start_forward(), Ok(5555));
        assert_eq!(forwarder(Some("")).start_forward(), Ok(5555));
        assert_eq!(forwarder(Some("7001\n")).start_forward(), Ok(7001));
    }

    #[test]
    fn disabled_debug_port_is_an_error() {
        let err = forwarder(Some("-1")).start_forward().unwrap_err();
        assert_eq!(err, "unable to determine debug port");
    }

    #[test]
    fn stop_forward_is_idempotent() {
        let mut fwd = forwarder(None);
        assert!(fwd.stop_forward().is_ok());
        fwd.start_forward().unwrap();
        assert!(fwd.stop_forward().is_ok());
        assert!(fwd.active.is_none());
    }

    #[test]
    fn available_port_skips_bound_ports() {
        let held = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = held.local_addr().unwrap().port();
        let found = find_available_port(port, 1);
        // Only candidate is taken, so the range start comes back.
        assert_eq!(found, port);
        drop(held);
        assert!(TcpListener::bind(("127.0.0.1", find_available_port(port, 1))).is_ok());
    }

    #[test]
    fn idle_service_reports_not_running() {
        let mut service = LocalAgentService::new(
            PathBuf::from("/nonexistent/agent"),
            PathBuf::from("/nonexistent/agent.log"),
            8080,
            100,
            Duration::from_millis(10),
        );
        assert_eq!(service.stop_service(), "service is not running");
        assert_eq!(service.detailed_status(), "service is not running");
        assert_eq!(service.local_port(), 0);
    }

    #[test]
    fn start_validates_arguments() {
        let mut service = LocalAgentService::new(
            PathBuf::from("/nonexistent/agent"),
            PathBuf::from("/nonexistent/agent.log"),
            8080,
            100,
            Duration::from_millis(10),
        );
        assert_eq!(
            service.start_service("", "https://host", "sh", ""),
            "client name must not be empty"
        );
        assert_eq!(
            service.start_service("agent", "", "sh", ""),
            "remote server address must not be empty"
        );
        assert!(service
            .start_service("agent", "https://host", "sh", "")
            .starts_with("agent binary not found"));
    }

    #[cfg(unix)]
    mod process {
        use super::super::*;
        use std::fs;
        use std::os::unix::fs::PermissionsExt;
        use std::path::Path;
        use tempfile::tempdir;

        fn write_agent(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("agent");
            fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        #[test]
        fn start_and_stop_long_running_agent() {
            let dir = tempdir().unwrap();
            let binary = write_agent(dir.path(), "echo \"started $1\"\nexec sleep 30");
            let log_path = dir.path().join("logs/agent.log");
            let mut service = LocalAgentService::new(
                binary,
                log_path.clone(),
                20080,
                100,
                Duration::from_millis(100),
            );

            assert_eq!(service.start_service("agent", "https://host", "sh", "pw"), "");
            assert!(service.local_port() >= 20080);
            let status = service.detailed_status();
            assert!(status.contains("remote server: https://host"));
            assert!(status.contains("authentication: enabled"));
            assert_eq!(
                service.start_service("agent", "https://host", "sh", ""),
                "service is already running"
            );

            assert_eq!(service.stop_service(), "");
            assert_eq!(service.local_port(), 0);
            assert_eq!(service.stop_service(), "service is not running");

            let log = fs::read_to_string(&log_path).unwrap();
            assert!(log.contains("started --name=agent"));
        }

        #[test]
        fn unwritable_log_path_is_reported() {
            let dir = tempdir().unwrap();
            let binary = write_agent(dir.path(), "exec sleep 30");
            let blocker = dir.path().join("file");
            fs::write(&blocker, "").unwrap();
            let mut service = LocalAgentService::new(
                binary,
                blocker.join("agent.log"),
                20080,
                100,
                Duration::from_millis(100),
            );
            let error = service.start_service("agent", "https://host", "sh", "");
            assert!(error.starts_with("cannot open agent log"), "{error}");
            assert_eq!(service.local_port(), 0);
        }

        #[test]
        fn agent_exiting_during_startup_is_reported() {
            let dir = tempdir().unwrap();
            let binary = write_agent(dir.path(), "exit 3");
            let mut service = LocalAgentService::new(
                binary,
                dir.path().join("agent.log"),
                20080,
                100,
                Duration::from_millis(300),
            );
            let error = service.start_service("agent", "https://host", "sh", "");
            assert_eq!(error, "agent exited during startup with status 3");
            assert_eq!(service.local_port(), 0);
        }
    }
}

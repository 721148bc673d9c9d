use std::io::{self, BufRead, BufReader, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// One spawned process plus the lines fed to its stdin.
///
/// An empty `script` means the process is invoked directly with stdin closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    pub argv: Vec<String>,
    pub script: Vec<String>,
    pub timeout: Duration,
}

impl SessionRequest {
    pub fn render(&self) -> String {
        self.argv.join(" ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Exited { status_code: i32 },
    TimedOut,
}

impl SessionOutcome {
    pub fn success(&self) -> bool {
        matches!(self, Self::Exited { status_code: 0 })
    }
}

pub trait ShellRunner: Send + Sync {
    fn run(&self, request: &SessionRequest) -> Result<SessionOutcome, io::Error>;
}

pub struct SystemShell;

impl ShellRunner for SystemShell {
    fn run(&self, request: &SessionRequest) -> Result<SessionOutcome, io::Error> {
        let (program, args) = request.argv.split_first().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "empty session command line")
        })?;
        let resolved = which::which(program).map_err(|err| {
            io::Error::new(io::ErrorKind::NotFound, format!("{program}: {err}"))
        })?;

        let mut cmd = Command::new(resolved);
        cmd.args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if request.script.is_empty() {
                Stdio::null()
            } else {
                Stdio::piped()
            });
        let mut child = cmd.spawn()?;
        debug!(command = %request.render(), pid = child.id(), "session spawned");

        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, "stderr");
        }

        if let Some(mut stdin) = child.stdin.take() {
            for line in &request.script {
                let written = writeln!(stdin, "{line}").and_then(|_| stdin.flush());
                match written {
                    Ok(()) => {}
                    Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
                        debug!(command = %request.render(), "session closed stdin early");
                        break;
                    }
                    Err(err) => {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(err);
                    }
                }
            }
        }

        match wait_with_deadline(&mut child, request.timeout)? {
            Some(status) => Ok(SessionOutcome::Exited {
                status_code: exit_code(status),
            }),
            None => {
                warn!(
                    command = %request.render(),
                    timeout_ms = request.timeout.as_millis() as u64,
                    "session timed out; abandoning process"
                );
                let _ = child.kill();
                let _ = child.try_wait();
                Ok(SessionOutcome::TimedOut)
            }
        }
    }
}

/// Polls `child` until it exits or `timeout` elapses. `None` means the deadline passed.
pub fn wait_with_deadline(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if start.elapsed() >= timeout {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

pub fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(if status.success() { 0 } else { 1 })
}

// Reader threads are detached: a backgrounded grandchild may keep the pipe open after the
// session exits.
fn forward_output<R: Read + Send + 'static>(stream: R, name: &'static str) {
    thread::spawn(move || {
        for line in BufReader::new(stream).lines() {
            match line {
                Ok(line) => debug!(target: "tether::session", stream = name, "{line}"),
                Err(_) => break,
            }
        }
    });
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::sync::Mutex;

    type Responder = Box<dyn Fn(&SessionRequest) -> Result<SessionOutcome, io::Error> + Send + Sync>;

    /// Records every request and answers through a caller-supplied closure.
    pub struct ScriptedShell {
        calls: Mutex<Vec<SessionRequest>>,
        respond: Responder,
    }

    impl ScriptedShell {
        pub fn new<F>(respond: F) -> Self
        where
            F: Fn(&SessionRequest) -> Result<SessionOutcome, io::Error> + Send + Sync + 'static,
        {
            Self {
                calls: Mutex::new(Vec::new()),
                respond: Box::new(respond),
            }
        }

        pub fn succeeding() -> Self {
            Self::new(|_| Ok(SessionOutcome::Exited { status_code: 0 }))
        }

        pub fn calls(&self) -> Vec<SessionRequest> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ShellRunner for ScriptedShell {
        fn run(&self, request: &SessionRequest) -> Result<SessionOutcome, io::Error> {
            self.calls.lock().unwrap().push(request.clone());
            (self.respond)(request)
        }
    }
}

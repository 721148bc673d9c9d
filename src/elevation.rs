//! Elevation mechanisms, their command grammars, and detection of the usable one.
//!
//! Candidates are probed in priority order and the first one whose probe exits cleanly wins.

use crate::shell::{SessionRequest, ShellRunner};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Command that closes an interactive elevated session.
pub const SESSION_EXIT: &str = "exit";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ElevationMechanism {
    Suks,
    Su,
    Sudo,
    Pksu,
}

/// How a mechanism is probed: either by writing a line into its session shell, or by invoking a
/// command line directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeForm {
    Session(String),
    Direct(Vec<String>),
}

impl ElevationMechanism {
    /// Default candidate order, highest priority first.
    pub const PRIORITY: [ElevationMechanism; 4] = [Self::Suks, Self::Su, Self::Sudo, Self::Pksu];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Suks => "suks",
            Self::Su => "su",
            Self::Sudo => "sudo",
            Self::Pksu => "pksu",
        }
    }

    /// Program hosting an elevated session. Only `su` yields a privileged shell by itself; the
    /// others run in a plain shell and elevate each wrapped line.
    pub fn session_argv(&self) -> Vec<String> {
        match self {
            Self::Su => vec!["su".to_string()],
            Self::Suks | Self::Sudo | Self::Pksu => vec!["sh".to_string()],
        }
    }

    /// Adds this mechanism's elevation envelope around an already valid shell command.
    pub fn wrap(&self, raw: &str) -> String {
        match self {
            Self::Su => raw.to_string(),
            Self::Sudo => format!("sudo {raw}"),
            Self::Pksu => format!("pksu -c \"{raw}\""),
            Self::Suks => format!("suks root {raw}"),
        }
    }

    pub fn probe_form(&self) -> ProbeForm {
        match self {
            Self::Su => ProbeForm::Session("id".to_string()),
            // -n keeps sudo from waiting on a password prompt.
            Self::Sudo => ProbeForm::Session("sudo -n id".to_string()),
            Self::Pksu => ProbeForm::Session(self.wrap("id")),
            Self::Suks => ProbeForm::Direct(vec![
                "suks".to_string(),
                "root".to_string(),
                "id".to_string(),
            ]),
        }
    }

    pub fn probe_request(&self, timeout: Duration) -> SessionRequest {
        match self.probe_form() {
            ProbeForm::Session(line) => SessionRequest {
                argv: self.session_argv(),
                script: vec![line, SESSION_EXIT.to_string()],
                timeout,
            },
            ProbeForm::Direct(argv) => SessionRequest {
                argv,
                script: Vec::new(),
                timeout,
            },
        }
    }
}

impl fmt::Display for ElevationMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Renders `raw` into the concrete invocation for `mechanism`.
pub fn wrap(mechanism: ElevationMechanism, raw: &str) -> String {
    mechanism.wrap(raw)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ElevationState {
    pub mechanism: Option<ElevationMechanism>,
    pub detected: bool,
}

impl ElevationState {
    pub fn granted(mechanism: ElevationMechanism) -> Self {
        Self {
            mechanism: Some(mechanism),
            detected: true,
        }
    }

    pub fn inconclusive() -> Self {
        Self {
            mechanism: None,
            detected: false,
        }
    }

    pub fn label(&self) -> String {
        match self.mechanism {
            Some(mechanism) => format!("granted ({mechanism})"),
            None => "probe_inconclusive".to_string(),
        }
    }
}

pub struct ElevationProbe {
    runner: Arc<dyn ShellRunner>,
    candidates: Vec<ElevationMechanism>,
    timeout: Duration,
}

impl ElevationProbe {
    pub fn new(
        runner: Arc<dyn ShellRunner>,
        candidates: Vec<ElevationMechanism>,
        timeout: Duration,
    ) -> Self {
        Self {
            runner,
            candidates,
            timeout,
        }
    }

    pub fn candidates(&self) -> &[ElevationMechanism] {
        &self.candidates
    }

    pub fn detect(&self) -> ElevationState {
        for mechanism in &self.candidates {
            if self.probe(*mechanism) {
                info!(mechanism = %mechanism, "elevation mechanism available");
                return ElevationState::granted(*mechanism);
            }
        }
        info!("no elevation mechanism available");
        ElevationState::inconclusive()
    }

    fn probe(&self, mechanism: ElevationMechanism) -> bool {
        let request = mechanism.probe_request(self.timeout);
        match self.runner.run(&request) {
            Ok(outcome) if outcome.success() => true,
            Ok(outcome) => {
                debug!(mechanism = %mechanism, ?outcome, "elevation probe failed");
                false
            }
            Err(err) => {
                debug!(mechanism = %mechanism, error = %err, "elevation probe could not run");
                false
            }
        }
    }
}

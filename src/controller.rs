//! Lifecycle orchestration across the elevated and embedded strategies.
//!
//! State moves only after the active strategy reports success. A failed operation leaves
//! [`ServiceLifecycleState`] exactly as it was.

use crate::config::{Config, StrategyPreference};
use crate::elevation::{ElevationProbe, ElevationState};
use crate::embedded::{DebugPortForwarder, LocalAgentService};
use crate::error::{Result, TetherError};
use crate::executor::ElevatedExecutor;
use crate::shell::{ShellRunner, SystemShell};
use crate::strategy::{
    check_remote, AgentLaunch, ElevatedStrategy, EmbeddedStrategy, ExecutionStrategy,
    StrategyKind, UnavailableStrategy,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServiceLifecycleState {
    pub running: bool,
    pub debug_enabled: bool,
    pub remote_address: String,
    pub listen_port: Option<u16>,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub lifecycle: ServiceLifecycleState,
    pub elevation: ElevationState,
    pub elevation_label: String,
    pub strategy: StrategyKind,
    pub detail: String,
}

impl StatusReport {
    pub fn render(&self) -> String {
        let mut text = String::new();
        let _ = writeln!(
            text,
            "agent: {}",
            if self.lifecycle.running { "running" } else { "stopped" }
        );
        let _ = writeln!(
            text,
            "debug: {}",
            if self.lifecycle.debug_enabled { "enabled" } else { "disabled" }
        );
        let _ = writeln!(text, "elevation: {}", self.elevation_label);
        let _ = writeln!(text, "strategy: {}", strategy_label(self.strategy));
        if !self.lifecycle.remote_address.is_empty() {
            let _ = writeln!(text, "remote: {}", self.lifecycle.remote_address);
        }
        if let Some(port) = self.lifecycle.listen_port {
            let _ = writeln!(text, "local port: {port}");
        }
        text.push_str(&self.detail);
        text
    }
}

pub fn strategy_label(kind: StrategyKind) -> &'static str {
    match kind {
        StrategyKind::Elevated => "elevated",
        StrategyKind::Embedded => "embedded",
        StrategyKind::Unavailable => "unavailable",
    }
}

pub struct ServiceController {
    probe: ElevationProbe,
    executor: ElevatedExecutor,
    agent: AgentLaunch,
    debug_port: u16,
    preference: StrategyPreference,
    elevation: ElevationState,
    elevated: Option<ElevatedStrategy>,
    embedded: EmbeddedStrategy,
    unavailable: UnavailableStrategy,
    state: ServiceLifecycleState,
}

impl ServiceController {
    pub fn new(
        probe: ElevationProbe,
        executor: ElevatedExecutor,
        agent: AgentLaunch,
        debug_port: u16,
        preference: StrategyPreference,
        embedded: EmbeddedStrategy,
    ) -> Self {
        Self {
            probe,
            executor,
            agent,
            debug_port,
            preference,
            elevation: ElevationState::inconclusive(),
            elevated: None,
            embedded,
            unavailable: UnavailableStrategy,
            state: ServiceLifecycleState::default(),
        }
    }

    /// Wires the controller to the real shell, the local agent service, and the debug port
    /// forwarder described by `cfg`.
    pub fn from_config(cfg: &Config) -> Self {
        let runner: Arc<dyn ShellRunner> = Arc::new(SystemShell);
        let probe = ElevationProbe::new(
            runner.clone(),
            cfg.elevation.candidates.clone(),
            cfg.probe_timeout(),
        );
        let executor = ElevatedExecutor::new(runner, cfg.session_timeout());
        let agent = AgentLaunch {
            binary_path: cfg.binary_path(),
            liveness_delay_secs: cfg.elevation.liveness_delay_secs,
        };
        let service = LocalAgentService::new(
            cfg.binary_path(),
            cfg.agent_log_path(),
            cfg.embedded.port_range_start,
            cfg.embedded.port_range_len,
            cfg.startup_grace(),
        );
        let forwarder =
            DebugPortForwarder::new(cfg.debug.tcp_port, cfg.debug.forward_endpoint.clone());
        let embedded = EmbeddedStrategy::new(
            Box::new(service),
            Box::new(forwarder),
            cfg.agent.password.clone(),
        );
        Self::new(
            probe,
            executor,
            agent,
            cfg.debug.tcp_port,
            cfg.elevation.mode,
            embedded,
        )
    }

    #[cfg(test)]
    pub fn state(&self) -> &ServiceLifecycleState {
        &self.state
    }

    /// Runs the elevation probe and re-selects the elevated strategy from its result.
    ///
    /// While the agent is running the current detection is kept, so the strategy that started
    /// the agent is the one that stops it.
    pub fn detect(&mut self) -> ElevationState {
        if self.state.running {
            info!(
                elevation = %self.elevation.label(),
                "agent running; keeping current elevation until it is stopped"
            );
        } else if self.preference == StrategyPreference::Embedded {
            info!("elevation probing skipped; embedded mode configured");
            self.apply_elevation(ElevationState::inconclusive());
        } else {
            debug!(candidates = ?self.probe.candidates(), "probing elevation mechanisms");
            let detected = self.probe.detect();
            self.apply_elevation(detected);
        }
        self.elevation
    }

    fn apply_elevation(&mut self, elevation: ElevationState) {
        self.elevation = elevation;
        self.elevated = elevation.mechanism.map(|mechanism| {
            ElevatedStrategy::new(
                mechanism,
                self.executor.clone(),
                self.agent.clone(),
                self.debug_port,
            )
        });
    }

    /// The single place where the execution strategy is chosen.
    fn strategy(&mut self) -> &mut dyn ExecutionStrategy {
        match (self.preference, self.elevated.as_mut()) {
            (StrategyPreference::Embedded, _) => &mut self.embedded,
            (_, Some(elevated)) => elevated,
            (StrategyPreference::Elevated, None) => &mut self.unavailable,
            (StrategyPreference::Auto, None) => &mut self.embedded,
        }
    }

    #[cfg(test)]
    pub fn active_strategy(&mut self) -> StrategyKind {
        self.strategy().kind()
    }

    pub fn start(&mut self, remote: &str) -> Result<ServiceLifecycleState> {
        let remote = remote.trim();
        check_remote(remote).map_err(TetherError::InvalidInput)?;
        let strategy = self.strategy();
        let kind = strategy.kind();
        info!(strategy = strategy_label(kind), remote, "starting agent");
        let port = strategy
            .start(remote)
            .inspect_err(|err| warn!(error = %err, "agent start failed"))?;
        self.state.running = true;
        self.state.remote_address = remote.to_string();
        self.state.listen_port = port;
        self.state.started_at = Some(Utc::now());
        info!(port = ?port, "agent running");
        Ok(self.state.clone())
    }

    pub fn stop(&mut self) -> Result<ServiceLifecycleState> {
        let strategy = self.strategy();
        info!(strategy = strategy_label(strategy.kind()), "stopping agent");
        strategy
            .stop()
            .inspect_err(|err| warn!(error = %err, "agent stop failed"))?;
        self.state.running = false;
        self.state.listen_port = None;
        self.state.started_at = None;
        info!("agent stopped");
        Ok(self.state.clone())
    }

    pub fn set_debug(&mut self, enabled: bool) -> Result<ServiceLifecycleState> {
        let strategy = self.strategy();
        info!(
            strategy = strategy_label(strategy.kind()),
            enabled, "toggling debug mode"
        );
        strategy
            .set_debug(enabled)
            .inspect_err(|err| warn!(error = %err, enabled, "debug toggle failed"))?;
        self.state.debug_enabled = enabled;
        Ok(self.state.clone())
    }

    pub fn enable_debug(&mut self) -> Result<ServiceLifecycleState> {
        self.set_debug(true)
    }

    pub fn disable_debug(&mut self) -> Result<ServiceLifecycleState> {
        self.set_debug(false)
    }

    pub fn status(&mut self) -> StatusReport {
        let strategy = self.strategy();
        let kind = strategy.kind();
        let detail = strategy.detailed_status();
        StatusReport {
            lifecycle: self.state.clone(),
            elevation: self.elevation,
            elevation_label: self.elevation.label(),
            strategy: kind,
            detail,
        }
    }
}

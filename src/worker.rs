//! Dedicated worker thread owning the [`ServiceController`].
//!
//! Callers talk to it through a [`ControllerHandle`]; each request carries its own reply channel.
//! Observers subscribe to [`LifecycleEvent`]s.

use crate::controller::{ServiceController, ServiceLifecycleState, StatusReport};
use crate::elevation::ElevationState;
use crate::error::{Result, TetherError};
use serde::Serialize;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use tracing::debug;

/// Commands that can be sent to the worker
pub enum LifecycleCommand {
    Detect {
        reply: Sender<ElevationState>,
    },
    Start {
        remote: String,
        reply: Sender<Result<ServiceLifecycleState>>,
    },
    Stop {
        reply: Sender<Result<ServiceLifecycleState>>,
    },
    SetDebug {
        enabled: bool,
        reply: Sender<Result<ServiceLifecycleState>>,
    },
    Status {
        reply: Sender<StatusReport>,
    },
    Subscribe {
        events: Sender<LifecycleEvent>,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    ElevationDetected {
        elevation: ElevationState,
        label: String,
    },
    StateChanged {
        state: ServiceLifecycleState,
    },
    OperationFailed {
        operation: String,
        kind: String,
        message: String,
    },
}

#[derive(Clone)]
pub struct ControllerHandle {
    tx: Sender<LifecycleCommand>,
}

impl ControllerHandle {
    fn request<T>(&self, build: impl FnOnce(Sender<T>) -> LifecycleCommand) -> Result<T> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.tx
            .send(build(reply_tx))
            .map_err(|_| TetherError::Worker("controller worker has shut down".to_string()))?;
        reply_rx
            .recv()
            .map_err(|_| TetherError::Worker("controller worker dropped the reply".to_string()))
    }

    pub fn detect(&self) -> Result<ElevationState> {
        self.request(|reply| LifecycleCommand::Detect { reply })
    }

    pub fn start(&self, remote: &str) -> Result<ServiceLifecycleState> {
        let remote = remote.to_string();
        self.request(|reply| LifecycleCommand::Start { remote, reply })?
    }

    pub fn stop(&self) -> Result<ServiceLifecycleState> {
        self.request(|reply| LifecycleCommand::Stop { reply })?
    }

    pub fn set_debug(&self, enabled: bool) -> Result<ServiceLifecycleState> {
        self.request(|reply| LifecycleCommand::SetDebug { enabled, reply })?
    }

    pub fn status(&self) -> Result<StatusReport> {
        self.request(|reply| LifecycleCommand::Status { reply })
    }

    pub fn subscribe(&self) -> Result<Receiver<LifecycleEvent>> {
        let (events, rx) = mpsc::channel();
        self.tx
            .send(LifecycleCommand::Subscribe { events })
            .map_err(|_| TetherError::Worker("controller worker has shut down".to_string()))?;
        Ok(rx)
    }
}

struct Worker {
    controller: ServiceController,
    rx: Receiver<LifecycleCommand>,
    subscribers: Vec<Sender<LifecycleEvent>>,
}

impl Worker {
    fn run(mut self) {
        while let Ok(cmd) = self.rx.recv() {
            self.process_command(cmd);
        }
        debug!("controller worker exiting");
    }

    fn process_command(&mut self, cmd: LifecycleCommand) {
        match cmd {
            LifecycleCommand::Detect { reply } => {
                let elevation = self.controller.detect();
                self.publish(LifecycleEvent::ElevationDetected {
                    elevation,
                    label: elevation.label(),
                });
                let _ = reply.send(elevation);
            }
            LifecycleCommand::Start { remote, reply } => {
                let result = self.controller.start(&remote);
                self.report("start", &result);
                let _ = reply.send(result);
            }
            LifecycleCommand::Stop { reply } => {
                let result = self.controller.stop();
                self.report("stop", &result);
                let _ = reply.send(result);
            }
            LifecycleCommand::SetDebug { enabled, reply } => {
                let (operation, result) = if enabled {
                    ("debug enable", self.controller.enable_debug())
                } else {
                    ("debug disable", self.controller.disable_debug())
                };
                self.report(operation, &result);
                let _ = reply.send(result);
            }
            LifecycleCommand::Status { reply } => {
                let _ = reply.send(self.controller.status());
            }
            LifecycleCommand::Subscribe { events } => {
                self.subscribers.push(events);
            }
        }
    }

    fn report(&mut self, operation: &str, result: &Result<ServiceLifecycleState>) {
        let event = match result {
            Ok(state) => LifecycleEvent::StateChanged {
                state: state.clone(),
            },
            Err(err) => LifecycleEvent::OperationFailed {
                operation: operation.to_string(),
                kind: err.kind().to_string(),
                message: err.to_string(),
            },
        };
        self.publish(event);
    }

    // Subscribers whose receiver is gone are dropped.
    fn publish(&mut self, event: LifecycleEvent) {
        self.subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }
}

/// Moves `controller` onto its own thread. The worker exits once every handle is dropped.
pub fn spawn(controller: ServiceController) -> Result<(ControllerHandle, JoinHandle<()>)> {
    let (tx, rx) = mpsc::channel();
    let worker = Worker {
        controller,
        rx,
        subscribers: Vec::new(),
    };
    let join = thread::Builder::new()
        .name("tether-controller".to_string())
        .spawn(move || worker.run())?;
    Ok((ControllerHandle { tx }, join))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StrategyPreference;
    use crate::controller::tests::{build, FakeForwarder, FakeService};
    use crate::elevation::ElevationMechanism;
    use crate::shell::fake::ScriptedShell;
    use crate::shell::SessionOutcome;
    use std::sync::{Arc, Mutex};

    fn embedded_worker(start_error: &str) -> (ControllerHandle, JoinHandle<()>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut service = FakeService::new(log.clone());
        service.start_error = start_error.to_string();
        let shell = Arc::new(ScriptedShell::new(|_| {
            Ok(SessionOutcome::Exited { status_code: 1 })
        }));
        let controller = build(
            shell,
            ElevationMechanism::PRIORITY.to_vec(),
            service,
            FakeForwarder { log, fail: false },
            StrategyPreference::Auto,
        );
        spawn(controller).unwrap()
    }

    #[test]
    fn handle_drives_lifecycle_and_publishes_events() {
        let (handle, join) = embedded_worker("");
        let events = handle.subscribe().unwrap();

        let elevation = handle.detect().unwrap();
        assert!(!elevation.detected);
        let state = handle.start("https://host").unwrap();
        assert!(state.running);
        assert!(handle.set_debug(true).unwrap().debug_enabled);
        assert!(!handle.stop().unwrap().running);

        drop(handle);
        join.join().unwrap();

        let received: Vec<LifecycleEvent> = events.iter().collect();
        assert_eq!(received.len(), 4);
        assert!(matches!(
            &received[0],
            LifecycleEvent::ElevationDetected { label, .. } if label == "probe_inconclusive"
        ));
        assert!(matches!(
            &received[1],
            LifecycleEvent::StateChanged { state } if state.running
        ));
        assert!(matches!(
            &received[3],
            LifecycleEvent::StateChanged { state } if !state.running && state.debug_enabled
        ));
    }

    #[test]
    fn failures_are_replied_and_published() {
        let (handle, _join) = embedded_worker("remote unreachable");
        let events = handle.subscribe().unwrap();

        let err = handle.start("https://host").unwrap_err();
        assert_eq!(err.kind(), "embedded_service_error");
        assert!(!handle.status().unwrap().lifecycle.running);

        match events.recv().unwrap() {
            LifecycleEvent::OperationFailed {
                operation,
                kind,
                message,
            } => {
                assert_eq!(operation, "start");
                assert_eq!(kind, "embedded_service_error");
                assert!(message.contains("remote unreachable"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn empty_remote_is_rejected_through_the_handle() {
        let (handle, _join) = embedded_worker("");
        assert_eq!(handle.start(" ").unwrap_err().kind(), "invalid_input");
    }

    #[test]
    fn dropped_subscriber_does_not_stall_worker() {
        let (handle, _join) = embedded_worker("");
        drop(handle.subscribe().unwrap());
        handle.detect().unwrap();
        assert!(handle.start("https://host").unwrap().running);
    }

    #[test]
    fn event_serializes_with_tag() {
        let event = LifecycleEvent::OperationFailed {
            operation: "stop".to_string(),
            kind: "session_failed".to_string(),
            message: "boom".to_string(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "operation_failed");
        assert_eq!(value["kind"], "session_failed");
    }
}

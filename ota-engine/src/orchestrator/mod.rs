// Copyright 2024 The Fuchsia Authors
//
// Licensed under a BSD-style license <LICENSE-BSD>, Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0>, or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to
// those terms.

//! Entry point of the engine: turns package assignments into delivery sessions, one worker
//! per (device, kind).

use crate::clock::{StandardTimeSource, TimeSource};
use crate::common::{DeviceId, PackageId, PackageKind, UpdateStatus};
use crate::configuration::{EngineConfig, TransportConfiguration};
use crate::metrics::{Metrics, MetricsReporter, StubMetricsReporter};
use crate::observer::{ResourceMapping, ResourceObserver};
use crate::package::{Package, PackageStore};
use crate::state_machine::observer::{EventPublisher, StateMachineEvent};
use crate::state_machine::{FailureReason, UpdateStateMachine};
use crate::strategy::{ConfigurationError, KindDelivery, ResolvedStrategy};
use crate::telemetry::{StatusEvent, TelemetryRecorder};
use crate::transport::Transport;
use futures::channel::{mpsc, oneshot};
use session::{DeliverySession, Services, SessionEvent};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

mod session;
mod transfer;

pub use transfer::TransferCursor;

/// A request to deliver a stored package to a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Assignment {
    pub device: DeviceId,
    pub package: PackageId,
    pub kind: PackageKind,
}

/// How a session ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionOutcome {
    pub device: DeviceId,
    pub kind: PackageKind,
    pub package: PackageId,
    /// UPDATED or FAILED.
    pub status: UpdateStatus,
    pub failure: Option<FailureReason>,
    pub history: Vec<StatusEvent>,
    pub blocks_acknowledged: u32,
    pub retries: u32,
}

impl SessionOutcome {
    fn new(machine: &UpdateStateMachine, package: PackageId, blocks: u32, retries: u32) -> Self {
        SessionOutcome {
            device: machine.device(),
            kind: machine.kind(),
            package,
            status: machine.status().unwrap_or(UpdateStatus::Failed),
            failure: machine.failure().cloned(),
            history: machine.history().to_vec(),
            blocks_acknowledged: blocks,
            retries,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session was superseded or unassigned")]
    Superseded,
    #[error("session worker stopped without an outcome")]
    WorkerLost,
}

/// Returned by [`Orchestrator::assign`]; resolves once the session ends.
#[derive(Debug)]
pub struct SessionHandle {
    device: DeviceId,
    kind: PackageKind,
    package: PackageId,
    cancelled: Arc<AtomicBool>,
    outcome: oneshot::Receiver<SessionOutcome>,
}

impl SessionHandle {
    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn kind(&self) -> PackageKind {
        self.kind
    }

    pub fn package(&self) -> PackageId {
        self.package
    }

    pub async fn outcome(self) -> Result<SessionOutcome, SessionError> {
        match self.outcome.await {
            Ok(outcome) => Ok(outcome),
            Err(oneshot::Canceled) if self.cancelled.load(Ordering::SeqCst) => {
                Err(SessionError::Superseded)
            }
            Err(oneshot::Canceled) => Err(SessionError::WorkerLost),
        }
    }
}

struct ActiveSession {
    package: PackageId,
    task: JoinHandle<()>,
    control: mpsc::UnboundedSender<SessionEvent>,
    cancelled: Arc<AtomicBool>,
}

struct Resolved {
    package: Arc<Package>,
    delivery: KindDelivery,
    composite: bool,
    mapping: ResourceMapping,
}

pub struct Orchestrator<T> {
    services: Services<T>,
    store: Arc<PackageStore>,
    recorder: Arc<TelemetryRecorder>,
    sessions: Mutex<HashMap<(DeviceId, PackageKind), ActiveSession>>,
}

impl<T: Transport> Orchestrator<T> {
    pub fn new(transport: Arc<T>, store: Arc<PackageStore>, config: EngineConfig) -> Self {
        Orchestrator {
            services: Services {
                transport,
                config: Arc::new(config),
                time: Arc::new(StandardTimeSource),
                metrics: Arc::new(StubMetricsReporter),
                events: EventPublisher::default(),
            },
            store,
            recorder: Arc::new(TelemetryRecorder::new()),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_time_source(mut self, time: impl TimeSource + 'static) -> Self {
        self.services.time = Arc::new(time);
        self
    }

    pub fn with_metrics_reporter(mut self, metrics: impl MetricsReporter + 'static) -> Self {
        self.services.metrics = Arc::new(metrics);
        self
    }

    /// Records into `recorder` instead of a private one.
    pub fn with_recorder(mut self, recorder: Arc<TelemetryRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn recorder(&self) -> &Arc<TelemetryRecorder> {
        &self.recorder
    }

    pub fn store(&self) -> &Arc<PackageStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.services.config
    }

    /// Subscribes to transitions, block acknowledgments and retries of every session.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StateMachineEvent> {
        self.services.events.subscribe()
    }

    /// Starts delivering `assignment` to a device configured by `profile`. A session still
    /// running for the same device and kind is cancelled first. If the package, strategy or
    /// resource mapping can't be resolved the session fails immediately, without contacting
    /// the device.
    pub async fn assign(
        &self,
        profile: &TransportConfiguration,
        assignment: Assignment,
    ) -> SessionHandle {
        let Assignment { device, package, kind } = assignment;
        let previous = self.sessions.lock().await.remove(&(device, kind));
        if let Some(previous) = previous {
            if self.cancel(device, kind, previous).await {
                info!(%device, "{kind} session superseded by package {package}");
            }
        }

        let cancelled = Arc::new(AtomicBool::new(false));
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let handle = SessionHandle {
            device,
            kind,
            package,
            cancelled: Arc::clone(&cancelled),
            outcome: outcome_rx,
        };
        let mut machine = UpdateStateMachine::new(device, kind, Arc::clone(&self.recorder));

        let resolved = match self.resolve(profile, package, kind) {
            Ok(resolved) => resolved,
            Err(error) => {
                warn!(%device, "Unable to deliver {kind} package {package}: {error}");
                if let Some(event) = machine.fail(error.into(), self.services.time.now()) {
                    self.services.events.publish(StateMachineEvent::StatusChange(event));
                }
                let _ = outcome_tx.send(SessionOutcome::new(&machine, package, 0, 0));
                return handle;
            }
        };

        if let Some(event) = machine.queue(&resolved.package, self.services.time.now()) {
            self.services.events.publish(StateMachineEvent::StatusChange(event));
        }
        let observer = ResourceObserver::new(
            device,
            Arc::new(resolved.mapping),
            Arc::clone(&self.services.time),
        );
        let (control_tx, control_rx) = mpsc::unbounded();
        let session = DeliverySession::new(
            self.services.clone(),
            resolved.package,
            resolved.delivery,
            resolved.composite,
            observer,
            machine,
            control_rx,
        );
        let task = tokio::spawn(session.run(outcome_tx));
        let active = ActiveSession { package, task, control: control_tx, cancelled };
        // A concurrent assignment for the same device and kind lost the race.
        let replaced = self.sessions.lock().await.insert((device, kind), active);
        if let Some(replaced) = replaced {
            self.cancel(device, kind, replaced).await;
        }
        handle
    }

    fn resolve(
        &self,
        profile: &TransportConfiguration,
        package_id: PackageId,
        kind: PackageKind,
    ) -> Result<Resolved, ConfigurationError> {
        let package =
            self.store.get(&package_id).ok_or(ConfigurationError::UnknownPackage(package_id))?;
        if package.kind() != kind {
            return Err(ConfigurationError::KindMismatch {
                package: package_id,
                expected: kind,
                actual: package.kind(),
            });
        }
        let strategy = ResolvedStrategy::resolve(profile);
        let delivery = strategy.for_kind(kind)?.clone();
        let mapping = ResourceMapping::from_config(&profile.observe_attr)?;
        mapping.state_path(kind)?;
        Ok(Resolved { package, delivery, composite: strategy.composite_operations, mapping })
    }

    /// Cancels the session for `device` and `kind`. Returns false if none was running.
    pub async fn unassign(&self, device: DeviceId, kind: PackageKind) -> bool {
        let previous = self.sessions.lock().await.remove(&(device, kind));
        match previous {
            Some(previous) => {
                let package = previous.package;
                let cancelled = self.cancel(device, kind, previous).await;
                if cancelled {
                    info!(%device, "{kind} package {package} unassigned");
                }
                cancelled
            }
            None => false,
        }
    }

    /// Stops the worker and waits until it is gone, so nothing it was doing can still reach
    /// the recorder. Returns false if it had already finished.
    async fn cancel(&self, device: DeviceId, kind: PackageKind, session: ActiveSession) -> bool {
        if session.task.is_finished() {
            return false;
        }
        session.cancelled.store(true, Ordering::SeqCst);
        session.task.abort();
        if let Err(e) = session.task.await {
            if !e.is_cancelled() {
                warn!(%device, "{kind} session worker failed: {e}");
            }
        }
        self.services.events.publish(StateMachineEvent::SessionCancelled { device, kind });
        if let Err(e) = self.services.metrics.report_metrics(Metrics::SessionSuperseded { kind }) {
            warn!("Unable to report session metrics: {e:#}");
        }
        true
    }

    /// Tells the sessions of `device` that it is reachable again. Returns how many were told.
    pub async fn device_reconnected(&self, device: &DeviceId) -> usize {
        let sessions = self.sessions.lock().await;
        sessions
            .iter()
            .filter(|((session_device, _), session)| {
                session_device == device && !session.task.is_finished()
            })
            .filter(|(_, session)| {
                session.control.unbounded_send(SessionEvent::Reconnected).is_ok()
            })
            .count()
    }

    /// Number of sessions still running.
    pub async fn active_sessions(&self) -> usize {
        let mut sessions = self.sessions.lock().await;
        sessions.retain(|_, session| !session.task.is_finished());
        sessions.len()
    }
}

impl<T> Drop for Orchestrator<T> {
    fn drop(&mut self) {
        for session in self.sessions.get_mut().values() {
            session.task.abort();
        }
    }
}

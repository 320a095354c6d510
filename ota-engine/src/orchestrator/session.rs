// Copyright 2024 The Fuchsia Authors
//
// Licensed under a BSD-style license <LICENSE-BSD>, Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0>, or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to
// those terms.

//! The worker driving one assignment. Notifications, transfer progress, control events, the
//! deadline and the poll timer are all consumed by a single loop, so the state machine and the
//! transfer cursor only ever have one writer. Transfer progress is applied before any device
//! signal that arrived after it.

use super::transfer::{BlockTransfer, TransferCursor, TransferEvent};
use super::SessionOutcome;
use crate::clock::TimeSource;
use crate::common::{PackageKind, UpdateStatus};
use crate::configuration::EngineConfig;
use crate::metrics::{Metrics, MetricsReporter};
use crate::observer::{ObservedField, ResourceObserver};
use crate::package::Package;
use crate::resource::{resources_for, ResourcePath, ResourceValue};
use crate::state_machine::observer::{EventPublisher, StateMachineEvent};
use crate::state_machine::{FailureReason, UpdateStateMachine};
use crate::strategy::{DeliveryStrategy, KindDelivery};
use crate::transport::{Notification, Notifications, Transport, TransportError};
use futures::channel::{mpsc, oneshot};
use futures::future::{self, BoxFuture};
use futures::prelude::*;
use itertools::Itertools as _;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Control signals sent to a running session by the orchestrator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) enum SessionEvent {
    Reconnected,
}

/// Collaborators shared by every session of an orchestrator.
pub(super) struct Services<T> {
    pub transport: Arc<T>,
    pub config: Arc<EngineConfig>,
    pub time: Arc<dyn TimeSource>,
    pub metrics: Arc<dyn MetricsReporter>,
    pub events: EventPublisher,
}

impl<T> Clone for Services<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            config: Arc::clone(&self.config),
            time: Arc::clone(&self.time),
            metrics: Arc::clone(&self.metrics),
            events: self.events.clone(),
        }
    }
}

/// Bounded retry of a single device request. Gives up at the session deadline.
#[derive(Clone, Copy, Debug)]
struct RetryPolicy {
    max_retries: u32,
    backoff: Duration,
    deadline: Instant,
    timeout: Duration,
}

impl RetryPolicy {
    async fn run<R, Fut>(
        self,
        operation: &'static str,
        retries: &mut u32,
        mut request: impl FnMut() -> Fut,
    ) -> Result<R, FailureReason>
    where
        Fut: Future<Output = Result<R, TransportError>>,
    {
        let attempts = async {
            let mut attempt = 0;
            loop {
                match request().await {
                    Ok(value) => return Ok(value),
                    Err(error) if error.is_transient() && attempt < self.max_retries => {
                        attempt += 1;
                        *retries += 1;
                        warn!("{operation} failed ({error}), retry {attempt}/{}", self.max_retries);
                        tokio::time::sleep(self.backoff).await;
                    }
                    Err(error) => {
                        return Err(FailureReason::Transport {
                            operation,
                            attempts: attempt + 1,
                            error,
                        })
                    }
                }
            }
        };
        tokio::time::timeout_at(self.deadline, attempts)
            .await
            .unwrap_or(Err(FailureReason::DeadlineExceeded(self.timeout)))
    }
}

pub(super) struct DeliverySession<T> {
    services: Services<T>,
    package: Arc<Package>,
    delivery: KindDelivery,
    composite: bool,
    observer: ResourceObserver,
    machine: UpdateStateMachine,
    cursor: TransferCursor,
    transfer: Option<BoxFuture<'static, ()>>,
    transfer_started: bool,
    install_triggered: bool,
    retries: u32,
    started: Instant,
    deadline: Instant,
    progress_tx: mpsc::UnboundedSender<TransferEvent>,
    progress_rx: mpsc::UnboundedReceiver<TransferEvent>,
    control: mpsc::UnboundedReceiver<SessionEvent>,
}

impl<T: Transport> DeliverySession<T> {
    /// `machine` must already be QUEUED.
    pub fn new(
        services: Services<T>,
        package: Arc<Package>,
        delivery: KindDelivery,
        composite: bool,
        observer: ResourceObserver,
        machine: UpdateStateMachine,
        control: mpsc::UnboundedReceiver<SessionEvent>,
    ) -> Self {
        let block_size = Self::block_size(&services.config, &delivery, &package);
        let cursor = TransferCursor::new(package.block_count(block_size));
        let started = Instant::now();
        let deadline = started + services.config.session_timeout;
        let (progress_tx, progress_rx) = mpsc::unbounded();
        Self {
            services,
            package,
            delivery,
            composite,
            observer,
            machine,
            cursor,
            transfer: None,
            transfer_started: false,
            install_triggered: false,
            retries: 0,
            started,
            deadline,
            progress_tx,
            progress_rx,
            control,
        }
    }

    fn block_size(config: &EngineConfig, delivery: &KindDelivery, package: &Package) -> usize {
        if delivery.block_transfer {
            config.block_size.max(1)
        } else {
            package.size().max(1)
        }
    }

    fn kind(&self) -> PackageKind {
        self.machine.kind()
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.services.config.max_retries,
            backoff: self.services.config.retry_backoff,
            deadline: self.deadline,
            timeout: self.services.config.session_timeout,
        }
    }

    pub async fn run(mut self, outcome: oneshot::Sender<SessionOutcome>) {
        let device = self.machine.device();
        info!(%device, "Starting {} delivery of package {}", self.kind(), self.package.id());

        let mut notifications = self.observe().await;
        if !self.machine.is_terminal() {
            self.start_delivery().await;
        }

        let deadline = tokio::time::sleep_until(self.deadline);
        tokio::pin!(deadline);
        let mut poll = self.services.config.poll_interval.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        while !self.machine.is_terminal() {
            tokio::select! {
                biased;
                () = &mut deadline => {
                    let timeout = self.services.config.session_timeout;
                    self.fail(FailureReason::DeadlineExceeded(timeout));
                }
                Some(event) = self.progress_rx.next() => self.on_transfer_event(event),
                Some(event) = self.control.next() => self.on_event(event).await,
                () = drive(&mut self.transfer) => self.transfer = None,
                notification = next_notification(&mut notifications) => match notification {
                    Some(notification) => self.on_notification(notification).await,
                    None => {
                        warn!(%device, "Observation of {} resources ended", self.kind());
                        notifications = None;
                    }
                },
                () = tick(&mut poll) => self.poll().await,
            }
        }
        self.finish(outcome);
    }

    async fn observe(&mut self) -> Option<Notifications> {
        let kind = self.kind();
        let device = self.machine.device();
        let paths = self.observer.mapping().observe_set(kind);
        if paths.is_empty() {
            warn!(%device, "No {kind} resources to observe, relying on reads");
            return None;
        }
        debug!(%device, "Observing {}", paths.iter().join(", "));
        let transport = &*self.services.transport;
        let paths = &paths;
        let result = self
            .retry_policy()
            .run("observe", &mut self.retries, || transport.observe(&device, paths))
            .await;
        match result {
            Ok(stream) => Some(stream),
            Err(reason @ FailureReason::Transport { .. }) if is_transient(&reason) => {
                warn!(%device, "Not observing {kind} resources ({reason}), relying on reads");
                None
            }
            Err(reason) => {
                self.fail(reason);
                None
            }
        }
    }

    async fn start_delivery(&mut self) {
        match self.delivery.strategy {
            DeliveryStrategy::Push => {
                if let Err(reason) = self.write_trigger().await {
                    self.fail(reason);
                    return;
                }
                self.start_transfer(0);
            }
            DeliveryStrategy::Pull => {
                let base = self
                    .delivery
                    .uri_base
                    .as_deref()
                    .unwrap_or(&self.services.config.package_uri_base);
                let uri =
                    format!("{}/{}/{}", base.trim_end_matches('/'), self.kind(), self.package.id());
                info!(device = %self.machine.device(), "Offering {} at {uri}", self.package.id());
                let path = resources_for(self.kind()).package_uri;
                if let Err(reason) = self.write("package URI write", path, uri.into()).await {
                    self.fail(reason);
                }
            }
        }
    }

    /// Announces the package through the name and version resources.
    async fn write_trigger(&mut self) -> Result<(), FailureReason> {
        let kind = self.kind();
        let mapping = self.observer.mapping();
        let name_path = mapping
            .path_of(kind, ObservedField::PkgName)
            .unwrap_or(resources_for(kind).pkg_name);
        let version_path = mapping
            .path_of(kind, ObservedField::PkgVersion)
            .unwrap_or(resources_for(kind).pkg_version);
        let name = ResourceValue::from(self.package.name());
        let version = ResourceValue::from(self.package.version());

        if self.composite {
            let device = self.machine.device();
            let transport = &*self.services.transport;
            let values = vec![(name_path, name.clone()), (version_path, version.clone())];
            let result = self
                .retry_policy()
                .run("composite trigger write", &mut self.retries, || {
                    transport.write_composite(&device, values.clone())
                })
                .await;
            match result {
                Err(FailureReason::Transport { error: TransportError::Unsupported, .. }) => {
                    debug!(%device, "Composite write unsupported, writing resources one by one");
                }
                result => return result,
            }
        }
        self.write("package name write", name_path, name).await?;
        self.write("package version write", version_path, version).await
    }

    async fn write(
        &mut self,
        operation: &'static str,
        path: ResourcePath,
        value: ResourceValue,
    ) -> Result<(), FailureReason> {
        let device = self.machine.device();
        let transport = &*self.services.transport;
        let path = &path;
        self.retry_policy()
            .run(operation, &mut self.retries, || transport.write(&device, path, value.clone()))
            .await
    }

    fn start_transfer(&mut self, start: u32) {
        let transfer = BlockTransfer {
            transport: Arc::clone(&self.services.transport),
            device: self.machine.device(),
            path: resources_for(self.kind()).package,
            package: Arc::clone(&self.package),
            block_size: Self::block_size(&self.services.config, &self.delivery, &self.package),
            max_retries: self.services.config.max_retries,
            backoff: self.services.config.retry_backoff,
            progress: self.progress_tx.clone(),
        };
        debug!(
            device = %self.machine.device(),
            "Transferring blocks {start}..{} of {}",
            self.cursor.total(),
            self.package.id()
        );
        self.transfer = Some(transfer.run(start).boxed());
        self.transfer_started = true;
    }

    async fn on_notification(&mut self, notification: Notification) {
        let Some(observation) = self.observer.decode_notification(&notification) else {
            return;
        };
        self.apply_progress();
        if let Some(event) = self.machine.reduce(&observation) {
            let status = event.status;
            self.services.events.publish(StateMachineEvent::StatusChange(event));
            self.after_transition(status).await;
        }
    }

    async fn on_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Reconnected => self.resume().await,
        }
    }

    /// Applies the transfer progress reported so far.
    fn apply_progress(&mut self) {
        while let Ok(event) = self.progress_rx.try_recv() {
            self.on_transfer_event(event);
        }
    }

    fn on_transfer_event(&mut self, event: TransferEvent) {
        let device = self.machine.device();
        let kind = self.kind();
        match event {
            TransferEvent::BlockAcknowledged { index } => {
                if self.cursor.acknowledge(index) {
                    self.services.events.publish(StateMachineEvent::BlockAcknowledged {
                        device,
                        kind,
                        index,
                        total: self.cursor.total(),
                    });
                } else {
                    debug!(%device, "Ignoring repeated acknowledgment of block {index}");
                }
            }
            TransferEvent::BlockRetry { index, attempt, error } => {
                self.retries += 1;
                self.services.events.publish(StateMachineEvent::TransferRetry {
                    device,
                    kind,
                    index,
                    attempt,
                    error,
                });
            }
            TransferEvent::TransferFailed { index, attempts, error } => {
                let reason = if error.is_transient() {
                    FailureReason::RetriesExhausted { index, attempts, error }
                } else {
                    FailureReason::Transport { operation: "block write", attempts, error }
                };
                self.fail(reason);
            }
            TransferEvent::TransferComplete => {
                let total = self.cursor.total();
                info!(%device, "All {total} blocks of {} delivered", self.package.id());
            }
        }
    }

    /// Restarts an interrupted transfer from the cursor and reads the state resources, since
    /// notifications sent while the device was away are lost.
    async fn resume(&mut self) {
        let device = self.machine.device();
        info!(%device, "Device reconnected during {} delivery", self.kind());
        if self.transfer_started && !self.cursor.is_complete() {
            self.transfer = None;
            // Progress reported by the dropped transfer must be applied before resuming from it.
            self.apply_progress();
            if self.machine.is_terminal() {
                return;
            }
            info!(%device, "Resuming transfer at block {}", self.cursor.next());
            self.start_transfer(self.cursor.next());
        }
        self.poll().await;
    }

    async fn poll(&mut self) {
        let kind = self.kind();
        let device = self.machine.device();
        let mapping = self.observer.mapping();
        let paths = [
            mapping.path_of(kind, ObservedField::state_of(kind)),
            mapping.path_of(kind, ObservedField::UpdateResult),
        ];
        for path in paths.into_iter().flatten() {
            if self.machine.is_terminal() {
                return;
            }
            let read = self.services.transport.read(&device, &path);
            let value = match tokio::time::timeout_at(self.deadline, read).await {
                Ok(Ok(value)) => value,
                Ok(Err(error)) => {
                    debug!(%device, "Polling {path} failed: {error}");
                    continue;
                }
                Err(_) => {
                    let timeout = self.services.config.session_timeout;
                    self.fail(FailureReason::DeadlineExceeded(timeout));
                    return;
                }
            };
            let Some(observation) = self.observer.decode_read(path, &value) else {
                continue;
            };
            self.apply_progress();
            if let Some(event) = self.machine.reduce(&observation) {
                let status = event.status;
                self.services.events.publish(StateMachineEvent::StatusChange(event));
                self.after_transition(status).await;
            }
        }
    }

    /// Executes the install resource once the package is ready on the device.
    async fn after_transition(&mut self, status: UpdateStatus) {
        let install_due = matches!(
            (self.kind(), status),
            (PackageKind::Firmware, UpdateStatus::Downloaded)
                | (PackageKind::Software, UpdateStatus::Verified)
        );
        if !install_due || self.install_triggered {
            return;
        }
        self.install_triggered = true;
        let device = self.machine.device();
        let transport = &*self.services.transport;
        let path = &resources_for(self.kind()).install;
        info!(%device, "Triggering {} install of {}", self.kind(), self.package.id());
        let result = self
            .retry_policy()
            .run("install", &mut self.retries, || transport.execute(&device, path))
            .await;
        if let Err(reason) = result {
            self.fail(reason);
        }
    }

    fn fail(&mut self, reason: FailureReason) {
        if let Some(event) = self.machine.fail(reason, self.services.time.now()) {
            self.services.events.publish(StateMachineEvent::StatusChange(event));
        }
    }

    fn finish(mut self, outcome: oneshot::Sender<SessionOutcome>) {
        self.apply_progress();
        let status = self.machine.status().unwrap_or(UpdateStatus::Failed);
        let metrics = Metrics::SessionFinished {
            kind: self.kind(),
            status,
            elapsed: self.started.elapsed(),
            blocks_sent: self.cursor.next(),
            retries: self.retries,
        };
        if let Err(e) = self.services.metrics.report_metrics(metrics) {
            warn!("Unable to report session metrics: {e:#}");
        }
        info!(
            device = %self.machine.device(),
            "{} delivery of {} finished: {status}",
            self.kind(),
            self.package.id()
        );
        // The handle may have been dropped; nobody is waiting then.
        let _ = outcome.send(SessionOutcome::new(
            &self.machine,
            self.package.id(),
            self.cursor.next(),
            self.retries,
        ));
    }
}

fn is_transient(reason: &FailureReason) -> bool {
    matches!(reason, FailureReason::Transport { error, .. } if error.is_transient())
}

async fn next_notification(notifications: &mut Option<Notifications>) -> Option<Notification> {
    match notifications {
        Some(stream) => stream.next().await,
        None => future::pending().await,
    }
}

async fn drive(transfer: &mut Option<BoxFuture<'static, ()>>) {
    match transfer {
        Some(transfer) => transfer.await,
        None => future::pending().await,
    }
}

async fn tick(poll: &mut Option<Interval>) {
    match poll {
        Some(interval) => {
            interval.tick().await;
        }
        None => future::pending().await,
    }
}

// Copyright 2024 The Fuchsia Authors
//
// Licensed under a BSD-style license <LICENSE-BSD>, Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0>, or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to
// those terms.

//! Reduction of observed device resources into the normalized delivery status of one
//! (device, kind) session.

use crate::common::{DeviceId, PackageKind, UpdateStatus};
use crate::observer::{FieldValue, ObservedField, Observation};
use crate::package::Package;
use crate::resource::{describe_result, firmware, software, ResourcePath};
use crate::strategy::ConfigurationError;
use crate::telemetry::{StatusEvent, TelemetryRecorder};
use crate::transport::TransportError;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

pub mod observer;

/// Why a session ended in FAILED.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FailureReason {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
    #[error("device reported result {code}: {description}")]
    DeviceReported { code: i64, description: &'static str },
    #[error("not updated within {0:?}")]
    DeadlineExceeded(Duration),
    #[error("block {index} not acknowledged after {attempts} attempts: {error}")]
    RetriesExhausted {
        index: u32,
        attempts: u32,
        error: TransportError,
    },
    #[error("{operation} failed after {attempts} attempts: {error}")]
    Transport {
        operation: &'static str,
        attempts: u32,
        error: TransportError,
    },
}

/// Last known value of every OTA field reported by the device.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceSnapshot {
    pub pkg_name: Option<String>,
    pub pkg_version: Option<String>,
    pub state: Option<i64>,
    pub result: Option<i64>,
    pub delivery_method: Option<i64>,
}

impl ResourceSnapshot {
    fn apply(&mut self, field: ObservedField, value: &FieldValue) {
        match (field, value) {
            (ObservedField::PkgName, FieldValue::Text(name)) => self.pkg_name = Some(name.clone()),
            (ObservedField::PkgVersion, FieldValue::Text(version)) => {
                self.pkg_version = Some(version.clone())
            }
            (ObservedField::State | ObservedField::UpdateState, FieldValue::Integer(code)) => {
                self.state = Some(*code)
            }
            (ObservedField::UpdateResult, FieldValue::Integer(code)) => self.result = Some(*code),
            (ObservedField::DeliveryMethod, FieldValue::Integer(code)) => {
                self.delivery_method = Some(*code)
            }
            _ => {}
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Verdict {
    Status(UpdateStatus),
    Failed(FailureReason),
}

/// Status of one (device, kind) delivery. Every accepted transition is appended to the
/// telemetry recorder in the same step that changes the current status.
#[derive(Debug)]
pub struct UpdateStateMachine {
    device: DeviceId,
    kind: PackageKind,
    expected: Option<(String, String)>,
    status: Option<UpdateStatus>,
    /// Field whose observation produced `status`.
    status_source: Option<ObservedField>,
    failure: Option<FailureReason>,
    snapshot: ResourceSnapshot,
    last_seq: HashMap<ResourcePath, u32>,
    history: Vec<StatusEvent>,
    recorder: Arc<TelemetryRecorder>,
}

impl UpdateStateMachine {
    pub fn new(device: DeviceId, kind: PackageKind, recorder: Arc<TelemetryRecorder>) -> Self {
        Self {
            device,
            kind,
            expected: None,
            status: None,
            status_source: None,
            failure: None,
            snapshot: ResourceSnapshot::default(),
            last_seq: HashMap::new(),
            history: vec![],
            recorder,
        }
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn kind(&self) -> PackageKind {
        self.kind
    }

    pub fn status(&self) -> Option<UpdateStatus> {
        self.status
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_some_and(|status| status.is_terminal())
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        self.failure.as_ref()
    }

    pub fn snapshot(&self) -> &ResourceSnapshot {
        &self.snapshot
    }

    pub fn history(&self) -> &[StatusEvent] {
        &self.history
    }

    /// Enters QUEUED for `package`. Only valid at the start of a session.
    pub fn queue(&mut self, package: &Package, at: DateTime<Utc>) -> Option<StatusEvent> {
        if self.status.is_some() {
            warn!("{} {} session already started", self.device, self.kind);
            return None;
        }
        self.expected = Some((package.name().to_string(), package.version().to_string()));
        Some(self.record(UpdateStatus::Queued, at))
    }

    /// Forces FAILED. Does nothing once the session is terminal.
    pub fn fail(&mut self, reason: FailureReason, at: DateTime<Utc>) -> Option<StatusEvent> {
        if self.is_terminal() {
            return None;
        }
        error!("{} {} update failed: {}", self.device, self.kind, reason);
        self.failure = Some(reason);
        Some(self.record(UpdateStatus::Failed, at))
    }

    /// Folds one observation into the session. Returns the recorded event if the observation
    /// produced a status.
    pub fn reduce(&mut self, observation: &Observation) -> Option<StatusEvent> {
        if self.is_terminal() || observation.kind != self.kind {
            trace!("Ignoring {:?} for {} {}", observation.field, self.device, self.kind);
            return None;
        }
        if let Some(seq) = observation.seq {
            match self.last_seq.get(&observation.path) {
                Some(last) if seq <= *last => {
                    debug!(
                        "Dropping replayed notification {} (seq {seq}, last {last})",
                        observation.path
                    );
                    return None;
                }
                _ => {
                    self.last_seq.insert(observation.path, seq);
                }
            }
        }
        self.snapshot.apply(observation.field, &observation.value);

        match self.map(observation)? {
            Verdict::Status(status) => {
                if self.status == Some(status) && !self.is_progress(status, observation) {
                    trace!("{} repeats the current status {status}", observation.path);
                    return None;
                }
                let event = self.record(status, observation.arrived_at);
                self.status_source = Some(observation.field);
                Some(event)
            }
            Verdict::Failed(reason) => self.fail(reason, observation.arrived_at),
        }
    }

    fn map(&self, observation: &Observation) -> Option<Verdict> {
        match (observation.field, &observation.value) {
            (ObservedField::PkgName | ObservedField::PkgVersion, _) => {
                (self.status == Some(UpdateStatus::Queued) && self.identity_confirmed())
                    .then_some(Verdict::Status(UpdateStatus::Initiated))
            }
            (ObservedField::State | ObservedField::UpdateState, FieldValue::Integer(code)) => {
                self.map_state(*code).map(Verdict::Status)
            }
            (ObservedField::UpdateResult, FieldValue::Integer(code)) => self.map_result(*code),
            _ => None,
        }
    }

    /// A fresh DOWNLOADING notification from the resource that reported the previous one.
    /// State and result resources that both map to a status report the same transition.
    fn is_progress(&self, status: UpdateStatus, observation: &Observation) -> bool {
        status == UpdateStatus::Downloading
            && observation.seq.is_some()
            && self.status_source == Some(observation.field)
    }

    /// The device reports both the name and the version of the assigned package.
    fn identity_confirmed(&self) -> bool {
        let Some((name, version)) = &self.expected else {
            return false;
        };
        self.snapshot.pkg_name.as_ref() == Some(name)
            && self.snapshot.pkg_version.as_ref() == Some(version)
    }

    fn map_state(&self, code: i64) -> Option<UpdateStatus> {
        let status = match self.kind {
            PackageKind::Firmware => match firmware::State::try_from(code) {
                Ok(firmware::State::Idle) => None,
                Ok(firmware::State::Downloading) => Some(UpdateStatus::Downloading),
                Ok(firmware::State::Downloaded) => Some(UpdateStatus::Downloaded),
                Ok(firmware::State::Updating) => Some(UpdateStatus::Updating),
                Err(_) => None,
            },
            PackageKind::Software => match software::UpdateState::try_from(code) {
                Ok(software::UpdateState::Initial) => None,
                Ok(software::UpdateState::DownloadStarted) => Some(UpdateStatus::Downloading),
                Ok(software::UpdateState::Downloaded) => Some(UpdateStatus::Downloaded),
                Ok(software::UpdateState::Delivered) => Some(UpdateStatus::Verified),
                Ok(software::UpdateState::Installed) => Some(UpdateStatus::Updated),
                Err(_) => None,
            },
        };
        if status.is_none() {
            trace!("{} state {code} carries no status", self.kind);
        }
        status
    }

    fn map_result(&self, code: i64) -> Option<Verdict> {
        let device_reported = || {
            Verdict::Failed(FailureReason::DeviceReported {
                code,
                description: describe_result(self.kind, code),
            })
        };
        match self.kind {
            PackageKind::Firmware => match firmware::UpdateResult::try_from(code) {
                Ok(firmware::UpdateResult::Initial) => None,
                Ok(firmware::UpdateResult::Success) => {
                    Some(Verdict::Status(UpdateStatus::Updated))
                }
                _ => Some(device_reported()),
            },
            PackageKind::Software => match software::UpdateResult::try_from(code) {
                Ok(software::UpdateResult::Initial) => None,
                Ok(software::UpdateResult::Downloading) => {
                    Some(Verdict::Status(UpdateStatus::Downloading))
                }
                Ok(software::UpdateResult::Installed) => {
                    Some(Verdict::Status(UpdateStatus::Updated))
                }
                Ok(software::UpdateResult::DownloadedVerified) => {
                    Some(Verdict::Status(UpdateStatus::Verified))
                }
                Ok(result) if result.is_failure() => Some(device_reported()),
                Ok(_) => None,
                Err(code) if code >= 50 => Some(device_reported()),
                Err(_) => None,
            },
        }
    }

    fn record(&mut self, status: UpdateStatus, at: DateTime<Utc>) -> StatusEvent {
        if !status.can_follow(self.status, self.kind) {
            warn!(
                "{} {} status {status} recorded out of lifecycle order after {:?}",
                self.device, self.kind, self.status
            );
        }
        let event = self.recorder.append(self.device, self.kind, status, at);
        self.status = Some(status);
        self.status_source = None;
        self.history.push(event.clone());
        info!("{} {} update status: {status}", self.device, self.kind);
        event
    }
}

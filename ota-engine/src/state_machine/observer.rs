// Copyright 2024 The Fuchsia Authors
//
// Licensed under a BSD-style license <LICENSE-BSD>, Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0>, or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to
// those terms.

use crate::common::{DeviceId, PackageKind};
use crate::telemetry::StatusEvent;
use crate::transport::TransportError;
use futures::channel::mpsc;
use std::sync::{Arc, Mutex, PoisonError};

/// Events emitted by delivery sessions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StateMachineEvent {
    StatusChange(StatusEvent),
    BlockAcknowledged {
        device: DeviceId,
        kind: PackageKind,
        index: u32,
        total: u32,
    },
    TransferRetry {
        device: DeviceId,
        kind: PackageKind,
        index: u32,
        attempt: u32,
        error: TransportError,
    },
    /// The session was cancelled by a newer assignment or an unassignment. No status event is
    /// recorded for it.
    SessionCancelled {
        device: DeviceId,
        kind: PackageKind,
    },
}

/// Fans events out to every live subscriber. Subscribers that went away are dropped.
#[derive(Clone, Debug, Default)]
pub struct EventPublisher {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<StateMachineEvent>>>>,
}

impl EventPublisher {
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StateMachineEvent> {
        let (sender, receiver) = mpsc::unbounded();
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner).push(sender);
        receiver
    }

    pub fn publish(&self, event: StateMachineEvent) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|subscriber| subscriber.unbounded_send(event.clone()).is_ok());
    }
}

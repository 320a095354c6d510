// Copyright 2024 The Fuchsia Authors
//
// Licensed under a BSD-style license <LICENSE-BSD>, Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0>, or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to
// those terms.

//! Append-only per-device, per-kind time series of status events.

use crate::common::{DeviceId, PackageKind, UpdateStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use typed_builder::TypedBuilder;

/// One recorded lifecycle transition. Immutable once appended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub device: DeviceId,
    pub kind: PackageKind,
    pub status: UpdateStatus,
    pub timestamp: DateTime<Utc>,
    /// Position in the stream; orders events with equal timestamps.
    pub seq: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Order {
    #[default]
    #[serde(rename = "ASC")]
    Ascending,
    #[serde(rename = "DESC")]
    Descending,
}

/// A time range query over one series. Both bounds are inclusive.
#[derive(Clone, Debug, PartialEq, Eq, TypedBuilder)]
pub struct TsQuery {
    #[builder(default = DateTime::<Utc>::MIN_UTC)]
    pub start: DateTime<Utc>,
    #[builder(default = DateTime::<Utc>::MAX_UTC)]
    pub end: DateTime<Utc>,
    #[builder(default)]
    pub order: Order,
    #[builder(default, setter(strip_option))]
    pub limit: Option<usize>,
}

type Stream = Arc<Mutex<Vec<StatusEvent>>>;

/// In-memory recorder. Appends to the same (device, kind) stream are serialized; different
/// streams only share the brief lookup of their stream.
#[derive(Debug, Default)]
pub struct TelemetryRecorder {
    streams: RwLock<HashMap<(DeviceId, PackageKind), Stream>>,
}

impl TelemetryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    fn stream(&self, device: DeviceId, kind: PackageKind) -> Stream {
        if let Some(stream) =
            self.streams.read().unwrap_or_else(PoisonError::into_inner).get(&(device, kind))
        {
            return Arc::clone(stream);
        }
        let mut streams = self.streams.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(streams.entry((device, kind)).or_default())
    }

    /// Appends a status event. A timestamp earlier than the stream's latest one is raised to it,
    /// so each stream stays ordered by time.
    pub fn append(
        &self,
        device: DeviceId,
        kind: PackageKind,
        status: UpdateStatus,
        timestamp: DateTime<Utc>,
    ) -> StatusEvent {
        let stream = self.stream(device, kind);
        let mut events = stream.lock().unwrap_or_else(PoisonError::into_inner);
        let timestamp = match events.last() {
            Some(last) if last.timestamp > timestamp => {
                tracing::debug!(
                    %device,
                    "Raising {kind} {status} timestamp {timestamp} to {}",
                    last.timestamp
                );
                last.timestamp
            }
            _ => timestamp,
        };
        let event = StatusEvent { device, kind, status, timestamp, seq: events.len() as u64 };
        events.push(event.clone());
        event
    }

    /// Events of the series named `key` (`fw_state` or `sw_state`) within the query range.
    pub fn query(&self, device: &DeviceId, key: &str, query: &TsQuery) -> Vec<StatusEvent> {
        let Some(kind) = PackageKind::from_telemetry_key(key) else {
            return vec![];
        };
        let stream = {
            let streams = self.streams.read().unwrap_or_else(PoisonError::into_inner);
            match streams.get(&(*device, kind)) {
                Some(stream) => Arc::clone(stream),
                None => return vec![],
            }
        };
        let events = stream.lock().unwrap_or_else(PoisonError::into_inner);
        let in_range = events
            .iter()
            .filter(|event| event.timestamp >= query.start && event.timestamp <= query.end)
            .cloned();
        let limit = query.limit.unwrap_or(usize::MAX);
        match query.order {
            Order::Ascending => in_range.take(limit).collect(),
            Order::Descending => {
                let mut events: Vec<_> = in_range.collect();
                events.reverse();
                events.truncate(limit);
                events
            }
        }
    }

    /// Every status recorded for `device` and `kind`, oldest first.
    pub fn statuses(&self, device: &DeviceId, kind: PackageKind) -> Vec<UpdateStatus> {
        self.query(device, kind.telemetry_key(), &TsQuery::builder().build())
            .into_iter()
            .map(|event| event.status)
            .collect()
    }
}

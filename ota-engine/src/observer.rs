// Copyright 2024 The Fuchsia Authors
//
// Licensed under a BSD-style license <LICENSE-BSD>, Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0>, or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to
// those terms.

//! Translation of observed or read resource values into named fields for the state machine.

use crate::clock::TimeSource;
use crate::common::{DeviceId, PackageKind};
use crate::configuration::ObserveAttributes;
use crate::resource::{ResourcePath, ResourceValue};
use crate::strategy::ConfigurationError;
use crate::transport::Notification;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// Semantic meaning of an OTA resource, as named in the profile's key mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObservedField {
    /// Firmware state.
    State,
    UpdateResult,
    PkgName,
    PkgVersion,
    DeliveryMethod,
    /// Software update state.
    UpdateState,
}

impl ObservedField {
    pub fn from_key_name(name: &str) -> Option<Self> {
        match name {
            "state" => Some(ObservedField::State),
            "updateResult" => Some(ObservedField::UpdateResult),
            "pkgname" => Some(ObservedField::PkgName),
            "pkgversion" => Some(ObservedField::PkgVersion),
            "firmwareUpdateDeliveryMethod" => Some(ObservedField::DeliveryMethod),
            "updateState" => Some(ObservedField::UpdateState),
            _ => None,
        }
    }

    fn is_text(&self) -> bool {
        matches!(self, ObservedField::PkgName | ObservedField::PkgVersion)
    }

    /// The field carrying the lifecycle state for `kind`.
    pub fn state_of(kind: PackageKind) -> Self {
        match kind {
            PackageKind::Firmware => ObservedField::State,
            PackageKind::Software => ObservedField::UpdateState,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldValue {
    Integer(i64),
    Text(String),
}

/// One decoded resource value, ready for reduction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Observation {
    pub device: DeviceId,
    pub kind: PackageKind,
    pub path: ResourcePath,
    pub field: ObservedField,
    pub value: FieldValue,
    /// Observe sequence number of a notification; `None` for explicit reads.
    pub seq: Option<u32>,
    pub arrived_at: DateTime<Utc>,
}

/// Lookup table from resource path to semantic field, loaded from a profile.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceMapping {
    fields: HashMap<ResourcePath, ObservedField>,
    observe: Vec<ResourcePath>,
}

impl ResourceMapping {
    pub fn from_config(attrs: &ObserveAttributes) -> Result<Self, ConfigurationError> {
        let mut fields = HashMap::new();
        for (path, name) in &attrs.key_name {
            let path: ResourcePath = path.parse()?;
            match (path.kind(), ObservedField::from_key_name(name)) {
                (Some(_), Some(field)) => {
                    fields.insert(path, field);
                }
                _ => trace!("Ignoring non-OTA key {name:?} at {path}"),
            }
        }
        let observe = attrs
            .observe
            .iter()
            .map(|path| path.parse::<ResourcePath>())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { fields, observe })
    }

    pub fn field(&self, path: &ResourcePath) -> Option<ObservedField> {
        self.fields.get(path).copied()
    }

    pub fn path_of(&self, kind: PackageKind, field: ObservedField) -> Option<ResourcePath> {
        self.fields
            .iter()
            .filter(|(path, f)| path.kind() == Some(kind) && **f == field)
            .map(|(path, _)| *path)
            .min()
    }

    /// Configured observe paths that belong to `kind` and have a semantic field.
    pub fn observe_set(&self, kind: PackageKind) -> Vec<ResourcePath> {
        self.observe
            .iter()
            .filter(|path| path.kind() == Some(kind) && self.fields.contains_key(path))
            .copied()
            .collect()
    }

    /// The resource carrying `kind`'s lifecycle state. Deliveries of a kind without one can't be
    /// tracked.
    pub fn state_path(&self, kind: PackageKind) -> Result<ResourcePath, ConfigurationError> {
        self.path_of(kind, ObservedField::state_of(kind))
            .ok_or(ConfigurationError::MissingStateMapping(kind))
    }
}

/// Decodes one device's notifications and reads into [`Observation`]s.
#[derive(Clone, Debug)]
pub struct ResourceObserver {
    device: DeviceId,
    mapping: Arc<ResourceMapping>,
    time: Arc<dyn TimeSource>,
}

impl ResourceObserver {
    pub fn new(device: DeviceId, mapping: Arc<ResourceMapping>, time: Arc<dyn TimeSource>) -> Self {
        Self { device, mapping, time }
    }

    pub fn mapping(&self) -> &ResourceMapping {
        &self.mapping
    }

    pub fn decode_notification(&self, notification: &Notification) -> Option<Observation> {
        self.decode(notification.path, &notification.value, Some(notification.seq))
    }

    pub fn decode_read(&self, path: ResourcePath, value: &ResourceValue) -> Option<Observation> {
        self.decode(path, value, None)
    }

    fn decode(
        &self,
        path: ResourcePath,
        value: &ResourceValue,
        seq: Option<u32>,
    ) -> Option<Observation> {
        let kind = path.kind()?;
        let Some(field) = self.mapping.field(&path) else {
            trace!(device = %self.device, "No field mapped to {path}");
            return None;
        };
        let value = if field.is_text() {
            value.as_text().map(FieldValue::Text)
        } else {
            value.as_integer().map(FieldValue::Integer)
        };
        let Some(value) = value else {
            debug!(device = %self.device, "Undecodable value at {path} for {field:?}");
            return None;
        };
        Some(Observation {
            device: self.device,
            kind,
            path,
            field,
            value,
            seq,
            arrived_at: self.time.now(),
        })
    }
}

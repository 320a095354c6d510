// Copyright 2024 The Fuchsia Authors
//
// Licensed under a BSD-style license <LICENSE-BSD>, Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0>, or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to
// those terms.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Identifies a managed device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(Uuid);

impl DeviceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for DeviceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifies an uploaded OTA package.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackageId(Uuid);

impl PackageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for PackageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for PackageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// The two package categories. Each is carried by its own protocol object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PackageKind {
    Firmware,
    Software,
}

impl PackageKind {
    pub const ALL: [PackageKind; 2] = [PackageKind::Firmware, PackageKind::Software];

    /// Name of the time series this kind's status events are recorded under.
    pub fn telemetry_key(&self) -> &'static str {
        match self {
            PackageKind::Firmware => "fw_state",
            PackageKind::Software => "sw_state",
        }
    }

    pub fn from_telemetry_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.telemetry_key() == key)
    }
}

impl fmt::Display for PackageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackageKind::Firmware => write!(f, "firmware"),
            PackageKind::Software => write!(f, "software"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown package kind {0:?}")]
pub struct ParsePackageKindError(String);

impl FromStr for PackageKind {
    type Err = ParsePackageKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "firmware" | "fw" => Ok(PackageKind::Firmware),
            "software" | "sw" => Ok(PackageKind::Software),
            _ => Err(ParsePackageKindError(s.to_string())),
        }
    }
}

/// Normalized lifecycle status of a delivery, in lifecycle order.
///
/// Firmware goes `DOWNLOADED -> UPDATING -> UPDATED`, software goes
/// `DOWNLOADED -> VERIFIED -> UPDATED`. `FAILED` may follow any non-terminal status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateStatus {
    Queued,
    Initiated,
    Downloading,
    Downloaded,
    Verified,
    Updating,
    Updated,
    Failed,
}

impl UpdateStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UpdateStatus::Updated | UpdateStatus::Failed)
    }

    /// Returns true if `self` may directly follow `previous` in a `kind` session. `None` stands
    /// for the start of the session.
    pub fn can_follow(&self, previous: Option<UpdateStatus>, kind: PackageKind) -> bool {
        use UpdateStatus::*;
        let Some(previous) = previous else {
            return matches!(self, Queued | Failed);
        };
        if previous.is_terminal() {
            return false;
        }
        match (previous, self) {
            (_, Failed) => true,
            (Queued, Initiated) => true,
            (Initiated, Downloading) => true,
            (Downloading, Downloading | Downloaded) => true,
            (Downloaded, Updating) => kind == PackageKind::Firmware,
            (Downloaded, Verified) => kind == PackageKind::Software,
            (Updating, Updated) => kind == PackageKind::Firmware,
            (Verified, Updated) => kind == PackageKind::Software,
            _ => false,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            UpdateStatus::Queued => "QUEUED",
            UpdateStatus::Initiated => "INITIATED",
            UpdateStatus::Downloading => "DOWNLOADING",
            UpdateStatus::Downloaded => "DOWNLOADED",
            UpdateStatus::Verified => "VERIFIED",
            UpdateStatus::Updating => "UPDATING",
            UpdateStatus::Updated => "UPDATED",
            UpdateStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown update status {0:?}")]
pub struct ParseUpdateStatusError(String);

impl FromStr for UpdateStatus {
    type Err = ParseUpdateStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use UpdateStatus::*;
        [Queued, Initiated, Downloading, Downloaded, Verified, Updating, Updated, Failed]
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseUpdateStatusError(s.to_string()))
    }
}

/// Returns true if `statuses` is a walk of the lifecycle for `kind`, starting at the beginning
/// of a session. A prefix of a complete walk is also a walk.
pub fn is_valid_walk(kind: PackageKind, statuses: &[UpdateStatus]) -> bool {
    let mut previous = None;
    for status in statuses {
        if !status.can_follow(previous, kind) {
            return false;
        }
        previous = Some(*status);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use UpdateStatus::*;

    #[test]
    fn test_firmware_success_walk() {
        assert!(is_valid_walk(
            PackageKind::Firmware,
            &[Queued, Initiated, Downloading, Downloading, Downloaded, Updating, Updated]
        ));
        assert!(!is_valid_walk(
            PackageKind::Firmware,
            &[Queued, Initiated, Downloading, Downloaded, Verified, Updated]
        ));
    }

    #[test]
    fn test_software_success_walk() {
        assert!(is_valid_walk(
            PackageKind::Software,
            &[
                Queued,
                Initiated,
                Downloading,
                Downloading,
                Downloading,
                Downloaded,
                Verified,
                Updated
            ]
        ));
        assert!(!is_valid_walk(
            PackageKind::Software,
            &[Queued, Initiated, Downloading, Downloaded, Updating, Updated]
        ));
    }

    #[test]
    fn test_failed_reachable_from_any_non_terminal_status() {
        for status in [Queued, Initiated, Downloading, Downloaded, Verified, Updating] {
            assert!(Failed.can_follow(Some(status), PackageKind::Software), "{status}");
        }
        assert!(is_valid_walk(PackageKind::Firmware, &[Failed]));
        assert!(!Failed.can_follow(Some(Updated), PackageKind::Firmware));
        assert!(!Failed.can_follow(Some(Failed), PackageKind::Firmware));
    }

    #[test]
    fn test_status_string_round_trip() {
        assert_eq!("DOWNLOADING".parse::<UpdateStatus>(), Ok(Downloading));
        assert_eq!(Verified.to_string(), "VERIFIED");
        assert!("downloading".parse::<UpdateStatus>().is_err());
        assert_eq!(serde_json::to_string(&Updating).unwrap(), "\"UPDATING\"");
    }

    #[test]
    fn test_telemetry_keys() {
        assert_eq!(PackageKind::Firmware.telemetry_key(), "fw_state");
        assert_eq!(PackageKind::from_telemetry_key("sw_state"), Some(PackageKind::Software));
        assert_eq!(PackageKind::from_telemetry_key("temperature"), None);
        assert_eq!("SW".parse::<PackageKind>(), Ok(PackageKind::Software));
    }
}

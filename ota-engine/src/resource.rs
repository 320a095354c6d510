// Copyright 2024 The Fuchsia Authors
//
// Licensed under a BSD-style license <LICENSE-BSD>, Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0>, or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to
// those terms.

//! Addressing and value types for the device-side object model, and the two OTA objects the
//! engine drives: object 5 (firmware update) and object 9 (software management).

use crate::common::PackageKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// `/<object>/<instance>/<resource>`. The textual form may carry an object version suffix, as in
/// `/5_1.0/0/3`; the version is not part of the resource identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourcePath {
    pub object: u16,
    pub instance: u16,
    pub resource: u16,
}

impl ResourcePath {
    pub const fn new(object: u16, instance: u16, resource: u16) -> Self {
        Self { object, instance, resource }
    }

    /// The package kind whose object this resource belongs to, if any.
    pub fn kind(&self) -> Option<PackageKind> {
        match self.object {
            firmware::OBJECT_ID => Some(PackageKind::Firmware),
            software::OBJECT_ID => Some(PackageKind::Software),
            _ => None,
        }
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}/{}", self.object, self.instance, self.resource)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ParseResourcePathError {
    #[error("resource path {0:?} must start with '/'")]
    MissingLeadingSlash(String),
    #[error("resource path {0:?} must have exactly three segments")]
    SegmentCount(String),
    #[error("invalid id {segment:?} in resource path {path:?}")]
    InvalidId { path: String, segment: String },
}

impl FromStr for ResourcePath {
    type Err = ParseResourcePathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix('/')
            .ok_or_else(|| ParseResourcePathError::MissingLeadingSlash(s.to_string()))?;
        let segments: Vec<&str> = rest.split('/').collect();
        let &[object, instance, resource] = segments.as_slice() else {
            return Err(ParseResourcePathError::SegmentCount(s.to_string()));
        };
        let object = object.split_once('_').map_or(object, |(id, _version)| id);
        let parse = |segment: &str| {
            segment.parse::<u16>().map_err(|_| ParseResourcePathError::InvalidId {
                path: s.to_string(),
                segment: segment.to_string(),
            })
        };
        Ok(Self::new(parse(object)?, parse(instance)?, parse(resource)?))
    }
}

impl TryFrom<String> for ResourcePath {
    type Error = ParseResourcePathError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ResourcePath> for String {
    fn from(path: ResourcePath) -> Self {
        path.to_string()
    }
}

/// A raw resource value as carried by the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResourceValue {
    Integer(i64),
    String(String),
    Opaque(Vec<u8>),
}

impl ResourceValue {
    /// Integer resources are sometimes reported in text form; both are accepted.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            ResourceValue::Integer(value) => Some(*value),
            ResourceValue::String(value) => value.trim().parse().ok(),
            ResourceValue::Opaque(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<String> {
        match self {
            ResourceValue::Integer(value) => Some(value.to_string()),
            ResourceValue::String(value) => Some(value.clone()),
            ResourceValue::Opaque(bytes) => String::from_utf8(bytes.clone()).ok(),
        }
    }
}

impl From<i64> for ResourceValue {
    fn from(value: i64) -> Self {
        ResourceValue::Integer(value)
    }
}

impl From<&str> for ResourceValue {
    fn from(value: &str) -> Self {
        ResourceValue::String(value.to_string())
    }
}

impl From<String> for ResourceValue {
    fn from(value: String) -> Self {
        ResourceValue::String(value)
    }
}

/// Declares a C-like enum for an integer-coded resource, with a fallible conversion from the raw
/// integer and a human readable description of each code.
macro_rules! coded_enum {
    ($(#[$meta:meta])* pub enum $name:ident { $($variant:ident = $code:literal => $text:literal,)* }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant = $code,)*
        }

        impl $name {
            pub fn code(&self) -> i64 {
                *self as i64
            }

            pub fn description(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)*
                }
            }
        }

        impl TryFrom<i64> for $name {
            type Error = i64;

            fn try_from(code: i64) -> Result<Self, i64> {
                match code {
                    $($code => Ok($name::$variant),)*
                    other => Err(other),
                }
            }
        }
    };
}

pub mod firmware {
    use super::ResourcePath;

    pub const OBJECT_ID: u16 = 5;

    pub const PACKAGE: ResourcePath = ResourcePath::new(OBJECT_ID, 0, 0);
    pub const PACKAGE_URI: ResourcePath = ResourcePath::new(OBJECT_ID, 0, 1);
    pub const UPDATE: ResourcePath = ResourcePath::new(OBJECT_ID, 0, 2);
    pub const STATE: ResourcePath = ResourcePath::new(OBJECT_ID, 0, 3);
    pub const UPDATE_RESULT: ResourcePath = ResourcePath::new(OBJECT_ID, 0, 5);
    pub const PKG_NAME: ResourcePath = ResourcePath::new(OBJECT_ID, 0, 6);
    pub const PKG_VERSION: ResourcePath = ResourcePath::new(OBJECT_ID, 0, 7);
    pub const DELIVERY_METHOD: ResourcePath = ResourcePath::new(OBJECT_ID, 0, 9);

    coded_enum! {
        pub enum State {
            Idle = 0 => "idle",
            Downloading = 1 => "downloading",
            Downloaded = 2 => "downloaded",
            Updating = 3 => "updating",
        }
    }

    coded_enum! {
        pub enum UpdateResult {
            Initial = 0 => "initial value",
            Success = 1 => "firmware updated successfully",
            NotEnoughFlash = 2 => "not enough flash memory for the new firmware package",
            OutOfRam = 3 => "out of RAM during downloading process",
            ConnectionLost = 4 => "connection lost during downloading process",
            IntegrityCheckFailure = 5 => "integrity check failure for new downloaded package",
            UnsupportedPackageType = 6 => "unsupported package type",
            InvalidUri = 7 => "invalid URI",
            UpdateFailed = 8 => "firmware update failed",
            UnsupportedProtocol = 9 => "unsupported protocol",
        }
    }

    coded_enum! {
        pub enum DeliveryMethod {
            PullOnly = 0 => "pull only",
            PushOnly = 1 => "push only",
            Both = 2 => "push or pull",
        }
    }
}

pub mod software {
    use super::ResourcePath;

    pub const OBJECT_ID: u16 = 9;

    pub const PKG_NAME: ResourcePath = ResourcePath::new(OBJECT_ID, 0, 0);
    pub const PKG_VERSION: ResourcePath = ResourcePath::new(OBJECT_ID, 0, 1);
    pub const PACKAGE: ResourcePath = ResourcePath::new(OBJECT_ID, 0, 2);
    pub const PACKAGE_URI: ResourcePath = ResourcePath::new(OBJECT_ID, 0, 3);
    pub const INSTALL: ResourcePath = ResourcePath::new(OBJECT_ID, 0, 4);
    pub const UPDATE_STATE: ResourcePath = ResourcePath::new(OBJECT_ID, 0, 7);
    pub const UPDATE_RESULT: ResourcePath = ResourcePath::new(OBJECT_ID, 0, 9);

    coded_enum! {
        pub enum UpdateState {
            Initial = 0 => "initial",
            DownloadStarted = 1 => "download started",
            Downloaded = 2 => "downloaded",
            Delivered = 3 => "delivered",
            Installed = 4 => "installed",
        }
    }

    coded_enum! {
        pub enum UpdateResult {
            Initial = 0 => "initial value",
            Downloading = 1 => "downloading",
            Installed = 2 => "software successfully installed",
            DownloadedVerified = 3 => "successfully downloaded and verified",
            NotEnoughStorage = 50 => "not enough storage for the new software package",
            OutOfMemory = 51 => "out of memory during downloading process",
            ConnectionLost = 52 => "connection lost during downloading process",
            IntegrityCheckFailure = 53 => "package integrity check failure",
            UnsupportedPackageType = 54 => "unsupported package type",
            InvalidUri = 56 => "invalid URI",
            DeviceError = 57 => "device defined update error",
            InstallFailure = 58 => "software installation failure",
            UninstallFailure = 59 => "uninstallation failure",
        }
    }

    impl UpdateResult {
        pub fn is_failure(&self) -> bool {
            self.code() >= 50
        }
    }
}

/// The fixed resources of one OTA object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KindResources {
    pub pkg_name: ResourcePath,
    pub pkg_version: ResourcePath,
    /// Block-wise write target for pushed payloads.
    pub package: ResourcePath,
    pub package_uri: ResourcePath,
    /// Executable resource that starts installation of a downloaded package.
    pub install: ResourcePath,
    pub state: ResourcePath,
    pub result: ResourcePath,
}

const FIRMWARE_RESOURCES: KindResources = KindResources {
    pkg_name: firmware::PKG_NAME,
    pkg_version: firmware::PKG_VERSION,
    package: firmware::PACKAGE,
    package_uri: firmware::PACKAGE_URI,
    install: firmware::UPDATE,
    state: firmware::STATE,
    result: firmware::UPDATE_RESULT,
};

const SOFTWARE_RESOURCES: KindResources = KindResources {
    pkg_name: software::PKG_NAME,
    pkg_version: software::PKG_VERSION,
    package: software::PACKAGE,
    package_uri: software::PACKAGE_URI,
    install: software::INSTALL,
    state: software::UPDATE_STATE,
    result: software::UPDATE_RESULT,
};

pub fn resources_for(kind: PackageKind) -> &'static KindResources {
    match kind {
        PackageKind::Firmware => &FIRMWARE_RESOURCES,
        PackageKind::Software => &SOFTWARE_RESOURCES,
    }
}

/// Human readable meaning of a device-reported update result code.
pub fn describe_result(kind: PackageKind, code: i64) -> &'static str {
    let description = match kind {
        PackageKind::Firmware => firmware::UpdateResult::try_from(code).map(|r| r.description()),
        PackageKind::Software => software::UpdateResult::try_from(code).map(|r| r.description()),
    };
    description.unwrap_or("unknown result code")
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_parse_versioned_path() {
        let path: ResourcePath = "/5_1.0/0/3".parse().unwrap();
        assert_eq!(path, firmware::STATE);
        assert_eq!(path.to_string(), "/5/0/3");
        assert_eq!(path.kind(), Some(PackageKind::Firmware));
        assert_eq!("/9/0/7".parse::<ResourcePath>().unwrap(), software::UPDATE_STATE);
    }

    #[test]
    fn test_parse_rejects_malformed_paths() {
        assert_matches!(
            "5/0/3".parse::<ResourcePath>(),
            Err(ParseResourcePathError::MissingLeadingSlash(_))
        );
        assert_matches!(
            "/5/0".parse::<ResourcePath>(),
            Err(ParseResourcePathError::SegmentCount(_))
        );
        assert_matches!(
            "/5/x/3".parse::<ResourcePath>(),
            Err(ParseResourcePathError::InvalidId { segment, .. }) if segment == "x"
        );
    }

    #[test]
    fn test_path_serde_uses_text_form() {
        let path: ResourcePath = serde_json::from_str("\"/3_1.2/0/9\"").unwrap();
        assert_eq!(path, ResourcePath::new(3, 0, 9));
        assert_eq!(path.kind(), None);
        assert_eq!(serde_json::to_string(&path).unwrap(), "\"/3/0/9\"");
    }

    #[test]
    fn test_coded_enums() {
        assert_eq!(firmware::State::try_from(2), Ok(firmware::State::Downloaded));
        assert_eq!(firmware::State::try_from(7), Err(7));
        assert!(software::UpdateResult::IntegrityCheckFailure.is_failure());
        assert!(!software::UpdateResult::DownloadedVerified.is_failure());
        assert_eq!(
            describe_result(PackageKind::Firmware, 5),
            "integrity check failure for new downloaded package"
        );
        assert_eq!(describe_result(PackageKind::Software, 99), "unknown result code");
    }

    #[test]
    fn test_integer_values_accept_text() {
        assert_eq!(ResourceValue::from(" 3").as_integer(), Some(3));
        assert_eq!(ResourceValue::Opaque(vec![1]).as_integer(), None);
        assert_eq!(ResourceValue::Integer(4).as_text().as_deref(), Some("4"));
    }
}

// Copyright 2024 The Fuchsia Authors
//
// Licensed under a BSD-style license <LICENSE-BSD>, Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0>, or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to
// those terms.

//! Resolution of how packages reach a device, from its profile's transport configuration.

use crate::common::{PackageId, PackageKind};
use crate::configuration::{TransportConfiguration, UpdateStrategyCode};
use crate::resource::ParseResourcePathError;
use thiserror::Error;

/// Who initiates the payload transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeliveryStrategy {
    /// The server writes the update trigger and pushes the payload.
    Push,
    /// The server only exposes where the package is; the device fetches it.
    Pull,
}

/// Delivery settings for one package kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KindDelivery {
    pub strategy: DeliveryStrategy,
    /// Payload is segmented into acknowledged blocks. Only meaningful for push.
    pub block_transfer: bool,
    /// Replaces the engine's package URI base for pull deliveries.
    pub uri_base: Option<String>,
}

/// Immutable result of resolving a profile, computed once per assignment.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolvedStrategy {
    pub firmware: Option<KindDelivery>,
    pub software: Option<KindDelivery>,
    /// The device accepts composite (multi-resource) operations.
    pub composite_operations: bool,
}

/// A profile, package or mapping that can't be resolved for an assignment. Never retried.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("no {0} update strategy configured")]
    MissingStrategy(PackageKind),
    #[error("no resource is mapped to the {0} update state")]
    MissingStateMapping(PackageKind),
    #[error("package {0} not found")]
    UnknownPackage(PackageId),
    #[error("package {package} is {actual}, but was assigned as {expected}")]
    KindMismatch {
        package: PackageId,
        expected: PackageKind,
        actual: PackageKind,
    },
    #[error("invalid resource path in profile: {0}")]
    InvalidResourcePath(#[from] ParseResourcePathError),
}

impl ResolvedStrategy {
    pub fn resolve(config: &TransportConfiguration) -> Self {
        let Some(settings) = config.client_settings.as_ref() else {
            return Self::default();
        };
        let delivery = |code: Option<UpdateStrategyCode>, resource: &Option<String>| {
            let uri_base = resource.as_ref().filter(|r| !r.is_empty()).cloned();
            code.map(|code| match code {
                UpdateStrategyCode::PushBinary => KindDelivery {
                    strategy: DeliveryStrategy::Push,
                    block_transfer: true,
                    uri_base,
                },
                UpdateStrategyCode::PullUri | UpdateStrategyCode::PullUriProxy => KindDelivery {
                    strategy: DeliveryStrategy::Pull,
                    block_transfer: false,
                    uri_base,
                },
            })
        };
        Self {
            firmware: delivery(settings.fw_update_strategy, &settings.fw_update_resource),
            software: delivery(settings.sw_update_strategy, &settings.sw_update_resource),
            composite_operations: settings.composite_operations_support,
        }
    }

    pub fn for_kind(&self, kind: PackageKind) -> Result<&KindDelivery, ConfigurationError> {
        let delivery = match kind {
            PackageKind::Firmware => &self.firmware,
            PackageKind::Software => &self.software,
        };
        delivery.as_ref().ok_or(ConfigurationError::MissingStrategy(kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::ClientSettings;
    use assert_matches::assert_matches;

    fn config(settings: ClientSettings) -> TransportConfiguration {
        TransportConfiguration { client_settings: Some(settings), ..Default::default() }
    }

    #[test]
    fn test_resolves_each_kind_independently() {
        let resolved = ResolvedStrategy::resolve(&config(ClientSettings {
            fw_update_strategy: Some(UpdateStrategyCode::PushBinary),
            sw_update_strategy: Some(UpdateStrategyCode::PullUriProxy),
            sw_update_resource: Some("coap://proxy/ota".to_string()),
            fw_update_resource: Some(String::new()),
            composite_operations_support: true,
            ..Default::default()
        }));
        let firmware = resolved.for_kind(PackageKind::Firmware).unwrap();
        assert_eq!(firmware.strategy, DeliveryStrategy::Push);
        assert!(firmware.block_transfer);
        assert_eq!(firmware.uri_base, None);

        let software = resolved.for_kind(PackageKind::Software).unwrap();
        assert_eq!(software.strategy, DeliveryStrategy::Pull);
        assert!(!software.block_transfer);
        assert_eq!(software.uri_base.as_deref(), Some("coap://proxy/ota"));
        assert!(resolved.composite_operations);
    }

    #[test]
    fn test_missing_strategy_is_a_configuration_error() {
        let resolved = ResolvedStrategy::resolve(&config(ClientSettings {
            fw_update_strategy: Some(UpdateStrategyCode::PullUri),
            ..Default::default()
        }));
        assert!(resolved.for_kind(PackageKind::Firmware).is_ok());
        assert_matches!(
            resolved.for_kind(PackageKind::Software),
            Err(ConfigurationError::MissingStrategy(PackageKind::Software))
        );
    }

    #[test]
    fn test_profile_without_settings_resolves_nothing() {
        let resolved = ResolvedStrategy::resolve(&TransportConfiguration::default());
        assert_eq!(resolved, ResolvedStrategy::default());
        for kind in PackageKind::ALL {
            assert!(resolved.for_kind(kind).is_err());
        }
    }
}

// Copyright 2024 The Fuchsia Authors
//
// Licensed under a BSD-style license <LICENSE-BSD>, Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0>, or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to
// those terms.

//! Engine settings and the device-profile transport configuration consumed from provisioning.

use serde::de::IntoDeserializer;
use serde::{Deserialize, Deserializer, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::collections::BTreeMap;
use std::time::Duration;

/// Settings of the delivery engine itself, shared by every session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Bound on a whole session; a session that has not reached UPDATED by then is FAILED.
    #[serde(rename = "session_timeout_ms", with = "millis")]
    pub session_timeout: Duration,
    /// Payload bytes per block in block-wise transfers.
    pub block_size: usize,
    /// Attempts per block (and per install trigger) after the first one.
    pub max_retries: u32,
    #[serde(rename = "retry_backoff_ms", with = "millis")]
    pub retry_backoff: Duration,
    /// When set, every session also reads its state resources at this period.
    #[serde(rename = "poll_interval_ms", with = "optional_millis")]
    pub poll_interval: Option<Duration>,
    /// Pull deliveries point devices at `<package_uri_base>/<kind>/<package id>`.
    pub package_uri_base: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            session_timeout: Duration::from_secs(30),
            block_size: 512,
            max_retries: 3,
            retry_backoff: Duration::from_millis(100),
            poll_interval: None,
            package_uri_base: "coap://localhost:5685/ota".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod optional_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(value) => serializer.serialize_some(&(value.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

/// The transport section of a device profile, as supplied by provisioning.
///
/// Only the parts the delivery engine reads are modelled; bootstrap and other sections are
/// accepted and ignored.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportConfiguration {
    #[serde(default)]
    pub observe_attr: ObserveAttributes,
    #[serde(default, rename = "clientLwM2mSettings")]
    pub client_settings: Option<ClientSettings>,
}

impl TransportConfiguration {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Which resources are observed, and what each of them means.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObserveAttributes {
    /// Resource path (e.g. `/5_1.0/0/3`) to semantic field name (e.g. `state`).
    #[serde(default)]
    pub key_name: BTreeMap<String, String>,
    #[serde(default)]
    pub observe: Vec<String>,
    #[serde(default)]
    pub attribute: Vec<String>,
    #[serde(default)]
    pub telemetry: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSettings {
    #[serde(default, deserialize_with = "strategy_code")]
    pub fw_update_strategy: Option<UpdateStrategyCode>,
    #[serde(default, deserialize_with = "strategy_code")]
    pub sw_update_strategy: Option<UpdateStrategyCode>,
    #[serde(default)]
    pub composite_operations_support: bool,
    /// Overrides the engine's package URI base for pull deliveries of firmware.
    #[serde(default)]
    pub fw_update_resource: Option<String>,
    #[serde(default)]
    pub sw_update_resource: Option<String>,
    #[serde(default)]
    pub client_only_observe_after_connect: Option<u8>,
    #[serde(default)]
    pub power_mode: Option<String>,
}

/// Integer strategy codes carried in the profile.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum UpdateStrategyCode {
    /// Server pushes the binary into the package resource, block-wise.
    PushBinary = 1,
    /// Server writes a package URI, the device downloads it.
    PullUri = 2,
    /// As `PullUri`, with the URI pointing at a proxy resource.
    PullUriProxy = 3,
}

/// Profiles write 0 for a kind that has no strategy.
fn strategy_code<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<UpdateStrategyCode>, D::Error> {
    match Option::<u8>::deserialize(deserializer)? {
        None | Some(0) => Ok(None),
        Some(code) => {
            let code: serde::de::value::U8Deserializer<D::Error> = code.into_deserializer();
            UpdateStrategyCode::deserialize(code).map(Some)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_engine_config_defaults_fill_missing_fields() {
        let config = EngineConfig::from_json(r#"{"block_size": 64, "poll_interval_ms": 250}"#)
            .unwrap();
        assert_eq!(
            config,
            EngineConfig {
                block_size: 64,
                poll_interval: Some(Duration::from_millis(250)),
                ..Default::default()
            }
        );
        assert_eq!(config.session_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_engine_config_serializes_millis() {
        let json = serde_json::to_value(EngineConfig::default()).unwrap();
        assert_eq!(json["session_timeout_ms"], 30_000);
        assert_eq!(json["poll_interval_ms"], serde_json::Value::Null);
    }

    #[test]
    fn test_parse_profile_transport_configuration() {
        let config = TransportConfiguration::from_json(
            r#"{
                "observeAttr": {
                    "keyName": { "/5_1.0/0/3": "state", "/9_1.0/0/7": "updateState" },
                    "observe": ["/5_1.0/0/3", "/9_1.0/0/7"],
                    "attribute": [],
                    "telemetry": ["/5_1.0/0/3"],
                    "attributeLwm2m": {}
                },
                "bootstrap": { "servers": { "binding": "UQ" } },
                "clientLwM2mSettings": {
                    "fwUpdateStrategy": 1,
                    "swUpdateStrategy": 2,
                    "clientOnlyObserveAfterConnect": 1,
                    "powerMode": "PSM",
                    "fwUpdateResource": "",
                    "swUpdateResource": "",
                    "compositeOperationsSupport": true
                },
                "type": "LWM2M"
            }"#,
        )
        .unwrap();
        assert_eq!(config.observe_attr.key_name.get("/5_1.0/0/3").unwrap(), "state");
        assert_eq!(config.observe_attr.observe.len(), 2);
        let settings = config.client_settings.unwrap();
        assert_eq!(settings.fw_update_strategy, Some(UpdateStrategyCode::PushBinary));
        assert_eq!(settings.sw_update_strategy, Some(UpdateStrategyCode::PullUri));
        assert!(settings.composite_operations_support);
        assert_eq!(settings.power_mode.as_deref(), Some("PSM"));
    }

    #[test]
    fn test_unknown_strategy_code_is_rejected() {
        let result = TransportConfiguration::from_json(
            r#"{ "clientLwM2mSettings": { "fwUpdateStrategy": 7 } }"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_strategy_code_is_unset() {
        let config = TransportConfiguration::from_json(
            r#"{ "clientLwM2mSettings": { "fwUpdateStrategy": 0, "swUpdateStrategy": 3 } }"#,
        )
        .unwrap();
        let settings = config.client_settings.unwrap();
        assert_eq!(settings.fw_update_strategy, None);
        assert_eq!(settings.sw_update_strategy, Some(UpdateStrategyCode::PullUriProxy));
    }

    #[test]
    fn test_profile_without_ota_sections() {
        let config = TransportConfiguration::from_json(r#"{ "type": "LWM2M" }"#).unwrap();
        assert_eq!(config, TransportConfiguration::default());
    }
}

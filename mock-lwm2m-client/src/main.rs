// Copyright 2024 The Fuchsia Authors
//
// Licensed under a BSD-style license <LICENSE-BSD>, Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0>, or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to
// those terms.

use anyhow::Context as _;
use argh::FromArgs;
use futures::future;
use mock_lwm2m_client::{DeviceBehaviorBuilder, MockTransport, EXAMPLE_PROFILE};
use ota_engine::common::{DeviceId, PackageKind};
use ota_engine::configuration::{EngineConfig, TransportConfiguration};
use ota_engine::orchestrator::{Assignment, Orchestrator};
use ota_engine::package::{Package, PackageStore};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(FromArgs)]
/// Delivers one generated package to a fleet of simulated devices and prints each device's
/// status history.
struct Args {
    /// device profile JSON, with the `observeAttr` and `clientLwM2mSettings` sections.
    /// Defaults to pushing both kinds block-wise with every OTA resource observed.
    #[argh(option, from_str_fn(parse_profile))]
    profile: Option<TransportConfiguration>,

    /// engine settings JSON, e.g. {"block_size": 256, "session_timeout_ms": 10000}
    #[argh(option, from_str_fn(parse_config), default = "EngineConfig::default()")]
    config: EngineConfig,

    /// package kind to deliver: firmware or software
    #[argh(option, default = "PackageKind::Firmware")]
    kind: PackageKind,

    /// package size in bytes
    #[argh(option, default = "4096")]
    size: usize,

    /// number of simulated devices
    #[argh(option, default = "1")]
    devices: usize,

    /// DOWNLOADING notifications each device sends when the download starts
    #[argh(option, default = "1")]
    progress_notifications: u32,

    /// result code every device reports instead of accepting the payload
    #[argh(option)]
    fail_with: Option<i64>,
}

fn parse_profile(value: &str) -> Result<TransportConfiguration, String> {
    TransportConfiguration::from_json(value).map_err(|e| format!("Parsing failed: {e:?}"))
}

fn parse_config(value: &str) -> Result<EngineConfig, String> {
    EngineConfig::from_json(value).map_err(|e| format!("Parsing failed: {e:?}"))
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args: Args = argh::from_env();

    let profile = match args.profile {
        Some(profile) => profile,
        None => TransportConfiguration::from_json(EXAMPLE_PROFILE)
            .context("parsing the example profile")?,
    };

    let mut store = PackageStore::new();
    let content: Vec<u8> = (0..args.size).map(|i| (i % 251) as u8).collect();
    let package = store.insert(Package::new(args.kind, "mock-package", "1.0.0", content));
    let store = Arc::new(store);

    let transport = Arc::new(MockTransport::new(Arc::clone(&store)));
    let orchestrator = Orchestrator::new(Arc::clone(&transport), store, args.config);

    let mut handles = vec![];
    for _ in 0..args.devices {
        let device = DeviceId::new();
        let mut behavior =
            DeviceBehaviorBuilder::default().progress_notifications(args.progress_notifications);
        if let Some(code) = args.fail_with {
            behavior = behavior.fail_with(code);
        }
        transport.add_device(device, behavior.build()?).await;
        let assignment = Assignment { device, package, kind: args.kind };
        handles.push(orchestrator.assign(&profile, assignment).await);
    }

    for outcome in future::join_all(handles.into_iter().map(|handle| handle.outcome())).await {
        let outcome = outcome?;
        println!("device {} {}: {}", outcome.device, outcome.kind, outcome.status);
        for event in &outcome.history {
            println!("  {} #{} {}", event.timestamp.to_rfc3339(), event.seq, event.status);
        }
        if let Some(failure) = &outcome.failure {
            println!("  failure: {failure}");
        }
        println!(
            "  {} blocks acknowledged, {} retries",
            outcome.blocks_acknowledged, outcome.retries
        );
    }
    Ok(())
}

// Copyright 2024 The Fuchsia Authors
//
// Licensed under a BSD-style license <LICENSE-BSD>, Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0>, or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to
// those terms.

//! A fleet of simulated constrained devices behind an in-memory [`Transport`]. Each device keeps
//! its OTA resources, answers observations with sequenced notifications and walks the firmware
//! or software update lifecycle as blocks, URIs and install triggers arrive.

use derive_builder::Builder;
use futures::channel::mpsc;
use futures::future::BoxFuture;
use futures::prelude::*;
use ota_engine::common::{DeviceId, PackageId, PackageKind};
use ota_engine::package::{Checksum, PackageStore};
use ota_engine::resource::{firmware, resources_for, software, ResourcePath, ResourceValue};
use ota_engine::transport::{Block, Notification, Notifications, Transport, TransportError};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

/// How a simulated device behaves during a delivery.
#[derive(Clone, Debug, Builder)]
#[builder(pattern = "owned")]
#[builder(derive(Debug))]
pub struct DeviceBehavior {
    /// DOWNLOADING notifications sent when the first block or the package URI arrives.
    #[builder(default = "1")]
    pub progress_notifications: u32,
    /// Block index to the number of writes of that block that time out before one succeeds.
    #[builder(default, setter(into))]
    pub flaky_blocks: HashMap<u32, u32>,
    /// Result code reported once the payload is complete, instead of accepting it.
    #[builder(default, setter(strip_option))]
    pub fail_with: Option<i64>,
    /// Writes of this block never complete, as if the device dropped off the network.
    #[builder(default, setter(strip_option))]
    pub stall_at_block: Option<u32>,
    /// Accepts composite writes.
    #[builder(default)]
    pub composite: bool,
    /// Updates its resources without ever notifying.
    #[builder(default)]
    pub silent: bool,
    /// Sets the software Update Result alongside every Update State change.
    #[builder(default)]
    pub report_results: bool,
}

impl Default for DeviceBehavior {
    fn default() -> Self {
        DeviceBehavior {
            progress_notifications: 1,
            flaky_blocks: HashMap::new(),
            fail_with: None,
            stall_at_block: None,
            composite: false,
            silent: false,
            report_results: false,
        }
    }
}

#[derive(Default)]
struct Download {
    next_block: u32,
    hasher: Sha256,
}

struct SimulatedDevice {
    behavior: DeviceBehavior,
    resources: HashMap<ResourcePath, ResourceValue>,
    observers: Vec<(mpsc::UnboundedSender<Notification>, HashSet<ResourcePath>)>,
    seq: u32,
    downloads: HashMap<PackageKind, Download>,
    received: Vec<u32>,
    executed: Vec<ResourcePath>,
}

impl SimulatedDevice {
    fn new(behavior: DeviceBehavior) -> Self {
        let mut resources = HashMap::new();
        for kind in PackageKind::ALL {
            let r = resources_for(kind);
            resources.insert(r.state, ResourceValue::Integer(0));
            resources.insert(r.result, ResourceValue::Integer(0));
            resources.insert(r.pkg_name, ResourceValue::from(""));
            resources.insert(r.pkg_version, ResourceValue::from(""));
        }
        SimulatedDevice {
            behavior,
            resources,
            observers: vec![],
            seq: 0,
            downloads: HashMap::new(),
            received: vec![],
            executed: vec![],
        }
    }

    /// Stores a resource value and notifies it if it is observed.
    fn set(&mut self, path: ResourcePath, value: impl Into<ResourceValue>) {
        let value = value.into();
        self.resources.insert(path, value.clone());
        if self.behavior.silent {
            return;
        }
        if !self.observers.iter().any(|(_, paths)| paths.contains(&path)) {
            return;
        }
        self.seq += 1;
        let seq = self.seq;
        tracing::debug!("notify {path} = {value:?} (seq {seq})");
        self.observers.retain(|(sender, paths)| {
            !paths.contains(&path)
                || sender.unbounded_send(Notification { path, value: value.clone(), seq }).is_ok()
        });
    }

    fn announced(&self, kind: PackageKind) -> Option<(String, String)> {
        let r = resources_for(kind);
        let name = self.resources.get(&r.pkg_name)?.as_text()?;
        let version = self.resources.get(&r.pkg_version)?.as_text()?;
        Some((name, version))
    }

    fn start_download(&mut self, kind: PackageKind) {
        let state = match kind {
            PackageKind::Firmware => firmware::State::Downloading.code(),
            PackageKind::Software => software::UpdateState::DownloadStarted.code(),
        };
        for _ in 0..self.behavior.progress_notifications.max(1) {
            self.set(resources_for(kind).state, state);
        }
        self.report_result(kind, software::UpdateResult::Downloading);
    }

    fn report_result(&mut self, kind: PackageKind, result: software::UpdateResult) {
        if kind == PackageKind::Software && self.behavior.report_results {
            self.set(software::UPDATE_RESULT, result.code());
        }
    }

    fn finish_download(&mut self, kind: PackageKind, intact: bool) {
        let r = resources_for(kind);
        if let Some(code) = self.behavior.fail_with {
            self.set(r.result, code);
            return;
        }
        match kind {
            PackageKind::Firmware if !intact => {
                self.set(r.result, firmware::UpdateResult::IntegrityCheckFailure.code())
            }
            PackageKind::Software if !intact => {
                self.set(r.result, software::UpdateResult::IntegrityCheckFailure.code())
            }
            PackageKind::Firmware => self.set(r.state, firmware::State::Downloaded.code()),
            PackageKind::Software => {
                self.set(r.state, software::UpdateState::Downloaded.code());
                self.set(r.state, software::UpdateState::Delivered.code());
                self.report_result(kind, software::UpdateResult::DownloadedVerified);
            }
        }
    }

    fn install(&mut self, kind: PackageKind) -> Result<(), TransportError> {
        let r = resources_for(kind);
        let state = self.resources.get(&r.state).and_then(ResourceValue::as_integer);
        match kind {
            PackageKind::Firmware if state == Some(firmware::State::Downloaded.code()) => {
                self.set(r.state, firmware::State::Updating.code());
                self.set(r.result, firmware::UpdateResult::Success.code());
                Ok(())
            }
            PackageKind::Software if state == Some(software::UpdateState::Delivered.code()) => {
                self.set(r.state, software::UpdateState::Installed.code());
                self.report_result(kind, software::UpdateResult::Installed);
                Ok(())
            }
            // Method Not Allowed: nothing to install yet.
            _ => Err(TransportError::Rejected(405)),
        }
    }
}

/// In-memory transport to a fleet of [`DeviceBehavior`]-driven devices. Packages offered by
/// URI are fetched from `store`, pushed payloads are checked against it.
pub struct MockTransport {
    store: Arc<PackageStore>,
    devices: Mutex<HashMap<DeviceId, SimulatedDevice>>,
}

impl MockTransport {
    pub fn new(store: Arc<PackageStore>) -> Self {
        MockTransport { store, devices: Mutex::new(HashMap::new()) }
    }

    pub async fn add_device(&self, device: DeviceId, behavior: DeviceBehavior) {
        self.devices.lock().await.insert(device, SimulatedDevice::new(behavior));
    }

    /// Brings a stalled device back; blocks written from now on are accepted again.
    pub async fn reconnect(&self, device: &DeviceId) {
        if let Some(state) = self.devices.lock().await.get_mut(device) {
            state.behavior.stall_at_block = None;
        }
    }

    /// Indexes of the blocks the device accepted, in arrival order.
    pub async fn blocks_received(&self, device: &DeviceId) -> Vec<u32> {
        self.devices.lock().await.get(device).map(|d| d.received.clone()).unwrap_or_default()
    }

    pub async fn resource(&self, device: &DeviceId, path: &ResourcePath) -> Option<ResourceValue> {
        self.devices.lock().await.get(device).and_then(|d| d.resources.get(path).cloned())
    }

    pub async fn executed(&self, device: &DeviceId) -> Vec<ResourcePath> {
        self.devices.lock().await.get(device).map(|d| d.executed.clone()).unwrap_or_default()
    }

    fn apply_write(&self, state: &mut SimulatedDevice, path: ResourcePath, value: ResourceValue) {
        let Some(kind) = path.kind() else {
            state.set(path, value);
            return;
        };
        let r = resources_for(kind);
        if path == r.pkg_name {
            state.downloads.remove(&kind);
        }
        if path == r.package_uri {
            let uri = value.as_text().unwrap_or_default();
            state.set(path, value);
            self.fetch(state, kind, &uri);
            return;
        }
        state.set(path, value);
    }

    /// Downloads the package at `uri`, whose last segment is the package id.
    fn fetch(&self, state: &mut SimulatedDevice, kind: PackageKind, uri: &str) {
        let r = resources_for(kind);
        let package = uri
            .rsplit('/')
            .next()
            .and_then(|id| id.parse::<PackageId>().ok())
            .and_then(|id| self.store.get(&id));
        let Some(package) = package else {
            tracing::warn!("cannot fetch {uri}");
            let code = match kind {
                PackageKind::Firmware => firmware::UpdateResult::InvalidUri.code(),
                PackageKind::Software => software::UpdateResult::InvalidUri.code(),
            };
            state.set(r.result, code);
            return;
        };
        state.set(r.pkg_name, package.name());
        state.set(r.pkg_version, package.version());
        state.start_download(kind);
        let intact = package.verify(package.content());
        state.finish_download(kind, intact);
    }
}

impl Transport for MockTransport {
    fn observe<'a>(
        &'a self,
        device: &'a DeviceId,
        paths: &'a [ResourcePath],
    ) -> BoxFuture<'a, Result<Notifications, TransportError>> {
        async move {
            let mut devices = self.devices.lock().await;
            let state = devices.get_mut(device).ok_or(TransportError::UnknownDevice(*device))?;
            let (sender, receiver) = mpsc::unbounded();
            state.observers.push((sender, paths.iter().copied().collect()));
            Ok(receiver.boxed())
        }
        .boxed()
    }

    fn read<'a>(
        &'a self,
        device: &'a DeviceId,
        path: &'a ResourcePath,
    ) -> BoxFuture<'a, Result<ResourceValue, TransportError>> {
        async move {
            let devices = self.devices.lock().await;
            let state = devices.get(device).ok_or(TransportError::UnknownDevice(*device))?;
            // Not Found.
            state.resources.get(path).cloned().ok_or(TransportError::Rejected(404))
        }
        .boxed()
    }

    fn write<'a>(
        &'a self,
        device: &'a DeviceId,
        path: &'a ResourcePath,
        value: ResourceValue,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        async move {
            let mut devices = self.devices.lock().await;
            let state = devices.get_mut(device).ok_or(TransportError::UnknownDevice(*device))?;
            self.apply_write(state, *path, value);
            Ok(())
        }
        .boxed()
    }

    fn write_composite<'a>(
        &'a self,
        device: &'a DeviceId,
        values: Vec<(ResourcePath, ResourceValue)>,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        async move {
            let mut devices = self.devices.lock().await;
            let state = devices.get_mut(device).ok_or(TransportError::UnknownDevice(*device))?;
            if !state.behavior.composite {
                return Err(TransportError::Unsupported);
            }
            for (path, value) in values {
                self.apply_write(state, path, value);
            }
            Ok(())
        }
        .boxed()
    }

    fn write_block<'a>(
        &'a self,
        device: &'a DeviceId,
        path: &'a ResourcePath,
        block: Block<'a>,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        async move {
            let mut devices = self.devices.lock().await;
            let state = devices.get_mut(device).ok_or(TransportError::UnknownDevice(*device))?;
            let kind = path.kind().ok_or(TransportError::Rejected(404))?;
            if *path != resources_for(kind).package {
                // Method Not Allowed.
                return Err(TransportError::Rejected(405));
            }
            if state.behavior.stall_at_block == Some(block.index) {
                drop(devices);
                return future::pending().await;
            }
            if let Some(remaining) = state.behavior.flaky_blocks.get_mut(&block.index) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(TransportError::Timeout);
                }
            }

            let download = state.downloads.entry(kind).or_default();
            if block.index < download.next_block {
                tracing::debug!("block {} already received", block.index);
                return Ok(());
            }
            if block.index > download.next_block {
                // Request Entity Incomplete.
                return Err(TransportError::Rejected(408));
            }
            download.hasher.update(block.payload);
            download.next_block += 1;
            state.received.push(block.index);
            if block.index == 0 {
                state.start_download(kind);
            }
            if !block.more {
                let download = state.downloads.remove(&kind).unwrap_or_default();
                let checksum = Checksum::from_array(download.hasher.finalize().into());
                let expected = state
                    .announced(kind)
                    .and_then(|(name, version)| self.store.find(kind, &name, &version));
                let intact = expected.map_or(true, |package| *package.checksum() == checksum);
                state.finish_download(kind, intact);
            }
            Ok(())
        }
        .boxed()
    }

    fn execute<'a>(
        &'a self,
        device: &'a DeviceId,
        path: &'a ResourcePath,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        async move {
            let mut devices = self.devices.lock().await;
            let state = devices.get_mut(device).ok_or(TransportError::UnknownDevice(*device))?;
            let kind = path.kind().ok_or(TransportError::Rejected(404))?;
            if *path != resources_for(kind).install {
                return Err(TransportError::Rejected(405));
            }
            state.executed.push(*path);
            state.install(kind)
        }
        .boxed()
    }
}

/// Device profile used when none is given: both kinds pushed block-wise, every OTA resource
/// observed.
pub const EXAMPLE_PROFILE: &str = r#"{
  "observeAttr": {
    "keyName": {
      "/5_1.0/0/3": "state",
      "/5_1.0/0/5": "updateResult",
      "/5_1.0/0/6": "pkgname",
      "/5_1.0/0/7": "pkgversion",
      "/5_1.0/0/9": "firmwareUpdateDeliveryMethod",
      "/9_1.0/0/0": "pkgname",
      "/9_1.0/0/1": "pkgversion",
      "/9_1.0/0/7": "updateState",
      "/9_1.0/0/9": "updateResult",
      "/3_1.0/0/9": "batteryLevel"
    },
    "observe": [
      "/5_1.0/0/3", "/5_1.0/0/5", "/5_1.0/0/6", "/5_1.0/0/7",
      "/9_1.0/0/0", "/9_1.0/0/1", "/9_1.0/0/7", "/9_1.0/0/9",
      "/3_1.0/0/9"
    ],
    "attribute": [],
    "telemetry": ["/3_1.0/0/9"]
  },
  "clientLwM2mSettings": {
    "fwUpdateStrategy": 1,
    "swUpdateStrategy": 1,
    "clientOnlyObserveAfterConnect": 1,
    "fwUpdateResource": "",
    "swUpdateResource": "",
    "compositeOperationsSupport": false
  },
  "type": "LWM2M"
}"#;

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use ota_engine::common::is_valid_walk;
    use ota_engine::common::UpdateStatus::{self, *};
    use ota_engine::configuration::{EngineConfig, TransportConfiguration, UpdateStrategyCode};
    use ota_engine::orchestrator::{Assignment, Orchestrator, SessionError};
    use ota_engine::package::Package;
    use ota_engine::state_machine::observer::StateMachineEvent;
    use ota_engine::state_machine::FailureReason;
    use ota_engine::telemetry::{Order, StatusEvent, TsQuery};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    const FIRMWARE: PackageKind = PackageKind::Firmware;
    const SOFTWARE: PackageKind = PackageKind::Software;
    const FIRMWARE_SUCCESS: [UpdateStatus; 6] =
        [Queued, Initiated, Downloading, Downloaded, Updating, Updated];

    struct Fleet {
        orchestrator: Orchestrator<MockTransport>,
        transport: Arc<MockTransport>,
        /// 4 blocks of 256 bytes.
        firmware: PackageId,
        /// 3 blocks.
        firmware_next: PackageId,
        software: PackageId,
    }

    impl Fleet {
        async fn device(&self, behavior: DeviceBehavior) -> DeviceId {
            let device = DeviceId::new();
            self.transport.add_device(device, behavior).await;
            device
        }

        fn assignment(&self, device: DeviceId, package: PackageId) -> Assignment {
            let kind = self.orchestrator.store().get(&package).map_or(FIRMWARE, |p| p.kind());
            Assignment { device, package, kind }
        }

        fn recorded(&self, device: &DeviceId, kind: PackageKind) -> Vec<UpdateStatus> {
            self.orchestrator.recorder().statuses(device, kind)
        }

        async fn wait_for(&self, device: &DeviceId, kind: PackageKind, status: UpdateStatus) {
            for _ in 0..1000 {
                if self.recorded(device, kind).contains(&status) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("{status} never recorded for {device}");
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn fleet(config: EngineConfig) -> Fleet {
        let mut store = PackageStore::new();
        let firmware = store.insert(Package::new(FIRMWARE, "tracker-fw", "1.0.0", payload(1000)));
        let firmware_next =
            store.insert(Package::new(FIRMWARE, "tracker-fw", "1.1.0", payload(700)));
        let software =
            store.insert(Package::new(SOFTWARE, "telemetry-agent", "3.2", payload(600)));
        let store = Arc::new(store);
        let transport = Arc::new(MockTransport::new(Arc::clone(&store)));
        let orchestrator = Orchestrator::new(Arc::clone(&transport), store, config);
        Fleet { orchestrator, transport, firmware, firmware_next, software }
    }

    fn config() -> EngineConfig {
        EngineConfig {
            block_size: 256,
            retry_backoff: Duration::from_millis(1),
            ..Default::default()
        }
    }

    fn profile() -> TransportConfiguration {
        TransportConfiguration::from_json(EXAMPLE_PROFILE).unwrap()
    }

    /// Statuses of one session's history, which must walk the lifecycle of its kind.
    fn statuses(history: &[StatusEvent]) -> Vec<UpdateStatus> {
        let statuses: Vec<UpdateStatus> = history.iter().map(|event| event.status).collect();
        if let Some(first) = history.first() {
            assert!(is_valid_walk(first.kind, &statuses), "not a lifecycle walk: {statuses:?}");
        }
        statuses
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<StateMachineEvent>) -> Vec<StateMachineEvent> {
        let mut drained = vec![];
        while let Ok(event) = events.try_recv() {
            drained.push(event);
        }
        drained
    }

    #[tokio::test]
    async fn test_unresolvable_package_fails_without_contacting_device() {
        let fleet = fleet(config());
        let device = fleet.device(DeviceBehavior::default()).await;
        let handle = fleet
            .orchestrator
            .assign(&profile(), Assignment { device, package: PackageId::new(), kind: FIRMWARE })
            .await;
        let outcome = handle.outcome().await.unwrap();

        assert_eq!(statuses(&outcome.history), vec![Failed]);
        assert_eq!(fleet.recorded(&device, FIRMWARE), vec![Failed]);
        assert_eq!(
            fleet.transport.resource(&device, &firmware::PKG_NAME).await,
            Some(ResourceValue::from(""))
        );
        assert!(fleet.transport.blocks_received(&device).await.is_empty());
    }

    #[tokio::test]
    async fn test_firmware_push_walks_full_lifecycle() {
        let fleet = fleet(config());
        let mut events = fleet.orchestrator.subscribe();
        let device = fleet.device(DeviceBehavior::default()).await;
        let outcome = fleet
            .orchestrator
            .assign(&profile(), fleet.assignment(device, fleet.firmware))
            .await
            .outcome()
            .await
            .unwrap();

        assert_eq!(outcome.status, Updated);
        assert_eq!(outcome.failure, None);
        assert_eq!(statuses(&outcome.history), FIRMWARE_SUCCESS.to_vec());
        assert_eq!(fleet.recorded(&device, FIRMWARE), FIRMWARE_SUCCESS.to_vec());
        assert_eq!(fleet.transport.blocks_received(&device).await, vec![0, 1, 2, 3]);
        assert_eq!(outcome.blocks_acknowledged, 4);
        assert_eq!(fleet.transport.executed(&device).await, vec![firmware::UPDATE]);

        let acknowledged: Vec<u32> = drain(&mut events)
            .into_iter()
            .filter_map(|event| match event {
                StateMachineEvent::BlockAcknowledged { index, total: 4, .. } => Some(index),
                _ => None,
            })
            .collect();
        assert_eq!(acknowledged, vec![0, 1, 2, 3]);

        let latest = fleet.orchestrator.recorder().query(
            &device,
            "fw_state",
            &TsQuery::builder().order(Order::Descending).limit(1).build(),
        );
        assert_matches!(latest.as_slice(), [StatusEvent { status: Updated, seq: 5, .. }]);
        assert!(fleet.recorded(&device, SOFTWARE).is_empty());
    }

    #[tokio::test]
    async fn test_software_push_records_every_progress_notification() {
        let fleet = fleet(config());
        let device = fleet
            .device(DeviceBehaviorBuilder::default().progress_notifications(3).build().unwrap())
            .await;
        let outcome = fleet
            .orchestrator
            .assign(&profile(), fleet.assignment(device, fleet.software))
            .await
            .outcome()
            .await
            .unwrap();

        assert_eq!(
            statuses(&outcome.history),
            vec![
                Queued,
                Initiated,
                Downloading,
                Downloading,
                Downloading,
                Downloaded,
                Verified,
                Updated
            ]
        );
        assert_eq!(fleet.transport.executed(&device).await, vec![software::INSTALL]);
        assert_eq!(
            fleet.transport.resource(&device, &software::UPDATE_STATE).await,
            Some(ResourceValue::Integer(software::UpdateState::Installed.code()))
        );
    }

    #[tokio::test]
    async fn test_software_device_reporting_state_and_result() {
        let fleet = fleet(config());
        let device = fleet
            .device(DeviceBehaviorBuilder::default().report_results(true).build().unwrap())
            .await;
        let outcome = fleet
            .orchestrator
            .assign(&profile(), fleet.assignment(device, fleet.software))
            .await
            .outcome()
            .await
            .unwrap();

        assert_eq!(
            statuses(&outcome.history),
            vec![Queued, Initiated, Downloading, Downloaded, Verified, Updated]
        );
        assert_eq!(fleet.transport.executed(&device).await, vec![software::INSTALL]);
        assert_eq!(
            fleet.transport.resource(&device, &software::UPDATE_RESULT).await,
            Some(ResourceValue::Integer(software::UpdateResult::Installed.code()))
        );
    }

    #[tokio::test]
    async fn test_composite_trigger_with_fallback() {
        let fleet = fleet(config());
        let mut profile = profile();
        profile.client_settings.as_mut().unwrap().composite_operations_support = true;
        let composite =
            fleet.device(DeviceBehaviorBuilder::default().composite(true).build().unwrap()).await;
        let plain = fleet.device(DeviceBehavior::default()).await;

        let first =
            fleet.orchestrator.assign(&profile, fleet.assignment(composite, fleet.firmware)).await;
        let second =
            fleet.orchestrator.assign(&profile, fleet.assignment(plain, fleet.firmware)).await;
        for handle in [first, second] {
            let outcome = handle.outcome().await.unwrap();
            assert_eq!(statuses(&outcome.history), FIRMWARE_SUCCESS.to_vec());
        }
        assert_eq!(
            fleet.transport.resource(&plain, &firmware::PKG_VERSION).await,
            Some(ResourceValue::from("1.0.0"))
        );
    }

    #[tokio::test]
    async fn test_new_assignment_supersedes_running_session() {
        let fleet = fleet(config());
        let device =
            fleet.device(DeviceBehaviorBuilder::default().stall_at_block(0).build().unwrap()).await;
        let first =
            fleet.orchestrator.assign(&profile(), fleet.assignment(device, fleet.firmware)).await;
        fleet.wait_for(&device, FIRMWARE, Initiated).await;

        fleet.transport.reconnect(&device).await;
        let next = fleet.assignment(device, fleet.firmware_next);
        let second = fleet.orchestrator.assign(&profile(), next).await;
        assert_eq!(first.outcome().await, Err(SessionError::Superseded));

        let outcome = second.outcome().await.unwrap();
        assert_eq!(outcome.package, fleet.firmware_next);
        assert_eq!(statuses(&outcome.history), FIRMWARE_SUCCESS.to_vec());
        assert_eq!(
            fleet.recorded(&device, FIRMWARE),
            vec![Queued, Initiated, Queued, Initiated, Downloading, Downloaded, Updating, Updated]
        );
        assert_eq!(fleet.transport.blocks_received(&device).await, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_device_reported_failure_is_terminal() {
        let fleet = fleet(config());
        let device = fleet
            .device(
                DeviceBehaviorBuilder::default()
                    .fail_with(firmware::UpdateResult::IntegrityCheckFailure.code())
                    .build()
                    .unwrap(),
            )
            .await;
        let outcome = fleet
            .orchestrator
            .assign(&profile(), fleet.assignment(device, fleet.firmware))
            .await
            .outcome()
            .await
            .unwrap();

        assert_eq!(statuses(&outcome.history), vec![Queued, Initiated, Downloading, Failed]);
        assert_matches!(outcome.failure, Some(FailureReason::DeviceReported { code: 5, .. }));
        assert!(fleet.transport.executed(&device).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_device_hits_deadline() {
        let fleet = fleet(EngineConfig { session_timeout: Duration::from_secs(5), ..config() });
        let device =
            fleet.device(DeviceBehaviorBuilder::default().silent(true).build().unwrap()).await;
        let outcome = fleet
            .orchestrator
            .assign(&profile(), fleet.assignment(device, fleet.firmware))
            .await
            .outcome()
            .await
            .unwrap();

        assert_eq!(statuses(&outcome.history), vec![Queued, Failed]);
        assert_eq!(outcome.failure, Some(FailureReason::DeadlineExceeded(Duration::from_secs(5))));
        assert_eq!(fleet.recorded(&device, FIRMWARE), vec![Queued, Failed]);
        assert_eq!(fleet.transport.blocks_received(&device).await, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_transient_block_errors_are_retried_in_place() {
        let fleet = fleet(config());
        let mut events = fleet.orchestrator.subscribe();
        let device = fleet
            .device(DeviceBehaviorBuilder::default().flaky_blocks([(1u32, 2u32)]).build().unwrap())
            .await;
        let outcome = fleet
            .orchestrator
            .assign(&profile(), fleet.assignment(device, fleet.firmware))
            .await
            .outcome()
            .await
            .unwrap();

        assert_eq!(statuses(&outcome.history), FIRMWARE_SUCCESS.to_vec());
        assert_eq!(outcome.retries, 2);
        assert_eq!(fleet.transport.blocks_received(&device).await, vec![0, 1, 2, 3]);
        let retried: Vec<(u32, u32)> = drain(&mut events)
            .into_iter()
            .filter_map(|event| match event {
                StateMachineEvent::TransferRetry { index, attempt, error, .. } => {
                    assert_eq!(error, TransportError::Timeout);
                    Some((index, attempt))
                }
                _ => None,
            })
            .collect();
        assert_eq!(retried, vec![(1, 1), (1, 2)]);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_the_session() {
        let fleet = fleet(config());
        let device = fleet
            .device(DeviceBehaviorBuilder::default().flaky_blocks([(2u32, 10u32)]).build().unwrap())
            .await;
        let outcome = fleet
            .orchestrator
            .assign(&profile(), fleet.assignment(device, fleet.firmware))
            .await
            .outcome()
            .await
            .unwrap();

        assert_eq!(statuses(&outcome.history), vec![Queued, Initiated, Downloading, Failed]);
        assert_eq!(
            outcome.failure,
            Some(FailureReason::RetriesExhausted {
                index: 2,
                attempts: 4,
                error: TransportError::Timeout
            })
        );
        assert_eq!(outcome.blocks_acknowledged, 2);
        assert_eq!(fleet.transport.blocks_received(&device).await, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_pull_strategy_offers_uri() {
        let fleet = fleet(config());
        let mut profile = profile();
        profile.client_settings.as_mut().unwrap().fw_update_strategy =
            Some(UpdateStrategyCode::PullUri);
        let device = fleet.device(DeviceBehavior::default()).await;
        let outcome = fleet
            .orchestrator
            .assign(&profile, fleet.assignment(device, fleet.firmware))
            .await
            .outcome()
            .await
            .unwrap();

        assert_eq!(statuses(&outcome.history), FIRMWARE_SUCCESS.to_vec());
        assert_eq!(
            fleet.transport.resource(&device, &firmware::PACKAGE_URI).await,
            Some(ResourceValue::String(format!(
                "coap://localhost:5685/ota/firmware/{}",
                fleet.firmware
            )))
        );
        assert!(fleet.transport.blocks_received(&device).await.is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_resumes_from_cursor() {
        let fleet = fleet(config());
        let mut events = fleet.orchestrator.subscribe();
        let device =
            fleet.device(DeviceBehaviorBuilder::default().stall_at_block(2).build().unwrap()).await;
        let handle =
            fleet.orchestrator.assign(&profile(), fleet.assignment(device, fleet.firmware)).await;

        for _ in 0..1000 {
            if fleet.transport.blocks_received(&device).await.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        fleet.transport.reconnect(&device).await;
        assert_eq!(fleet.orchestrator.device_reconnected(&device).await, 1);

        let outcome = handle.outcome().await.unwrap();
        assert_eq!(statuses(&outcome.history), FIRMWARE_SUCCESS.to_vec());
        assert_eq!(fleet.transport.blocks_received(&device).await, vec![0, 1, 2, 3]);
        let acknowledged: Vec<u32> = drain(&mut events)
            .into_iter()
            .filter_map(|event| match event {
                StateMachineEvent::BlockAcknowledged { index, .. } => Some(index),
                _ => None,
            })
            .collect();
        assert_eq!(acknowledged, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_polling_tracks_silent_device() {
        let fleet =
            fleet(EngineConfig { poll_interval: Some(Duration::from_millis(20)), ..config() });
        let device =
            fleet.device(DeviceBehaviorBuilder::default().silent(true).build().unwrap()).await;
        let outcome = fleet
            .orchestrator
            .assign(&profile(), fleet.assignment(device, fleet.firmware))
            .await
            .outcome()
            .await
            .unwrap();

        // Reads only see the state at each tick, so steps between ticks are missing. What is
        // recorded still never goes backwards.
        let recorded: Vec<UpdateStatus> = outcome.history.iter().map(|e| e.status).collect();
        assert_eq!(recorded.first(), Some(&Queued));
        assert_eq!(recorded.last(), Some(&Updated));
        assert!(recorded.contains(&Downloaded));
        assert!(!recorded.contains(&Initiated));
        assert!(recorded.windows(2).all(|pair| pair[0] < pair[1]), "{recorded:?}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_sessions_run_in_parallel() {
        let fleet = fleet(config());
        let mut handles = vec![];
        let mut devices = vec![];
        for _ in 0..4 {
            let device = fleet.device(DeviceBehavior::default()).await;
            devices.push(device);
            for package in [fleet.firmware, fleet.software] {
                let assignment = fleet.assignment(device, package);
                handles.push(fleet.orchestrator.assign(&profile(), assignment).await);
            }
        }
        let outcomes = future::join_all(handles.into_iter().map(|handle| handle.outcome())).await;
        for outcome in outcomes {
            let outcome = outcome.unwrap();
            assert_eq!(statuses(&outcome.history).last(), Some(&Updated));
        }
        for device in &devices {
            assert_eq!(fleet.recorded(device, FIRMWARE), FIRMWARE_SUCCESS.to_vec());
            assert_eq!(fleet.recorded(device, SOFTWARE).last(), Some(&Updated));
        }
    }
}

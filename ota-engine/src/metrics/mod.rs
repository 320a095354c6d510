// Copyright 2024 The Fuchsia Authors
//
// Licensed under a BSD-style license <LICENSE-BSD>, Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0>, or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to
// those terms.

use crate::common::{PackageKind, UpdateStatus};
use anyhow::Error;
use std::fmt::Debug;
use std::time::Duration;

mod stub;
pub use stub::StubMetricsReporter;

/// Per-session measurements reported when a delivery ends.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Metrics {
    /// The session reached a terminal status.
    SessionFinished {
        kind: PackageKind,
        status: UpdateStatus,
        elapsed: Duration,
        blocks_sent: u32,
        retries: u32,
    },
    /// The session was superseded or unassigned before it finished.
    SessionSuperseded { kind: PackageKind },
}

pub trait MetricsReporter: Debug + Send + Sync {
    fn report_metrics(&self, metrics: Metrics) -> Result<(), Error>;
}

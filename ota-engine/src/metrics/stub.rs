// Copyright 2024 The Fuchsia Authors
//
// Licensed under a BSD-style license <LICENSE-BSD>, Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0>, or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to
// those terms.

use crate::metrics::{Metrics, MetricsReporter};
use anyhow::Error;
use tracing::info;

/// A stub implementation of MetricsReporter which only logs metrics.
#[derive(Clone, Copy, Debug, Default)]
pub struct StubMetricsReporter;

impl MetricsReporter for StubMetricsReporter {
    fn report_metrics(&self, metrics: Metrics) -> Result<(), Error> {
        info!("Received request to report metrics: {:?}", metrics);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{PackageKind, UpdateStatus};
    use std::time::Duration;

    #[test]
    fn test_stub_metrics_reporter() {
        let stub = StubMetricsReporter;
        let result = stub.report_metrics(Metrics::SessionFinished {
            kind: PackageKind::Firmware,
            status: UpdateStatus::Updated,
            elapsed: Duration::from_secs(2),
            blocks_sent: 4,
            retries: 1,
        });
        assert!(result.is_ok(), "{result:?}");
    }
}

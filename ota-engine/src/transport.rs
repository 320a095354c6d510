// Copyright 2024 The Fuchsia Authors
//
// Licensed under a BSD-style license <LICENSE-BSD>, Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0>, or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to
// those terms.

//! The operations this engine needs from the constrained-protocol transport. Wire encoding is
//! the transport's business; it only has to deliver notifications in arrival order per
//! observation and acknowledge each block before the next one is sent.

use crate::common::DeviceId;
use crate::resource::{ResourcePath, ResourceValue};
use futures::future::BoxFuture;
use futures::prelude::*;
use futures::stream::BoxStream;
use thiserror::Error;

/// A value change pushed by a device for an observed resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    pub path: ResourcePath,
    pub value: ResourceValue,
    /// Observe sequence number, increasing per device.
    pub seq: u32,
}

pub type Notifications = BoxStream<'static, Notification>;

/// One segment of a block-wise payload write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Block<'a> {
    pub index: u32,
    /// More blocks follow this one.
    pub more: bool,
    pub payload: &'a [u8],
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request to device timed out")]
    Timeout,
    #[error("device is disconnected")]
    Disconnected,
    #[error("device rejected the request with code {0}")]
    Rejected(u16),
    #[error("unknown device {0}")]
    UnknownDevice(DeviceId),
    #[error("operation not supported by the device")]
    Unsupported,
}

impl TransportError {
    /// Errors worth retrying with the same request.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Timeout | TransportError::Disconnected)
    }
}

/// Resource operations on remote devices. Every future resolves when the device acknowledged
/// the request.
pub trait Transport: Send + Sync + 'static {
    /// Subscribes to `paths` on `device`. Dropping the stream cancels the observation.
    fn observe<'a>(
        &'a self,
        device: &'a DeviceId,
        paths: &'a [ResourcePath],
    ) -> BoxFuture<'a, Result<Notifications, TransportError>>;

    fn read<'a>(
        &'a self,
        device: &'a DeviceId,
        path: &'a ResourcePath,
    ) -> BoxFuture<'a, Result<ResourceValue, TransportError>>;

    fn write<'a>(
        &'a self,
        device: &'a DeviceId,
        path: &'a ResourcePath,
        value: ResourceValue,
    ) -> BoxFuture<'a, Result<(), TransportError>>;

    /// Writes several resources in one request, for devices that support composite operations.
    fn write_composite<'a>(
        &'a self,
        _device: &'a DeviceId,
        _values: Vec<(ResourcePath, ResourceValue)>,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        future::ready(Err(TransportError::Unsupported)).boxed()
    }

    fn write_block<'a>(
        &'a self,
        device: &'a DeviceId,
        path: &'a ResourcePath,
        block: Block<'a>,
    ) -> BoxFuture<'a, Result<(), TransportError>>;

    fn execute<'a>(
        &'a self,
        device: &'a DeviceId,
        path: &'a ResourcePath,
    ) -> BoxFuture<'a, Result<(), TransportError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(TransportError::Timeout.is_transient());
        assert!(TransportError::Disconnected.is_transient());
        assert!(!TransportError::Rejected(405).is_transient());
        assert!(!TransportError::Unsupported.is_transient());
        assert!(!TransportError::UnknownDevice(DeviceId::new()).is_transient());
    }
}

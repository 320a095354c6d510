// Copyright 2024 The Fuchsia Authors
//
// Licensed under a BSD-style license <LICENSE-BSD>, Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0>, or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to
// those terms.

use crate::common::DeviceId;
use crate::package::Package;
use crate::resource::ResourcePath;
use crate::transport::{Block, Transport, TransportError};
use futures::channel::mpsc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Progress of a [`BlockTransfer`], in the order it happened.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) enum TransferEvent {
    BlockAcknowledged { index: u32 },
    BlockRetry { index: u32, attempt: u32, error: TransportError },
    TransferFailed { index: u32, attempts: u32, error: TransportError },
    TransferComplete,
}

/// Position of a block-wise transfer: every block before `next` has been acknowledged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferCursor {
    next: u32,
    total: u32,
}

impl TransferCursor {
    pub fn new(total: u32) -> Self {
        Self { next: 0, total }
    }

    pub fn next(&self) -> u32 {
        self.next
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn is_complete(&self) -> bool {
        self.next >= self.total
    }

    /// Records the acknowledgment of block `index`. Only the block the cursor waits for moves it;
    /// a repeated or out-of-range acknowledgment returns false.
    pub fn acknowledge(&mut self, index: u32) -> bool {
        if index == self.next && index < self.total {
            self.next += 1;
            true
        } else {
            false
        }
    }
}

/// Writes a package to a device block by block, from a given index to the end. Progress is
/// reported to the owning session, which alone updates the cursor.
pub(super) struct BlockTransfer<T> {
    pub transport: Arc<T>,
    pub device: DeviceId,
    pub path: ResourcePath,
    pub package: Arc<Package>,
    pub block_size: usize,
    pub max_retries: u32,
    pub backoff: Duration,
    pub progress: mpsc::UnboundedSender<TransferEvent>,
}

impl<T: Transport> BlockTransfer<T> {
    pub async fn run(self, start: u32) {
        let total = self.package.block_count(self.block_size);
        for index in start..total {
            let Some(payload) = self.package.block(index, self.block_size) else {
                break;
            };
            let block = Block { index, more: index + 1 < total, payload };
            let mut attempt = 0;
            loop {
                match self.transport.write_block(&self.device, &self.path, block).await {
                    Ok(()) => {
                        debug!(device = %self.device, "Block {}/{total} acknowledged", index + 1);
                        self.send(TransferEvent::BlockAcknowledged { index });
                        break;
                    }
                    Err(error) if error.is_transient() && attempt < self.max_retries => {
                        attempt += 1;
                        warn!(
                            device = %self.device,
                            "Block {index} failed ({error}), retry {attempt}/{}",
                            self.max_retries
                        );
                        self.send(TransferEvent::BlockRetry { index, attempt, error });
                        tokio::time::sleep(self.backoff).await;
                    }
                    Err(error) => {
                        self.send(TransferEvent::TransferFailed {
                            index,
                            attempts: attempt + 1,
                            error,
                        });
                        return;
                    }
                }
            }
        }
        self.send(TransferEvent::TransferComplete);
    }

    fn send(&self, event: TransferEvent) {
        // The session stopped listening; it is being torn down.
        let _ = self.progress.unbounded_send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_cursor_advances_in_order() {
        let mut cursor = TransferCursor::new(3);
        assert!(!cursor.acknowledge(1));
        assert!(cursor.acknowledge(0));
        assert!(!cursor.acknowledge(0));
        assert!(cursor.acknowledge(1));
        assert!(cursor.acknowledge(2));
        assert!(cursor.is_complete());
        assert!(!cursor.acknowledge(3));
        assert_eq!(cursor.next(), 3);
    }

    #[test]
    fn test_empty_transfer_is_complete() {
        assert!(TransferCursor::new(0).is_complete());
    }

    proptest! {
        #[test]
        fn test_redelivered_acks_advance_once(
            total in 1u32..64,
            acks in prop::collection::vec(0u32..64, 0..256),
        ) {
            let mut cursor = TransferCursor::new(total);
            let mut advanced = 0;
            for index in acks {
                let before = cursor.next();
                if cursor.acknowledge(index) {
                    advanced += 1;
                    prop_assert_eq!(cursor.next(), before + 1);
                } else {
                    prop_assert_eq!(cursor.next(), before);
                }
            }
            prop_assert!(cursor.next() <= total);
            prop_assert_eq!(cursor.next(), advanced);
        }

        #[test]
        fn test_sequential_acks_complete(total in 0u32..128) {
            let mut cursor = TransferCursor::new(total);
            for index in 0..total {
                prop_assert!(cursor.acknowledge(index));
                prop_assert!(!cursor.acknowledge(index));
            }
            prop_assert!(cursor.is_complete());
        }
    }
}

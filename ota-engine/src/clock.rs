// Copyright 2024 The Fuchsia Authors
//
// Licensed under a BSD-style license <LICENSE-BSD>, Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0>, or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to
// those terms.

use chrono::{DateTime, Utc};
use std::fmt::Debug;

/// Source of wall-clock timestamps for status events.
pub trait TimeSource: Debug + Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct StandardTimeSource;

impl TimeSource for StandardTimeSource {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub mod mock {
    use super::*;
    use std::sync::{Arc, Mutex, PoisonError};

    /// A clock that only moves when told to. Clones share the same time.
    #[derive(Clone, Debug)]
    pub struct MockTimeSource(Arc<Mutex<DateTime<Utc>>>);

    impl MockTimeSource {
        pub fn new(time: DateTime<Utc>) -> Self {
            Self(Arc::new(Mutex::new(time)))
        }

        pub fn new_from_now() -> Self {
            Self::new(Utc::now())
        }

        pub fn set(&self, new_time: DateTime<Utc>) {
            *self.0.lock().unwrap_or_else(PoisonError::into_inner) = new_time;
        }

        pub fn advance(&self, duration: chrono::Duration) {
            let mut time = self.0.lock().unwrap_or_else(PoisonError::into_inner);
            *time += duration;
        }
    }

    impl TimeSource for MockTimeSource {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }
}

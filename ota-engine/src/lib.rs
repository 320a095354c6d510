// Copyright 2024 The Fuchsia Authors
//
// Licensed under a BSD-style license <LICENSE-BSD>, Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0>, or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to
// those terms.

//! Server-side engine that delivers firmware and software packages to devices managed over a
//! constrained object/resource protocol, and records every lifecycle transition as telemetry.

pub mod clock;
pub mod common;
pub mod configuration;
pub mod metrics;
pub mod observer;
pub mod orchestrator;
pub mod package;
pub mod resource;
pub mod state_machine;
pub mod strategy;
pub mod telemetry;
pub mod transport;

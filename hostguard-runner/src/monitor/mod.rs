// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Watchers that detect non-graceful terminations of the test host.
//!
//! * [`HangMonitor`] fires when the host stops reporting progress.
//! * [`CrashDetector`] classifies how the host exited.
//!
//! Both feed into the [`DumpCoordinator`](crate::dump::DumpCoordinator), which makes sure only
//! one of them captures dumps for an attempt.

mod crash;
mod hang;

pub use crash::*;
pub use hang::*;

// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Retrying failed tests across attempts.
//!
//! [`ThresholdPolicy`] decides, after each attempt, whether a retry is allowed. The
//! [`RetryCoordinator`] drives the attempts themselves.

mod coordinator;
mod threshold;

pub use coordinator::*;
pub use threshold::*;

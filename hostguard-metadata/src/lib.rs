// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Stable external contracts for [hostguard](https://crates.io/crates/hostguard).
//!
//! This crate contains the documented exit codes and the line-delimited JSON
//! protocol spoken between the supervisor and a test host.

mod exit_codes;
mod protocol;

pub use exit_codes::*;
pub use protocol::*;

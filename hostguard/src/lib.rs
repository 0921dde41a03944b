// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Runs a test host process under supervision.
//!
//! hostguard launches a test host, watches its process tree for crashes and hangs, captures
//! memory dumps when either happens, can ask the host to stop after too many failures, and
//! re-runs failed tests. The core logic lives in
//! [`hostguard-runner`](https://crates.io/crates/hostguard-runner); this crate is the command-line
//! front end.

#![warn(missing_docs)]

mod dispatch;
mod errors;
mod output;

#[doc(hidden)]
pub use dispatch::*;
#[doc(hidden)]
pub use errors::*;
#[doc(hidden)]
pub use output::{Color, OutputContext, StderrStyles};

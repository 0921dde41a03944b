// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Core functionality for [hostguard](https://crates.io/crates/hostguard), a supervisor that runs
//! a test host process, watches it for crashes and hangs, captures memory dumps of its process
//! tree, and retries failed tests.
//!
//! A session is driven by a [`retry::RetryCoordinator`], which runs one attempt at a time through
//! a [`runner::AttemptRunner`].

pub mod config;
pub mod dump;
pub mod errors;
pub mod exit_code;
pub mod helpers;
pub mod monitor;
pub mod process_tree;
pub mod reporter;
pub mod results;
pub mod retry;
pub mod runner;
pub mod signal;
pub mod stop;
mod time;

// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Running a single attempt of the test host.
//!
//! The main structure in this module is [`AttemptRunner`].

mod imp;

#[cfg(unix)]
#[path = "unix.rs"]
mod os;

#[cfg(windows)]
#[path = "windows.rs"]
mod os;

pub use imp::*;

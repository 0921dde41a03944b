// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Helpers shared by the integration tests and the fixture binaries.

pub mod fixture;
pub mod hostguard_cli;

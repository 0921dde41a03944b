// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration support for hostguard.
//!
//! Configuration is read from an embedded default config, layered under an optional
//! `.config/hostguard.toml`. Command-line options are then validated against it into
//! [`SessionSettings`].

mod hang_timeout;
mod imp;
mod settings;

pub use hang_timeout::*;
pub use imp::*;
pub use settings::*;

// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A duplicate of hostguard's main.rs, so that integration tests run a binary built from this
//! package. See tests/integration/main.rs for more.

use color_eyre::Result;

fn main() -> Result<()> {
    color_eyre::install()?;
    let _ = enable_ansi_support::enable_ansi_support();

    hostguard::main_impl()
}

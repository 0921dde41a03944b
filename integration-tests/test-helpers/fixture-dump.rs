// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A fake dump tool.
//!
//! Accepts the default dump argument template, `<kind-flag> --name <path> <pid>`, and writes a
//! small text file instead of a memory dump.

use color_eyre::{Result, eyre::bail};

fn main() -> Result<()> {
    color_eyre::install()?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let [kind_flag, name_flag, path, pid] = args.as_slice() else {
        bail!("[fixture-dump] expected 4 arguments, found {args:?}");
    };
    if name_flag != "--name" {
        bail!("[fixture-dump] expected `--name`, found `{name_flag}`");
    }
    let pid: u32 = pid.parse()?;

    fs_err::write(path, format!("pid {pid} {kind_flag}\n"))?;
    eprintln!("[fixture-dump] wrote {path}");
    Ok(())
}

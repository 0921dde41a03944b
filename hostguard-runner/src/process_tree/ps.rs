// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{ProcessEntry, ProcessEnumerator};
use crate::errors::ProcessEnumError;

const PS_ARGS: &[&str] = &["-A", "-o", "pid=,ppid=,comm="];

/// Enumerates processes by running `ps`.
#[derive(Clone, Copy, Debug, Default)]
pub struct PsEnumerator;

impl ProcessEnumerator for PsEnumerator {
    fn enumerate(&self) -> Result<Vec<ProcessEntry>, ProcessEnumError> {
        let output = duct::cmd("ps", PS_ARGS)
            .stderr_null()
            .read()
            .map_err(|err| ProcessEnumError::Command {
                command: format!("ps {}", PS_ARGS.join(" ")),
                err,
            })?;
        Ok(output.lines().filter_map(parse_ps_line).collect())
    }
}

fn parse_ps_line(line: &str) -> Option<ProcessEntry> {
    let mut parts = line.split_whitespace();
    let pid = parts.next()?.parse().ok()?;
    let ppid = parts.next()?.parse().ok()?;
    let comm = parts.collect::<Vec<_>>().join(" ");
    // comm can be a full path on some platforms.
    let name = comm.rsplit('/').next().unwrap_or_default().to_owned();
    Some(ProcessEntry {
        pid,
        ppid: Some(ppid),
        name: (!name.is_empty()).then_some(name),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ps_output() {
        let entry = parse_ps_line("  412     1 /usr/libexec/test host").unwrap();
        assert_eq!(entry.pid, 412);
        assert_eq!(entry.ppid, Some(1));
        assert_eq!(entry.name.as_deref(), Some("test host"));

        assert_eq!(parse_ps_line("header line"), None);
    }
}

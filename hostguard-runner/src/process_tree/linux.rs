// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{ProcessEntry, ProcessEnumerator};
use crate::errors::ProcessEnumError;
use camino::{Utf8Path, Utf8PathBuf};

/// Enumerates processes by reading `/proc/<pid>/stat`.
#[derive(Clone, Debug)]
pub struct ProcFsEnumerator {
    proc_root: Utf8PathBuf,
}

impl ProcFsEnumerator {
    /// Creates an enumerator reading from `/proc`.
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Creates an enumerator reading from a different procfs root.
    pub fn with_root(proc_root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }
}

impl Default for ProcFsEnumerator {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessEnumerator for ProcFsEnumerator {
    fn enumerate(&self) -> Result<Vec<ProcessEntry>, ProcessEnumError> {
        let dir = self.proc_root.read_dir_utf8().map_err(|err| {
            ProcessEnumError::ReadProcTable {
                path: self.proc_root.clone(),
                err,
            }
        })?;

        let mut entries = Vec::new();
        for dir_entry in dir {
            // Entries can disappear while we're iterating.
            let Ok(dir_entry) = dir_entry else { continue };
            let Ok(pid) = dir_entry.file_name().parse::<u32>() else {
                continue;
            };
            if let Some(entry) = read_stat(&self.proc_root, pid) {
                entries.push(entry);
            }
        }

        Ok(entries)
    }
}

fn read_stat(proc_root: &Utf8Path, pid: u32) -> Option<ProcessEntry> {
    let contents = std::fs::read_to_string(proc_root.join(pid.to_string()).join("stat")).ok()?;
    let (name, state, ppid) = parse_stat(&contents)?;
    // Zombies have already exited and can't be dumped.
    if state == "Z" {
        return None;
    }
    Some(ProcessEntry {
        pid,
        ppid: Some(ppid),
        name: Some(name.to_owned()),
    })
}

/// Parses the name, state and parent pid out of a `/proc/<pid>/stat` line.
///
/// The name is wrapped in parentheses and may itself contain spaces and parentheses, so the
/// fields after it are located from the last `)`.
fn parse_stat(contents: &str) -> Option<(&str, &str, u32)> {
    let open = contents.find('(')?;
    let close = contents.rfind(')')?;
    let name = contents.get(open + 1..close)?;
    let mut rest = contents.get(close + 1..)?.split_ascii_whitespace();
    let state = rest.next()?;
    let ppid = rest.next()?.parse().ok()?;
    Some((name, state, ppid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;
    use test_case::test_case;

    #[test_case("1234 (bash) S 1 1234 1234 0 -1", Some(("bash", "S", 1)); "simple")]
    #[test_case("55 (my (weird) proc) R 54 55 55", Some(("my (weird) proc", "R", 54)); "parens in name")]
    #[test_case("77 (with space) Z 3 0", Some(("with space", "Z", 3)); "space in name")]
    #[test_case("garbage", None; "no parens")]
    #[test_case("12 (x) S notanumber", None; "bad ppid")]
    fn parse_stat_lines(input: &str, expected: Option<(&str, &str, u32)>) {
        assert_eq!(parse_stat(input), expected);
    }

    #[test]
    fn enumerates_fake_procfs() {
        let dir = Utf8TempDir::new().unwrap();
        let stats = [
            (1, "1 (init) S 0 1"),
            (42, "42 (host) S 1 42"),
            (43, "43 (child) S 42 42"),
            (44, "44 (defunct) Z 42 42"),
        ];
        for (pid, line) in stats {
            let pid_dir = dir.path().join(pid.to_string());
            std::fs::create_dir(&pid_dir).unwrap();
            std::fs::write(pid_dir.join("stat"), line).unwrap();
        }
        std::fs::create_dir(dir.path().join("self")).unwrap();

        let mut entries = ProcFsEnumerator::with_root(dir.path()).enumerate().unwrap();
        entries.sort_by_key(|e| e.pid);
        let summary: Vec<_> = entries
            .iter()
            .map(|e| (e.pid, e.ppid, e.name.as_deref()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (1, Some(0), Some("init")),
                (42, Some(1), Some("host")),
                (43, Some(42), Some("child")),
            ]
        );
    }
}

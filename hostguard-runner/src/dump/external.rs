// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{DumpKind, DumpWriter};
use crate::errors::DumpWriteError;
use camino::Utf8Path;
use tracing::{debug, trace};

/// Writes dumps by running an external tool such as `createdump`.
///
/// Each argument may contain the placeholders `{kind-flag}`, `{path}` and `{pid}`.
#[derive(Clone, Debug)]
pub struct ExternalDumpWriter {
    tool: String,
    args: Vec<String>,
}

impl ExternalDumpWriter {
    /// Creates a new writer from a tool and an argument template.
    pub fn new(tool: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            tool: tool.into(),
            args,
        }
    }

    fn expand_args(&self, pid: u32, kind: DumpKind, path: &Utf8Path) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{kind-flag}", kind.kind_flag())
                    .replace("{path}", path.as_str())
                    .replace("{pid}", &pid.to_string())
            })
            .collect()
    }

    /// Converts a dump of `pid` into a [`duct::Expression`].
    pub fn to_expression(&self, pid: u32, kind: DumpKind, path: &Utf8Path) -> duct::Expression {
        duct::cmd(&self.tool, self.expand_args(pid, kind, path))
    }
}

impl DumpWriter for ExternalDumpWriter {
    fn write_dump(&self, pid: u32, kind: DumpKind, path: &Utf8Path) -> Result<(), DumpWriteError> {
        let expression = self.to_expression(pid, kind, path);
        trace!("executing dump tool: {:?}", expression);

        let output = expression
            .stdout_capture()
            .stderr_capture()
            .unchecked()
            .run()
            .map_err(|err| DumpWriteError::Exec {
                tool: self.tool.clone(),
                pid,
                err,
            })?;

        if !output.status.success() {
            debug!("dump tool failed with {}", output.status);
            debug!("stdout:");
            debug!("{}", String::from_utf8_lossy(&output.stdout));
            debug!("stderr:");
            debug!("{}", String::from_utf8_lossy(&output.stderr));
            return Err(DumpWriteError::ToolFailed {
                tool: self.tool.clone(),
                pid,
                exit_code: output.status.code(),
            });
        }

        Ok(())
    }
}

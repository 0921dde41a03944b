// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Capturing memory dumps of the test host's process tree.
//!
//! Dumps are requested by the [`DumpCoordinator`] when either a crash or a hang is detected, and
//! are written by a [`DumpWriter`].

mod coordinator;
mod external;

use crate::{errors::DumpKindParseError, process_tree::ProcessNode};
use camino::{Utf8Path, Utf8PathBuf};
pub use coordinator::*;
pub use external::*;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// The kind of dump to write.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize)]
pub enum DumpKind {
    /// Stacks and module lists only.
    Mini,

    /// Mini plus the managed heap.
    Heap,

    /// A mini dump with personal data removed.
    Triage,

    /// The full process memory.
    #[default]
    Full,
}

impl DumpKind {
    /// Returns the string representations of all variants.
    pub fn variants() -> &'static [&'static str] {
        &["Mini", "Heap", "Triage", "Full"]
    }

    /// Returns the flag the default dump tool uses for this kind.
    pub fn kind_flag(self) -> &'static str {
        match self {
            Self::Mini => "--normal",
            Self::Heap => "--withheap",
            Self::Triage => "--triage",
            Self::Full => "--full",
        }
    }
}

impl fmt::Display for DumpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Mini => "Mini",
            Self::Heap => "Heap",
            Self::Triage => "Triage",
            Self::Full => "Full",
        };
        f.write_str(s)
    }
}

impl FromStr for DumpKind {
    type Err = DumpKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s.to_ascii_lowercase().as_str() {
            "mini" => Self::Mini,
            "heap" => Self::Heap,
            "triage" => Self::Triage,
            "full" => Self::Full,
            _ => return Err(DumpKindParseError::new(s)),
        };
        Ok(kind)
    }
}

impl<'de> Deserialize<'de> for DumpKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// What caused a dump to be captured.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DumpTrigger {
    /// The host terminated non-gracefully.
    Crash,

    /// The host stopped reporting progress.
    Hang,
}

impl DumpTrigger {
    fn suffix(self) -> &'static str {
        match self {
            Self::Crash => "_crash",
            Self::Hang => "_hang",
        }
    }
}

impl fmt::Display for DumpTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Crash => f.write_str("crash"),
            Self::Hang => f.write_str("hang"),
        }
    }
}

/// Settings for one dump generator (crash or hang).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DumpGeneratorSettings {
    /// The kind of dump to write.
    pub kind: DumpKind,

    /// A file name template, or `None` for the default.
    ///
    /// `%p` is replaced with the process ID and `%e` with the process name.
    pub file_template: Option<String>,
}

/// Which dump generators are enabled for a session.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DumpSettings {
    /// Settings for crash dumps, if enabled.
    pub crash: Option<DumpGeneratorSettings>,

    /// Settings for hang dumps, if enabled.
    pub hang: Option<DumpGeneratorSettings>,
}

impl DumpSettings {
    /// Returns the settings for the given trigger, if that generator is enabled.
    pub fn generator(&self, trigger: DumpTrigger) -> Option<&DumpGeneratorSettings> {
        match trigger {
            DumpTrigger::Crash => self.crash.as_ref(),
            DumpTrigger::Hang => self.hang.as_ref(),
        }
    }

    /// Returns true if both crash and hang dumps are enabled.
    pub fn both_enabled(&self) -> bool {
        self.crash.is_some() && self.hang.is_some()
    }
}

/// A file name template for dumps, with disambiguation applied.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DumpFileTemplate {
    template: String,
}

impl DumpFileTemplate {
    /// Builds the template for a trigger.
    ///
    /// * The default template is `%e_%p_crash.dmp` or `%e_%p_hang.dmp`.
    /// * If both generators are enabled, a user template that lacks the trigger's suffix gets it
    ///   inserted before the extension.
    /// * If more than one process is dumped, a template without `%p` gets `_%p` inserted before
    ///   the extension, so that every process gets its own file.
    pub fn new(
        user_template: Option<&str>,
        trigger: DumpTrigger,
        both_enabled: bool,
        multiple_targets: bool,
    ) -> Self {
        let Some(user_template) = user_template else {
            return Self {
                template: format!("%e_%p{}.dmp", trigger.suffix()),
            };
        };

        let mut template = user_template.to_owned();
        if multiple_targets && !template.contains("%p") {
            template = insert_before_extension(&template, "_%p");
        }
        if both_enabled && !template.contains(trigger.suffix()) {
            template = insert_before_extension(&template, trigger.suffix());
        }
        Self { template }
    }

    /// Returns the raw template.
    pub fn as_str(&self) -> &str {
        &self.template
    }

    /// Expands the template for a process.
    pub fn expand(&self, node: &ProcessNode) -> String {
        self.template
            .replace("%p", &node.pid.to_string())
            .replace("%e", &node.name)
    }
}

fn insert_before_extension(template: &str, insertion: &str) -> String {
    // Only the file name can carry an extension.
    let name_start = template.rfind(['/', '\\']).map_or(0, |sep| sep + 1);
    match template[name_start..].rfind('.') {
        Some(dot) if dot > 0 => {
            let dot = name_start + dot;
            format!("{}{insertion}{}", &template[..dot], &template[dot..])
        }
        _ => format!("{template}{insertion}"),
    }
}

/// A request to dump every node in a fixed snapshot of the process tree.
#[derive(Clone, Debug)]
pub struct DumpRequest {
    /// What caused the dump.
    pub trigger: DumpTrigger,

    /// The kind of dump to write.
    pub kind: DumpKind,

    /// The processes to dump, as of the moment the trigger fired.
    pub target_nodes: Vec<ProcessNode>,

    /// The file name template.
    pub output_template: DumpFileTemplate,

    /// The directory to write dumps to.
    pub output_directory: Utf8PathBuf,
}

impl DumpRequest {
    /// Returns the path the dump for `node` will be written to.
    pub fn output_path(&self, node: &ProcessNode) -> Utf8PathBuf {
        self.output_directory
            .join(self.output_template.expand(node))
    }
}

/// A dump that was written successfully.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct CapturedDump {
    /// What caused the dump.
    pub trigger: DumpTrigger,

    /// The process that was dumped.
    pub pid: u32,

    /// The name of the process that was dumped.
    pub process_name: String,

    /// Where the dump was written.
    pub path: Utf8PathBuf,
}

/// Writes a memory dump of a single process.
///
/// Implementations are called from a blocking thread.
pub trait DumpWriter: Send + Sync + 'static {
    /// Writes a dump of `pid` to `path`.
    fn write_dump(
        &self,
        pid: u32,
        kind: DumpKind,
        path: &Utf8Path,
    ) -> Result<(), crate::errors::DumpWriteError>;
}

// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Host capabilities and cooperative stop requests.
//!
//! A test host declares the optional capabilities it supports. Capabilities are resolved once, at
//! session start, into a [`CapabilityRegistry`]. Flags that depend on a capability the host
//! doesn't declare are rejected before any attempt runs.

use crate::errors::PolicyViolation;
use hostguard_metadata::{ControlMessage, TestOutcome, TestUid, TestUpdate};
use serde::Deserialize;
use std::{collections::HashSet, fmt, sync::Arc};
use tracing::info;

/// An optional capability a test host can declare.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum CapabilityKind {
    /// The host can stop starting new tests when asked to, and then exit normally.
    GracefulStop,
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GracefulStop => f.write_str("graceful-stop"),
        }
    }
}

/// A way to ask the host to stop starting new tests.
pub trait GracefulStopCapability: fmt::Debug + Send + Sync {
    /// Encodes a stop request, to be written to the host's stdin.
    fn encode_stop_request(&self, reason: &str) -> Vec<u8>;
}

/// The default stop protocol: a `stop-request` JSON line on the host's stdin.
#[derive(Clone, Copy, Debug, Default)]
pub struct StdinStopProtocol;

impl GracefulStopCapability for StdinStopProtocol {
    fn encode_stop_request(&self, reason: &str) -> Vec<u8> {
        let message = ControlMessage::StopRequest {
            reason: reason.to_owned(),
        };
        message.to_line().into_bytes()
    }
}

/// Capabilities declared by the test host, resolved at session start.
#[derive(Clone, Debug, Default)]
pub struct CapabilityRegistry {
    graceful_stop: Option<Arc<dyn GracefulStopCapability>>,
}

impl CapabilityRegistry {
    /// Resolves the list of declared capabilities into implementations.
    pub fn from_declared(declared: &[CapabilityKind]) -> Self {
        let mut registry = Self::default();
        for kind in declared {
            match kind {
                CapabilityKind::GracefulStop => {
                    registry.graceful_stop = Some(Arc::new(StdinStopProtocol));
                }
            }
        }
        registry
    }

    /// Returns the graceful stop capability, if the host declared it.
    pub fn graceful_stop(&self) -> Option<&Arc<dyn GracefulStopCapability>> {
        self.graceful_stop.as_ref()
    }

    /// Returns an error if `kind` is not available. `flag` is the flag that requires it.
    pub fn require(&self, kind: CapabilityKind, flag: &'static str) -> Result<(), PolicyViolation> {
        let present = match kind {
            CapabilityKind::GracefulStop => self.graceful_stop.is_some(),
        };
        if present {
            Ok(())
        } else {
            Err(PolicyViolation::MissingCapability {
                flag,
                capability: kind,
            })
        }
    }
}

/// A stop request that should be sent to the host.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StopRequest {
    /// Why the stop was requested.
    pub reason: String,

    /// The encoded request.
    pub bytes: Vec<u8>,
}

/// Counts failures during an attempt and requests a cooperative stop once the maximum number of
/// failed tests is reached.
#[derive(Debug)]
pub struct GracefulStopController {
    max_failed: usize,
    capability: Arc<dyn GracefulStopCapability>,
    failed: HashSet<TestUid>,
    state: StopState,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum StopState {
    Idle,
    Requested,
    Acknowledged,
}

impl GracefulStopController {
    /// Creates a new controller for one attempt.
    pub fn new(max_failed: usize, capability: Arc<dyn GracefulStopCapability>) -> Self {
        Self {
            max_failed,
            capability,
            failed: HashSet::new(),
            state: StopState::Idle,
        }
    }

    /// Observes a test transition.
    ///
    /// Returns a stop request the first time the number of distinct failed tests reaches the
    /// maximum.
    pub fn observe(&mut self, update: &TestUpdate) -> Option<StopRequest> {
        if update.outcome != TestOutcome::Failed {
            return None;
        }
        self.failed.insert(update.uid.clone());
        if self.state != StopState::Idle || self.failed.len() < self.max_failed {
            return None;
        }

        self.state = StopState::Requested;
        let reason = format!(
            "Maximum failed tests threshold is {} and {} tests failed",
            self.max_failed,
            self.failed.len(),
        );
        info!("{reason}, asking the test host to stop");
        let bytes = self.capability.encode_stop_request(&reason);
        Some(StopRequest { reason, bytes })
    }

    /// Records that the host acknowledged the stop request.
    pub fn acknowledge(&mut self) {
        if self.state == StopState::Requested {
            self.state = StopState::Acknowledged;
        }
    }

    /// Returns true if a stop was requested.
    pub fn stop_requested(&self) -> bool {
        self.state != StopState::Idle
    }

    /// Returns true if the host acknowledged the stop request.
    pub fn acknowledged(&self) -> bool {
        self.state == StopState::Acknowledged
    }
}

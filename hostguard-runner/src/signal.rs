// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Support for aborting a session, from signals or programmatically.

use crate::errors::SignalHandlerSetupError;
use std::sync::Arc;
use tokio::sync::watch;

/// The kind of signal handling to set up for a session.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum SignalHandlerKind {
    /// The standard signal handler. Capture interrupt and termination signals depending on the
    /// platform.
    Standard,

    /// A no-op signal handler. Useful for tests: the session can still be aborted through an
    /// [`AbortTrigger`].
    Noop,
}

impl SignalHandlerKind {
    pub(crate) fn build(
        self,
        trigger: &AbortTrigger,
    ) -> Result<SignalHandler, SignalHandlerSetupError> {
        let signals = match self {
            Self::Standard => Some(imp::Signals::new()?),
            Self::Noop => None,
        };
        Ok(SignalHandler {
            signals,
            abort_rx: trigger.tx.subscribe(),
        })
    }
}

/// Aborts a running session from code, as if the operator had pressed Ctrl-C.
#[derive(Clone, Debug)]
pub struct AbortTrigger {
    tx: Arc<watch::Sender<bool>>,
}

impl AbortTrigger {
    /// Creates a new trigger.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Aborts the session.
    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    /// Returns true if the session was aborted.
    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for AbortTrigger {
    fn default() -> Self {
        Self::new()
    }
}

/// The signal handler implementation.
#[derive(Debug)]
pub(crate) struct SignalHandler {
    signals: Option<imp::Signals>,
    abort_rx: watch::Receiver<bool>,
}

impl SignalHandler {
    /// Waits for the next abort event.
    ///
    /// Returns `None` once no more events can arrive.
    pub(crate) async fn recv(&mut self) -> Option<AbortEvent> {
        if *self.abort_rx.borrow_and_update() {
            return Some(AbortEvent::Requested);
        }

        let mut trigger_done = false;
        loop {
            tokio::select! {
                event = recv_signal(&mut self.signals), if self.signals.is_some() => {
                    match event {
                        Some(event) => break Some(AbortEvent::Signal(event)),
                        None => self.signals = None,
                    }
                }
                changed = self.abort_rx.changed(), if !trigger_done => {
                    match changed {
                        Ok(()) => {
                            if *self.abort_rx.borrow_and_update() {
                                break Some(AbortEvent::Requested);
                            }
                        }
                        Err(_) => trigger_done = true,
                    }
                }
                else => break None,
            }
        }
    }
}

async fn recv_signal(signals: &mut Option<imp::Signals>) -> Option<ShutdownEvent> {
    match signals {
        Some(signals) => signals.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(unix)]
mod imp {
    use super::*;
    use tokio::signal::unix::{Signal, SignalKind, signal};

    /// Signals for SIGINT, SIGTERM and SIGHUP on Unix.
    #[derive(Debug)]
    pub(super) struct Signals {
        sigint: SignalWithDone,
        sighup: SignalWithDone,
        sigterm: SignalWithDone,
    }

    impl Signals {
        pub(super) fn new() -> std::io::Result<Self> {
            let sigint = SignalWithDone::new(SignalKind::interrupt())?;
            let sighup = SignalWithDone::new(SignalKind::hangup())?;
            let sigterm = SignalWithDone::new(SignalKind::terminate())?;

            Ok(Self {
                sigint,
                sighup,
                sigterm,
            })
        }

        pub(super) async fn recv(&mut self) -> Option<ShutdownEvent> {
            loop {
                tokio::select! {
                    recv = self.sigint.signal.recv(), if !self.sigint.done => {
                        match recv {
                            Some(()) => break Some(ShutdownEvent::Interrupt),
                            None => self.sigint.done = true,
                        }
                    }
                    recv = self.sighup.signal.recv(), if !self.sighup.done => {
                        match recv {
                            Some(()) => break Some(ShutdownEvent::Hangup),
                            None => self.sighup.done = true,
                        }
                    }
                    recv = self.sigterm.signal.recv(), if !self.sigterm.done => {
                        match recv {
                            Some(()) => break Some(ShutdownEvent::Term),
                            None => self.sigterm.done = true,
                        }
                    }
                    else => {
                        break None
                    }
                }
            }
        }
    }

    #[derive(Debug)]
    struct SignalWithDone {
        signal: Signal,
        done: bool,
    }

    impl SignalWithDone {
        fn new(kind: SignalKind) -> std::io::Result<Self> {
            let signal = signal(kind)?;
            Ok(Self {
                signal,
                done: false,
            })
        }
    }
}

#[cfg(windows)]
mod imp {
    use super::*;
    use tokio::signal::windows::{CtrlC, ctrl_c};

    #[derive(Debug)]
    pub(super) struct Signals {
        ctrl_c: CtrlC,
        ctrl_c_done: bool,
    }

    impl Signals {
        pub(super) fn new() -> std::io::Result<Self> {
            let ctrl_c = ctrl_c()?;
            Ok(Self {
                ctrl_c,
                ctrl_c_done: false,
            })
        }

        pub(super) async fn recv(&mut self) -> Option<ShutdownEvent> {
            if self.ctrl_c_done {
                return None;
            }

            match self.ctrl_c.recv().await {
                Some(()) => Some(ShutdownEvent::Interrupt),
                None => {
                    self.ctrl_c_done = true;
                    None
                }
            }
        }
    }
}

/// An event that aborts the session.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AbortEvent {
    /// A signal was received.
    Signal(ShutdownEvent),

    /// [`AbortTrigger::abort`] was called.
    Requested,
}

/// A signal that should cause a shutdown to happen.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ShutdownEvent {
    /// SIGHUP.
    #[cfg(unix)]
    Hangup,

    /// SIGTERM.
    #[cfg(unix)]
    Term,

    /// SIGINT or Ctrl-C.
    Interrupt,
}

impl std::fmt::Display for AbortEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(unix)]
            Self::Signal(ShutdownEvent::Hangup) => f.write_str("SIGHUP"),
            #[cfg(unix)]
            Self::Signal(ShutdownEvent::Term) => f.write_str("SIGTERM"),
            Self::Signal(ShutdownEvent::Interrupt) => f.write_str("interrupt"),
            Self::Requested => f.write_str("abort request"),
        }
    }
}

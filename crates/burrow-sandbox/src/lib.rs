//! Process sandboxing for the burrow file server.
//!
//! Wraps three platform capabilities behind the [`Sandbox`] trait:
//! - **restrict visibility**: limit which filesystem paths the process may ever
//!   touch (`unveil(2)` on OpenBSD)
//! - **lock visibility**: forbid any further visibility grants
//!   (`unveil(NULL, NULL)`)
//! - **restrict syscalls**: limit the categories of system calls the process
//!   may issue from now on (`pledge(2)`)
//!
//! [`PlatformSandbox`] selects the real implementation on OpenBSD and a no-op
//! everywhere else, so callers never branch on the platform. The
//! [`Negotiator`] enforces the fixed call order on top of either variant.

mod noop;
#[cfg(target_os = "openbsd")]
mod openbsd;

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

pub use noop::NoopSandbox;
#[cfg(target_os = "openbsd")]
pub use openbsd::OpenBsdSandbox;

/// Sandbox implementation for the current build target.
#[cfg(target_os = "openbsd")]
pub type PlatformSandbox = OpenBsdSandbox;

/// Sandbox implementation for the current build target.
#[cfg(not(target_os = "openbsd"))]
pub type PlatformSandbox = NoopSandbox;

/// Promises granted to the file server: standard I/O, path reads, networking.
pub const SERVER_PROMISES: &[Promise] = &[Promise::Stdio, Promise::Rpath, Promise::Inet];

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("failed to unveil {}: {source}", path.display())]
    Unveil {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to block unveil: {0}")]
    UnveilBlock(#[source] io::Error),

    #[error("failed to pledge \"{promises}\": {source}")]
    Pledge {
        promises: String,
        #[source]
        source: io::Error,
    },

    #[error("path contains an interior NUL byte: {}", .0.display())]
    InvalidPath(PathBuf),

    #[error("visibility list is locked")]
    VisibilityLocked,

    #[error("{step} called out of order (stage: {stage})")]
    OutOfOrder { step: &'static str, stage: Stage },

    #[error("sandbox negotiation already failed")]
    Poisoned,
}

/// Access modes for a visibility grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    pub create: bool,
}

impl Permissions {
    pub const READ_ONLY: Self = Self {
        read: true,
        write: false,
        execute: false,
        create: false,
    };
}

impl fmt::Display for Permissions {
    /// Renders the unveil flag string, e.g. `r` or `rwc`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flags = [
            (self.read, 'r'),
            (self.write, 'w'),
            (self.execute, 'x'),
            (self.create, 'c'),
        ];
        for (enabled, flag) in flags {
            if enabled {
                write!(f, "{flag}")?;
            }
        }
        Ok(())
    }
}

/// A syscall category that stays permitted after [`Sandbox::restrict_syscalls`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Promise {
    Stdio,
    Rpath,
    Inet,
}

impl Promise {
    pub fn as_str(&self) -> &'static str {
        match self {
            Promise::Stdio => "stdio",
            Promise::Rpath => "rpath",
            Promise::Inet => "inet",
        }
    }
}

impl fmt::Display for Promise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Space-separated promise list as passed to `pledge(2)`.
pub fn promise_list(promises: &[Promise]) -> String {
    promises
        .iter()
        .map(Promise::as_str)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Platform capability used to narrow what the process can do.
///
/// Every call is irreversible. Implementations without OS support succeed
/// unconditionally.
pub trait Sandbox {
    fn restrict_visibility(&self, path: &Path, permissions: Permissions)
    -> Result<(), SandboxError>;

    fn lock_visibility(&self) -> Result<(), SandboxError>;

    fn restrict_syscalls(&self, promises: &[Promise]) -> Result<(), SandboxError>;
}

/// Progress of the negotiation sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Open,
    Visible,
    Locked,
    Restricted,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Open => "open",
            Stage::Visible => "visible",
            Stage::Locked => "locked",
            Stage::Restricted => "restricted",
            Stage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Drives a [`Sandbox`] through restrict-visibility, lock-visibility and
/// restrict-syscalls, in that order.
///
/// Stages only move forward. A failed step poisons the negotiator.
#[derive(Debug)]
pub struct Negotiator<S> {
    sandbox: S,
    stage: Stage,
}

impl<S: Sandbox> Negotiator<S> {
    pub fn new(sandbox: S) -> Self {
        Self {
            sandbox,
            stage: Stage::Open,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Run the full sequence for a served directory: read-only visibility of
    /// `dir`, lock, then [`SERVER_PROMISES`].
    ///
    /// Calling this again after it succeeded is a no-op.
    pub fn negotiate(&mut self, dir: &Path) -> Result<(), SandboxError> {
        if self.stage == Stage::Restricted {
            return Ok(());
        }

        self.restrict_visibility(dir, Permissions::READ_ONLY)?;
        self.lock_visibility()?;
        self.restrict_syscalls(SERVER_PROMISES)?;

        info!(directory = %dir.display(), "sandbox negotiated");
        Ok(())
    }

    pub fn restrict_visibility(
        &mut self,
        path: &Path,
        permissions: Permissions,
    ) -> Result<(), SandboxError> {
        match self.stage {
            Stage::Open | Stage::Visible => {}
            Stage::Locked | Stage::Restricted => return Err(SandboxError::VisibilityLocked),
            Stage::Failed => return Err(SandboxError::Poisoned),
        }

        let result = self.sandbox.restrict_visibility(path, permissions);
        self.advance(result, Stage::Visible)
    }

    pub fn lock_visibility(&mut self) -> Result<(), SandboxError> {
        match self.stage {
            Stage::Visible => {}
            Stage::Locked | Stage::Restricted => return Ok(()),
            Stage::Open => {
                return Err(SandboxError::OutOfOrder {
                    step: "lock_visibility",
                    stage: self.stage,
                });
            }
            Stage::Failed => return Err(SandboxError::Poisoned),
        }

        let result = self.sandbox.lock_visibility();
        self.advance(result, Stage::Locked)
    }

    /// Narrow the permitted syscalls. May be repeated once locked; each call
    /// can only shrink the set further.
    pub fn restrict_syscalls(&mut self, promises: &[Promise]) -> Result<(), SandboxError> {
        match self.stage {
            Stage::Locked | Stage::Restricted => {}
            Stage::Open | Stage::Visible => {
                return Err(SandboxError::OutOfOrder {
                    step: "restrict_syscalls",
                    stage: self.stage,
                });
            }
            Stage::Failed => return Err(SandboxError::Poisoned),
        }

        let result = self.sandbox.restrict_syscalls(promises);
        self.advance(result, Stage::Restricted)
    }

    fn advance(&mut self, result: Result<(), SandboxError>, next: Stage) -> Result<(), SandboxError> {
        match result {
            Ok(()) => {
                self.stage = next;
                Ok(())
            }
            Err(err) => {
                self.stage = Stage::Failed;
                Err(err)
            }
        }
    }
}
